//! Query wire model.
//!
//! Requests and responses are JSON. A request names root positions (FEN, or
//! FEN plus a SAN move - the root is then the position *after* the move,
//! which also gives the root a reverse move), the game levels and results
//! to aggregate, and per-category fetching options. Categories:
//!
//! - `continuations` - per legal move, games that reached the successor
//!   position *by that move*;
//! - `transpositions` - games that reached the root by exactly its reverse
//!   move;
//! - `all` - every game that reached the root, however it got there.
//!
//! Responses mirror the request: per position, per category, a `--` entry
//! for the root and one entry per SAN-keyed child, each carrying counts by
//! level and result plus optional first/last game references.

pub mod executor;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chess::{GameLevel, GameResult};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("query failed: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPosition {
    pub fen: String,

    /// SAN move applied to `fen`; the root is the resulting position.
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub san: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Continuations,
    Transpositions,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchingOptions {
    pub fetch_children: bool,
    pub fetch_first_game: bool,
    pub fetch_last_game: bool,
    pub fetch_first_game_for_each_child: bool,
    pub fetch_last_game_for_each_child: bool,
}

impl FetchingOptions {
    /// Per-child fetches imply fetching children at all.
    pub fn normalized(mut self) -> Self {
        if !self.fetch_children {
            self.fetch_first_game_for_each_child = false;
            self.fetch_last_game_for_each_child = false;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back verbatim so clients can match responses to queries.
    pub token: String,

    pub positions: Vec<RootPosition>,
    pub levels: Vec<GameLevel>,
    pub results: Vec<GameResult>,

    #[serde(flatten)]
    pub categories: BTreeMap<Category, FetchingOptions>,
}

impl Request {
    pub fn parse(json: &str) -> Result<Self, QueryError> {
        serde_json::from_str(json).map_err(|e| QueryError::InvalidRequest(e.to_string()))
    }

    pub(crate) fn validate(&self) -> Result<(), QueryError> {
        if self.positions.is_empty() {
            return Err(QueryError::InvalidRequest("no positions".into()));
        }
        if self.levels.is_empty() {
            return Err(QueryError::InvalidRequest("no levels".into()));
        }
        if self.results.is_empty() {
            return Err(QueryError::InvalidRequest("no results".into()));
        }
        if self.categories.is_empty() {
            return Err(QueryError::InvalidRequest("no categories".into()));
        }
        Ok(())
    }
}

/// Resolved reference to a stored game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameRef {
    pub game_id: u32,
    pub date: String,
    pub eco: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ply_count: Option<u16>,
    pub white_elo: u16,
    pub black_elo: u16,
    pub round: u16,
    pub event: String,
    pub white: String,
    pub black: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryEntry {
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_game: Option<GameRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_game: Option<GameRef>,
}

/// Per-(level, result) entries for one position or child.
pub type EntryMap = BTreeMap<GameLevel, BTreeMap<GameResult, QueryEntry>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryResult {
    #[serde(rename = "--")]
    pub root: EntryMap,

    /// Children keyed by SAN, present only when children were fetched.
    #[serde(flatten)]
    pub children: BTreeMap<String, EntryMap>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionResult {
    pub position: RootPosition,

    #[serde(flatten)]
    pub categories: BTreeMap<Category, CategoryResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub token: String,
    pub results: Vec<PositionResult>,
}
