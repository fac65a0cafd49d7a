//! `posdb` is a position-indexed chess game database.
//!
//! Imported games are fingerprinted position by position and persisted as
//! externally sorted, mergeable runs of fixed-size records; queries come
//! back as per-(level, result) occurrence counts with optional first/last
//! game references and continuation statistics.
//!
//! This crate is opinionated about its storage discipline:
//! - Runs are immutable, sorted by the full key, and only ever replaced by
//!   a merge that renames into place before unlinking its inputs.
//! - Imports flow through a bounded buffer pool, so peak memory is fixed
//!   no matter how large the input corpus is.
//! - A fingerprint collision counts as the same position; that probability
//!   trade-off is part of the format.
//!
//! Chess rules (move generation, SAN, FEN) and game input (PGN/BCGN
//! lexing) are external collaborators behind the [`chess::MoveRules`] and
//! [`import::GameReaderFactory`] traits.

pub mod chess;
pub mod db;
pub mod entry;
pub mod headers;
pub mod import;
pub mod key;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod query;
pub mod run;

pub use db::{Database, DatabaseOptions, DatabaseStats, Manifest, ManifestError, FORMAT_KEY};
pub use import::{GameReader, GameReaderFactory, ImportStats, ImportableFile};
pub use query::{QueryError, Request, Response};
