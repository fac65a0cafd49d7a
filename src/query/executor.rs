//! Query execution: expansion, batched range lookups, aggregation, and
//! header resolution.
//!
//! Every root position contributes one probe key; if continuation children
//! are fetched, each legal move contributes a probe key for the successor
//! position tagged with that move as its reverse move. All probe keys are
//! sorted and dispatched to every run as one batch, so each run walks its
//! sparse index once. A matched range is scanned once and its records are
//! folded into per-(category, level, result) cells; the category decides
//! which records in the range qualify:
//!
//! - `all` and the continuations root take every record of the position;
//! - `transpositions` takes records whose reverse move equals the root's;
//! - a continuation child takes records whose reverse move is the move
//!   that leads to it.
//!
//! "First game" aggregates the minimum stored game offset, "last game" the
//! maximum; records whose packed offset was crowded out contribute their
//! count only. Game references are resolved against the per-level header
//! stores in one batch at the end.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;

use crate::chess::{ByLevel, GameLevel, GameResult, Move, MoveRules, Position};
use crate::headers::HeaderStore;
use crate::key::{Key, KeyCompare};
use crate::partition::Partition;

use super::{
    Category, CategoryResult, EntryMap, FetchingOptions, GameRef, PositionResult, QueryEntry,
    QueryError, Request, Response, RootPosition,
};

const NUM_CATEGORIES: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    count: u64,
    first_offset: Option<u64>,
    last_offset: Option<u64>,
}

impl Cell {
    fn fold(&mut self, count: u64, offset: Option<u64>) {
        self.count += count;
        if let Some(offset) = offset {
            self.first_offset = Some(self.first_offset.map_or(offset, |o| o.min(offset)));
            self.last_offset = Some(self.last_offset.map_or(offset, |o| o.max(offset)));
        }
    }
}

/// Per-query aggregation grid: category x level x result.
#[derive(Debug, Clone, Default)]
struct CellGrid([[[Cell; 3]; 3]; NUM_CATEGORIES]);

impl CellGrid {
    fn cell(&self, category: Category, level: GameLevel, result: GameResult) -> &Cell {
        &self.0[category as usize][level as usize][result as usize]
    }

    fn cell_mut(&mut self, category: Category, level: GameLevel, result: GameResult) -> &mut Cell {
        &mut self.0[category as usize][level as usize][result as usize]
    }
}

#[derive(Clone, Copy)]
enum Origin {
    Root,
    Child { mv: Move },
}

struct PositionQuery {
    root: usize,
    origin: Origin,
    key: Key,
}

struct Root {
    request_position: RootPosition,
    position: Position,
    /// Index of this root's own query in the query batch.
    query_idx: usize,
}

pub(crate) fn execute(
    request: &Request,
    rules: &dyn MoveRules,
    partition: &Partition,
    headers: &ByLevel<HeaderStore>,
) -> Result<Response, QueryError> {
    request.validate()?;

    let mut levels = request.levels.clone();
    levels.sort();
    levels.dedup();
    let mut results = request.results.clone();
    results.sort();
    results.dedup();

    let categories: BTreeMap<Category, FetchingOptions> = request
        .categories
        .iter()
        .map(|(&category, &options)| (category, options.normalized()))
        .collect();

    let fetch_continuation_children = categories
        .get(&Category::Continuations)
        .is_some_and(|options| options.fetch_children);

    // Expansion: one probe per root, plus one per legal continuation when
    // children are fetched.
    let mut roots = Vec::with_capacity(request.positions.len());
    let mut queries = Vec::new();
    for (root_idx, request_position) in request.positions.iter().enumerate() {
        let base = rules
            .position_from_fen(&request_position.fen)
            .ok_or_else(|| {
                QueryError::InvalidRequest(format!("unparsable fen {:?}", request_position.fen))
            })?;

        let (position, reverse_move) = match &request_position.san {
            Some(san) => {
                let mv = rules.san_to_move(&base, san).ok_or_else(|| {
                    QueryError::InvalidRequest(format!("unknown move {san:?}"))
                })?;
                let (after, reverse_move) = rules.make_move(&base, mv);
                (after, Some(reverse_move))
            }
            None => (base, None),
        };

        let query_idx = queries.len();
        queries.push(PositionQuery {
            root: root_idx,
            origin: Origin::Root,
            key: Key::probe(&position, reverse_move.as_ref()),
        });

        if fetch_continuation_children {
            for mv in rules.legal_moves(&position) {
                let (child, child_reverse) = rules.make_move(&position, mv);
                queries.push(PositionQuery {
                    root: root_idx,
                    origin: Origin::Child { mv },
                    key: Key::probe(&child, Some(&child_reverse)),
                });
            }
        }

        roots.push(Root {
            request_position: request_position.clone(),
            position,
            query_idx,
        });
    }

    // Dispatch: one sorted key batch per run, index cursor advancing
    // monotonically.
    let mut order: Vec<usize> = (0..queries.len()).collect();
    order.sort_by(|&a, &b| queries[a].key.cmp(&queries[b].key));
    let sorted_keys: Vec<Key> = order.iter().map(|&i| queries[i].key).collect();

    let mut grids: Vec<CellGrid> = (0..queries.len()).map(|_| CellGrid::default()).collect();
    for run in partition.files() {
        let ranges = run.equal_range_many(&sorted_keys, KeyCompare::WithoutReverseMove);
        for (slot, &(begin, end)) in ranges.iter().enumerate() {
            let query = &queries[order[slot]];
            let grid = &mut grids[order[slot]];

            for entry in run.entries_in(begin, end) {
                let (Ok(level), Ok(result)) = (entry.key().level(), entry.key().result()) else {
                    continue;
                };
                if !levels.contains(&level) || !results.contains(&result) {
                    continue;
                }

                let reverse_move_matches =
                    entry.key().reverse_move_bits() == query.key.reverse_move_bits();

                match query.origin {
                    Origin::Root => {
                        for &category in categories.keys() {
                            let matches = match category {
                                Category::Continuations | Category::All => true,
                                Category::Transpositions => reverse_move_matches,
                            };
                            if matches {
                                grid.cell_mut(category, level, result)
                                    .fold(entry.count(), entry.game_offset());
                            }
                        }
                    }
                    Origin::Child { .. } => {
                        if reverse_move_matches {
                            grid.cell_mut(Category::Continuations, level, result)
                                .fold(entry.count(), entry.game_offset());
                        }
                    }
                }
            }
        }
    }

    let mut resolver = GameRefResolver::new(headers);
    let mut results_out = Vec::with_capacity(roots.len());
    for (root_idx, root) in roots.iter().enumerate() {
        let mut by_category = BTreeMap::new();
        for (&category, options) in &categories {
            let mut category_result = CategoryResult::default();

            let root_grid = &grids[root.query_idx];
            category_result.root = entry_map(
                root_grid,
                category,
                &levels,
                &results,
                options.fetch_first_game,
                options.fetch_last_game,
                &mut resolver,
            )?;

            if category == Category::Continuations && options.fetch_children {
                for (query, grid) in queries.iter().zip(&grids) {
                    if query.root != root_idx {
                        continue;
                    }
                    let Origin::Child { mv } = query.origin else {
                        continue;
                    };
                    let san = rules.move_to_san(&root.position, mv);
                    category_result.children.insert(
                        san,
                        entry_map(
                            grid,
                            category,
                            &levels,
                            &results,
                            options.fetch_first_game_for_each_child,
                            options.fetch_last_game_for_each_child,
                            &mut resolver,
                        )?,
                    );
                }
            }

            by_category.insert(category, category_result);
        }

        results_out.push(PositionResult {
            position: root.request_position.clone(),
            categories: by_category,
        });
    }

    Ok(Response {
        token: request.token.clone(),
        results: results_out,
    })
}

#[allow(clippy::too_many_arguments)]
fn entry_map(
    grid: &CellGrid,
    category: Category,
    levels: &[GameLevel],
    results: &[GameResult],
    fetch_first: bool,
    fetch_last: bool,
    resolver: &mut GameRefResolver<'_>,
) -> Result<EntryMap, QueryError> {
    let mut map = EntryMap::new();
    for &level in levels {
        let mut by_result = BTreeMap::new();
        for &result in results {
            let cell = grid.cell(category, level, result);
            let mut entry = QueryEntry {
                count: cell.count,
                first_game: None,
                last_game: None,
            };
            if fetch_first {
                entry.first_game = cell
                    .first_offset
                    .map(|offset| resolver.resolve(level, offset))
                    .transpose()?;
            }
            if fetch_last {
                entry.last_game = cell
                    .last_offset
                    .map(|offset| resolver.resolve(level, offset))
                    .transpose()?;
            }
            by_result.insert(result, entry);
        }
        map.insert(level, by_result);
    }
    Ok(map)
}

/// Batches header lookups and caches resolved references per (level,
/// offset).
struct GameRefResolver<'a> {
    headers: &'a ByLevel<HeaderStore>,
    cache: HashMap<(GameLevel, u64), GameRef>,
}

impl<'a> GameRefResolver<'a> {
    fn new(headers: &'a ByLevel<HeaderStore>) -> Self {
        Self {
            headers,
            cache: HashMap::new(),
        }
    }

    fn resolve(&mut self, level: GameLevel, offset: u64) -> Result<GameRef, QueryError> {
        if let Some(cached) = self.cache.get(&(level, offset)) {
            return Ok(cached.clone());
        }

        let store = &self.headers[level];
        let metadata = store
            .query_by_offsets(&[offset])
            .with_context(|| format!("resolve game header at offset {offset}"))?
            .remove(0);
        let game_id = store
            .game_id_for_offset(offset)
            .context("resolve game id")?
            .unwrap_or(u32::MAX);

        let game_ref = GameRef {
            game_id,
            date: metadata.date.to_string(),
            eco: metadata.eco.to_string(),
            ply_count: metadata.ply_count(),
            white_elo: metadata.white_elo,
            black_elo: metadata.black_elo,
            round: metadata.round,
            event: metadata.event,
            white: metadata.white,
            black: metadata.black,
        };
        self.cache.insert((level, offset), game_ref.clone());
        Ok(game_ref)
    }
}
