//! Import orchestration: read games, fingerprint every position, and feed
//! full buffers into the store pipeline.
//!
//! Game input is external: the database consumes any [`GameReaderFactory`],
//! which lazily yields games with their metadata and a lazy ply walk.
//! Games with an unknown result are counted and skipped; games the reader
//! fails to parse are counted separately and skipped too. Neither leaves a
//! header or any entries behind.
//!
//! The parallel pass divides the input files into blocks by cumulative
//! size. Each block pre-reserves a run-id range wide enough for the worst
//! case - one full buffer per `buffer_entries * MIN_PGN_BYTES_PER_MOVE`
//! input bytes - so blocks schedule runs without any shared id lock, and
//! the resulting file set, ordered by id, matches what a sequential import
//! of the same files would have produced.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chess::{ByLevel, GameLevel, GameResult, Position, ReverseMove};
use crate::entry::Entry;
use crate::headers::{GameMetadata, HeaderStore};
use crate::partition::Partition;
use crate::pipeline::StorePipeline;

/// Conservative lower bound on input bytes per recorded position, used to
/// bound how many runs a block can possibly schedule.
pub(crate) const MIN_PGN_BYTES_PER_MOVE: u64 = 4;

/// One input file tagged with the game level its games belong to.
#[derive(Debug, Clone)]
pub struct ImportableFile {
    path: PathBuf,
    level: GameLevel,
}

impl ImportableFile {
    pub fn new(path: impl Into<PathBuf>, level: GameLevel) -> Self {
        Self {
            path: path.into(),
            level,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> GameLevel {
        self.level
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed game: {0}")]
pub struct GameParseError(pub String);

/// One game as produced by an external reader. `plies` walks the game's
/// positions from the initial position onward; every position after the
/// first carries the reverse move that produced it.
pub struct Game {
    pub result: Option<GameResult>,
    pub metadata: GameMetadata,
    pub plies: Box<dyn Iterator<Item = (Position, Option<ReverseMove>)>>,
}

/// Lazy iterator over the games of one input file.
pub trait GameReader {
    fn next_game(&mut self) -> Option<Result<Game, GameParseError>>;
}

/// Opens input files; the import path is written entirely against this.
pub trait GameReaderFactory: Send + Sync {
    fn open(&self, path: &Path) -> std::io::Result<Box<dyn GameReader>>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SingleLevelImportStats {
    pub num_games: u64,
    /// Games skipped because their result is unknown.
    pub num_skipped_games: u64,
    /// Games the reader failed to parse.
    pub num_malformed_games: u64,
    pub num_positions: u64,
}

impl SingleLevelImportStats {
    fn add(&mut self, rhs: &Self) {
        self.num_games += rhs.num_games;
        self.num_skipped_games += rhs.num_skipped_games;
        self.num_malformed_games += rhs.num_malformed_games;
        self.num_positions += rhs.num_positions;
    }
}

#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub by_level: ByLevel<SingleLevelImportStats>,
}

impl ImportStats {
    pub fn merge(&mut self, rhs: &ImportStats) {
        for (level, stats) in self.by_level.iter_mut() {
            stats.add(&rhs.by_level[level]);
        }
    }

    pub fn total_games(&self) -> u64 {
        self.by_level.iter().map(|(_, s)| s.num_games).sum()
    }

    pub fn total_skipped_games(&self) -> u64 {
        self.by_level.iter().map(|(_, s)| s.num_skipped_games).sum()
    }

    pub fn total_positions(&self) -> u64 {
        self.by_level.iter().map(|(_, s)| s.num_positions).sum()
    }
}

/// Monotone import progress in input bytes; `completed_file` names the file
/// whose games were just finished.
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub work_done: u64,
    pub work_total: u64,
    pub completed_file: PathBuf,
}

pub(crate) struct ImportEnv<'a> {
    pub pipeline: &'a StorePipeline,
    pub partition: &'a Partition,
    pub headers: &'a ByLevel<HeaderStore>,
}

struct ProgressState<'a> {
    work_done: u64,
    work_total: u64,
    callback: Option<&'a mut (dyn FnMut(&ImportProgress) + Send)>,
}

impl ProgressState<'_> {
    fn file_completed(&mut self, path: &Path, bytes: u64) {
        self.work_done += bytes;
        if let Some(callback) = self.callback.as_deref_mut() {
            callback(&ImportProgress {
                work_done: self.work_done,
                work_total: self.work_total,
                completed_file: path.to_path_buf(),
            });
        }
    }
}

fn file_sizes(files: &[ImportableFile]) -> std::io::Result<Vec<u64>> {
    files
        .iter()
        .map(|file| std::fs::metadata(file.path()).map(|m| m.len()))
        .collect()
}

/// Import `files` on the calling thread, letting the partition allocate
/// run ids in scheduling order.
pub(crate) fn import_sequential(
    env: &ImportEnv<'_>,
    factory: &dyn GameReaderFactory,
    files: &[ImportableFile],
    progress: Option<&mut (dyn FnMut(&ImportProgress) + Send)>,
) -> anyhow::Result<ImportStats> {
    let sizes = file_sizes(files).context("stat import files")?;
    let progress = Mutex::new(ProgressState {
        work_done: 0,
        work_total: sizes.iter().sum(),
        callback: progress,
    });
    import_block(env, factory, files, &sizes, None, &progress)
}

/// Import `files` with up to `num_blocks` parallel importers, each owning a
/// pre-reserved run-id range.
pub(crate) fn import_parallel(
    env: &ImportEnv<'_>,
    factory: &dyn GameReaderFactory,
    files: &[ImportableFile],
    num_blocks: usize,
    progress: Option<&mut (dyn FnMut(&ImportProgress) + Send)>,
) -> anyhow::Result<ImportStats> {
    let sizes = file_sizes(files).context("stat import files")?;
    let blocks = divide_into_blocks(
        &sizes,
        env.partition.next_id(),
        env.pipeline.buffer_capacity(),
        num_blocks,
    );
    debug!(files = files.len(), blocks = blocks.len(), "parallel import");

    let progress = Mutex::new(ProgressState {
        work_done: 0,
        work_total: sizes.iter().sum(),
        callback: progress,
    });

    let results: Mutex<Vec<anyhow::Result<ImportStats>>> = Mutex::new(Vec::new());
    rayon::scope(|scope| {
        for (range, first_id) in &blocks {
            let results = &results;
            let progress = &progress;
            let block_files = &files[range.clone()];
            let block_sizes = &sizes[range.clone()];
            scope.spawn(move |_| {
                let outcome = import_block(
                    env,
                    factory,
                    block_files,
                    block_sizes,
                    Some(*first_id),
                    progress,
                );
                results.lock().push(outcome);
            });
        }
    });

    let mut total = ImportStats::default();
    for outcome in results.into_inner() {
        total.merge(&outcome?);
    }
    Ok(total)
}

/// Partition `sizes` into contiguous blocks of roughly equal byte size and
/// assign each block the first id of a range no sequentially earlier block
/// can collide with.
fn divide_into_blocks(
    sizes: &[u64],
    base_next_id: u32,
    buffer_entries: usize,
    num_blocks: usize,
) -> Vec<(Range<usize>, u32)> {
    let total: u64 = sizes.iter().sum();
    let threshold = total.div_ceil(num_blocks.max(1) as u64).max(1);
    let ids_per_byte_divisor = (buffer_entries as u64 * MIN_PGN_BYTES_PER_MOVE).max(1);

    let mut blocks = Vec::new();
    let mut id_offset = 0u32;
    let mut block_bytes = 0u64;
    let mut start = 0usize;

    for (i, &size) in sizes.iter().enumerate() {
        block_bytes += size;
        if block_bytes >= threshold {
            blocks.push((start..i + 1, base_next_id + id_offset));
            start = i + 1;
            id_offset += (block_bytes / ids_per_byte_divisor) as u32 + 1;
            block_bytes = 0;
        }
    }
    if start < sizes.len() {
        blocks.push((start..sizes.len(), base_next_id + id_offset));
    }
    blocks
}

fn import_block(
    env: &ImportEnv<'_>,
    factory: &dyn GameReaderFactory,
    files: &[ImportableFile],
    sizes: &[u64],
    first_id: Option<u32>,
    progress: &Mutex<ProgressState<'_>>,
) -> anyhow::Result<ImportStats> {
    let capacity = env.pipeline.buffer_capacity();
    let mut next_id = first_id;
    let mut bucket = env.pipeline.get_empty_buffer()?;
    let mut stats = ImportStats::default();

    let mut schedule = |bucket: &mut Vec<Entry>, next_id: &mut Option<u32>| -> anyhow::Result<()> {
        if bucket.is_empty() {
            return Ok(());
        }
        let full = std::mem::replace(bucket, env.pipeline.get_empty_buffer()?);
        let id = match next_id {
            Some(reserved) => {
                let assigned = *reserved;
                *reserved = assigned + 1;
                Some(assigned)
            }
            None => None,
        };
        env.partition.store_unordered(env.pipeline, full, id);
        Ok(())
    };

    for (file, &size) in files.iter().zip(sizes) {
        let level = file.level();
        let level_stats = &mut stats.by_level[level];
        let mut reader = factory
            .open(file.path())
            .with_context(|| format!("open import file {:?}", file.path()))?;

        while let Some(game) = reader.next_game() {
            let game = match game {
                Ok(game) => game,
                Err(error) => {
                    warn!(file = ?file.path(), %error, "skipping malformed game");
                    level_stats.num_malformed_games += 1;
                    continue;
                }
            };
            let Some(result) = game.result else {
                level_stats.num_skipped_games += 1;
                continue;
            };

            let (_, game_offset) = env.headers[level].add_game(&game.metadata)?;

            let mut positions_in_game = 0u64;
            for (position, reverse_move) in game.plies {
                bucket.push(Entry::new(
                    &position,
                    reverse_move.as_ref(),
                    level,
                    result,
                    game_offset,
                ));
                positions_in_game += 1;

                if bucket.len() >= capacity {
                    schedule(&mut bucket, &mut next_id)?;
                }
            }

            level_stats.num_games += 1;
            level_stats.num_positions += positions_in_game;
        }

        progress.lock().file_completed(file.path(), size);
    }

    schedule(&mut bucket, &mut next_id)?;
    Ok(stats)
}
