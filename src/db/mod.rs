//! Database envelope: directory layout, manifest and stats lifecycle, and
//! the top-level import / query / merge operations.
//!
//! On-disk layout:
//!
//! ```text
//! <db>/
//!   manifest            format key + endianness flag
//!   stats               per-level (games, positions)
//!   _human/ _engine/ _server/
//!     header, index     per-level header stores
//!   data/
//!     <id>, <id>_index  run files of the single partition
//! ```
//!
//! `open` creates the layout on first use and otherwise validates the
//! manifest; a wrong format key or byte order is fatal before anything is
//! touched. `open_any` resolves the stored key against the table of known
//! formats instead of assuming one.

pub mod manifest;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::chess::{ByLevel, GameLevel, MoveRules};
use crate::entry::ENTRY_SIZE;
use crate::headers::HeaderStore;
use crate::import::{
    import_parallel, import_sequential, GameReaderFactory, ImportEnv, ImportProgress,
    ImportStats, ImportableFile,
};
use crate::merge::MergeProgress;
use crate::partition::Partition;
use crate::pipeline::StorePipeline;
use crate::query::{executor, QueryError, Request, Response};

pub use manifest::{Endianness, Manifest, ManifestError};
pub use stats::DatabaseStats;

/// Manifest key of this storage format.
pub const FORMAT_KEY: &str = "posdb";

const PARTITION_DIR: &str = "data";

fn header_dir(level: GameLevel) -> &'static str {
    match level {
        GameLevel::Human => "_human",
        GameLevel::Engine => "_engine",
        GameLevel::Server => "_server",
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Byte budget for the import buffer pool.
    pub import_memory: usize,
    /// Byte budget for merge cursor buffers.
    pub merge_memory: usize,
    /// Sorting threads in the store pipeline.
    pub sort_workers: usize,
    /// Parallel importer blocks; 1 imports sequentially.
    pub import_workers: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self {
            import_memory: 256 << 20,
            merge_memory: 64 << 20,
            sort_workers: (parallelism / 2).max(1),
            import_workers: parallelism.max(1),
        }
    }
}

pub struct Database {
    path: PathBuf,
    manifest: Manifest,
    options: DatabaseOptions,
    rules: Arc<dyn MoveRules>,
    headers: ByLevel<HeaderStore>,
    partition: Partition,
    stats: DatabaseStats,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("manifest", &self.manifest)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create a database of this format at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        rules: Arc<dyn MoveRules>,
        options: DatabaseOptions,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).with_context(|| format!("create database dir {path:?}"))?;

        let manifest = if manifest::exists(&path) {
            manifest::validate(&path, FORMAT_KEY)?
        } else {
            let manifest = Manifest::for_format(FORMAT_KEY);
            manifest::write(&path, &manifest)?;
            manifest
        };

        let headers = ByLevel::try_from_fn(|level| HeaderStore::open(path.join(header_dir(level))))
            .context("open header stores")?;
        let partition = Partition::open(path.join(PARTITION_DIR)).context("open partition")?;
        let stats =
            DatabaseStats::load(&path.join(stats::STATS_FILE)).context("load database stats")?;

        info!(
            ?path,
            runs = partition.files().len(),
            games = stats.total_games(),
            "opened database"
        );

        Ok(Self {
            path,
            manifest,
            options,
            rules,
            headers,
            partition,
            stats,
        })
    }

    /// Open an existing database by whatever format its manifest declares.
    pub fn open_any(
        path: impl AsRef<Path>,
        rules: Arc<dyn MoveRules>,
        options: DatabaseOptions,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let stored = manifest::read(path)?;
        match stored.key.as_str() {
            FORMAT_KEY => Self::open(path, rules, options),
            _ => Err(ManifestError::UnknownFormat { key: stored.key }.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn stats(&self) -> &DatabaseStats {
        &self.stats
    }

    pub fn num_runs(&self) -> usize {
        self.partition.files().len()
    }

    /// Import games from `files` through `reader`. Returns per-level stats;
    /// all scheduled writes are durable when this returns.
    pub fn import(
        &mut self,
        reader: &dyn GameReaderFactory,
        files: &[ImportableFile],
        progress: Option<&mut (dyn FnMut(&ImportProgress) + Send)>,
    ) -> anyhow::Result<ImportStats> {
        if files.is_empty() {
            return Ok(ImportStats::default());
        }

        let importers = if files.len() > 1 {
            self.options.import_workers.max(1)
        } else {
            1
        };
        let num_buffers = 2 * importers;
        let buffer_entries = (self.options.import_memory / (num_buffers * ENTRY_SIZE)).max(64);

        let stats = {
            let mut pipeline =
                StorePipeline::new(num_buffers, buffer_entries, self.options.sort_workers);
            let env = ImportEnv {
                pipeline: &pipeline,
                partition: &self.partition,
                headers: &self.headers,
            };

            let stats = if importers > 1 {
                import_parallel(&env, reader, files, importers, progress)?
            } else {
                import_sequential(&env, reader, files, progress)?
            };
            pipeline.wait_for_completion();
            stats
        };

        self.partition
            .collect_future_files()
            .context("collect imported runs")?;
        for (_, store) in self.headers.iter() {
            store.flush()?;
        }
        self.stats.record_import(&stats);
        self.stats.save(&self.path.join(stats::STATS_FILE))?;

        info!(
            games = stats.total_games(),
            skipped = stats.total_skipped_games(),
            positions = stats.total_positions(),
            runs = self.partition.files().len(),
            "import finished"
        );
        Ok(stats)
    }

    pub fn execute_query(&self, request: &Request) -> Result<Response, QueryError> {
        executor::execute(request, &*self.rules, &self.partition, &self.headers)
    }

    /// JSON-in/JSON-out query entry point; request errors come back in-band.
    pub fn execute_query_json(&self, json: &str) -> serde_json::Value {
        let respond = |outcome: Result<Response, QueryError>| match outcome {
            Ok(response) => serde_json::to_value(&response)
                .unwrap_or_else(|_| serde_json::json!({ "error": "InternalError" })),
            Err(QueryError::InvalidRequest(_)) => {
                serde_json::json!({ "error": "InvalidRequest" })
            }
            Err(QueryError::Internal(_)) => serde_json::json!({ "error": "InternalError" }),
        };
        match Request::parse(json) {
            Ok(request) => respond(self.execute_query(&request)),
            Err(error) => respond(Err(error)),
        }
    }

    /// Consolidate every run of the partition into one.
    pub fn merge_all(
        &mut self,
        progress: Option<&mut dyn FnMut(&MergeProgress)>,
    ) -> anyhow::Result<()> {
        let mut noop = |_: &MergeProgress| {};
        let callback = progress.unwrap_or(&mut noop);
        self.partition
            .merge_all(self.options.merge_memory, callback)
            .context("merge partition")?;
        info!(runs = self.partition.files().len(), "merge finished");
        Ok(())
    }

    /// Merge every run into `out_dir` without modifying this database.
    pub fn replicate_merge_all(
        &self,
        out_dir: impl AsRef<Path>,
        progress: Option<&mut dyn FnMut(&MergeProgress)>,
    ) -> anyhow::Result<()> {
        let mut noop = |_: &MergeProgress| {};
        let callback = progress.unwrap_or(&mut noop);
        self.partition
            .replicate_merge_all(out_dir.as_ref(), self.options.merge_memory, callback)
            .context("replicate merge")?;
        Ok(())
    }

    /// Resolve every pending write and persist stats.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.partition
            .collect_future_files()
            .context("collect pending runs")?;
        for (_, store) in self.headers.iter() {
            store.flush()?;
        }
        self.stats.save(&self.path.join(stats::STATS_FILE))?;
        Ok(())
    }

    /// Drop all stored data, keeping the manifest.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.partition.clear().context("clear partition")?;
        for level in GameLevel::ALL {
            let dir = self.path.join(header_dir(level));
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("clear header store {dir:?}")),
            }
        }
        self.headers =
            ByLevel::try_from_fn(|level| HeaderStore::open(self.path.join(header_dir(level))))
                .context("recreate header stores")?;
        self.stats = DatabaseStats::default();
        self.stats.save(&self.path.join(stats::STATS_FILE))?;
        Ok(())
    }
}
