//! A partition: the ordered collection of runs for one logical shard.
//!
//! Run files live directly in the partition directory, named by a
//! monotonically increasing `u32` id. Ids are allocated under a mutex and
//! cover both materialised files and "future files" - runs whose write has
//! been scheduled on the pipeline but whose promise has not resolved yet.
//! Ids are never reused, so the file set ordered by id reproduces the
//! insertion order regardless of how the pipeline reordered the writes.
//!
//! Discovery on open ignores `*_index` siblings, deletes stray `.tmp`
//! staging files left by a crashed merge, and refuses to open if any run
//! fails its size or index invariants.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::entry::Entry;
use crate::merge::{merge_runs, MergeProgress};
use crate::pipeline::{FutureIndex, StorePipeline};
use crate::run::{self, Run, RunError};

struct PendingFile {
    path: PathBuf,
    future: FutureIndex,
}

pub struct Partition {
    path: PathBuf,
    files: Vec<Run>,
    pending: Mutex<BTreeMap<u32, PendingFile>>,
}

impl Partition {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RunError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut files = Vec::new();
        for dir_entry in std::fs::read_dir(&path)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let file_path = dir_entry.path();
            if file_path.extension().is_some_and(|ext| ext == "tmp") {
                debug!(path = ?file_path, "removing stray staging file");
                std::fs::remove_file(&file_path)?;
                continue;
            }
            if run::id_from_path(&file_path).is_some() {
                files.push(Run::open(&file_path)?);
            }
        }
        files.sort_by_key(Run::id);

        Ok(Self {
            path,
            files,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> &[Run] {
        &self.files
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.files.iter().map(Run::size_bytes).sum()
    }

    fn next_id_locked(&self, pending: &BTreeMap<u32, PendingFile>) -> u32 {
        let from_pending = pending.keys().next_back().map(|id| id + 1);
        let from_files = self.files.last().map(|run| run.id() + 1);
        from_pending.max(from_files).unwrap_or(0)
    }

    /// One id past the highest known, counting unresolved future files.
    pub fn next_id(&self) -> u32 {
        self.next_id_locked(&self.pending.lock())
    }

    /// Schedule `entries` as a new run. With `id: None` the next free id is
    /// taken; parallel importers pass pre-reserved ids instead. An empty
    /// buffer schedules nothing and writes no file.
    pub fn store_unordered(
        &self,
        pipeline: &StorePipeline,
        entries: Vec<Entry>,
        id: Option<u32>,
    ) {
        if entries.is_empty() {
            return;
        }

        let mut pending = self.pending.lock();
        let id = id.unwrap_or_else(|| self.next_id_locked(&pending));
        debug_assert!(!pending.contains_key(&id), "run id {id} scheduled twice");

        let path = self.path.join(id.to_string());
        let future = pipeline.schedule_unordered(path.clone(), entries);
        pending.insert(id, PendingFile { path, future });
    }

    /// Resolve every future file in id order and adopt the produced runs.
    pub fn collect_future_files(&mut self) -> Result<(), RunError> {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, pending_file) in pending {
            let index = pending_file.future.wait()?;
            self.files
                .push(Run::open_with_index(&pending_file.path, index)?);
        }
        self.files.sort_by_key(Run::id);
        Ok(())
    }

    pub fn has_pending_files(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Merge every run into a single consolidated run, combining duplicate
    /// keys. Inputs are unlinked after the staged output is complete.
    pub fn merge_all(
        &mut self,
        merge_memory: usize,
        progress: &mut dyn FnMut(&MergeProgress),
    ) -> Result<(), RunError> {
        self.collect_future_files()?;
        if self.files.len() < 2 {
            return Ok(());
        }

        let out_path = self.path.join(self.next_id().to_string());
        let staged = merge_runs(&self.files, &out_path, merge_memory, progress)?;

        // Crash ordering: unlink the inputs, then publish the staged file.
        // A crash before this point leaves the inputs untouched and only a
        // stray staging file behind.
        for input in &self.files {
            std::fs::remove_file(input.path())?;
            std::fs::remove_file(run::index_path_for(input.path()))?;
        }
        let index = staged.commit()?;
        self.files = vec![Run::open_with_index(&out_path, index)?];
        Ok(())
    }

    /// Merge every run into `out_dir` without touching this partition.
    pub fn replicate_merge_all(
        &self,
        out_dir: &Path,
        merge_memory: usize,
        progress: &mut dyn FnMut(&MergeProgress),
    ) -> Result<(), RunError> {
        if self.has_pending_files() {
            return Err(RunError::Io(std::io::Error::other(
                "partition has unresolved future files; flush before replicating",
            )));
        }
        if self.files.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(out_dir)?;
        let staged = merge_runs(&self.files, &out_dir.join("0"), merge_memory, progress)?;
        staged.commit()?;
        Ok(())
    }

    /// Delete every run file. Pending futures must be resolved first.
    pub fn clear(&mut self) -> Result<(), RunError> {
        self.collect_future_files()?;
        for file in self.files.drain(..) {
            std::fs::remove_file(file.path())?;
            std::fs::remove_file(run::index_path_for(file.path()))?;
        }
        Ok(())
    }
}
