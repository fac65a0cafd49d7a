//! Asynchronous store pipeline.
//!
//! Decouples importers from the CPU-bound sort and the IO-bound write, and
//! bounds peak memory with a fixed pool of pre-allocated entry buffers:
//!
//! ```text
//! importer --(full buffer)--> sort workers --(sorted)--> writer --+
//!     ^                                                           |
//!     +-------------------(cleared buffer)-----------------------+
//! ```
//!
//! `get_empty_buffer` blocks while the pool is empty, which is the
//! back-pressure that keeps importers from outrunning the disk. Sort
//! workers may reorder jobs relative to scheduling order; callers that care
//! about placement pre-assign file ids through the partition. There is
//! exactly one writer, so run files appear one at a time.
//!
//! There is no per-job cancellation; `wait_for_completion` (also run on
//! drop) is the only shutdown, and it drains everything.

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::entry::Entry;
use crate::run::{write_run, RangeIndex, RunError};

/// Stable-sort by full key, then fold adjacent records with equal full keys
/// into one (summing counts, keeping the earliest game offset).
///
/// Idempotent: applying it to already combined data changes nothing.
pub fn sort_and_combine(entries: &mut Vec<Entry>) {
    entries.sort_by(|a, b| a.key().cmp(b.key()));
    entries.dedup_by(|current, kept| {
        if kept.key() == current.key() {
            kept.combine(current);
            true
        } else {
            false
        }
    });
}

struct Job {
    path: PathBuf,
    buffer: Vec<Entry>,
    promise: Sender<Result<RangeIndex, RunError>>,
}

/// Handle to a scheduled write; resolves once the run and its index are
/// durable on disk.
pub struct FutureIndex(Receiver<Result<RangeIndex, RunError>>);

impl FutureIndex {
    pub fn wait(&self) -> Result<RangeIndex, RunError> {
        match self.0.recv() {
            Ok(result) => result,
            Err(_) => Err(RunError::Io(std::io::Error::other(
                "store pipeline terminated before fulfilling the write",
            ))),
        }
    }
}

pub struct StorePipeline {
    sort_tx: Option<Sender<Job>>,
    buffer_rx: Receiver<Vec<Entry>>,
    buffer_capacity: usize,
    sorters: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl StorePipeline {
    /// Pipeline with `num_buffers` buffers of `buffer_capacity` entries and
    /// `sort_workers >= 1` sorting threads.
    pub fn new(num_buffers: usize, buffer_capacity: usize, sort_workers: usize) -> Self {
        let num_buffers = num_buffers.max(1);
        let buffer_capacity = buffer_capacity.max(1);

        let (buffer_tx, buffer_rx) = bounded(num_buffers);
        for _ in 0..num_buffers {
            buffer_tx
                .send(Vec::with_capacity(buffer_capacity))
                .expect("buffer pool sized to hold all buffers");
        }

        let (sort_tx, sort_rx) = unbounded::<Job>();
        let (write_tx, write_rx) = unbounded::<Job>();

        let sorters = (0..sort_workers.max(1))
            .map(|_| {
                let sort_rx = sort_rx.clone();
                let write_tx = write_tx.clone();
                std::thread::spawn(move || {
                    for mut job in sort_rx.iter() {
                        sort_and_combine(&mut job.buffer);
                        if write_tx.send(job).is_err() {
                            return;
                        }
                    }
                })
            })
            .collect();
        drop(write_tx);

        let writer = std::thread::spawn(move || {
            for job in write_rx.iter() {
                let result = write_run(&job.path, &job.buffer);
                let mut buffer = job.buffer;
                buffer.clear();
                // Receivers may be gone during teardown; nothing to do then.
                let _ = buffer_tx.send(buffer);
                let _ = job.promise.send(result);
            }
        });

        Self {
            sort_tx: Some(sort_tx),
            buffer_rx,
            buffer_capacity,
            sorters,
            writer: Some(writer),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Blocks until a buffer returns to the pool, then hands it out empty.
    pub fn get_empty_buffer(&self) -> Result<Vec<Entry>, RunError> {
        let mut buffer = self.buffer_rx.recv().map_err(|_| {
            RunError::Io(std::io::Error::other("store pipeline writer is gone"))
        })?;
        buffer.clear();
        Ok(buffer)
    }

    /// Queue `entries` to be sorted, combined and written to `path`.
    pub fn schedule_unordered(&self, path: PathBuf, entries: Vec<Entry>) -> FutureIndex {
        let (promise_tx, promise_rx) = bounded(1);
        if let Some(sort_tx) = &self.sort_tx {
            // A send failure means shutdown already began; the dropped
            // promise surfaces as an error on wait.
            let _ = sort_tx.send(Job {
                path,
                buffer: entries,
                promise: promise_tx,
            });
        }
        FutureIndex(promise_rx)
    }

    /// Drain both queues and join every worker. All scheduled writes are
    /// durable when this returns.
    pub fn wait_for_completion(&mut self) {
        self.sort_tx.take();
        for handle in self.sorters.drain(..) {
            let _ = handle.join();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for StorePipeline {
    fn drop(&mut self) {
        self.wait_for_completion();
    }
}
