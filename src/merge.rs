//! External k-way merge of sorted runs.
//!
//! Cursors over the input runs feed a min-heap keyed by the full key.
//! Whenever the popped record equals the last emitted one under the full
//! comparator it is folded into it (counts summed, earliest game offset
//! kept); combination is associative and commutative, so the result does
//! not depend on which input a duplicate came from. Everything streams: the
//! cursors decode bounded chunks under a total memory budget and the output
//! goes through [`RunWriter`] with its index built on the fly.
//!
//! The merged run stays at its staging path until the caller has unlinked
//! the inputs; committing it is the rename that publishes the replacement.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

use tracing::debug;

use crate::entry::{Entry, ENTRY_SIZE};
use crate::run::index::granularity_for;
use crate::run::{Run, RunError, RunWriter, StagedRun};

/// Monotone merge progress, measured in input bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress {
    pub work_done: u64,
    pub work_total: u64,
}

impl MergeProgress {
    pub fn ratio(&self) -> f64 {
        if self.work_total == 0 {
            1.0
        } else {
            self.work_done as f64 / self.work_total as f64
        }
    }
}

struct Cursor<'a> {
    run: &'a Run,
    /// Next record position to decode.
    position: usize,
    chunk: Vec<Entry>,
    chunk_pos: usize,
    chunk_capacity: usize,
}

impl<'a> Cursor<'a> {
    fn new(run: &'a Run, chunk_capacity: usize) -> Self {
        Self {
            run,
            position: 0,
            chunk: Vec::new(),
            chunk_pos: 0,
            chunk_capacity,
        }
    }

    /// Next record, refilling the chunk when exhausted. Returns the number
    /// of input bytes consumed by a refill so the caller can report
    /// progress.
    fn next(&mut self) -> (Option<Entry>, u64) {
        let mut refilled_bytes = 0;
        if self.chunk_pos >= self.chunk.len() {
            let remaining = self.run.len() - self.position;
            let take = remaining.min(self.chunk_capacity);
            if take == 0 {
                return (None, 0);
            }
            self.chunk = self
                .run
                .entries_in(self.position, self.position + take)
                .collect();
            self.position += take;
            self.chunk_pos = 0;
            refilled_bytes = (take * ENTRY_SIZE) as u64;
        }

        let entry = self.chunk[self.chunk_pos];
        self.chunk_pos += 1;
        (Some(entry), refilled_bytes)
    }
}

struct HeapItem {
    entry: Entry,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // Reversed so the max-heap pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key()
            .cmp(self.entry.key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merge `inputs` into a staged run at `final_path`'s staging sibling,
/// combining records with equal full keys. The caller commits the returned
/// [`StagedRun`] after unlinking the inputs.
pub fn merge_runs(
    inputs: &[Run],
    final_path: &Path,
    merge_memory: usize,
    progress: &mut dyn FnMut(&MergeProgress),
) -> Result<StagedRun, RunError> {
    let work_total: u64 = inputs.iter().map(Run::size_bytes).sum();
    let total_entries: usize = inputs.iter().map(Run::len).sum();
    let chunk_capacity =
        (merge_memory / (inputs.len().max(1) * ENTRY_SIZE)).max(1);

    debug!(
        inputs = inputs.len(),
        total_entries, chunk_capacity, "merging runs"
    );

    let mut writer = RunWriter::create(final_path, granularity_for(total_entries))?;
    let mut cursors: Vec<Cursor> = inputs
        .iter()
        .map(|run| Cursor::new(run, chunk_capacity))
        .collect();

    let mut work_done = 0;
    let mut report = |work_done: u64| {
        progress(&MergeProgress {
            work_done,
            work_total,
        });
    };

    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (source, cursor) in cursors.iter_mut().enumerate() {
        let (entry, bytes) = cursor.next();
        work_done += bytes;
        if let Some(entry) = entry {
            heap.push(HeapItem { entry, source });
        }
    }
    report(work_done);

    let mut current: Option<Entry> = None;
    while let Some(HeapItem { entry, source }) = heap.pop() {
        match &mut current {
            Some(last) if last.key() == entry.key() => last.combine(&entry),
            Some(last) => {
                writer.push(last)?;
                *last = entry;
            }
            None => current = Some(entry),
        }

        let (next, bytes) = cursors[source].next();
        if bytes > 0 {
            work_done += bytes;
            report(work_done);
        }
        if let Some(next) = next {
            heap.push(HeapItem {
                entry: next,
                source,
            });
        }
    }
    if let Some(last) = current {
        writer.push(&last)?;
    }

    let staged = writer.finish_staged()?;
    report(work_total.max(work_done));
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::{Color, GameLevel, GameResult, Piece, PieceType, Position, Square};
    use crate::key::KeyCompare;
    use crate::pipeline::sort_and_combine;
    use crate::run::write_run;

    fn entry(seed: u32, offset: u64) -> Entry {
        let mut pos = Position::initial();
        pos.set_piece(
            Square::from_index((seed % 64) as u8),
            Piece::new(PieceType::Pawn, Color::Black),
        );
        if seed % 2 == 0 {
            pos.set_side_to_move(Color::Black);
        }
        Entry::new(&pos, None, GameLevel::Engine, GameResult::WhiteWin, offset)
    }

    fn make_run(dir: &Path, id: u32, mut entries: Vec<Entry>) -> Run {
        sort_and_combine(&mut entries);
        let path = dir.join(id.to_string());
        let index = write_run(&path, &entries).unwrap();
        Run::open_with_index(&path, index).unwrap()
    }

    fn merged_pairs(dir: &Path, runs: &[Run]) -> Vec<(u64, Option<u64>)> {
        let out = dir.join("out").join("0");
        std::fs::create_dir_all(dir.join("out")).unwrap();
        let mut last_done = 0;
        let staged = merge_runs(runs, &out, 1 << 20, &mut |p: &MergeProgress| {
            assert!(p.work_done >= last_done, "progress went backwards");
            last_done = p.work_done;
        })
        .unwrap();
        let index = staged.commit().unwrap();
        let run = Run::open_with_index(&out, index).unwrap();
        run.entries_in(0, run.len())
            .map(|e| (e.count(), e.game_offset()))
            .collect()
    }

    #[test]
    fn duplicates_collapse_with_summed_counts_and_min_offset() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let a = make_run(
            dir.path(),
            0,
            vec![entry(1, 100), entry(2, 10), entry(3, 7)],
        );
        let b = make_run(dir.path(), 1, vec![entry(1, 20), entry(2, 90)]);

        let pairs = merged_pairs(dir.path(), &[a, b]);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.contains(&(2, Some(20))));
        assert!(pairs.contains(&(2, Some(10))));
        assert!(pairs.contains(&(1, Some(7))));
        Ok(())
    }

    #[test]
    fn merge_order_does_not_change_the_result() -> anyhow::Result<()> {
        let dir_ab = tempfile::TempDir::new()?;
        let dir_ba = tempfile::TempDir::new()?;

        let entries_a: Vec<Entry> = (0..50).map(|s| entry(s, 1000 + u64::from(s))).collect();
        let entries_b: Vec<Entry> = (25..75).map(|s| entry(s, u64::from(s))).collect();

        let ab = {
            let a = make_run(dir_ab.path(), 0, entries_a.clone());
            let b = make_run(dir_ab.path(), 1, entries_b.clone());
            merged_pairs(dir_ab.path(), &[a, b])
        };
        let ba = {
            let b = make_run(dir_ba.path(), 0, entries_b);
            let a = make_run(dir_ba.path(), 1, entries_a);
            merged_pairs(dir_ba.path(), &[b, a])
        };

        assert_eq!(ab, ba);
        Ok(())
    }

    #[test]
    fn tiny_memory_budget_still_merges_correctly() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let a = make_run(dir.path(), 0, (0..200).map(|s| entry(s, 1)).collect());
        let b = make_run(dir.path(), 1, (100..300).map(|s| entry(s, 2)).collect());

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out)?;
        let staged = merge_runs(&[a, b], &out.join("0"), 1, &mut |_| {})?;
        let index = staged.commit()?;
        let run = Run::open_with_index(out.join("0"), index)?;

        let total: u64 = run.entries_in(0, run.len()).map(|e| e.count()).sum();
        assert_eq!(total, 400);

        // Spot-check an overlapping key.
        let key = *entry(150, 0).key();
        let (begin, end) = run.equal_range(&key, KeyCompare::WithoutReverseMove);
        let counts: Vec<u64> = run.entries_in(begin, end).map(|e| e.count()).collect();
        assert_eq!(counts, vec![2]);
        Ok(())
    }

    #[test]
    fn progress_reaches_the_total() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let a = make_run(dir.path(), 0, (0..64).map(|s| entry(s, 1)).collect());
        let b = make_run(dir.path(), 1, (0..64).map(|s| entry(s, 2)).collect());
        let expected_total = a.size_bytes() + b.size_bytes();

        let out = dir.path().join("merged");
        std::fs::create_dir_all(&out)?;
        let mut final_report = None;
        let staged = merge_runs(&[a, b], &out.join("0"), 256, &mut |p| {
            final_report = Some(*p);
        })?;
        staged.commit()?;

        let report = final_report.expect("at least one progress report");
        assert_eq!(report.work_total, expected_total);
        assert_eq!(report.work_done, expected_total);
        Ok(())
    }
}
