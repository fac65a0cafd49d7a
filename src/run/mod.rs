//! Immutable sorted run files.
//!
//! A run is a packed array of 24-byte records sorted by the full key, with
//! no header; the record count comes from the file length. Each run has a
//! sibling `<id>_index` file holding the sparse range index. Runs are
//! memory-mapped read-only and never modified in place: writers stage into
//! `<id>.tmp` and rename into place once the bytes are durable.
//!
//! Equal-range lookups bracket the key through the sparse index and then
//! run an interpolation search (alternated with midpoint probes, so the
//! worst case stays logarithmic) inside the bounded window. Batched lookups
//! require their keys sorted ascending and advance the index cursor
//! monotonically across the whole batch.

pub mod index;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::entry::{Entry, ENTRY_SIZE};
use crate::key::{Key, KeyCompare};

pub use index::{IndexBuilder, RangeIndex};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt run {path:?}: {reason}")]
    Corrupt {
        path: PathBuf,
        reason: &'static str,
    },
}

/// Run id parsed from a file name; `None` for index files, staging files
/// and anything else that is not a bare numeric name.
pub fn id_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    if name.contains("index") {
        return None;
    }
    name.parse().ok()
}

/// Path of the sibling index file for a run at `path`.
pub fn index_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push("_index");
    path.with_file_name(name)
}

pub(crate) fn fsync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// A memory-mapped run plus its loaded range index.
#[derive(Debug)]
pub struct Run {
    path: PathBuf,
    id: u32,
    mmap: Mmap,
    index: RangeIndex,
    len: usize,
}

impl Run {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RunError> {
        let path = path.as_ref();
        let index = RangeIndex::load(&index_path_for(path))?;
        Self::open_with_index(path, index)
    }

    /// Open a run reusing an index that is already in memory (the store
    /// pipeline hands the freshly built index over with the file).
    pub fn open_with_index(path: impl AsRef<Path>, index: RangeIndex) -> Result<Self, RunError> {
        let path = path.as_ref().to_path_buf();
        let id = id_from_path(&path).ok_or_else(|| RunError::Corrupt {
            path: path.clone(),
            reason: "file name is not a run id",
        })?;

        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() % ENTRY_SIZE != 0 {
            return Err(RunError::Corrupt {
                path,
                reason: "file size is not a multiple of the record size",
            });
        }
        let len = mmap.len() / ENTRY_SIZE;

        if len > 0 && index.is_empty() {
            return Err(RunError::Corrupt {
                path,
                reason: "missing index for non-empty run",
            });
        }
        if let Some(&(_, position)) = index.entries().last() {
            if position >= len as u64 {
                return Err(RunError::Corrupt {
                    path,
                    reason: "index references past the end of the run",
                });
            }
        }

        Ok(Self {
            path,
            id,
            mmap,
            index,
            len,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn index(&self) -> &RangeIndex {
        &self.index
    }

    pub fn entry(&self, position: usize) -> Entry {
        debug_assert!(position < self.len);
        let offset = position * ENTRY_SIZE;
        Entry::decode(&self.mmap[offset..offset + ENTRY_SIZE])
    }

    fn key_at(&self, position: usize) -> Key {
        *self.entry(position).key()
    }

    /// `[begin, end)` of records equal to `key` under `compare`.
    pub fn equal_range(&self, key: &Key, compare: KeyCompare) -> (usize, usize) {
        let (_, begin, end) = self.equal_range_from(key, compare, 0);
        (begin, end)
    }

    /// Batched [`Self::equal_range`]; `keys` must be sorted ascending under
    /// `compare`, which lets the index cursor advance monotonically.
    pub fn equal_range_many(&self, keys: &[Key], compare: KeyCompare) -> Vec<(usize, usize)> {
        debug_assert!(keys.windows(2).all(|p| compare.cmp(&p[0], &p[1]).is_le()));

        let mut ranges = Vec::with_capacity(keys.len());
        let mut cursor = 0;
        for key in keys {
            let (next, begin, end) = self.equal_range_from(key, compare, cursor);
            cursor = next;
            ranges.push((begin, end));
        }
        ranges
    }

    fn equal_range_from(
        &self,
        key: &Key,
        compare: KeyCompare,
        cursor: usize,
    ) -> (usize, usize, usize) {
        if self.len == 0 {
            return (cursor, 0, 0);
        }

        let (next, lo, hi) = self.index.bracket_from(key, cursor);
        let lo = lo as usize;
        let hi = hi.map_or(self.len, |pos| pos as usize);

        let begin = self.search_boundary(lo, hi, key, |entry, key| compare.cmp(entry, key).is_lt());
        let end = self.search_boundary(begin, hi, key, |entry, key| compare.cmp(entry, key).is_le());
        (next, begin, end)
    }

    /// First position in `[lo, hi)` whose key makes `keep_going` false.
    ///
    /// Probes by interpolating the 96-bit key prefix over the window,
    /// alternating with midpoint probes.
    fn search_boundary(
        &self,
        mut lo: usize,
        mut hi: usize,
        key: &Key,
        keep_going: impl Fn(&Key, &Key) -> bool,
    ) -> usize {
        let target = key.prefix_value();
        let mut interpolate = true;

        while lo < hi {
            let mid = if interpolate {
                self.interpolated_probe(lo, hi, target)
            } else {
                lo + (hi - lo) / 2
            };
            interpolate = !interpolate;

            if keep_going(&self.key_at(mid), key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn interpolated_probe(&self, lo: usize, hi: usize, target: u128) -> usize {
        let lo_val = self.key_at(lo).prefix_value();
        let hi_val = self.key_at(hi - 1).prefix_value();
        if hi_val <= lo_val || target <= lo_val {
            return lo;
        }

        let span = (hi - lo - 1) as u128;
        let denom = hi_val - lo_val;
        let num = (target - lo_val).min(denom);
        // Scale both sides down so `num * span` cannot overflow.
        let shift = (128 - num.leading_zeros()).saturating_sub(64);
        let num = num >> shift;
        let denom = (denom >> shift).max(1);

        lo + ((num * span) / denom).min(span) as usize
    }

    /// Lazy cursor over `[begin, end)`.
    pub fn entries_in(&self, begin: usize, end: usize) -> Entries<'_> {
        debug_assert!(begin <= end && end <= self.len);
        Entries {
            run: self,
            position: begin,
            end,
        }
    }
}

pub struct Entries<'a> {
    run: &'a Run,
    position: usize,
    end: usize,
}

impl Iterator for Entries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.position >= self.end {
            return None;
        }
        let entry = self.run.entry(self.position);
        self.position += 1;
        Some(entry)
    }
}

/// Streaming run writer: records go to `<path>.tmp`, the sparse index is
/// built along the way, and `finish` makes both files durable before the
/// rename publishes the run.
pub struct RunWriter {
    path_tmp: PathBuf,
    path_final: PathBuf,
    writer: BufWriter<File>,
    index: IndexBuilder,
    scratch: Vec<u8>,
    entries: u64,
}

impl RunWriter {
    pub fn create(path: impl AsRef<Path>, granularity: usize) -> Result<Self, RunError> {
        let path_final = path.as_ref().to_path_buf();
        let path_tmp = path_final.with_extension("tmp");
        let file = File::create(&path_tmp)?;
        Ok(Self {
            path_tmp,
            path_final,
            writer: BufWriter::new(file),
            index: IndexBuilder::new(granularity),
            scratch: Vec::with_capacity(ENTRY_SIZE),
            entries: 0,
        })
    }

    pub fn push(&mut self, entry: &Entry) -> Result<(), RunError> {
        self.scratch.clear();
        entry.encode_into(&mut self.scratch);
        self.writer.write_all(&self.scratch)?;
        self.index.push(entry.key());
        self.entries += 1;
        Ok(())
    }

    pub fn entries_written(&self) -> u64 {
        self.entries
    }

    /// Make the staged bytes and the index durable, but leave the run at
    /// its staging path. The merger uses this to unlink its inputs before
    /// the rename publishes the replacement.
    pub fn finish_staged(self) -> Result<StagedRun, RunError> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;
        drop(file);

        let index = self.index.finish();
        index.save(&index_path_for(&self.path_final))?;

        Ok(StagedRun {
            path_tmp: self.path_tmp,
            path_final: self.path_final,
            index,
        })
    }

    pub fn finish(self) -> Result<RangeIndex, RunError> {
        self.finish_staged()?.commit()
    }
}

/// A completely written run still sitting at its staging path.
pub struct StagedRun {
    path_tmp: PathBuf,
    path_final: PathBuf,
    index: RangeIndex,
}

impl StagedRun {
    pub fn final_path(&self) -> &Path {
        &self.path_final
    }

    /// Rename into place and return the in-memory index.
    pub fn commit(self) -> Result<RangeIndex, RunError> {
        std::fs::rename(&self.path_tmp, &self.path_final)?;
        fsync_parent_dir(&self.path_final)?;
        Ok(self.index)
    }
}

/// Write a sorted buffer as a complete run with its sparse index.
pub fn write_run(path: &Path, entries: &[Entry]) -> Result<RangeIndex, RunError> {
    let mut writer = RunWriter::create(path, index::granularity_for(entries.len()))?;
    for entry in entries {
        writer.push(entry)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::{
        Color, GameLevel, GameResult, Move, Piece, PieceType, Position, ReverseMove, Square,
    };
    use crate::pipeline::sort_and_combine;

    fn board(seed: u32) -> Position {
        let mut pos = Position::initial();
        pos.set_piece(
            Square::from_index((seed % 64) as u8),
            Piece::new(PieceType::Knight, Color::White),
        );
        if seed % 2 == 1 {
            pos.set_side_to_move(Color::Black);
        }
        pos
    }

    fn sample_entries() -> Vec<Entry> {
        let mut entries = Vec::new();
        for seed in 0..96u32 {
            let pos = board(seed);
            let rm = ReverseMove::new(Move::new(
                Square::from_index((seed % 60) as u8),
                Square::from_index((seed % 60 + 4) as u8),
            ));
            for (result, offset) in [
                (GameResult::WhiteWin, 10 + seed as u64),
                (GameResult::Draw, 500 + seed as u64),
            ] {
                entries.push(Entry::new(
                    &pos,
                    Some(&rm),
                    GameLevel::Human,
                    result,
                    offset,
                ));
                entries.push(Entry::new(&pos, None, GameLevel::Engine, result, offset));
            }
        }
        sort_and_combine(&mut entries);
        entries
    }

    fn linear_equal_range(entries: &[Entry], key: &Key, compare: KeyCompare) -> (usize, usize) {
        let begin = entries
            .iter()
            .position(|e| compare.eq(e.key(), key))
            .unwrap_or(entries.len());
        let end = entries
            .iter()
            .rposition(|e| compare.eq(e.key(), key))
            .map_or(begin, |i| i + 1);
        (begin, end)
    }

    #[test]
    fn equal_range_matches_linear_scan() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let entries = sample_entries();

        let path = dir.path().join("0");
        let index = write_run(&path, &entries)?;
        let run = Run::open_with_index(&path, index)?;
        assert_eq!(run.len(), entries.len());

        for compare in [KeyCompare::WithoutReverseMove, KeyCompare::WithReverseMove] {
            for entry in &entries {
                let expected = linear_equal_range(&entries, entry.key(), compare);
                assert_eq!(run.equal_range(entry.key(), compare), expected);
            }
        }
        Ok(())
    }

    #[test]
    fn equal_range_many_agrees_with_singles() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let entries = sample_entries();
        let path = dir.path().join("3");
        write_run(&path, &entries)?;
        let run = Run::open(&path)?;

        let mut keys: Vec<Key> = entries.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys.dedup_by(|a, b| a.eq_without_reverse_move(b));

        let ranges = run.equal_range_many(&keys, KeyCompare::WithoutReverseMove);
        for (key, range) in keys.iter().zip(&ranges) {
            assert_eq!(run.equal_range(key, KeyCompare::WithoutReverseMove), *range);
        }
        Ok(())
    }

    #[test]
    fn missing_keys_yield_empty_ranges() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let entries = sample_entries();
        let path = dir.path().join("1");
        write_run(&path, &entries)?;
        let run = Run::open(&path)?;

        let mut absent = Position::initial();
        absent.set_piece(Square::new(4, 4), Piece::new(PieceType::Queen, Color::Black));
        absent.set_piece(Square::new(5, 5), Piece::new(PieceType::Queen, Color::Black));
        let key = Key::probe(&absent, None);
        let (begin, end) = run.equal_range(&key, KeyCompare::WithoutReverseMove);
        assert_eq!(begin, end);
        Ok(())
    }

    #[test]
    fn reopen_reads_identical_records() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let entries = sample_entries();
        let path = dir.path().join("12");
        write_run(&path, &entries)?;

        let run = Run::open(&path)?;
        let read: Vec<Entry> = run.entries_in(0, run.len()).collect();
        assert_eq!(read, entries);
        Ok(())
    }

    #[test]
    fn truncated_run_is_reported_corrupt() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let entries = sample_entries();
        let path = dir.path().join("5");
        write_run(&path, &entries)?;

        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() - 7])?;
        assert!(matches!(Run::open(&path), Err(RunError::Corrupt { .. })));
        Ok(())
    }
}
