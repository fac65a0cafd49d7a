//! Sparse range index for run files.
//!
//! The index is a packed array of `(key, position)` pairs, one per indexed
//! group start. A group is a maximal span of records that compare equal
//! under the without-reverse-move comparator. The builder samples group
//! starts roughly every `granularity` records; the first and the final
//! group are always present. Lookups use the index to bracket a key into a
//! bounded window of the run before searching the mapped file itself.
//!
//! On disk an index record is 24 bytes little-endian: the four key lanes
//! followed by a `u64` record position.

use std::io::Write;
use std::path::Path;

use crate::key::Key;

use super::RunError;

/// Bytes per on-disk index record.
pub const INDEX_RECORD_SIZE: usize = 24;

/// Sparse index size rule used by every run writer: one index record per
/// 1024 entries, minimum one.
pub fn index_size_for(num_entries: usize) -> usize {
    (num_entries / 1024).max(1)
}

/// Sampling step derived from [`index_size_for`].
pub fn granularity_for(num_entries: usize) -> usize {
    num_entries.div_ceil(index_size_for(num_entries)).max(1)
}

#[derive(Debug, Clone, Default)]
pub struct RangeIndex {
    entries: Vec<(Key, u64)>,
}

impl RangeIndex {
    pub fn from_entries(entries: Vec<(Key, u64)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Key, u64)] {
        &self.entries
    }

    /// Window of the run that must contain every record equal to `key`
    /// under the without-reverse-move comparator, starting the index scan
    /// at `start`. Returns the advanced index cursor and the window
    /// `[lo, hi)`; `hi` is `None` when the window is open-ended.
    ///
    /// Cursors exploit sorted query batches: for ascending keys the cursor
    /// only ever moves forward, so a whole batch costs one index pass.
    pub fn bracket_from(&self, key: &Key, start: usize) -> (usize, u64, Option<u64>) {
        let mut cursor = start;
        while cursor < self.entries.len()
            && self.entries[cursor]
                .0
                .cmp_without_reverse_move(key)
                .is_le()
        {
            cursor += 1;
        }

        let lo = if cursor == 0 {
            0
        } else {
            self.entries[cursor - 1].1
        };
        let hi = self.entries.get(cursor).map(|&(_, pos)| pos);
        (cursor, lo, hi)
    }

    /// Load and validate a sibling `_index` file.
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() % INDEX_RECORD_SIZE != 0 {
            return Err(RunError::Corrupt {
                path: path.to_path_buf(),
                reason: "index size is not a multiple of the record size",
            });
        }

        let mut entries = Vec::with_capacity(bytes.len() / INDEX_RECORD_SIZE);
        for record in bytes.chunks_exact(INDEX_RECORD_SIZE) {
            let lane = |i: usize| {
                u32::from_le_bytes(record[i * 4..i * 4 + 4].try_into().expect("lane slice"))
            };
            let key = Key::from_lanes([lane(0), lane(1), lane(2), lane(3)]);
            let position = u64::from_le_bytes(record[16..24].try_into().expect("position slice"));
            entries.push((key, position));
        }

        for pair in entries.windows(2) {
            let key_monotone = pair[0].0.cmp_without_reverse_move(&pair[1].0).is_lt();
            if !key_monotone || pair[0].1 >= pair[1].1 {
                return Err(RunError::Corrupt {
                    path: path.to_path_buf(),
                    reason: "index entries are not monotone",
                });
            }
        }

        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), RunError> {
        let mut buf = Vec::with_capacity(self.entries.len() * INDEX_RECORD_SIZE);
        for (key, position) in &self.entries {
            for lane in key.lanes() {
                buf.extend_from_slice(&lane.to_le_bytes());
            }
            buf.extend_from_slice(&position.to_le_bytes());
        }

        let mut file = std::fs::File::create(path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Streaming sparse index builder, fed every record of a run in order.
///
/// Shared by the pipeline writer (over a sorted in-memory buffer) and the
/// merger (over a stream of unknown final length).
#[derive(Debug)]
pub struct IndexBuilder {
    granularity: u64,
    next_sample: u64,
    position: u64,
    previous: Option<Key>,
    group_start: Option<(Key, u64)>,
    group_indexed: bool,
    out: Vec<(Key, u64)>,
}

impl IndexBuilder {
    pub fn new(granularity: usize) -> Self {
        Self {
            granularity: granularity.max(1) as u64,
            next_sample: 0,
            position: 0,
            previous: None,
            group_start: None,
            group_indexed: false,
            out: Vec::new(),
        }
    }

    /// Builder sized by the run-writer rule for `num_entries` records.
    pub fn for_len(num_entries: usize) -> Self {
        Self::new(granularity_for(num_entries))
    }

    pub fn push(&mut self, key: &Key) {
        let new_group = self
            .previous
            .as_ref()
            .map_or(true, |prev| !prev.eq_without_reverse_move(key));

        if new_group {
            self.group_start = Some((*key, self.position));
            if self.position >= self.next_sample {
                self.out.push((*key, self.position));
                self.next_sample = self.position + self.granularity;
                self.group_indexed = true;
            } else {
                self.group_indexed = false;
            }
        }

        self.previous = Some(*key);
        self.position += 1;
    }

    pub fn finish(mut self) -> RangeIndex {
        // The last index entry always references the final group.
        if let Some(group_start) = self.group_start {
            if !self.group_indexed {
                self.out.push(group_start);
            }
        }
        RangeIndex::from_entries(self.out)
    }
}
