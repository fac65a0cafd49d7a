//! Per-game-level header store.
//!
//! Two append-only files per level: `header`, a concatenation of
//! variable-length game records, and `index`, a packed array of `u64` byte
//! offsets into `header`, one per game. A game's id is its position in the
//! index; the byte offset of its record is what run entries carry.
//!
//! Record layout (little-endian), after a leading `u16` payload size:
//!
//! ```text
//! [version u16]
//! [year u16][month u8][day u8]
//! [eco letter u8][eco index u8]
//! [ply_count u16]  (u16::MAX = unknown)
//! [white_elo u16][black_elo u16][round u16]
//! [flags u8]       (bit 0: extra tag pairs follow the names)
//! [event][white][black]            each a u8 length + bytes, max 255
//! [pair count u8][name][value]...  only when the flag bit is set
//! ```
//!
//! Appends serialize under a mutex, so concurrent importers interleave
//! cleanly. Readers use positional reads and never need the lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::chess::{Date, Eco};

pub const UNKNOWN_PLY_COUNT: u16 = u16::MAX;

const HEADER_FILE: &str = "header";
const INDEX_FILE: &str = "index";

const FORMAT_VERSION: u16 = 0;
const FLAG_EXTRA_TAGS: u8 = 0b0000_0001;
const MAX_STRING_BYTES: usize = 255;
const FIXED_FIELDS_BYTES: usize = 17;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt header store {path:?}: {reason}")]
    Corrupt {
        path: PathBuf,
        reason: &'static str,
    },

    #[error("game reference out of range: {0}")]
    OutOfRange(u64),
}

/// Metadata stored for one game.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GameMetadata {
    pub date: Date,
    pub eco: Eco,
    pub ply_count: u16,
    pub white_elo: u16,
    pub black_elo: u16,
    pub round: u16,
    pub event: String,
    pub white: String,
    pub black: String,
    pub extra_tags: Vec<(String, String)>,
}

fn truncated(value: &str) -> &[u8] {
    let mut end = value.len().min(MAX_STRING_BYTES);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].as_bytes()
}

fn push_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = truncated(value);
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

fn read_string(bytes: &[u8], at: &mut usize) -> Option<String> {
    let len = *bytes.get(*at)? as usize;
    *at += 1;
    let slice = bytes.get(*at..*at + len)?;
    *at += len;
    Some(String::from_utf8_lossy(slice).into_owned())
}

impl GameMetadata {
    pub fn ply_count(&self) -> Option<u16> {
        (self.ply_count != UNKNOWN_PLY_COUNT).then_some(self.ply_count)
    }

    /// Record payload, without the leading size field.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(FIXED_FIELDS_BYTES + 64);
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.date.year.to_le_bytes());
        buf.push(self.date.month);
        buf.push(self.date.day);
        buf.push(self.eco.letter);
        buf.push(self.eco.index);
        buf.extend_from_slice(&self.ply_count.to_le_bytes());
        buf.extend_from_slice(&self.white_elo.to_le_bytes());
        buf.extend_from_slice(&self.black_elo.to_le_bytes());
        buf.extend_from_slice(&self.round.to_le_bytes());

        let flags = if self.extra_tags.is_empty() {
            0
        } else {
            FLAG_EXTRA_TAGS
        };
        buf.push(flags);

        push_string(&mut buf, &self.event);
        push_string(&mut buf, &self.white);
        push_string(&mut buf, &self.black);

        if flags & FLAG_EXTRA_TAGS != 0 {
            let pairs = self.extra_tags.len().min(u8::MAX as usize);
            buf.push(pairs as u8);
            for (name, value) in self.extra_tags.iter().take(pairs) {
                push_string(&mut buf, name);
                push_string(&mut buf, value);
            }
        }

        Bytes::from(buf)
    }

    /// Decode a record payload produced by [`Self::encode`].
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, HeaderError> {
        let corrupt = |reason| HeaderError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        if bytes.len() < FIXED_FIELDS_BYTES {
            return Err(corrupt("record shorter than its fixed fields"));
        }

        let u16_at = |i: usize| u16::from_le_bytes(bytes[i..i + 2].try_into().expect("u16 slice"));

        let mut meta = GameMetadata {
            date: Date {
                year: u16_at(2),
                month: bytes[4],
                day: bytes[5],
            },
            eco: Eco {
                letter: bytes[6],
                index: bytes[7],
            },
            ply_count: u16_at(8),
            white_elo: u16_at(10),
            black_elo: u16_at(12),
            round: u16_at(14),
            ..GameMetadata::default()
        };
        let flags = bytes[16];

        let mut at = FIXED_FIELDS_BYTES;
        meta.event = read_string(bytes, &mut at).ok_or_else(|| corrupt("truncated event"))?;
        meta.white = read_string(bytes, &mut at).ok_or_else(|| corrupt("truncated white"))?;
        meta.black = read_string(bytes, &mut at).ok_or_else(|| corrupt("truncated black"))?;

        if flags & FLAG_EXTRA_TAGS != 0 {
            let pairs = *bytes.get(at).ok_or_else(|| corrupt("truncated tag count"))?;
            at += 1;
            for _ in 0..pairs {
                let name = read_string(bytes, &mut at).ok_or_else(|| corrupt("truncated tag"))?;
                let value = read_string(bytes, &mut at).ok_or_else(|| corrupt("truncated tag"))?;
                meta.extra_tags.push((name, value));
            }
        }

        Ok(meta)
    }
}

#[derive(Debug)]
struct AppendState {
    header: File,
    index: File,
    header_len: u64,
    num_games: u64,
}

/// Append-only header store for one game level.
#[derive(Debug)]
pub struct HeaderStore {
    dir: PathBuf,
    header_read: File,
    index_read: File,
    state: Mutex<AppendState>,
}

impl HeaderStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, HeaderError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let open_append = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        let header = open_append(HEADER_FILE)?;
        let index = open_append(INDEX_FILE)?;

        let header_len = header.metadata()?.len();
        let index_len = index.metadata()?.len();
        if index_len % 8 != 0 {
            return Err(HeaderError::Corrupt {
                path: dir.join(INDEX_FILE),
                reason: "index size is not a multiple of 8",
            });
        }

        let header_read = File::open(dir.join(HEADER_FILE))?;
        let index_read = File::open(dir.join(INDEX_FILE))?;

        Ok(Self {
            dir,
            header_read,
            index_read,
            state: Mutex::new(AppendState {
                header,
                index,
                header_len,
                num_games: index_len / 8,
            }),
        })
    }

    /// Append one game; returns its id and the byte offset of its record
    /// (the value run entries carry).
    pub fn add_game(&self, metadata: &GameMetadata) -> Result<(u32, u64), HeaderError> {
        let payload = metadata.encode();
        let mut record = Vec::with_capacity(2 + payload.len());
        record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        record.extend_from_slice(&payload);

        let mut state = self.state.lock();
        let offset = state.header_len;
        let id = state.num_games;

        state.header.write_all(&record)?;
        state.index.write_all(&offset.to_le_bytes())?;
        state.header_len += record.len() as u64;
        state.num_games += 1;

        Ok((id as u32, offset))
    }

    pub fn next_game_id(&self) -> u32 {
        self.state.lock().num_games as u32
    }

    fn snapshot(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.header_len, state.num_games)
    }

    fn record_at(&self, offset: u64, header_len: u64) -> Result<GameMetadata, HeaderError> {
        if offset + 2 > header_len {
            return Err(HeaderError::OutOfRange(offset));
        }
        let mut size_bytes = [0u8; 2];
        self.header_read.read_exact_at(&mut size_bytes, offset)?;
        let size = u16::from_le_bytes(size_bytes) as u64;
        if offset + 2 + size > header_len {
            return Err(HeaderError::Corrupt {
                path: self.dir.join(HEADER_FILE),
                reason: "record size extends past the end of the blob",
            });
        }

        let mut payload = vec![0u8; size as usize];
        self.header_read.read_exact_at(&mut payload, offset + 2)?;
        GameMetadata::decode(&payload, &self.dir.join(HEADER_FILE))
    }

    fn offset_of(&self, id: u32) -> Result<u64, HeaderError> {
        let mut bytes = [0u8; 8];
        self.index_read.read_exact_at(&mut bytes, u64::from(id) * 8)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Fetch records by blob offset, in the given order.
    pub fn query_by_offsets(&self, offsets: &[u64]) -> Result<Vec<GameMetadata>, HeaderError> {
        let (header_len, _) = self.snapshot();
        offsets
            .iter()
            .map(|&offset| self.record_at(offset, header_len))
            .collect()
    }

    /// Fetch records by game id, in the given order.
    pub fn query_by_ids(&self, ids: &[u32]) -> Result<Vec<GameMetadata>, HeaderError> {
        let (header_len, num_games) = self.snapshot();
        ids.iter()
            .map(|&id| {
                if u64::from(id) >= num_games {
                    return Err(HeaderError::OutOfRange(u64::from(id)));
                }
                self.record_at(self.offset_of(id)?, header_len)
            })
            .collect()
    }

    /// Game id for a record offset, by binary search over the index file.
    pub fn game_id_for_offset(&self, offset: u64) -> Result<Option<u32>, HeaderError> {
        let (_, num_games) = self.snapshot();
        let mut lo = 0u64;
        let mut hi = num_games;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let at_mid = self.offset_of(mid as u32)?;
            match at_mid.cmp(&offset) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok(Some(mid as u32)),
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    pub fn flush(&self) -> Result<(), HeaderError> {
        let state = self.state.lock();
        state.header.sync_data()?;
        state.index.sync_data()?;
        Ok(())
    }
}
