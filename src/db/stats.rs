//! Persisted database statistics: per game level, the number of stored
//! games and recorded positions. Fixed 48-byte little-endian file, three
//! `(u64, u64)` pairs in level order, rewritten atomically after imports.

use std::io::Write;
use std::path::Path;

use crate::chess::ByLevel;
use crate::import::ImportStats;

pub const STATS_FILE: &str = "stats";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleLevelStats {
    pub num_games: u64,
    pub num_positions: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub by_level: ByLevel<SingleLevelStats>,
}

impl DatabaseStats {
    pub fn total_games(&self) -> u64 {
        self.by_level.iter().map(|(_, s)| s.num_games).sum()
    }

    pub fn total_positions(&self) -> u64 {
        self.by_level.iter().map(|(_, s)| s.num_positions).sum()
    }

    pub fn record_import(&mut self, import: &ImportStats) {
        for (level, stats) in self.by_level.iter_mut() {
            let imported = &import.by_level[level];
            stats.num_games += imported.num_games;
            stats.num_positions += imported.num_positions;
        }
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e),
        };
        if bytes.len() != 48 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stats file has the wrong size",
            ));
        }

        let u64_at =
            |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().expect("u64 slice"));
        let mut lane = 0;
        let by_level = ByLevel::from_fn(|_| {
            let stats = SingleLevelStats {
                num_games: u64_at(lane),
                num_positions: u64_at(lane + 1),
            };
            lane += 2;
            stats
        });
        Ok(Self { by_level })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(48);
        for (_, stats) in self.by_level.iter() {
            bytes.extend_from_slice(&stats.num_games.to_le_bytes());
            bytes.extend_from_slice(&stats.num_positions.to_le_bytes());
        }

        let tmp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        crate::run::fsync_parent_dir(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::GameLevel;
    use crate::import::SingleLevelImportStats;

    #[test]
    fn save_load_roundtrip() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join(STATS_FILE);

        let mut stats = DatabaseStats::default();
        let mut import = ImportStats::default();
        import.by_level[GameLevel::Engine] = SingleLevelImportStats {
            num_games: 11,
            num_skipped_games: 2,
            num_malformed_games: 0,
            num_positions: 400,
        };
        stats.record_import(&import);
        stats.save(&path)?;

        let loaded = DatabaseStats::load(&path)?;
        assert_eq!(
            loaded.by_level[GameLevel::Engine],
            SingleLevelStats {
                num_games: 11,
                num_positions: 400
            }
        );
        assert_eq!(loaded.total_games(), 11);
        Ok(())
    }

    #[test]
    fn missing_file_loads_as_empty() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let loaded = DatabaseStats::load(&dir.path().join(STATS_FILE))?;
        assert_eq!(loaded.total_games(), 0);
        Ok(())
    }
}
