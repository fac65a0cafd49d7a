//! Database manifest: a tiny binary file identifying the on-disk format.
//!
//! Layout: one `u8` key length, the ASCII format key, one endianness byte
//! (0 = little, 1 = big) recording the byte order of the host that created
//! the database. Opening validates both; a mismatch is fatal and leaves the
//! database untouched. The manifest is written to a staging file and
//! renamed into place so a half-written manifest can never be observed.

use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn host() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Little => 0,
            Self::Big => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Little),
            1 => Some(Self::Big),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub key: String,
    pub endianness: Endianness,
}

impl Manifest {
    pub fn for_format(key: &str) -> Self {
        Self {
            key: key.to_string(),
            endianness: Endianness::host(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing manifest in {0:?}")]
    Missing(PathBuf),

    #[error("invalid manifest in {0:?}")]
    Invalid(PathBuf),

    #[error("format key mismatch: found {found:?}, expected {expected:?}")]
    KeyMismatch { found: String, expected: String },

    #[error("endianness mismatch: database was written on a different byte order host")]
    EndiannessMismatch,

    #[error("unknown database format {key:?}")]
    UnknownFormat { key: String },
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn exists(dir: &Path) -> bool {
    manifest_path(dir).exists()
}

pub fn write(dir: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    assert!(manifest.key.len() <= u8::MAX as usize && manifest.key.is_ascii());

    let mut bytes = Vec::with_capacity(2 + manifest.key.len());
    bytes.push(manifest.key.len() as u8);
    bytes.extend_from_slice(manifest.key.as_bytes());
    bytes.push(manifest.endianness.to_byte());

    let final_path = manifest_path(dir);
    let tmp_path = final_path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    drop(file);
    std::fs::rename(&tmp_path, &final_path)?;
    crate::run::fsync_parent_dir(&final_path)?;
    Ok(())
}

pub fn read(dir: &Path) -> Result<Manifest, ManifestError> {
    let path = manifest_path(dir);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing(dir.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let invalid = || ManifestError::Invalid(path.clone());
    let key_len = *bytes.first().ok_or_else(invalid)? as usize;
    if bytes.len() != key_len + 2 {
        return Err(invalid());
    }
    let key = std::str::from_utf8(&bytes[1..1 + key_len])
        .map_err(|_| invalid())?
        .to_string();
    let endianness = Endianness::from_byte(bytes[1 + key_len]).ok_or_else(invalid)?;

    Ok(Manifest { key, endianness })
}

/// Read and validate against the expected format key and the host byte
/// order.
pub fn validate(dir: &Path, expected_key: &str) -> Result<Manifest, ManifestError> {
    let manifest = read(dir)?;
    if manifest.key != expected_key {
        return Err(ManifestError::KeyMismatch {
            found: manifest.key,
            expected: expected_key.to_string(),
        });
    }
    if manifest.endianness != Endianness::host() {
        return Err(ManifestError::EndiannessMismatch);
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_validate_roundtrip() -> Result<(), ManifestError> {
        let dir = tempfile::TempDir::new()?;
        let manifest = Manifest::for_format("posdb");
        write(dir.path(), &manifest)?;

        assert_eq!(read(dir.path())?, manifest);
        assert_eq!(validate(dir.path(), "posdb")?, manifest);
        Ok(())
    }

    #[test]
    fn wrong_key_is_rejected() -> Result<(), ManifestError> {
        let dir = tempfile::TempDir::new()?;
        write(dir.path(), &Manifest::for_format("somethingelse"))?;
        assert!(matches!(
            validate(dir.path(), "posdb"),
            Err(ManifestError::KeyMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn foreign_endianness_is_rejected() -> Result<(), ManifestError> {
        let dir = tempfile::TempDir::new()?;
        let manifest = Manifest {
            key: "posdb".to_string(),
            endianness: match Endianness::host() {
                Endianness::Little => Endianness::Big,
                Endianness::Big => Endianness::Little,
            },
        };
        write(dir.path(), &manifest)?;
        assert!(matches!(
            validate(dir.path(), "posdb"),
            Err(ManifestError::EndiannessMismatch)
        ));
        Ok(())
    }

    #[test]
    fn garbage_is_invalid_and_absence_is_missing() -> Result<(), ManifestError> {
        let dir = tempfile::TempDir::new()?;
        assert!(matches!(
            read(dir.path()),
            Err(ManifestError::Missing(_))
        ));

        std::fs::write(manifest_path(dir.path()), [200, 1, 2])?;
        assert!(matches!(read(dir.path()), Err(ManifestError::Invalid(_))));
        Ok(())
    }
}
