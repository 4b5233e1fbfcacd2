//! On-disk image of a committed group.
//!
//! A file holds one bincode-encoded `FileImage`. Writes go to a sibling
//! temporary file that is then renamed over the target.

use crate::group::Group;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tessel_core::{Error, Result};

const MAGIC: [u8; 8] = *b"TESSEL\0\x01";
const FORMAT_VERSION: u32 = 1;

/// Fingerprint of an encryption key, stored instead of the key itself.
pub type KeyFingerprint = [u8; 32];

/// Computes the fingerprint of an encryption key.
pub fn fingerprint(key: &[u8]) -> KeyFingerprint {
    *blake3::hash(key).as_bytes()
}

#[derive(Serialize, Deserialize)]
struct FileImage {
    magic: [u8; 8],
    format_version: u32,
    key_fingerprint: Option<KeyFingerprint>,
    version: u64,
    group: Group,
}

/// Contents read back from a file.
#[derive(Debug)]
pub(crate) struct LoadedFile {
    pub version: u64,
    pub group: Group,
}

/// Reads and verifies a file against the expected key fingerprint.
pub(crate) fn read_file(path: &Path, key: Option<&KeyFingerprint>) -> Result<LoadedFile> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let image: FileImage =
        bincode::deserialize(&bytes).map_err(|e| Error::corrupted(path, e.to_string()))?;
    if image.magic != MAGIC {
        return Err(Error::corrupted(path, "not a tessel file"));
    }
    if image.format_version != FORMAT_VERSION {
        return Err(Error::corrupted(
            path,
            format!("unsupported file format {}", image.format_version),
        ));
    }
    if image.key_fingerprint.as_ref() != key {
        return Err(Error::Encryption {
            path: path.to_path_buf(),
        });
    }
    let mut group = image.group;
    group.rebuild_indexes()?;
    Ok(LoadedFile {
        version: image.version,
        group,
    })
}

/// Writes a group atomically through a temporary sibling file.
pub(crate) fn write_file(
    path: &Path,
    key: Option<&KeyFingerprint>,
    version: u64,
    group: &Group,
) -> Result<()> {
    let image = FileImage {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        key_fingerprint: key.copied(),
        version,
        group: group.clone(),
    };
    let bytes = bincode::serialize(&image).map_err(|e| {
        Error::io(path, io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    })?;
    let tmp = temp_path(path);
    fs::write(&tmp, &bytes).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
