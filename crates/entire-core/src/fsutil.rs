//! Filesystem utilities for crash-safe writes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::EntireResult;

/// Write data to a file atomically using temp-file-then-rename.
///
/// On POSIX, `rename()` within the same filesystem is atomic: either the
/// old file or the new file is visible, never a partial write. We fsync
/// the temp file before renaming so the data is durable on disk.
pub fn atomic_write(path: &Path, data: &[u8]) -> EntireResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_data()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and deserialize a JSON file, returning `None` if it doesn't exist.
pub fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> EntireResult<Option<T>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, ignoring "not found".
pub fn remove_if_exists(path: &Path) -> EntireResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
