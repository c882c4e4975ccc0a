//! Snapshot file codec for [`crate::file::FileStore`].
//!
//! A snapshot is a pretty-printed JSON array of metric records:
//!
//! ```text
//! [
//!   { "id": "hits", "type": "counter", "delta": 12 },
//!   { "id": "temp", "type": "gauge", "value": 21.5 }
//! ]
//! ```
//!
//! Writes go to a sibling `*.tmp` file that is renamed over the target, so a
//! crash mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};
use crate::metric::Metric;

/// Reads a snapshot.
///
/// Returns `Ok(None)` if the file does not exist or is empty.
///
/// # Errors
///
/// - [`SnapshotError::Read`] if the file exists but cannot be read
/// - [`SnapshotError::Parse`] if the contents are not a metric array
pub fn read(path: &Path) -> Result<Option<Vec<Metric>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SnapshotError::Read {
                path: path.to_path_buf(),
                source: e,
            }
            .into());
        }
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    let records = serde_json::from_str(&contents).map_err(|e| SnapshotError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(records))
}

/// Writes `records` as the new snapshot, replacing any previous one.
///
/// # Errors
///
/// - [`SnapshotError::Serialize`] if the records cannot be encoded
/// - [`SnapshotError::Write`] if the temporary file cannot be written or
///   renamed into place
pub fn write(path: &Path, records: &[Metric]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)
        .map_err(|e| SnapshotError::Serialize { source: e })?;

    let tmp_path = temp_path(path);
    let write_err = |e: std::io::Error| SnapshotError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    fs::write(&tmp_path, json).map_err(write_err)?;
    fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
