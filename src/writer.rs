//! Crash-safe writes of the target file.
//!
//! Every destination is written through a temporary file in the same
//! directory which is flushed, synced and then renamed over the target, so
//! Prometheus' file watcher only ever sees the old or the new document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::types::Snapshot;

/// Serialize `snapshot` and atomically replace `path` with it.
pub fn write(path: &Path, snapshot: &Snapshot) -> Result<()> {
    write_bytes(path, &snapshot.to_json()?)
}

/// Write `snapshot` to every destination. Each path is attempted regardless
/// of earlier failures; all failures are returned.
pub fn write_all(paths: &[PathBuf], snapshot: &Snapshot) -> Vec<(PathBuf, Error)> {
    paths
        .iter()
        .filter_map(|path| write(path, snapshot).err().map(|e| (path.clone(), e)))
        .collect()
}

/// Atomically replace `path` with `bytes`, creating its directory if needed.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| Error::io(path, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(path, e))?;
    tmp.write_all(bytes).map_err(|e| Error::io(path, e))?;
    tmp.flush().map_err(|e| Error::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(path, e))?;

    // NamedTempFile is created 0600; Prometheus often runs as another user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::io(path, e))?;
    }

    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    sync_dir(dir);
    Ok(())
}

// Best effort: persists the rename where the directory can be opened.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}
