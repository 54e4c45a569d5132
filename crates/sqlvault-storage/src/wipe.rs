//! Disposal of plaintext working files.
//!
//! Overwriting before unlinking is best effort: journaling and copy-on-write
//! file systems may keep old blocks. The working directory should live on a
//! tmpfs where one is available.

use std::{
    fs::{self, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, instrument};

/// SQLite files that sit next to an open database.
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];
/// Sidecars whose non-empty presence means the database has unmerged pages.
const JOURNAL_SUFFIXES: [&str; 2] = ["-wal", "-journal"];
const CHUNK: usize = 64 * 1024;

/// Zero-fill, sync and remove `path`. Returns `false` if it did not exist.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn wipe_file(path: &Path) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    let len = file.metadata()?.len();
    let zeros = [0u8; CHUNK];
    let mut remaining = len;
    file.seek(SeekFrom::Start(0))?;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    drop(file);

    fs::remove_file(path)?;
    debug!(len, "plaintext wiped");
    Ok(true)
}

/// Wipe the working database together with its SQLite sidecars.
/// Returns how many files were removed.
pub fn wipe_working_set(path: &Path) -> io::Result<usize> {
    let mut removed = usize::from(wipe_file(path)?);
    for suffix in SIDECAR_SUFFIXES {
        removed += usize::from(wipe_file(&sidecar(path, suffix))?);
    }
    Ok(removed)
}

/// First non-empty write-ahead log or rollback journal next to `path`.
pub fn open_journal(path: &Path) -> io::Result<Option<PathBuf>> {
    for suffix in JOURNAL_SUFFIXES {
        let candidate = sidecar(path, suffix);
        match fs::metadata(&candidate) {
            Ok(meta) if meta.len() > 0 => return Ok(Some(candidate)),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
