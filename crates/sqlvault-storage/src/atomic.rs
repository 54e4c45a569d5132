use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tempfile::{Builder, NamedTempFile};
use tracing::{debug, instrument, warn};

const TEMP_SUFFIX: &str = ".tmp";

/// How the replaced file should be protected once it lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Owner read/write only (0600 on unix).
    pub restricted: bool,
    /// Hidden + system attributes where the platform has them.
    pub hidden: bool,
}

impl WriteOptions {
    /// Key, password record and envelope.
    pub fn secret() -> Self {
        Self {
            restricted: true,
            hidden: true,
        }
    }

    /// Plaintext working file: private but visible to the database layer.
    pub fn private() -> Self {
        Self {
            restricted: true,
            hidden: false,
        }
    }
}

/// Replace `path` with `bytes` so that observers only ever see the old or
/// the new complete content.
///
/// The data goes to a temp file in the same directory, is synced, and is
/// renamed over `path`. Any failure removes the temp file and leaves `path`
/// untouched.
#[instrument(skip_all, fields(path = %path.display(), len = bytes.len()))]
pub fn write_atomic(path: &Path, bytes: &[u8], options: WriteOptions) -> io::Result<()> {
    stage(path, bytes, options)?.commit()
}

/// Fully written and synced temp file waiting to be renamed over its target.
///
/// Dropping it without `commit` deletes the temp file.
#[derive(Debug)]
pub struct StagedWrite {
    tmp: NamedTempFile,
    target: PathBuf,
    options: WriteOptions,
}

/// First half of [`write_atomic`]: everything up to, but not including, the
/// rename.
pub fn stage(path: &Path, bytes: &[u8], options: WriteOptions) -> io::Result<StagedWrite> {
    let (parent, name) = split(path)?;
    fs::create_dir_all(parent)?;

    let mut tmp = Builder::new()
        .prefix(&temp_prefix(name))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)?;
    if options.restricted {
        restrict(tmp.as_file())?;
    }
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    Ok(StagedWrite {
        tmp,
        target: path.to_path_buf(),
        options,
    })
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Rename the temp file over the target.
    pub fn commit(self) -> io::Result<()> {
        let StagedWrite {
            tmp,
            target,
            options,
        } = self;

        #[cfg(windows)]
        {
            // Replacing a hidden/system file is refused on some Windows versions.
            if target.exists() {
                let _ = platform::set_attributes(&target, platform::NORMAL);
            }
        }

        tmp.persist(&target).map_err(|err| err.error)?;
        sync_parent(&target);

        if options.hidden {
            if let Err(err) = hide(&target) {
                warn!(path = %target.display(), %err, "could not set hidden attribute");
            }
        }
        debug!(path = %target.display(), "atomic replace committed");
        Ok(())
    }
}

/// Remove temp files left behind for `path` by an interrupted write.
///
/// Returns how many were removed.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn sweep_stale(path: &Path) -> io::Result<usize> {
    let (parent, name) = split(path)?;
    let prefix = temp_prefix(name);
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&prefix)
            && file_name.ends_with(TEMP_SUFFIX)
            && entry.file_type()?.is_file()
        {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(removed, "removed temp files from an interrupted write");
    }
    Ok(removed)
}

/// Create `dir` owner-only if it does not exist yet. An existing directory
/// keeps its permissions; files written into it are restricted on their own.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir)?.permissions().mode();
            if mode & 0o077 != 0 {
                warn!(
                    path = %dir.display(),
                    mode = %format!("{:o}", mode & 0o777),
                    "working directory is readable by other users"
                );
            }
        }
        return Ok(());
    }

    if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(err) => Err(err),
    }
}

fn split(path: &Path) -> io::Result<(&Path, &OsStr)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not name a file", path.display()),
        )
    })?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    Ok((parent, name))
}

fn temp_prefix(name: &OsStr) -> String {
    format!(".{}.", name.to_string_lossy())
}

fn restrict(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
                warn!(dir = %parent.display(), %err, "directory sync failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn hide(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    return platform::set_attributes(path, platform::HIDDEN_SYSTEM);
    #[cfg(not(windows))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use std::{io, os::windows::ffi::OsStrExt, path::Path};

    use winapi::um::{
        fileapi::SetFileAttributesW,
        winnt::{FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_NORMAL, FILE_ATTRIBUTE_SYSTEM},
    };

    pub const NORMAL: u32 = FILE_ATTRIBUTE_NORMAL;
    pub const HIDDEN_SYSTEM: u32 = FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM;

    pub fn set_attributes(path: &Path, attributes: u32) -> io::Result<()> {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        // SAFETY: `wide` is a NUL-terminated UTF-16 buffer that outlives the call.
        let ok = unsafe { SetFileAttributesW(wide.as_ptr(), attributes) };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(TEMP_SUFFIX))
            .collect()
    }

    #[test]
    fn replaces_content_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.json");

        write_atomic(&path, b"first", WriteOptions::default()).expect("first write");
        write_atomic(&path, b"second, longer", WriteOptions::default()).expect("second write");

        assert_eq!(fs::read(&path).expect("read"), b"second, longer");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn crash_before_rename_keeps_previous_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("database.db.enc");
        write_atomic(&path, b"previous envelope", WriteOptions::secret()).expect("write");

        let staged = stage(&path, b"half-finished", WriteOptions::secret()).expect("stage");
        let leftover = staged.temp_path().to_path_buf();
        // Process dies here: no rename, no destructor.
        std::mem::forget(staged);

        assert!(leftover.exists());
        assert_eq!(fs::read(&path).expect("read"), b"previous envelope");

        // Next start-up sweeps the orphan.
        assert_eq!(sweep_stale(&path).expect("sweep"), 1);
        assert!(!leftover.exists());
        assert_eq!(fs::read(&path).expect("read"), b"previous envelope");
    }

    #[test]
    fn abandoned_stage_removes_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db_key.key");
        let staged = stage(&path, b"k", WriteOptions::secret()).expect("stage");
        drop(staged);

        assert!(!path.exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn failure_leaves_target_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").expect("write blocker");

        write_atomic(&blocker.join("auth.json"), b"x", WriteOptions::default())
            .expect_err("parent is a file");
        assert_eq!(fs::read(&blocker).expect("read"), b"file");
    }

    #[test]
    fn sweep_ignores_unrelated_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.json");
        fs::write(dir.path().join(".other.json.abc123.tmp"), b"x").expect("write");
        fs::write(dir.path().join("auth.json.tmp"), b"x").expect("write");

        assert_eq!(sweep_stale(&path).expect("sweep"), 0);
        assert_eq!(temp_files(dir.path()).len(), 2);
    }

    #[test]
    fn sweep_of_missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("auth.json");
        assert_eq!(sweep_stale(&path).expect("sweep"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn restricted_writes_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db_key.key");
        write_atomic(&path, b"secret", WriteOptions::secret()).expect("write");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let private = dir.path().join("run").join("work");
        ensure_private_dir(&private).expect("dir");
        let mode = fs::metadata(&private).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn existing_directory_keeps_its_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let shared = dir.path().join("shared");
        fs::create_dir(&shared).expect("mkdir");
        fs::set_permissions(&shared, fs::Permissions::from_mode(0o755)).expect("chmod");

        ensure_private_dir(&shared).expect("existing dir");
        let mode = fs::metadata(&shared).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn private_dir_rejects_a_file_in_the_way() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("work");
        fs::write(&blocker, b"file").expect("write");
        assert!(ensure_private_dir(&blocker).is_err());
    }
}
