//! Atomic rendering of resolved contents to the filesystem.
//!
//! Writes go through a temp-and-rename strategy so readers never observe
//! a partially written file: contents land in a sibling temp file, are
//! synced to disk, and replace the destination in one rename. An
//! existing destination keeps its permission bits; a missing one gets
//! [`DEFAULT_FILE_PERMS`]. Missing parent directories are created only
//! when the renderer allows it, otherwise the write aborts with
//! [`Error::NoParentDir`].

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::constants::DEFAULT_FILE_PERMS;
use crate::error::Error;

/// Writes rendered template output to destination files.
#[derive(Debug, Clone)]
pub struct FileRenderer {
    create_dirs: bool,
    backup: bool,
}

impl FileRenderer {
    /// Create a renderer that creates missing parent directories and
    /// takes no backups.
    pub fn new() -> Self {
        Self {
            create_dirs: true,
            backup: false,
        }
    }

    /// Whether missing parent directories are created before writing.
    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    /// Whether the previous contents are snapshotted to `<dest>.bak`
    /// before each overwrite.
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Atomically write `contents` to `dest`.
    pub fn render(&self, dest: &Path, contents: &[u8]) -> Result<(), Error> {
        if self.backup {
            single_backup(dest)?;
        }
        atomic_write(dest, contents, DEFAULT_FILE_PERMS, self.create_dirs)?;
        tracing::debug!(dest = %dest.display(), bytes = contents.len(), "rendered");
        Ok(())
    }
}

impl Default for FileRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomically write `contents` to `path` using a temp file and rename.
///
/// An existing destination keeps its permission bits; otherwise `mode`
/// applies (on Unix). With `create_dirs` disabled, a missing parent
/// yields [`Error::NoParentDir`].
pub fn atomic_write(
    path: &Path,
    contents: &[u8],
    mode: u32,
    create_dirs: bool,
) -> Result<(), Error> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    if !parent.exists() {
        if !create_dirs {
            return Err(Error::NoParentDir {
                path: parent.display().to_string(),
            });
        }
        fs::create_dir_all(parent)?;
    }

    // Keep the existing permission bits across the rename.
    let perms = match fs::metadata(path) {
        Ok(metadata) => Some(metadata.permissions()),
        Err(_) => None,
    };

    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = perms.unwrap_or_else(|| fs::Permissions::from_mode(mode));
        fs::set_permissions(&temp_path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (perms, mode);
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Snapshot `path` to `<path>.bak`, keeping its permission bits.
///
/// A missing source is a no-op; a previous backup is overwritten.
pub fn single_backup(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        return Ok(());
    }
    let mut backup = path.as_os_str().to_os_string();
    backup.push(".bak");
    fs::copy(path, &backup)?;
    tracing::trace!(path = %path.display(), "backed up previous contents");
    Ok(())
}
