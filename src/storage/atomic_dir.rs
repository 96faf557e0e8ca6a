//! Crash-safe directory swap.
//!
//! A write builds the complete new file set in `<dir>.new`, then swaps it in:
//!
//! ```text
//!   rename <dir>     -> <dir>.bak
//!   rename <dir>.new -> <dir>
//!   remove <dir>.bak
//! ```
//!
//! [`AtomicDirectory::recover`] undoes whatever an interrupted swap left
//! behind: a backup wins over the base directory, a staging directory is
//! dropped. Readers therefore always see one complete committed set.

use log::{debug, warn};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const STAGING_SUFFIX: &str = ".new";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Clone, Debug)]
pub struct AtomicDirectory {
    base: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
}

impl AtomicDirectory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            staging: sibling(&base, STAGING_SUFFIX),
            backup: sibling(&base, BACKUP_SUFFIX),
            base,
        }
    }

    /// Directory holding the committed set.
    pub fn read_path(&self) -> &Path {
        &self.base
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn exists(&self) -> bool {
        self.base.is_dir()
    }

    /// Restore a consistent committed set after an interrupted swap.
    pub fn recover(&self) -> io::Result<()> {
        if self.backup.exists() {
            warn!(
                "Restoring history backup {} after interrupted write",
                self.backup.display()
            );
            remove_dir_if_exists(&self.base)?;
            fs::rename(&self.backup, &self.base)?;
        }
        remove_dir_if_exists(&self.staging)
    }

    /// Create an empty staging directory and return its path.
    pub fn start_write(&self) -> io::Result<PathBuf> {
        remove_dir_if_exists(&self.staging)?;
        fs::create_dir_all(&self.staging)?;
        Ok(self.staging.clone())
    }

    /// Swap the staging directory in as the committed set.
    pub fn finish_write(&self) -> io::Result<()> {
        if self.base.exists() {
            remove_dir_if_exists(&self.backup)?;
            fs::rename(&self.base, &self.backup)?;
        }
        fs::rename(&self.staging, &self.base)?;
        remove_dir_if_exists(&self.backup)
    }

    /// Abandon the staging directory and keep the last committed set.
    pub fn fail_write(&self) -> io::Result<()> {
        self.recover()
    }

    /// Remove the committed set along with any staging or backup leftovers.
    pub fn delete(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.base)?;
        remove_dir_if_exists(&self.staging)?;
        remove_dir_if_exists(&self.backup)
    }
}

fn sibling(base: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = base.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    base.with_file_name(name)
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Hard-link `src` to `dst`, copying when the file system refuses links.
pub fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "Hard link {} -> {} failed ({}), copying",
                src.display(),
                dst.display(),
                e
            );
            fs::copy(src, dst).map(|_| ())
        }
    }
}
