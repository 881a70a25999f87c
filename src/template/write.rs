//! Atomic replace-or-nothing file writes.
//!
//! Content is written to a uniquely named temporary file in the destination
//! directory, flushed to disk, and renamed over the destination. Until the
//! rename succeeds the destination is untouched; if anything fails before
//! that, [`TempFileGuard`] removes the temporary file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::{self as rfs, CWD, Gid, Mode, OFlags, Uid};
use tracing::{debug, warn};

use crate::error::ProvisionError;

/// RAII guard to ensure temporary file cleanup even on error.
pub(crate) struct TempFileGuard {
    path: Utf8PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: Utf8PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Keeps the file: called once it has been renamed into place.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("cleaned up temp file: {}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("temp file already removed: {}", self.path);
            }
            Err(e) => {
                tracing::error!(
                    path = %self.path,
                    error_kind = ?e.kind(),
                    "failed to cleanup temp file: {}",
                    e,
                );
            }
        }
    }
}

/// Options for [`write_atomic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Unix permission bits for the new file. When `None`, an existing
    /// destination's mode is preserved.
    pub mode: Option<u32>,
    /// Create missing parent directories.
    pub create_dirs: bool,
}

/// Opens the destination directory without following a symlink at its final
/// component.
fn open_parent_dir(dir: &Utf8Path) -> Result<OwnedFd, ProvisionError> {
    rfs::openat(
        CWD,
        dir.as_str(),
        OFlags::NOFOLLOW | OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| match e {
        rustix::io::Errno::LOOP | rustix::io::Errno::NOTDIR => ProvisionError::Validation(format!(
            "{} is a symlink or not a directory, refusing to write into it",
            dir
        )),
        _ => ProvisionError::io(format!("failed to open directory {}", dir), io::Error::from(e)),
    })
}

fn existing_mode(path: &Utf8Path) -> Option<u32> {
    fs::metadata(path).ok().map(|m| m.mode() & 0o7777)
}

/// Gives the temp file the owner and group of the file it replaces.
///
/// Without privileges only a group change the caller belongs to can
/// succeed; a refused change is logged and the write goes ahead.
fn copy_ownership(file: &File, meta: &fs::Metadata, tmp_path: &Utf8Path) -> Result<(), ProvisionError> {
    let current = file
        .metadata()
        .map_err(|e| ProvisionError::io(format!("failed to stat {}", tmp_path), e))?;
    if current.uid() == meta.uid() && current.gid() == meta.gid() {
        return Ok(());
    }
    match rfs::fchown(
        file,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
    ) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::PERM) => {
            warn!(
                "cannot keep owner {}:{} for {}: operation not permitted",
                meta.uid(),
                meta.gid(),
                tmp_path
            );
            Ok(())
        }
        Err(e) => Err(ProvisionError::io(
            format!("failed to set owner on {}", tmp_path),
            e.into(),
        )),
    }
}

/// Writes `contents` to `dest` atomically.
pub fn write_atomic(
    dest: &Utf8Path,
    contents: &[u8],
    options: WriteOptions,
) -> Result<(), ProvisionError> {
    write_atomic_with(dest, options, |file| file.write_all(contents))
}

/// Writes to `dest` atomically, letting `fill` produce the content.
///
/// If `fill` fails, the destination keeps its previous content (or stays
/// absent) and the temporary file is removed.
pub fn write_atomic_with<F>(dest: &Utf8Path, options: WriteOptions, fill: F) -> Result<(), ProvisionError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let file_name = dest.file_name().ok_or_else(|| {
        ProvisionError::Validation(format!("destination has no file name: {}", dest))
    })?;
    let parent = match dest.parent() {
        Some(p) if !p.as_str().is_empty() => p.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };

    if options.create_dirs {
        fs::create_dir_all(&parent)
            .map_err(|e| ProvisionError::io(format!("failed to create directory {}", parent), e))?;
    }
    let dir_fd = open_parent_dir(&parent)?;

    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    let mut guard = TempFileGuard::new(tmp_path.clone());

    let existing = fs::metadata(dest).ok();
    let mode = options
        .mode
        .or_else(|| existing.as_ref().map(|m| m.mode() & 0o7777));

    // Never wider than the final mode, even before the explicit chmod.
    let mut file = File::options()
        .write(true)
        .create_new(true)
        .mode(mode.unwrap_or(0o666))
        .open(&tmp_path)
        .map_err(|e| ProvisionError::io(format!("failed to create temp file {}", tmp_path), e))?;

    if let Some(mode) = mode {
        rfs::fchmod(&file, Mode::from_raw_mode(mode)).map_err(|e| {
            ProvisionError::io(format!("failed to set permissions on {}", tmp_path), e.into())
        })?;
    }
    if let Some(meta) = &existing {
        copy_ownership(&file, meta, &tmp_path)?;
    }

    fill(&mut file)
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_all())
        .map_err(|e| ProvisionError::io(format!("failed to write {}", tmp_path), e))?;
    drop(file);

    fs::rename(&tmp_path, dest).map_err(|e| {
        ProvisionError::io(format!("failed to move {} into place at {}", tmp_path, dest), e)
    })?;
    guard.disarm();

    if let Err(e) = rfs::fsync(&dir_fd) {
        warn!("failed to sync directory {} after replacing {}: {}", parent, dest, e);
    }

    debug!("wrote {} atomically", dest);
    Ok(())
}

/// Returns true if `dest` already holds exactly `contents` (and `mode`, when given).
pub fn is_up_to_date(dest: &Utf8Path, contents: &[u8], mode: Option<u32>) -> bool {
    match fs::read(dest) {
        Ok(existing) if existing == contents => {}
        _ => return false,
    }
    match mode {
        Some(mode) => existing_mode(dest) == Some(mode),
        None => true,
    }
}
