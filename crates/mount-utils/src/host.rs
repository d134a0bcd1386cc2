use crate::{MountError, Result};
use std::{fs, io, path::Path};
use tracing::debug;

/// Reports whether something exists at path. Errors other than "not found"
/// (permissions, stale handles) count as existing.
pub fn is_file_existing(path: &Path) -> bool {
  match fs::metadata(path) {
    Ok(_) => true,
    Err(e) => e.kind() != io::ErrorKind::NotFound,
  }
}

pub fn is_dir_empty(path: &Path) -> io::Result<bool> {
  match fs::read_dir(path)?.next() {
    None => Ok(true),
    Some(Ok(_)) => Ok(false),
    Some(Err(e)) => Err(e),
  }
}

/// Ensures dest exists as a directory, creating it and any missing parents.
pub fn create_dest(dest: &Path) -> Result<()> {
  match fs::symlink_metadata(dest) {
    Ok(meta) if meta.is_dir() => Ok(()),
    Ok(_) => Err(MountError::NotADirectory(dest.to_owned())),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      debug!("Creating mount target {}", dest.display());
      fs::create_dir_all(dest)?;
      Ok(())
    }
    Err(e) => Err(e.into()),
  }
}
