// src/upload.rs

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where uploads are spooled and how large they may get.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub dir: PathBuf,
    pub max_bytes: usize,
}

/// A spooled upload. The file is removed when this value is dropped,
/// whichever way the request ends.
#[derive(Debug)]
pub struct UploadedFile {
    path: PathBuf,
}

impl UploadedFile {
    /// Create an empty, uniquely named file in `dir`.
    pub async fn create(dir: &Path) -> Result<(Self, tokio::fs::File)> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(Uuid::new_v4().simple().to_string());
        let file = tokio::fs::File::create(&path).await?;
        debug!(path = %path.display(), "Upload spooled");
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Upload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove upload"),
        }
    }
}

/// True for names `UploadedFile::create` hands out: 32 lowercase hex digits.
fn is_spooled_name(name: &str) -> bool {
    name.len() == 32 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Remove uploads left behind by a previous process that died mid-request.
/// Only spooled names are touched; anything else in the directory is kept.
pub fn sweep_stale(dir: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dir)?;
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let spooled = entry.file_name().to_str().is_some_and(is_spooled_name);
        if !spooled || !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale upload"),
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "Stale uploads removed");
    }
    Ok(removed)
}
