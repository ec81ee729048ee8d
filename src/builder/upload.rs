use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use log::{info, warn};
use walkdir::WalkDir;

use crate::tools::with_backoff;

/// Destination for finished blocks.
///
/// Implementations must be idempotent: uploading the same ULID directory
/// twice is a no-op. What "upload" means (object store, rsync target, ...)
/// is the implementation's business.
pub trait Uploader: Send + Sync {
    fn upload_block<'a>(
        &'a self,
        block_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
}

/// Upload `block_dir` with bounded retry. Exhausting the retries fails the
/// build; the block stays on local disk either way.
pub async fn upload_block(uploader: &Arc<dyn Uploader>, block_dir: &Path) -> Result<(), Error> {
    with_backoff("uploading block", || uploader.upload_block(block_dir))
        .await
        .map_err(|err| format_err!("uploading block {:?} failed - {}", block_dir, err))
}

/// Total size of a block directory, excluding spill data.
///
/// A stale `series/` subtree is deleted first so it can never count
/// towards the block size or reach the uploader.
pub fn block_size(block_dir: &Path) -> Result<u64, Error> {
    let spill_dir = block_dir.join("series");
    if spill_dir.exists() {
        std::fs::remove_dir_all(&spill_dir)
            .map_err(|err| format_err!("unable to remove {:?} - {}", spill_dir, err))?;
    }

    let mut total = 0u64;
    for entry in WalkDir::new(block_dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Remove a block directory after a successful upload. Failures are logged,
/// not fatal: a leftover local block is re-uploadable and harmless.
pub fn delete_local_block(block_dir: &Path) {
    match std::fs::remove_dir_all(block_dir) {
        Ok(()) => info!("removed local block {:?}", block_dir),
        Err(err) => warn!("unable to remove local block {:?} - {}", block_dir, err),
    }
}

/// Reclaim interrupted builds: remove every `*.tmp` entry under
/// `output_dir`. Called once at startup before any build may run; an entry
/// that cannot be removed fails startup since the workspace is suspect.
pub fn cleanup_output_dir(output_dir: &Path) -> Result<usize, Error> {
    let mut removed = 0;
    for entry in std::fs::read_dir(output_dir)
        .map_err(|err| format_err!("unable to read output dir {:?} - {}", output_dir, err))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(".tmp") {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(err) = result {
            bail!("unable to clean up {:?} - {}", path, err);
        }
        info!("removed leftover temporary block {:?}", path);
        removed += 1;
    }
    Ok(removed)
}

/// Uploader copying blocks into another directory, for deployments whose
/// "object store" is a mounted filesystem, and for tests.
pub struct CopyUploader {
    target: PathBuf,
}

impl CopyUploader {
    pub fn new<P: Into<PathBuf>>(target: P) -> Self {
        Self { target: target.into() }
    }

    fn copy_dir(&self, block_dir: &Path) -> Result<(), Error> {
        let name = block_dir
            .file_name()
            .ok_or_else(|| format_err!("block path {:?} has no name", block_dir))?;
        let target = self.target.join(name);

        for entry in WalkDir::new(block_dir) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(block_dir)?;
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)?;
            } else {
                // copy to a temp name, then rename, so rereads never see
                // partial files
                let mut tmp = destination.clone();
                tmp.set_extension("upload.tmp");
                std::fs::copy(entry.path(), &tmp)?;
                std::fs::rename(&tmp, &destination)?;
            }
        }
        Ok(())
    }
}

impl Uploader for CopyUploader {
    fn upload_block<'a>(
        &'a self,
        block_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(async move { self.copy_dir(block_dir) })
    }
}
