//! Raw message archive on the local filesystem.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::RawMessageStore;
use crate::error::StorageError;

/// Writes every payload to its own `<yyyyMMdd_HHmmss_fffffff>_<seq>.hl7` file.
///
/// The sequence number keeps names unique when several connections store within the same tick.
#[derive(Debug)]
pub struct FileRawMessageStore {
    directory: PathBuf,
    sequence: AtomicU64,
}

impl FileRawMessageStore {
    /// Creates `directory` (and its parents) if it doesn't exist yet.
    pub async fn create(directory: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        Ok(Self {
            directory,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_path(&self, at: DateTime<Utc>) -> PathBuf {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let ticks = at.timestamp_subsec_nanos() / 100;
        self.directory.join(format!(
            "{}_{:07}_{:06}.hl7",
            at.format("%Y%m%d_%H%M%S"),
            ticks,
            sequence
        ))
    }

    async fn write(&self, path: &Path, raw: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(raw.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl RawMessageStore for FileRawMessageStore {
    async fn store(&self, raw: &str, cancel: &CancellationToken) -> Result<(), StorageError> {
        let path = self.next_path(Utc::now());
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StorageError::Cancelled),
            result = self.write(&path, raw) => {
                result?;
                info!("Stored raw message {}", path.display());
                Ok(())
            }
        }
    }
}
