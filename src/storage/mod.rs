//! The two storage collaborators: a raw-message archive and an observation repository.
//!
//! Both are called concurrently from every connection, so implementations must be `Send + Sync` and
//! every call must be self-contained.

mod file;
mod sql;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::model::ParsedObservationMessage;

pub use file::FileRawMessageStore;
pub use sql::SqlObservationRepository;

/// Write-only archive of the exact text of every received frame.
#[async_trait]
pub trait RawMessageStore: Send + Sync {
    async fn store(&self, raw: &str, cancel: &CancellationToken) -> Result<(), StorageError>;
}

/// Durable store for parsed observations: one row per [`ObservationRecord`](crate::ObservationRecord).
#[async_trait]
pub trait ObservationRepository: Send + Sync {
    async fn save(
        &self,
        message: ParsedObservationMessage,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators that record what they were given.

    use std::io;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingRawStore {
        pub stored: Mutex<Vec<String>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RawMessageStore for RecordingRawStore {
        async fn store(&self, raw: &str, _cancel: &CancellationToken) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "archive is read-only",
                )));
            }
            self.stored.lock().unwrap().push(raw.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingRepository {
        pub saved: Mutex<Vec<ParsedObservationMessage>>,
        pub fail: bool,
    }

    #[async_trait]
    impl ObservationRepository for RecordingRepository {
        async fn save(
            &self,
            message: ParsedObservationMessage,
            _cancel: &CancellationToken,
        ) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "database unavailable",
                )));
            }
            self.saved.lock().unwrap().push(message);
            Ok(())
        }
    }
}
