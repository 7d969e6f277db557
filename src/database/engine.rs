use std::future::Future;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Failure vocabulary reported by the storage engine.
///
/// The `Display` form is the wire tag (`NotFound`, `Collision`, ...). Tags the
/// controller does not know about are kept verbatim in `Other` so they can be
/// shown to the user unmodified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("NotFound")]
    NotFound,
    #[error("Collision")]
    Collision,
    #[error("DataIsCorrupted")]
    DataIsCorrupted,
    #[error("AlreadyOpen")]
    AlreadyOpen,
    #[error("AlreadyExists")]
    AlreadyExists,
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "NotFound" => Self::NotFound,
            "Collision" => Self::Collision,
            "DataIsCorrupted" => Self::DataIsCorrupted,
            "AlreadyOpen" => Self::AlreadyOpen,
            "AlreadyExists" => Self::AlreadyExists,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> String {
        self.to_string()
    }

    pub(crate) fn io(context: &str, e: std::io::Error) -> Self {
        Self::Other(format!("{context}: {e}"))
    }
}

/// Integrity metadata returned when the current store is corrupted and a
/// backup is available. Both instants are engine-formatted and shown verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackInfo {
    #[serde(alias = "newest_instant")]
    pub corrupted_instant: String,
    #[serde(alias = "rollback_instant")]
    pub rollback_candidate_instant: String,
}

/// RPC surface of the storage engine. The controller only talks to the store
/// through these calls.
pub trait StorageEngine: Send + Sync + 'static {
    fn open(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn create(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Drops handles this process still holds from a previous session of the
    /// UI. Never fails.
    fn release_stale_handles(&self) -> impl Future<Output = ()> + Send;

    /// Durable checkpoint of the in-memory record state.
    fn store(&self) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn query_integrity(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<RollbackInfo, EngineError>> + Send;

    fn commit_rollback(&self, path: &Path) -> impl Future<Output = Result<(), EngineError>> + Send;
}
