pub mod backup;
pub mod error;
pub mod limits;
pub mod names;
pub mod pg;
pub mod pipeline;
pub mod prefetch;
pub mod prune;
pub mod sentinel;
pub mod tar_partition;
pub mod wal_transfer;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use walstash_storage::{BlobStore, CancelFlag, StorePrefix};

/// Everything an archive operation needs, passed explicitly: the blob
/// store for this invocation's prefix context, the shared cancel flag, the
/// configured filter programs, and the staging directory.
pub struct ArchiveContext {
    pub store: Arc<dyn BlobStore>,
    pub prefix: StorePrefix,
    pub cancel: CancelFlag,
    pub filters: pipeline::FilterSet,
    pub tmp_dir: PathBuf,
}

impl ArchiveContext {
    /// Render a key as a full store URL for operator-facing output.
    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}
