//! Chunk and metadata persistence seam.
//!
//! The mesh treats storage as a plain key-value collaborator. In-memory
//! tracking is only a projection of it: chunks and info records may
//! outlive the process.

use async_trait::async_trait;
use bytes::Bytes;

/// Key-value storage for info records (`<url>-info`) and chunk bytes
/// (`<url>-part<N>`).
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Fetch a value. `Ok(None)` when the key was never stored.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Store a value, overwriting any previous one.
    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()>;

    /// Every stored key. Used once at startup to find seedable files.
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}
