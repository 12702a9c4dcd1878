//! Upload collaborator: stores raw document bytes

use async_trait::async_trait;
use crate::error::Result;

/// Where an upload landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Key to fetch the bytes back
    pub storage_key: String,
    /// Size in bytes
    pub size: u64,
}

/// Trait for raw document storage
///
/// Implementations:
/// - `LocalDocumentStore`: Local filesystem
#[async_trait]
pub trait DocumentStoreProvider: Send + Sync {
    /// Store a document under a name derived from `object_id`
    async fn store_document(
        &self,
        object_id: &str,
        declared_type: &str,
        data: &[u8],
    ) -> Result<StoredObject>;

    /// Retrieve document data
    async fn get_document(&self, storage_key: &str) -> Result<Vec<u8>>;

    /// Delete a document; missing keys are not an error
    async fn delete_document(&self, storage_key: &str) -> Result<()>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
