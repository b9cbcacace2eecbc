//! Seams to the database: the client used for collection metadata, the key
//! vault client, and the client that talks to the marking helper.

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf};

use crate::error::ClientError;
use crate::options::Namespace;

#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// `listCollections` on `db` with `filter`.
    async fn list_collections(
        &self,
        db: &str,
        filter: Document,
    ) -> Result<Vec<RawDocumentBuf>, ClientError>;

    async fn create_collection(
        &self,
        db: &str,
        name: &str,
        options: Document,
    ) -> Result<(), ClientError>;
}

#[async_trait]
pub trait KeyVaultClient: Send + Sync {
    async fn find(
        &self,
        namespace: &Namespace,
        filter: Document,
    ) -> Result<Vec<RawDocumentBuf>, ClientError>;

    async fn insert_one(&self, namespace: &Namespace, document: Document)
    -> Result<(), ClientError>;

    /// Returns the number of deleted documents.
    async fn delete_one(&self, namespace: &Namespace, filter: Document)
    -> Result<u64, ClientError>;

    /// Returns the document as it was before the update.
    async fn find_one_and_update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: UpdateModifications,
    ) -> Result<Option<RawDocumentBuf>, ClientError>;

    /// Unordered bulk of single-document updates.
    async fn bulk_update(
        &self,
        namespace: &Namespace,
        updates: Vec<UpdateOne>,
    ) -> Result<BulkWriteOutcome, ClientError>;
}

#[async_trait]
pub trait MarkingClient: Send + Sync {
    /// Send `command` to the helper and return the marked reply.
    async fn mark_command(
        &self,
        db: &str,
        command: RawDocumentBuf,
    ) -> Result<RawDocumentBuf, ClientError>;

    /// Cheap request/response round trip used as a liveness check.
    async fn ping(&self) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateModifications {
    Document(Document),
    Pipeline(Vec<Document>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOne {
    pub filter: Document,
    pub update: Document,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub write_errors: Vec<WriteFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    /// Position of the failed update in the submitted batch.
    pub index: usize,
    pub code: i32,
    pub message: String,
}
