//! Seam to the document database. The store only ever talks to the
//! engine through [`Database`]; [`MemoryDatabase`] is the in-process
//! reference engine used by the server binary and the tests.

mod memory;

pub use memory::MemoryDatabase;

use crate::document::Document;
use crate::filter::{Filter, FilterError, SortOrder, Stage, UpdateSpec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey { collection: String, key: String },
    #[error(transparent)]
    InvalidQuery(#[from] FilterError),
    #[error("change feed fault: {0}")]
    Feed(String),
    #[error("database error: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: OperationType,
    pub document_id: Option<String>,
    /// Post-image for inserts, updates and replaces.
    pub full_document: Option<Document>,
    /// Paths written by an operator update.
    pub updated_fields: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub projection: Vec<String>,
}

impl FindOptions {
    pub fn limit(n: usize) -> Self {
        Self {
            limit: Some(n),
            ..Default::default()
        }
    }

    pub fn sorted(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            sort: vec![(field.into(), order)],
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub text: bool,
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, DbError>>;

#[async_trait]
pub trait Database: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, DbError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, DbError>;

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, DbError>;

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Document>, DbError>;

    async fn insert_one(&self, collection: &str, doc: Document) -> Result<Document, DbError>;

    /// Replace the first match. Returns the number of matched documents (0 or 1).
    async fn replace_one(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<u64, DbError>;

    /// Apply `update` to the first match and return its post-image.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
    ) -> Result<Option<Document>, DbError>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateSpec,
    ) -> Result<Vec<Document>, DbError>;

    /// Remove the first match and return it.
    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, DbError>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, DbError>;

    /// Open a change feed covering every collection. The stream yields an
    /// error when the feed faults; callers drop it and resubscribe.
    async fn watch(&self) -> Result<ChangeStream, DbError>;

    async fn list_collections(&self) -> Result<Vec<String>, DbError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexInfo>, DbError>;

    async fn create_index(&self, collection: &str, index: IndexInfo) -> Result<(), DbError>;

    async fn drop_collection(&self, collection: &str) -> Result<(), DbError>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, DbError> {
        let mut docs = self.find(collection, filter, &FindOptions::limit(1)).await?;
        Ok(docs.pop())
    }
}
