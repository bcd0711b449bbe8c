//! Storage for deployed pipelines and execution history.
//!
//! A thin collection abstraction over an in-memory backend. Run and step
//! records persist past run completion so history stays inspectable by step
//! id; swapping in a durable backend means implementing [`DbCollection`]
//! for each record type and registering it.

pub mod data;
mod mem;
mod store;

use serde_json::Value;
use strum::{AsRefStr, EnumIter};

use crate::Result;

pub use mem::MemStore;
pub use store::Store;

/// Identifiers for the storage collections.
#[derive(Debug, Clone, AsRefStr, PartialEq, Hash, Eq, EnumIter)]
pub enum StoreIden {
    /// Deployed pipeline definitions.
    #[strum(serialize = "pipelines")]
    Pipelines,
    /// Run instances.
    #[strum(serialize = "runs")]
    Runs,
    /// Per-step execution records.
    #[strum(serialize = "steps")]
    Steps,
    /// Log entries.
    #[strum(serialize = "logs")]
    Logs,
}

/// Field-equality filter over a collection.
#[derive(Debug, Clone, Default)]
pub struct Query {
    filters: Vec<(String, Value)>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter<V: Into<Value>>(
        mut self,
        field: &str,
        value: V,
    ) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn limit(
        mut self,
        limit: usize,
    ) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[(String, Value)] {
        &self.filters
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.limit
    }
}

/// Trait for types that can identify their storage collection.
pub trait DbCollectionIden {
    fn iden() -> StoreIden;
}

/// Operations every collection backend provides.
pub trait DbCollection: Send + Sync {
    type Item;

    fn exists(
        &self,
        id: &str,
    ) -> Result<bool>;

    fn find(
        &self,
        id: &str,
    ) -> Result<Self::Item>;

    fn query(
        &self,
        query: &Query,
    ) -> Result<Vec<Self::Item>>;

    fn create(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    fn update(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    fn delete(
        &self,
        id: &str,
    ) -> Result<bool>;
}

/// Backend initialization: registers its collections with the store.
pub trait DbStore {
    fn init(
        &self,
        s: &Store,
    );
}
