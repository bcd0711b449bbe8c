//! In-memory storage backend.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    FlowgateError, Result, ShareLock,
    store::{DbCollection, DbStore, Query, Store, data::*},
};

/// One in-memory collection: documents by id, insertion order preserved for
/// queries.
pub struct Collect<T> {
    name: &'static str,
    docs: ShareLock<HashMap<String, T>>,
    order: ShareLock<Vec<String>>,
}

trait DbDocument: Serialize + DeserializeOwned + Clone {
    fn doc_id(&self) -> &str;
}

impl DbDocument for PipelineRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for RunRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for StepRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for LogRecord {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

impl<T: DbDocument> Collect<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            docs: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn matches(
        doc: &T,
        query: &Query,
    ) -> bool {
        let Ok(value) = serde_json::to_value(doc) else {
            return false;
        };
        query.filters().iter().all(|(field, expected)| value.get(field) == Some(expected))
    }
}

impl<T: DbDocument + Send + Sync> DbCollection for Collect<T> {
    type Item = T;

    fn exists(
        &self,
        id: &str,
    ) -> Result<bool> {
        Ok(self.docs.read().unwrap().contains_key(id))
    }

    fn find(
        &self,
        id: &str,
    ) -> Result<T> {
        self.docs
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| FlowgateError::Store(format!("{}: '{}' not found", self.name, id)))
    }

    fn query(
        &self,
        query: &Query,
    ) -> Result<Vec<T>> {
        let docs = self.docs.read().unwrap();
        let order = self.order.read().unwrap();

        let mut rows = Vec::new();
        for id in order.iter() {
            if let Some(doc) = docs.get(id) {
                if Self::matches(doc, query) {
                    rows.push(doc.clone());
                    if query.max_rows().map(|limit| rows.len() >= limit).unwrap_or(false) {
                        break;
                    }
                }
            }
        }
        Ok(rows)
    }

    fn create(
        &self,
        data: &T,
    ) -> Result<bool> {
        let id = data.doc_id().to_string();
        let mut docs = self.docs.write().unwrap();
        if docs.contains_key(&id) {
            return Err(FlowgateError::Store(format!("{}: '{}' already exists", self.name, id)));
        }
        docs.insert(id.clone(), data.clone());
        self.order.write().unwrap().push(id);
        Ok(true)
    }

    fn update(
        &self,
        data: &T,
    ) -> Result<bool> {
        let id = data.doc_id().to_string();
        let mut docs = self.docs.write().unwrap();
        if !docs.contains_key(&id) {
            return Err(FlowgateError::Store(format!("{}: '{}' not found", self.name, id)));
        }
        docs.insert(id, data.clone());
        Ok(true)
    }

    fn delete(
        &self,
        id: &str,
    ) -> Result<bool> {
        let removed = self.docs.write().unwrap().remove(id).is_some();
        if removed {
            self.order.write().unwrap().retain(|existing| existing != id);
        }
        Ok(removed)
    }
}

#[derive(Clone)]
pub struct MemStore {
    pipelines: Arc<Collect<PipelineRecord>>,
    runs: Arc<Collect<RunRecord>>,
    steps: Arc<Collect<StepRecord>>,
    logs: Arc<Collect<LogRecord>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            pipelines: Arc::new(Collect::new("pipelines")),
            runs: Arc::new(Collect::new("runs")),
            steps: Arc::new(Collect::new("steps")),
            logs: Arc::new(Collect::new("logs")),
        }
    }
}

impl DbStore for MemStore {
    fn init(
        &self,
        s: &Store,
    ) {
        s.register(self.pipelines.clone());
        s.register(self.runs.clone());
        s.register(self.steps.clone());
        s.register(self.logs.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_record(
        id: &str,
        pipeline: &str,
        state: &str,
    ) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            pipeline: pipeline.to_string(),
            state: state.to_string(),
            start_time: 0,
            end_time: 0,
            err: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_create_find_update_delete() {
        let collect: Collect<RunRecord> = Collect::new("runs");
        collect.create(&run_record("r1", "p", "Pending")).unwrap();

        assert!(collect.exists("r1").unwrap());
        assert!(collect.create(&run_record("r1", "p", "Pending")).is_err());

        collect.update(&run_record("r1", "p", "Succeeded")).unwrap();
        assert_eq!(collect.find("r1").unwrap().state, "Succeeded");

        assert!(collect.delete("r1").unwrap());
        assert!(!collect.exists("r1").unwrap());
    }

    #[test]
    fn test_query_filters_and_limit() {
        let collect: Collect<RunRecord> = Collect::new("runs");
        collect.create(&run_record("r1", "sync", "Succeeded")).unwrap();
        collect.create(&run_record("r2", "sync", "Failed")).unwrap();
        collect.create(&run_record("r3", "other", "Succeeded")).unwrap();

        let rows = collect.query(&Query::new().filter("pipeline", "sync")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "r1");

        let rows = collect.query(&Query::new().filter("pipeline", "sync").limit(1)).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
