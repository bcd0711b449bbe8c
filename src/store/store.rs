use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::trace;

use crate::{FlowgateError, Result, ShareLock, model::PipelineModel, utils};

use super::{DbCollection, DbCollectionIden, StoreIden, data::*};

#[derive(Clone)]
pub struct DynDbSetRef<T>(Arc<dyn DbCollection<Item = T>>);

/// Registry of typed collections, keyed by [`StoreIden`].
pub struct Store {
    collections: ShareLock<HashMap<StoreIden, Arc<dyn Any + Send + Sync + 'static>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn collection<DATA>(&self) -> Arc<dyn DbCollection<Item = DATA>>
    where
        DATA: DbCollectionIden + Send + Sync + 'static,
    {
        let collections = self.collections.read().unwrap();

        let collection = collections.get(&DATA::iden()).expect(&format!("fail to get collection: {}", DATA::iden().as_ref()));

        collection.downcast_ref::<DynDbSetRef<DATA>>().map(|v| v.0.clone()).expect(&format!("fail to get collection: {}", DATA::iden().as_ref()))
    }

    pub fn register<DATA>(
        &self,
        collection: Arc<dyn DbCollection<Item = DATA> + Send + Sync + 'static>,
    ) where
        DATA: DbCollectionIden + 'static,
    {
        let mut collections = self.collections.write().unwrap();
        collections.insert(DATA::iden(), Arc::new(DynDbSetRef::<DATA>(collection)));
    }

    pub fn pipelines(&self) -> Arc<dyn DbCollection<Item = PipelineRecord>> {
        self.collection()
    }

    pub fn runs(&self) -> Arc<dyn DbCollection<Item = RunRecord>> {
        self.collection()
    }

    pub fn steps(&self) -> Arc<dyn DbCollection<Item = StepRecord>> {
        self.collection()
    }

    pub fn logs(&self) -> Arc<dyn DbCollection<Item = LogRecord>> {
        self.collection()
    }

    /// Create or update a deployed pipeline definition, keyed by name.
    pub fn deploy(
        &self,
        pipeline: &PipelineModel,
    ) -> Result<bool> {
        trace!("store::deploy({})", pipeline.name);
        if pipeline.name.is_empty() {
            return Err(FlowgateError::Pipeline("missing name in pipeline".into()));
        }
        let pipelines = self.pipelines();
        let text = serde_json::to_string(pipeline)?;
        match pipelines.find(&pipeline.name) {
            Ok(existing) => {
                let data = PipelineRecord {
                    id: pipeline.name.clone(),
                    version: pipeline.version.clone(),
                    desc: pipeline.desc.clone(),
                    data: text,
                    create_time: existing.create_time,
                    update_time: utils::time::time_millis(),
                };
                pipelines.update(&data)
            }
            Err(_) => {
                let data = PipelineRecord {
                    id: pipeline.name.clone(),
                    version: pipeline.version.clone(),
                    desc: pipeline.desc.clone(),
                    data: text,
                    create_time: utils::time::time_millis(),
                    update_time: 0,
                };
                pipelines.create(&data)
            }
        }
    }
}
