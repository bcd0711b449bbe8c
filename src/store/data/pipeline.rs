use serde::{Deserialize, Serialize};

use crate::store::{DbCollectionIden, StoreIden};

/// A deployed pipeline definition. `data` holds the serialized model.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipelineRecord {
    /// The pipeline name; deploy key.
    pub id: String,
    pub version: String,
    pub desc: String,
    pub data: String,
    pub create_time: i64,
    pub update_time: i64,
}

impl DbCollectionIden for PipelineRecord {
    fn iden() -> StoreIden {
        StoreIden::Pipelines
    }
}
