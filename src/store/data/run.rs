use serde::{Deserialize, Serialize};

use crate::store::{DbCollectionIden, StoreIden};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub pipeline: String,

    pub state: String,
    pub start_time: i64,
    pub end_time: i64,
    pub err: Option<String>,
    pub timestamp: i64,
}

impl DbCollectionIden for RunRecord {
    fn iden() -> StoreIden {
        StoreIden::Runs
    }
}
