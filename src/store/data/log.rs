use serde::{Deserialize, Serialize};

use crate::store::{DbCollectionIden, StoreIden};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogRecord {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub content: String,
    pub timestamp: i64,
}

impl DbCollectionIden for LogRecord {
    fn iden() -> StoreIden {
        StoreIden::Logs
    }
}
