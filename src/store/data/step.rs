use serde::{Deserialize, Serialize};

use crate::store::{DbCollectionIden, StoreIden};

/// Execution record of one step within one run. `output` carries the final
/// committed envelope once the run settles.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StepRecord {
    /// `{run_id}:{step_id}`
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub state: String,
    pub error: Option<String>,
    pub output: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub timestamp: i64,
}

impl StepRecord {
    pub fn record_id(
        run_id: &str,
        step_id: &str,
    ) -> String {
        format!("{}:{}", run_id, step_id)
    }
}

impl DbCollectionIden for StepRecord {
    fn iden() -> StoreIden {
        StoreIden::Steps
    }
}
