use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    FlowgateError, Result,
    gateway::{ErrorPolicy, PolicyAction},
    model::StepModel,
};

/// A declared pipeline: the ordered step list plus its variables, schedule,
/// and default error handling. Immutable during a run; versioning is the
/// operator's concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineModel {
    /// Deploy key; unique per store.
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub desc: String,
    /// Initial variable bindings, referenced as `${var:name}`.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Environment overrides layered over the process environment snapshot.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Carried as data; firing the schedule is the embedding host's job.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    pub steps: Vec<StepModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Standard five-field cron expression.
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub default_action: PolicyAction,
    #[serde(default)]
    pub retry_count: Option<u64>,
    #[serde(default)]
    pub retry_delay_seconds: Option<u64>,
    #[serde(default)]
    pub retry_backoff: bool,
}

impl ErrorHandling {
    /// The pipeline-level default policy steps fall back to.
    pub fn policy(&self) -> ErrorPolicy {
        ErrorPolicy {
            action: self.default_action,
            retry_count: self.retry_count,
            retry_delay_seconds: self.retry_delay_seconds,
            retry_backoff: self.retry_backoff,
            fallback: None,
        }
    }
}

impl PipelineModel {
    pub fn from_json(s: &str) -> Result<Self> {
        let pipeline = serde_json::from_str::<PipelineModel>(s).map_err(|e| FlowgateError::Pipeline(format!("{}", e)))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Definition-level checks that must hold before any step runs.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FlowgateError::Pipeline("missing name in pipeline".to_string()));
        }
        if self.steps.is_empty() {
            return Err(FlowgateError::Pipeline(format!("pipeline '{}' has no steps", self.name)));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(FlowgateError::Pipeline(format!("pipeline '{}' has a step with an empty id", self.name)));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(FlowgateError::Pipeline(format!("duplicate step id '{}' in pipeline '{}'", step.id, self.name)));
            }
        }

        if let Some(schedule) = &self.schedule {
            if schedule.cron.split_whitespace().count() != 5 {
                return Err(FlowgateError::Pipeline(format!(
                    "schedule '{}' is not a five-field cron expression",
                    schedule.cron
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_json_minimal() {
        let raw = json!({
            "name": "sync-issues",
            "version": "3",
            "steps": [
                {"id": "fetch", "type": "read", "config": {"system": "tracker", "resource": "issue", "action": "list"}}
            ]
        });
        let pipeline = PipelineModel::from_json(&raw.to_string()).unwrap();
        assert_eq!(pipeline.name, "sync-issues");
        assert_eq!(pipeline.error_handling.default_action, PolicyAction::Fail);
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let raw = json!({
            "name": "p",
            "steps": [
                {"id": "a", "type": "wait", "config": {"duration_seconds": 0}},
                {"id": "a", "type": "wait", "config": {"duration_seconds": 0}}
            ]
        });
        let err = PipelineModel::from_json(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let raw = json!({
            "name": "p",
            "schedule": {"cron": "* *", "timezone": "UTC"},
            "steps": [{"id": "a", "type": "wait", "config": {"duration_seconds": 0}}]
        });
        assert!(PipelineModel::from_json(&raw.to_string()).is_err());
    }
}
