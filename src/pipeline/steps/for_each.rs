use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    FlowgateError, Result,
    expr,
    gateway::{Attempted, ErrorPolicy, PolicyAction, run_with_policy},
    model::StepModel,
    pipeline::{OutputMeta, StepGraph, StepId, StepOutput, StepState, steps::SELECTED_KEY},
    runtime::{Context, RateGate},
};

use super::{StepAction, StepKind};

/// How a single item's unrecoverable failure affects the loop.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemErrorMode {
    /// The whole loop fails (the loop step's own error policy then applies).
    #[default]
    Fail,
    /// The loop succeeds with partial results; failed items are reported in
    /// the aggregate.
    Continue,
}

/// Execute a nested step list once per item of a resolved iterable.
///
/// Items run concurrently up to the configured bound; an optional rate limit
/// throttles the gateway calls the loop issues regardless of the bound. With
/// `batch_size` set, the body runs once per batch instead, with the item
/// variable bound to the batch's array. Within one iteration the nested
/// steps execute sequentially in dependency order.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ForEachStep {
    /// Template resolving to an array.
    items: String,
    /// Variable name each item (or batch) is bound to inside the body.
    #[serde(default = "default_item_var")]
    item_var: String,
    /// Group items into arrays of this size, one iteration per group.
    #[serde(default)]
    batch_size: Option<usize>,
    /// Simultaneous in-flight iterations; defaults to the engine limit.
    #[serde(default)]
    concurrency: Option<usize>,
    /// Gateway calls per second across all iterations.
    #[serde(default)]
    rate_limit_per_second: Option<f64>,
    #[serde(default)]
    item_error: ItemErrorMode,
    /// Nested step list executed per item.
    steps: Vec<StepModel>,
}

fn default_item_var() -> String {
    "item".to_string()
}

/// Per-item outcome recorded in the loop's aggregate output.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct ItemOutcome {
    index: usize,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Data payload of each body step that committed output.
    steps: serde_json::Map<String, Value>,
}

impl ItemOutcome {
    fn succeeded(
        index: usize,
        steps: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            index,
            status: "succeeded".to_string(),
            error: None,
            steps,
        }
    }

    fn failed(
        index: usize,
        error: String,
        steps: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            index,
            status: "failed".to_string(),
            error: Some(error),
            steps,
        }
    }
}

fn collect_ids(
    steps: &[StepModel],
    out: &mut Vec<StepId>,
) {
    for step in steps {
        out.push(step.id.clone());
        if step.kind == "loop" {
            if let Some(nested) = step.config.get("steps") {
                if let Ok(nested) = serde_json::from_value::<Vec<StepModel>>(nested.clone()) {
                    collect_ids(&nested, out);
                }
            }
        }
    }
}

fn committed_data(ctx: &Context) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (sid, output) in ctx.outputs().iter() {
        map.insert(sid.as_str().to_string(), output.data.clone());
    }
    map
}

/// Sequential driver for one item's sub-graph.
async fn run_item(
    ctx: Arc<Context>,
    steps: Arc<Vec<StepModel>>,
    index: usize,
) -> ItemOutcome {
    let graph = match StepGraph::build_nested(&steps) {
        Ok(graph) => graph,
        Err(e) => return ItemOutcome::failed(index, e.to_string(), serde_json::Map::new()),
    };

    loop {
        if ctx.is_shutdown() {
            return ItemOutcome::failed(index, "run aborted".to_string(), committed_data(&ctx));
        }

        let Some(sid) = graph.next_runnable() else {
            break;
        };
        graph.mark_state(&sid, StepState::Running);

        let step = match graph.get_step(&sid) {
            Some(step) => step,
            None => break,
        };
        let policy = ErrorPolicy::resolve(step.on_error.as_ref(), Some(ctx.default_policy()));

        let outcome = if let Some(source) = graph.skipped_data_source(&sid) {
            let error = FlowgateError::SkippedDependency(format!("step '{}' requires output of skipped step '{}'", sid, source));
            if policy.action == PolicyAction::Continue {
                Attempted::Continued {
                    error,
                    attempts: 0,
                }
            } else {
                Attempted::Failed {
                    error,
                    attempts: 0,
                }
            }
        } else {
            let limits = ctx.limits();
            run_with_policy(&policy, &limits, |_| {
                let ctx = ctx.clone();
                let sid = sid.clone();
                let step = &step;
                async move {
                    match step.timeout {
                        Some(timeout) => tokio::time::timeout(timeout, step.action.run(ctx, sid.clone()))
                            .await
                            .map_err(|_| FlowgateError::Timeout(format!("step '{}' timed out", sid)))?,
                        None => step.action.run(ctx, sid).await,
                    }
                }
            })
            .await
        };

        match outcome {
            Attempted::Done {
                mut value,
                attempts,
            } => {
                value.meta.attempts = attempts;
                ctx.commit_output(sid.clone(), value);
                graph.mark_state(&sid, StepState::Succeeded);

                if matches!(step.kind, StepKind::Condition | StepKind::Switch) {
                    if let Some(selected) = ctx.output(&sid).and_then(|o| o.data.get(SELECTED_KEY).and_then(Value::as_str).map(String::from)) {
                        graph.skip_unselected(&sid, &selected);
                    }
                }
            }
            Attempted::Continued {
                error,
                attempts,
            } => {
                let mut output = StepOutput::continued(error.to_string());
                output.meta.attempts = attempts;
                ctx.commit_output(sid.clone(), output);
                graph.mark_state(&sid, StepState::Failed);
                graph.mark_continued(&sid);
            }
            Attempted::Failed {
                error, ..
            } => {
                graph.mark_state(&sid, StepState::Failed);
                return ItemOutcome::failed(index, format!("step '{}': {}", sid, error), committed_data(&ctx));
            }
        }
    }

    ItemOutcome::succeeded(index, committed_data(&ctx))
}

#[async_trait]
#[typetag::serde(name = "loop")]
impl StepAction for ForEachStep {
    fn create(config: Value) -> Result<Self> {
        jsonschema::validate(&Self::schema(), &config)?;
        let action = serde_json::from_value::<Self>(config)?;
        // surface bad body configs and body cycles at load time
        StepGraph::build_nested(&action.steps)?;
        Ok(action)
    }

    fn schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["items", "steps"],
            "properties": {
                "items": { "type": "string", "description": "Template resolving to an array" },
                "item_var": { "type": "string", "default": "item" },
                "batch_size": { "type": ["integer", "null"], "minimum": 1 },
                "concurrency": { "type": ["integer", "null"], "minimum": 1 },
                "rate_limit_per_second": { "type": ["number", "null"], "exclusiveMinimum": 0 },
                "item_error": { "type": "string", "enum": ["fail", "continue"] },
                "steps": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["id", "type"],
                        "properties": {
                            "id": { "type": "string" },
                            "type": { "type": "string" },
                            "config": { "type": "object" }
                        }
                    }
                }
            }
        })
    }

    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    fn local_step_ids(&self) -> Vec<StepId> {
        let mut ids = Vec::new();
        collect_ids(&self.steps, &mut ids);
        ids
    }

    async fn run(
        &self,
        ctx: Arc<Context>,
        sid: StepId,
    ) -> Result<StepOutput> {
        let resolved = expr::resolve_value(ctx.as_ref(), &self.items)?;
        let Value::Array(items) = resolved else {
            return Err(FlowgateError::Validation(format!("step '{}': items template did not resolve to an array", sid)));
        };

        let items: Vec<Value> = match self.batch_size {
            Some(size) => items.chunks(size.max(1)).map(|batch| Value::Array(batch.to_vec())).collect(),
            None => items,
        };

        let limits = ctx.limits();
        let bound = self.concurrency.unwrap_or(limits.max_loop_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(bound));
        let rate = self.rate_limit_per_second.map(|r| Arc::new(RateGate::new(r)));
        let steps = Arc::new(self.steps.clone());
        let total = items.len();

        let mut tasks = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let steps = steps.clone();
            let child = ctx.child(
                vec![(self.item_var.clone(), item), ("item_index".to_string(), Value::from(index as u64))],
                rate.clone(),
            );

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                run_item(Arc::new(child), steps, index).await
            });
        }

        let mut outcomes: Vec<ItemOutcome> = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => return Err(FlowgateError::Runtime(format!("loop '{}' worker panicked: {}", sid, e))),
            }
        }
        outcomes.sort_by_key(|o| o.index);

        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        if failed > 0 && self.item_error == ItemErrorMode::Fail {
            let first = outcomes.iter().find(|o| o.error.is_some()).unwrap();
            return Err(FlowgateError::Step(format!(
                "loop '{}': {} of {} items failed; first failure at item {}: {}",
                sid,
                failed,
                total,
                first.index,
                first.error.as_deref().unwrap_or_default()
            )));
        }

        let data: Vec<Value> = outcomes.iter().map(|o| serde_json::to_value(o).unwrap_or(Value::Null)).collect();
        Ok(StepOutput {
            data: Value::Array(data),
            meta: OutputMeta {
                count: total,
                pages: 1,
                ..Default::default()
            },
            error: None,
        })
    }
}
