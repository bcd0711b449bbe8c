use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    FlowgateError, Result,
    common::{MemCache, Shutdown},
    config::Limits,
    events::{Event, LogEntry},
    expr::Scope,
    gateway::{ActionGateway, ErrorPolicy},
    mapping::MappingStore,
    pipeline::{StepId, StepOutput, steps::Notifier},
    runtime::Channel,
    utils,
};

pub type RunId = String;

/// Collaborators shared by every run the engine starts.
#[derive(Clone)]
pub struct RuntimeParts {
    pub gateway: Arc<dyn ActionGateway>,
    pub mappings: Arc<MappingStore>,
    pub notifier: Arc<dyn Notifier>,
    pub limits: Arc<Limits>,
}

/// Minimum-interval throttle for gateway calls issued inside a loop step.
pub struct RateGate {
    interval: Duration,
    next: tokio::sync::Mutex<Instant>,
}

impl RateGate {
    /// `per_second` requests allowed per second across the holders.
    pub fn new(per_second: f64) -> Self {
        let per_second = per_second.max(0.001);
        Self {
            interval: Duration::from_secs_f64(1.0 / per_second),
            next: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    /// Waits for the next slot.
    pub async fn acquire(&self) {
        let mut next = self.next.lock().await;
        let now = Instant::now();
        if *next > now {
            let wait = *next - now;
            *next += self.interval;
            drop(next);
            tokio::time::sleep(wait).await;
        } else {
            *next = now + self.interval;
        }
    }
}

/// Run-scoped execution state.
///
/// Each step id owns exactly one output slot, written by the scheduler after
/// an attempt completes; committed outputs are immutable, so concurrent
/// branches read them without coordination. The environment snapshot is
/// captured at run start and read-only thereafter.
#[derive(Clone)]
pub struct Context {
    run_id: RunId,
    vars: MemCache<String, Value>,
    env: Arc<HashMap<String, String>>,
    outputs: MemCache<StepId, StepOutput>,
    channel: Arc<Channel>,
    parts: RuntimeParts,
    default_policy: ErrorPolicy,
    /// Throttle for gateway calls; set on loop-item child contexts.
    rate: Option<Arc<RateGate>>,
    /// Pending user-input hand-off channels, one per waiting step.
    inputs: Arc<Mutex<HashMap<StepId, oneshot::Sender<Value>>>>,

    shutdown: Shutdown,
}

impl Context {
    pub fn new(
        run_id: RunId,
        channel: Arc<Channel>,
        parts: RuntimeParts,
        default_policy: ErrorPolicy,
    ) -> Self {
        Self {
            run_id,
            vars: MemCache::new(1024),
            env: Arc::new(std::env::vars().collect()),
            outputs: MemCache::new(4096),
            channel,
            parts,
            default_policy,
            rate: None,
            inputs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Shutdown::new(),
        }
    }

    /// Layer pipeline-defined entries over the process environment snapshot.
    pub fn overlay_env(
        &mut self,
        overrides: &HashMap<String, String>,
    ) {
        if overrides.is_empty() {
            return;
        }
        let mut env = (*self.env).clone();
        env.extend(overrides.clone());
        self.env = Arc::new(env);
    }

    /// A child context for one loop item: shares collaborators, channel, and
    /// the shutdown signal; gets its own variables and output slots. The
    /// parent's committed outputs are snapshot in, so body steps may
    /// reference steps that ran before the loop.
    pub fn child(
        &self,
        extra_vars: Vec<(String, Value)>,
        rate: Option<Arc<RateGate>>,
    ) -> Self {
        let vars = MemCache::new(1024);
        for (key, value) in self.vars.iter() {
            vars.set(key.as_str().to_string(), value.clone());
        }
        for (key, value) in extra_vars {
            vars.set(key, value);
        }

        let outputs = MemCache::new(1024);
        for (sid, output) in self.outputs.iter() {
            outputs.set(sid.as_str().to_string(), output.clone());
        }

        Self {
            run_id: self.run_id.clone(),
            vars,
            env: self.env.clone(),
            outputs,
            channel: self.channel.clone(),
            parts: self.parts.clone(),
            default_policy: self.default_policy.clone(),
            rate,
            inputs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id.to_owned()
    }

    pub fn set_var(
        &self,
        name: &str,
        value: Value,
    ) {
        self.vars.set(name.to_string(), value);
    }

    /// Committed output for a step, if any.
    pub fn output(
        &self,
        sid: &StepId,
    ) -> Option<StepOutput> {
        self.outputs.get(sid)
    }

    /// Commit a step's output slot. Retried attempts replace the prior
    /// attempt's output; only the scheduler calls this.
    pub fn commit_output(
        &self,
        sid: StepId,
        output: StepOutput,
    ) {
        self.outputs.set(sid, output);
    }

    /// All committed outputs, keyed by step id.
    pub fn outputs(&self) -> MemCache<StepId, StepOutput> {
        self.outputs.clone()
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn gateway(&self) -> Arc<dyn ActionGateway> {
        self.parts.gateway.clone()
    }

    pub fn mappings(&self) -> Arc<MappingStore> {
        self.parts.mappings.clone()
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.parts.notifier.clone()
    }

    pub fn limits(&self) -> Arc<Limits> {
        self.parts.limits.clone()
    }

    pub fn parts(&self) -> RuntimeParts {
        self.parts.clone()
    }

    pub fn default_policy(&self) -> &ErrorPolicy {
        &self.default_policy
    }

    /// Honor the loop rate limit, when one is set.
    pub async fn throttle(&self) {
        if let Some(rate) = &self.rate {
            rate.acquire().await;
        }
    }

    /// Register a pending user-input slot for a step; the returned receiver
    /// resolves when [`Context::provide_input`] delivers a value.
    pub fn register_input(
        &self,
        sid: &StepId,
    ) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.inputs.lock().unwrap().insert(sid.clone(), tx);
        rx
    }

    /// Deliver an external response to a waiting `user_input` step.
    pub fn provide_input(
        &self,
        sid: &StepId,
        value: Value,
    ) -> Result<()> {
        let sender = self
            .inputs
            .lock()
            .unwrap()
            .remove(sid)
            .ok_or_else(|| FlowgateError::NotFound(format!("step '{}' is not waiting for input", sid)))?;
        sender.send(value).map_err(|_| FlowgateError::Runtime(format!("step '{}' stopped waiting for input", sid)))
    }

    pub fn clear_input(
        &self,
        sid: &StepId,
    ) {
        self.inputs.lock().unwrap().remove(sid);
    }

    pub fn emit_log(
        &self,
        sid: StepId,
        content: String,
    ) {
        let log = LogEntry {
            run_id: self.run_id.clone(),
            step_id: sid,
            content,
            timestamp: utils::time::time_millis(),
        };
        let _ = self.channel.log_queue().send(Event::new(&log));
    }

    pub fn done(&self) {
        self.shutdown.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_terminated()
    }

    pub fn wait_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        self.shutdown.wait()
    }
}

impl Scope for Context {
    fn var(
        &self,
        name: &str,
    ) -> Option<Value> {
        self.vars.get(&name.to_string())
    }

    fn env_value(
        &self,
        name: &str,
    ) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn step_output_value(
        &self,
        id: &str,
    ) -> Option<Value> {
        self.outputs.get(&id.to_string()).map(|o| o.to_value())
    }
}
