//! Pipeline engine - the embedding host's entry point.
//!
//! The engine deploys pipeline definitions, builds and starts runs, routes
//! external input to waiting steps, and coordinates graceful shutdown. Tool
//! sessions trigger runs through the same surface.

mod monitor;

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;
use tokio::runtime::{Builder, Runtime};

use crate::{
    Config, FlowgateError, Result,
    common::{MemCache, Queue, Shutdown, Vars},
    gateway::ActionGateway,
    mapping::MappingStore,
    model::PipelineModel,
    pipeline::{StepGraph, StepId, steps::LogNotifier},
    runtime::{Channel, ChannelEvent, ChannelOptions, Run, RunId, RuntimeParts},
    store::{MemStore, Store, data, DbStore},
    utils,
};

use monitor::Monitor;

/// Maximum number of runs kept addressable in memory. Completed runs stay
/// cached (their outputs remain inspectable) until evicted.
const RUN_CACHE_SIZE: usize = 2048;
/// Size of the queue for settled-run notifications.
const RUN_SETTLED_QUEUE_SIZE: usize = 100;

/// The run execution engine.
pub struct Engine {
    /// Event channel for broadcasting run events.
    channel: Arc<Channel>,
    /// Storage for pipelines and execution history.
    store: Arc<Store>,
    /// Background monitor persisting events to the store.
    monitor: Monitor,
    /// Queue of runs that reached a terminal state.
    runs_settled_queue: Arc<Queue<RunId>>,
    /// Addressable runs, active and recently completed.
    runs: Arc<MemCache<RunId, Arc<Run>>>,
    /// Collaborators shared by every run.
    parts: RuntimeParts,

    running: Arc<AtomicBool>,
    runtime: Arc<Runtime>,
    shutdown: Arc<Shutdown>,
}

impl Engine {
    /// Engine with its own runtime, the in-memory store, and default
    /// collaborators. Use [`crate::EngineBuilder`] to supply your own.
    pub fn new_with_config(
        config: Config,
        gateway: Arc<dyn ActionGateway>,
    ) -> Self {
        let runtime = Arc::new(Builder::new_multi_thread().worker_threads(config.async_worker_thread_number.into()).enable_all().build().unwrap());

        let parts = RuntimeParts {
            gateway,
            mappings: Arc::new(MappingStore::new()),
            notifier: Arc::new(LogNotifier),
            limits: Arc::new(config.limits.clone()),
        };

        Self::with_parts(runtime, parts)
    }

    pub(crate) fn with_parts(
        runtime: Arc<Runtime>,
        parts: RuntimeParts,
    ) -> Self {
        let store = Store::new();
        MemStore::new().init(&store);
        let store = Arc::new(store);

        let channel = Arc::new(Channel::new(runtime.handle().clone()));
        let monitor = Monitor::new(store.clone(), channel.clone());

        Self {
            channel,
            store,
            monitor,
            runs_settled_queue: Queue::new(RUN_SETTLED_QUEUE_SIZE),
            runs: Arc::new(MemCache::new(RUN_CACHE_SIZE)),
            parts,
            running: Arc::new(AtomicBool::new(false)),
            runtime,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Starts event processing. Handlers are registered before the channel
    /// begins listening so no events are missed.
    pub fn launch(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }

        self.monitor.monitor();
        self.channel.listen();

        // Persist final step outputs once a run settles, success or failure.
        let settled_queue = self.runs_settled_queue.clone();
        let events = ChannelEvent::channel(self.channel.clone(), ChannelOptions::default());
        {
            let settled_queue = settled_queue.clone();
            events.on_complete(move |run_id| {
                let _ = settled_queue.send(run_id);
            });
        }
        {
            let settled_queue = settled_queue.clone();
            events.on_error(move |e| {
                let _ = settled_queue.send(e.run_id.clone());
            });
        }

        let settled_queue = self.runs_settled_queue.clone();
        let shutdown = self.shutdown.clone();
        let runs = self.runs.clone();
        let store = self.store.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Some(run_id) = settled_queue.next_async() => {
                        if let Some(run) = runs.get(&run_id) {
                            Self::persist_outputs(&store, &run);
                        }
                    }
                }
            }
        });
    }

    /// Gracefully shuts down: aborts active runs and stops the channel.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }

        self.shutdown.shutdown();
        for (_, run) in self.runs.iter() {
            run.abort();
        }
        self.channel.shutdown();
    }

    /// Validate and store a pipeline definition. The step graph is derived
    /// here too, so config and cycle errors surface at deploy time.
    pub fn deploy(
        &self,
        pipeline: &PipelineModel,
    ) -> Result<bool> {
        pipeline.validate()?;
        StepGraph::build(&pipeline.steps)?;
        self.store.deploy(pipeline)
    }

    /// Build a run of a deployed pipeline, layering extra variables over the
    /// definition's. The run is validated but not started.
    pub fn build_run(
        &self,
        pipeline_name: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Arc<Run>> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(FlowgateError::Engine("Engine is not running".to_string()));
        }

        let record = self.store.pipelines().find(pipeline_name)?;
        let mut model = PipelineModel::from_json(&record.data)?;
        model.variables.extend(variables);

        let run = Run::new(&model, self.parts.clone(), self.channel.clone(), self.runtime.handle().clone())?;

        if self.runs.get(&run.id().to_string()).is_some() {
            return Err(FlowgateError::Engine(format!("Run {} already exists in cache", run.id())));
        }

        Ok(run)
    }

    /// Record and start a built run; returns its id immediately.
    pub fn start_run(
        &self,
        run: Arc<Run>,
    ) -> Result<RunId> {
        let run_id = run.id().to_string();

        let record = data::RunRecord {
            id: run_id.clone(),
            pipeline: run.pipeline().to_string(),
            state: "Pending".to_string(),
            start_time: utils::time::time_millis(),
            end_time: 0,
            err: None,
            timestamp: utils::time::time_millis(),
        };
        self.store.runs().create(&record)?;

        self.runs.set(run_id.clone(), run.clone());
        run.start();

        Ok(run_id)
    }

    /// Deploy-run convenience: build and start in one call.
    pub fn run_pipeline(
        &self,
        pipeline_name: &str,
        variables: HashMap<String, Value>,
    ) -> Result<RunId> {
        let run = self.build_run(pipeline_name, variables)?;
        self.start_run(run)
    }

    /// Cooperatively abort a run.
    pub fn stop(
        &self,
        run_id: &str,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        if let Some(run) = self.runs.get(&run_id) {
            run.abort();
            Ok(())
        } else {
            Err(FlowgateError::NotFound(format!("Run {} not found", run_id)))
        }
    }

    pub fn get_run(
        &self,
        run_id: &String,
    ) -> Option<Arc<Run>> {
        self.runs.get(run_id)
    }

    /// Deliver an external response to a waiting `user_input` step.
    pub fn provide_input(
        &self,
        run_id: &str,
        step_id: &StepId,
        value: Value,
    ) -> Result<()> {
        let run = self
            .get_run(&run_id.to_string())
            .ok_or_else(|| FlowgateError::NotFound(format!("Run {} not found", run_id)))?;
        run.provide_input(step_id, value)
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub(crate) fn parts(&self) -> RuntimeParts {
        self.parts.clone()
    }

    pub fn mappings(&self) -> Arc<MappingStore> {
        self.parts.mappings.clone()
    }

    fn persist_outputs(
        store: &Arc<Store>,
        run: &Arc<Run>,
    ) {
        let outputs: Vars = run.outputs();
        let steps = store.steps();
        for (step_id, envelope) in outputs.iter() {
            let id = data::StepRecord::record_id(run.id(), step_id);
            if let Ok(mut record) = steps.find(&id) {
                record.output = Some(envelope.to_string());
                let _ = steps.update(&record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::{EngineBuilder, testkit::ScriptedGateway};

    fn engine_with(gateway: Arc<ScriptedGateway>) -> Engine {
        let engine = EngineBuilder::new().gateway(gateway).build().unwrap();
        engine.launch();
        engine
    }

    fn wait_complete(run: &Arc<Run>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !run.is_complete() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(run.is_complete(), "run did not complete in time");
    }

    fn simple_pipeline(name: &str) -> PipelineModel {
        PipelineModel::from_json(
            &json!({
                "name": name,
                "version": "1",
                "steps": [
                    {"id": "fetch", "type": "read", "config": {"system": "s", "resource": "r", "action": "list"}}
                ]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_deploy_and_run() {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = engine_with(gateway.clone());

        engine.deploy(&simple_pipeline("sync")).unwrap();
        let run_id = engine.run_pipeline("sync", HashMap::new()).unwrap();

        let run = engine.get_run(&run_id).unwrap();
        wait_complete(&run);

        let envelope: serde_json::Value = run.outputs().get("fetch").unwrap();
        assert_eq!(envelope["data"], json!({"ok": true}));
        assert_eq!(gateway.call_count(), 1);

        // the monitor persists the terminal state shortly after completion
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = engine.store().runs().find(&run_id).unwrap();
            if record.state == "Succeeded" {
                break;
            }
            assert!(Instant::now() < deadline, "run record never settled, state {}", record.state);
            std::thread::sleep(Duration::from_millis(10));
        }

        engine.shutdown();
    }

    #[test]
    fn test_deploy_rejects_cycles() {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = engine_with(gateway);

        let pipeline = PipelineModel::from_json(
            &json!({
                "name": "looped",
                "steps": [
                    {"id": "a", "type": "read", "config": {"system": "s", "resource": "r", "action": "x", "params": {"p": "${steps.b.output.data}"}}},
                    {"id": "b", "type": "read", "config": {"system": "s", "resource": "r", "action": "y", "params": {"p": "${steps.a.output.data}"}}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        assert!(matches!(engine.deploy(&pipeline), Err(FlowgateError::Cycle(_))));
        engine.shutdown();
    }

    #[test]
    fn test_user_input_delivery() {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = engine_with(gateway);

        let pipeline = PipelineModel::from_json(
            &json!({
                "name": "approval",
                "steps": [
                    {"id": "ask", "type": "user_input", "config": {"prompt": "approve?", "timeout_seconds": 30}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        engine.deploy(&pipeline).unwrap();
        let run_id = engine.run_pipeline("approval", HashMap::new()).unwrap();

        // the step registers its input slot once it starts running
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match engine.provide_input(&run_id, &"ask".to_string(), json!("yes")) {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("input never accepted: {}", e),
            }
        }

        let run = engine.get_run(&run_id).unwrap();
        wait_complete(&run);

        let envelope: serde_json::Value = run.outputs().get("ask").unwrap();
        assert_eq!(envelope["data"]["value"], json!("yes"));
        assert_eq!(envelope["data"]["timed_out"], json!(false));

        engine.shutdown();
    }

    #[test]
    fn test_abort_cancels_waiting_run() {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = engine_with(gateway);

        let pipeline = PipelineModel::from_json(
            &json!({
                "name": "long",
                "steps": [
                    {"id": "nap", "type": "wait", "config": {"duration_seconds": 30}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        engine.deploy(&pipeline).unwrap();
        let run_id = engine.run_pipeline("long", HashMap::new()).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        engine.stop(&run_id).unwrap();

        let run = engine.get_run(&run_id).unwrap();
        wait_complete(&run);

        engine.shutdown();
    }
}
