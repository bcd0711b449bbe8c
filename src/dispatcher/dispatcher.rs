//! The pipeline interpreter.
//!
//! Consumes the step graph and schedules steps as their dependencies become
//! terminal. Independent branches genuinely overlap: ready steps execute on
//! a pool of worker tasks bounded by a semaphore. Every attempt is wrapped
//! by the resolved error/retry policy, and outputs are committed only here,
//! one slot per step per attempt.

use std::sync::Arc;

use tokio::{
    runtime::Handle,
    sync::{Semaphore, mpsc},
};
use serde_json::Value;

use crate::{
    FlowgateError,
    common::{Queue, Shutdown, Vars},
    events::{ErrorReason, Event, FlowEvent, Message, RunAbortedEvent, RunEvent, RunFailedEvent, RunStartEvent, StepEvent},
    gateway::{Attempted, ErrorPolicy, PolicyAction, run_with_policy},
    pipeline::{
        StepGraph, StepId, StepOutput, StepState,
        steps::{SELECTED_KEY, StepKind},
    },
    runtime::{Context, RunCommand},
    utils,
};

/// Result of one step's execution, reported back to the scheduler.
enum StepDone {
    Succeeded(StepOutput),
    /// Failure absorbed by a continue policy.
    Continued {
        error: FlowgateError,
        attempts: u64,
    },
    Failed {
        error: FlowgateError,
        attempts: u64,
    },
    Stopped,
}

/// Schedules and executes a run's steps.
pub struct Dispatcher {
    ctx: Arc<Context>,
    graph: Arc<StepGraph>,
    command_queue: Arc<Queue<RunCommand>>,
    handle: Handle,
    /// Bounds simultaneous step execution across the run.
    workers: Arc<Semaphore>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<Context>,
        graph: Arc<StepGraph>,
        command_queue: Arc<Queue<RunCommand>>,
        handle: Handle,
        max_parallel: usize,
    ) -> Self {
        Self {
            ctx,
            graph,
            command_queue,
            handle,
            workers: Arc::new(Semaphore::new(max_parallel.max(1))),
            shutdown: Shutdown::new(),
        }
    }

    /// Starts the scheduler loop. Processes step completions and run
    /// commands; all graph state transitions happen on this task.
    pub fn start(&self) {
        let (tx, mut rx) = mpsc::channel::<(StepId, StepDone)>(1024);

        let ctx = self.ctx.clone();
        let graph = self.graph.clone();
        let command_queue = self.command_queue.clone();
        let handle = self.handle.clone();
        let workers = self.workers.clone();
        let shutdown = self.shutdown.clone();

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,

                    Some((sid, done)) = rx.recv() => {
                        match done {
                            StepDone::Succeeded(output) => {
                                ctx.commit_output(sid.clone(), output);
                                graph.mark_state(&sid, StepState::Succeeded);
                                Self::emit_step(&ctx, &sid, StepEvent::Succeeded(utils::time::time_millis()));
                                Self::advance(&ctx, &graph, &handle, &workers, &tx, &shutdown, sid);
                            }
                            StepDone::Continued { error, attempts } => {
                                let mut output = StepOutput::continued(error.to_string());
                                output.meta.attempts = attempts;
                                ctx.commit_output(sid.clone(), output);
                                graph.mark_state(&sid, StepState::Failed);
                                graph.mark_continued(&sid);
                                Self::emit_step(&ctx, &sid, StepEvent::Continued(error.to_string()));
                                Self::advance(&ctx, &graph, &handle, &workers, &tx, &shutdown, sid);
                            }
                            StepDone::Failed { error, attempts } => {
                                graph.mark_state(&sid, StepState::Failed);
                                Self::emit_step(&ctx, &sid, StepEvent::Error(ErrorReason::Failed(error.to_string())));
                                let _ = ctx.channel().event_queue().send(Event::new(&Message {
                                    run_id: ctx.run_id(),
                                    step_id: sid.clone(),
                                    event: FlowEvent::Run(RunEvent::Failed(RunFailedEvent {
                                        error: error.to_string(),
                                        step_id: sid,
                                        attempts,
                                    })),
                                }));
                                ctx.done();
                                shutdown.shutdown();
                            }
                            StepDone::Stopped => {
                                Self::emit_step(&ctx, &sid, StepEvent::Stopped(utils::time::time_millis()));
                            }
                        }
                    }

                    cmd_opt = command_queue.next_async() => {
                        if let Some(cmd) = cmd_opt {
                            match cmd {
                                RunCommand::Start => {
                                    let step_ids = graph.all_step_ids();
                                    let _ = ctx.channel().event_queue().send(Event::new(&Message {
                                        run_id: ctx.run_id(),
                                        step_id: "".to_string(),
                                        event: FlowEvent::Run(RunEvent::Start(RunStartEvent { step_ids })),
                                    }));

                                    for root in graph.roots() {
                                        Self::spawn_step(&ctx, &graph, &handle, &workers, &tx, root);
                                    }
                                }
                                RunCommand::Abort => {
                                    let _ = ctx.channel().event_queue().send(Event::new(&Message {
                                        run_id: ctx.run_id(),
                                        step_id: "".to_string(),
                                        event: FlowEvent::Run(RunEvent::Aborted(RunAbortedEvent {
                                            reason: "Aborted by command".to_string(),
                                        })),
                                    }));
                                    ctx.done();
                                    shutdown.shutdown();
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stops the scheduler.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    /// All committed outputs, as `{step_id: envelope}`.
    pub fn outputs(&self) -> Vars {
        let mut result = Vars::new();
        for (sid, output) in self.ctx.outputs().iter() {
            result.set(sid.as_str(), output.to_value());
        }
        result
    }

    /// Current (id, state, continued) of every step.
    pub fn step_states(&self) -> Vec<(StepId, StepState, bool)> {
        self.graph.states()
    }

    pub fn is_complete(&self) -> bool {
        self.shutdown.is_terminated()
    }

    fn emit_step(
        ctx: &Arc<Context>,
        sid: &StepId,
        event: StepEvent,
    ) {
        let _ = ctx.channel().event_queue().send(Event::new(&Message {
            run_id: ctx.run_id(),
            step_id: sid.clone(),
            event: FlowEvent::Step(event),
        }));
    }

    /// After a step settles: apply branch skipping, schedule newly ready
    /// steps, and detect run completion.
    fn advance(
        ctx: &Arc<Context>,
        graph: &Arc<StepGraph>,
        handle: &Handle,
        workers: &Arc<Semaphore>,
        tx: &mpsc::Sender<(StepId, StepDone)>,
        shutdown: &Shutdown,
        sid: StepId,
    ) {
        let mut skipped: Vec<StepId> = Vec::new();

        if let Some(step) = graph.get_step(&sid) {
            if matches!(step.kind, StepKind::Condition | StepKind::Switch) {
                let selected = ctx.output(&sid).and_then(|o| o.data.get(SELECTED_KEY).and_then(Value::as_str).map(String::from));
                if let Some(selected) = selected {
                    skipped = graph.skip_unselected(&sid, &selected);
                    for skipped_id in &skipped {
                        Self::emit_step(ctx, skipped_id, StepEvent::Skipped);
                    }
                }
            }
        }

        let mut next = graph.ready_successors(&sid);
        for skipped_id in &skipped {
            next.extend(graph.ready_successors(skipped_id));
        }
        next.sort();
        next.dedup();

        if next.is_empty() && graph.is_all_terminal() {
            let _ = ctx.channel().event_queue().send(Event::new(&Message {
                run_id: ctx.run_id(),
                step_id: sid,
                event: FlowEvent::Run(RunEvent::Succeeded),
            }));
            ctx.done();
            shutdown.shutdown();
            return;
        }

        for next_sid in next {
            Self::spawn_step(ctx, graph, handle, workers, tx, next_sid);
        }
    }

    /// Hand a ready step to a worker. The Ready mark happens here, on the
    /// scheduler, so no two workers ever take the same step.
    fn spawn_step(
        ctx: &Arc<Context>,
        graph: &Arc<StepGraph>,
        handle: &Handle,
        workers: &Arc<Semaphore>,
        tx: &mpsc::Sender<(StepId, StepDone)>,
        sid: StepId,
    ) {
        graph.mark_state(&sid, StepState::Ready);

        // A dependency skipped by branching fails the dependent fast, before
        // any worker or external call is involved.
        if let Some(source) = graph.skipped_data_source(&sid) {
            let step = graph.get_step(&sid);
            let policy = ErrorPolicy::resolve(step.as_ref().and_then(|s| s.on_error.as_ref()), Some(ctx.default_policy()));
            let error = FlowgateError::SkippedDependency(format!("step '{}' requires output of skipped step '{}'", sid, source));
            let done = if policy.action == PolicyAction::Continue {
                StepDone::Continued {
                    error,
                    attempts: 0,
                }
            } else {
                StepDone::Failed {
                    error,
                    attempts: 0,
                }
            };
            let tx = tx.clone();
            handle.spawn(async move {
                let _ = tx.send((sid, done)).await;
            });
            return;
        }

        let ctx = ctx.clone();
        let graph = graph.clone();
        let workers = workers.clone();
        let tx = tx.clone();

        handle.spawn(async move {
            let _permit = workers.acquire_owned().await.unwrap();
            graph.mark_state(&sid, StepState::Running);
            Self::emit_step(&ctx, &sid, StepEvent::Running(utils::time::time_millis()));

            let done = Self::execute_step(&ctx, &graph, &sid).await;
            let _ = tx.send((sid, done)).await;
        });
    }

    /// Execute one step under its resolved policy and timeout.
    async fn execute_step(
        ctx: &Arc<Context>,
        graph: &Arc<StepGraph>,
        sid: &StepId,
    ) -> StepDone {
        let Some(step) = graph.get_step(sid) else {
            return StepDone::Failed {
                error: FlowgateError::Step(format!("step '{}' not found", sid)),
                attempts: 0,
            };
        };

        let policy = ErrorPolicy::resolve(step.on_error.as_ref(), Some(ctx.default_policy()));
        let limits = ctx.limits();
        let started = std::time::Instant::now();

        let execution = run_with_policy(&policy, &limits, |attempt| {
            let ctx = ctx.clone();
            let sid = sid.clone();
            let step = &step;
            async move {
                if attempt > 1 {
                    Self::emit_step(&ctx, &sid, StepEvent::Retry);
                }
                match step.timeout {
                    Some(timeout) => tokio::time::timeout(timeout, step.action.run(ctx, sid.clone()))
                        .await
                        .map_err(|_| FlowgateError::Timeout(format!("step '{}' timed out", sid)))?,
                    None => step.action.run(ctx, sid).await,
                }
            }
        });

        let attempted = tokio::select! {
            _ = ctx.wait_shutdown() => return StepDone::Stopped,
            attempted = execution => attempted,
        };

        match attempted {
            Attempted::Done {
                mut value,
                attempts,
            } => {
                value.meta.attempts = attempts;
                if value.meta.duration_ms == 0 {
                    value.meta.duration_ms = started.elapsed().as_millis() as u64;
                }
                StepDone::Succeeded(value)
            }
            Attempted::Continued {
                error,
                attempts,
            } => StepDone::Continued {
                error,
                attempts,
            },
            Attempted::Failed {
                error,
                attempts,
            } => StepDone::Failed {
                error,
                attempts,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use crate::{
        gateway::{ErrorPolicy, PolicyAction},
        model::{PipelineModel, StepModel},
        pipeline::StepState,
        runtime::Run,
        testkit::{ScriptedGateway, execute_model},
    };

    fn read_step(
        id: &str,
        action: &str,
        params: Value,
    ) -> StepModel {
        StepModel {
            id: id.to_string(),
            kind: "read".to_string(),
            config: json!({"system": "s", "resource": "r", "action": action, "params": params}),
            ..Default::default()
        }
    }

    fn model(steps: Vec<StepModel>) -> PipelineModel {
        PipelineModel {
            name: "test".to_string(),
            steps,
            ..Default::default()
        }
    }

    fn state_of(
        run: &Arc<Run>,
        id: &str,
    ) -> (StepState, bool) {
        run.step_states()
            .into_iter()
            .find(|(sid, _, _)| sid == id)
            .map(|(_, state, continued)| (state, continued))
            .unwrap()
    }

    fn run_failed(run: &Arc<Run>) -> bool {
        run.step_states().iter().any(|(_, state, continued)| *state == StepState::Failed && !continued)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chain_executes_in_dependency_order() {
        let gateway = Arc::new(ScriptedGateway::new());
        let pipeline = model(vec![
            read_step("a", "first", json!({})),
            read_step("b", "second", json!({"prev": "${steps.a.output.meta.request_id}"})),
            read_step("c", "third", json!({"prev": "${steps.b.output.meta.request_id}"})),
        ]);

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(!run_failed(&run));
        assert_eq!(gateway.targets(), vec!["s.r.first", "s.r.second", "s.r.third"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_diamond_respects_partial_order() {
        let gateway = Arc::new(ScriptedGateway::new());
        let pipeline = model(vec![
            read_step("a", "root", json!({})),
            read_step("b", "left", json!({"prev": "${steps.a.output.meta.request_id}"})),
            read_step("c", "right", json!({"prev": "${steps.a.output.meta.request_id}"})),
            read_step(
                "d",
                "join",
                json!({"l": "${steps.b.output.meta.request_id}", "r": "${steps.c.output.meta.request_id}"}),
            ),
        ]);

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(!run_failed(&run));
        let order = gateway.targets();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "s.r.root");
        assert_eq!(order[3], "s.r.join");
        for (id, state, _) in run.step_states() {
            assert_eq!(state, StepState::Succeeded, "step {} not succeeded", id);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cycle_rejected_before_any_execution() {
        let gateway = Arc::new(ScriptedGateway::new());
        let pipeline = model(vec![
            read_step("a", "one", json!({"prev": "${steps.b.output.data}"})),
            read_step("b", "two", json!({"prev": "${steps.a.output.data}"})),
        ]);

        let channel = Arc::new(crate::runtime::Channel::new(tokio::runtime::Handle::current()));
        let err = Run::new(&pipeline, crate::testkit::test_parts(gateway.clone()), channel, tokio::runtime::Handle::current())
            .err()
            .unwrap();

        assert!(matches!(err, crate::FlowgateError::Cycle(_)));
        assert_eq!(gateway.call_count(), 0);
    }

    fn branching_steps() -> Vec<StepModel> {
        vec![
            StepModel {
                id: "cond".to_string(),
                kind: "condition".to_string(),
                config: json!({
                    "conditions": [{"selector": "${var:flag}", "op": "eq", "value": true}],
                    "then_step": "t",
                    "else_step": "f"
                }),
                ..Default::default()
            },
            read_step("t", "then_branch", json!({})),
            read_step("f", "else_branch", json!({})),
        ]
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_false_condition_skips_then_branch() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut steps = branching_steps();
        steps.push(read_step("after", "uses_chosen", json!({"from": "${steps.f.output.meta.request_id}"})));

        let mut pipeline = model(steps);
        pipeline.variables.insert("flag".to_string(), json!(false));

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(!run_failed(&run));
        assert_eq!(state_of(&run, "t").0, StepState::Skipped);
        assert_eq!(state_of(&run, "f").0, StepState::Succeeded);
        assert_eq!(state_of(&run, "after").0, StepState::Succeeded);
        assert!(!gateway.targets().contains(&"s.r.then_branch".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dependent_of_skipped_branch_fails_fast() {
        let gateway = Arc::new(ScriptedGateway::new());
        let mut steps = branching_steps();
        steps.push(read_step("orphan", "uses_skipped", json!({"from": "${steps.t.output.data}"})));

        let mut pipeline = model(steps);
        pipeline.variables.insert("flag".to_string(), json!(false));

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(run_failed(&run));
        assert_eq!(state_of(&run, "orphan").0, StepState::Failed);
        // the orphan never reached the gateway
        assert!(!gateway.targets().contains(&"s.r.uses_skipped".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_succeeds_on_third_attempt() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.fail_first(2);

        let mut step = read_step("a", "flaky", json!({}));
        step.on_error = Some(ErrorPolicy::retry(3, 0));
        let pipeline = model(vec![step]);

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert_eq!(state_of(&run, "a").0, StepState::Succeeded);
        assert_eq!(gateway.call_count(), 3);

        let envelope: Value = run.outputs().get("a").unwrap();
        assert_eq!(envelope["meta"]["attempts"], json!(3));
        assert!(envelope["error"].is_null());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_exhaustion_fails_run() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.fail_first(100);

        let mut step = read_step("a", "flaky", json!({}));
        step.on_error = Some(ErrorPolicy::retry(2, 0));
        let pipeline = model(vec![step]);

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(run_failed(&run));
        assert_eq!(gateway.call_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_continue_policy_records_error_and_proceeds() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.fail_first(1);

        let mut failing = read_step("a", "down", json!({}));
        failing.on_error = Some(ErrorPolicy {
            action: PolicyAction::Continue,
            ..Default::default()
        });
        let dependent = read_step("b", "reports", json!({"note": "${steps.a.output.error}"}));
        let pipeline = model(vec![failing, dependent]);

        let run = execute_model(&pipeline, gateway.clone()).await;

        let (a_state, a_continued) = state_of(&run, "a");
        assert_eq!(a_state, StepState::Failed);
        assert!(a_continued);
        assert_eq!(state_of(&run, "b").0, StepState::Succeeded);
        assert!(!run_failed(&run));

        // dependents see the explicit error flag, not a bare empty payload
        let envelope: Value = run.outputs().get("a").unwrap();
        assert!(envelope["error"].as_str().unwrap().contains("scripted failure"));
        assert!(envelope["data"].is_null());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pipeline_default_policy_applies_when_step_has_none() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.fail_first(1);

        let mut pipeline = model(vec![read_step("a", "down", json!({})), read_step("b", "next", json!({"prev": "${steps.a.output.error}"}))]);
        pipeline.error_handling.default_action = PolicyAction::Continue;

        let run = execute_model(&pipeline, gateway.clone()).await;

        assert!(!run_failed(&run));
        assert!(state_of(&run, "a").1);
    }

}

