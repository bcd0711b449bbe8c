use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;

use crate::{
    Result,
    common::{Queue, Vars},
    dispatcher::Dispatcher,
    events::{FlowEvent, RunEvent},
    model::PipelineModel,
    pipeline::{StepGraph, StepId, StepState},
    runtime::{Channel, ChannelOptions, Context, RunId, RuntimeParts, channel::ChannelEvent},
    utils,
};

const COMMAND_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub enum RunCommand {
    Start,
    Abort,
}

/// One execution of a deployed pipeline.
///
/// Building a run validates the definition hard: the dependency graph is
/// derived and checked for cycles before anything executes.
#[derive(Clone)]
pub struct Run {
    id: RunId,
    pipeline: String,
    ctx: Arc<Context>,
    dispatcher: Arc<Dispatcher>,
    command_queue: Arc<Queue<RunCommand>>,
    channel: Arc<Channel>,
}

impl Run {
    pub fn new(
        model: &PipelineModel,
        parts: RuntimeParts,
        channel: Arc<Channel>,
        handle: Handle,
    ) -> Result<Arc<Run>> {
        let run_id = utils::longid();

        model.validate()?;
        let graph = StepGraph::build(&model.steps)?;

        let mut ctx = Context::new(run_id.clone(), channel.clone(), parts.clone(), model.error_handling.policy());
        ctx.overlay_env(&model.env);
        for (name, value) in &model.variables {
            ctx.set_var(name, value.clone());
        }
        let ctx = Arc::new(ctx);

        let command_queue = Queue::new(COMMAND_QUEUE_SIZE);
        let max_parallel = parts.limits.max_parallel_steps;

        let dispatcher = Arc::new(Dispatcher::new(
            ctx.clone(),
            Arc::new(graph),
            command_queue.clone(),
            handle,
            max_parallel,
        ));

        Ok(Arc::new(Run {
            id: run_id,
            pipeline: model.name.clone(),
            ctx,
            dispatcher,
            command_queue,
            channel,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn start(&self) {
        self.dispatcher.start();

        let dispatcher = self.dispatcher.clone();

        ChannelEvent::channel(self.channel.clone(), ChannelOptions::with_run_id(self.id.to_owned())).on_event(move |event| {
            match &event.event {
                FlowEvent::Run(e) => match e {
                    RunEvent::Succeeded | RunEvent::Failed(_) | RunEvent::Aborted(_) => {
                        dispatcher.stop();
                    }
                    _ => {}
                },
                _ => {}
            }
        });

        let _ = self.command_queue.send(RunCommand::Start);
    }

    /// Cooperative abort: in-flight steps observe the signal; no new steps
    /// start.
    pub fn abort(&self) {
        let _ = self.command_queue.send(RunCommand::Abort);
    }

    /// Committed step outputs, `{step_id: envelope}`. Available during and
    /// after the run, whether it succeeded or failed.
    pub fn outputs(&self) -> Vars {
        self.dispatcher.outputs()
    }

    /// Current state of every step.
    pub fn step_states(&self) -> Vec<(StepId, StepState, bool)> {
        self.dispatcher.step_states()
    }

    /// Deliver an external response to a waiting `user_input` step.
    pub fn provide_input(
        &self,
        sid: &StepId,
        value: Value,
    ) -> Result<()> {
        self.ctx.provide_input(sid, value)
    }

    pub fn is_complete(&self) -> bool {
        self.dispatcher.is_complete()
    }
}
