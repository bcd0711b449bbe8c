//! Background monitor persisting run events to the store.

use std::sync::Arc;

use tracing::warn;

use crate::{
    events::{FlowEvent, RunEvent, StepEvent},
    runtime::{Channel, ChannelEvent, ChannelOptions},
    store::{Store, data},
    utils,
};

pub struct Monitor {
    store: Arc<Store>,
    channel: Arc<Channel>,
}

impl Monitor {
    pub fn new(
        store: Arc<Store>,
        channel: Arc<Channel>,
    ) -> Self {
        Self {
            store,
            channel,
        }
    }

    /// Register persistence handlers. Must run before the channel starts
    /// listening.
    pub fn monitor(&self) {
        let events = ChannelEvent::channel(self.channel.clone(), ChannelOptions::default());

        let store = self.store.clone();
        events.on_event(move |e| {
            let result = match &e.event {
                FlowEvent::Run(run_event) => Self::persist_run_event(&store, &e.run_id, run_event),
                FlowEvent::Step(step_event) => Self::persist_step_event(&store, &e.run_id, &e.step_id, step_event),
            };
            if let Err(err) = result {
                warn!(run_id = %e.run_id, "monitor persist failed: {}", err);
            }
        });

        let store = self.store.clone();
        events.on_log(move |l| {
            let record = data::LogRecord {
                id: utils::longid(),
                run_id: l.run_id.clone(),
                step_id: l.step_id.clone(),
                content: l.content.clone(),
                timestamp: l.timestamp,
            };
            if let Err(err) = store.logs().create(&record) {
                warn!(run_id = %l.run_id, "monitor log persist failed: {}", err);
            }
        });
    }

    fn persist_run_event(
        store: &Arc<Store>,
        run_id: &str,
        event: &RunEvent,
    ) -> crate::Result<()> {
        let runs = store.runs();
        let mut record = runs.find(run_id)?;

        record.state = event.str().to_string();
        record.timestamp = utils::time::time_millis();
        match event {
            RunEvent::Start(_) => {}
            RunEvent::Failed(failed) => {
                record.err = Some(failed.error.clone());
                record.end_time = utils::time::time_millis();
            }
            RunEvent::Succeeded | RunEvent::Aborted(_) => {
                record.end_time = utils::time::time_millis();
            }
        }
        runs.update(&record)?;
        Ok(())
    }

    fn persist_step_event(
        store: &Arc<Store>,
        run_id: &str,
        step_id: &str,
        event: &StepEvent,
    ) -> crate::Result<()> {
        let steps = store.steps();
        let id = data::StepRecord::record_id(run_id, step_id);
        let now = utils::time::time_millis();

        match event {
            StepEvent::Running(ts) => {
                let record = data::StepRecord {
                    id,
                    run_id: run_id.to_string(),
                    step_id: step_id.to_string(),
                    state: event.str().to_string(),
                    error: None,
                    output: None,
                    start_time: *ts,
                    end_time: 0,
                    timestamp: now,
                };
                steps.create(&record)?;
            }
            StepEvent::Retry => {}
            _ => {
                // Skipped steps never ran, so their record may not exist yet.
                let mut record = match steps.find(&id) {
                    Ok(record) => record,
                    Err(_) => data::StepRecord {
                        id,
                        run_id: run_id.to_string(),
                        step_id: step_id.to_string(),
                        state: String::new(),
                        error: None,
                        output: None,
                        start_time: 0,
                        end_time: 0,
                        timestamp: now,
                    },
                };
                record.state = event.str().to_string();
                record.timestamp = now;
                match event {
                    StepEvent::Succeeded(ts) | StepEvent::Stopped(ts) => record.end_time = *ts,
                    StepEvent::Continued(error) => {
                        record.error = Some(error.clone());
                        record.end_time = now;
                    }
                    StepEvent::Error(reason) => {
                        record.error = Some(reason.to_string());
                        record.end_time = now;
                    }
                    _ => {}
                }

                if steps.exists(&record.id)? {
                    steps.update(&record)?;
                } else {
                    steps.create(&record)?;
                }
            }
        }
        Ok(())
    }
}
