//! # Flowgate
//!
//! Flowgate is a pipeline execution engine with a session-based tool
//! dispatch layer, designed to be embedded in applications that move data
//! between heterogeneous external systems.
//!
//! ## Core Features
//!
//! - **Declarative pipelines**: a JSON step graph with branching, loops,
//!   sandboxed transforms, waits, and human-input steps
//! - **Derived dependencies**: step order comes from template references;
//!   cycles are rejected before anything runs
//! - **One invocation contract**: pipeline steps and remote tool calls share
//!   the same action gateway, pagination controller, and error/retry policy
//! - **Session tools**: every catalog action is callable over JSON-RPC under
//!   safe/power permission modes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgate::{EngineBuilder, PipelineModel};
//!
//! let engine = EngineBuilder::new().gateway(gateway).build()?;
//! engine.launch();
//!
//! let pipeline = PipelineModel::from_json(json_str)?;
//! engine.deploy(&pipeline)?;
//! let run_id = engine.run_pipeline(&pipeline.name, Default::default())?;
//! ```

mod builder;
pub mod catalog;
mod common;
mod config;
mod dispatcher;
mod engine;
mod error;
pub mod events;
pub mod expr;
pub mod gateway;
pub mod mapping;
mod model;
mod pipeline;
mod runtime;
pub mod session;
mod store;
mod utils;

#[cfg(test)]
pub(crate) mod testkit;

use std::sync::{Arc, RwLock};

pub use builder::EngineBuilder;
pub use config::{Config, Limits};
pub use engine::Engine;
pub use error::FlowgateError;
pub use model::*;
pub use pipeline::{StepId, StepOutput, StepState};
pub use runtime::{Channel, ChannelEvent, ChannelOptions, Run};

/// Result type alias for Flowgate operations.
pub type Result<T> = std::result::Result<T, FlowgateError>;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
