mod pipeline;
mod step;

pub use pipeline::{ErrorHandling, PipelineModel, Schedule};
pub use step::StepModel;
