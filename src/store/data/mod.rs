mod log;
mod pipeline;
mod run;
mod step;

pub use log::LogRecord;
pub use pipeline::PipelineRecord;
pub use run::RunRecord;
pub use step::StepRecord;
