mod channel;
mod context;
mod run;

pub use channel::{Channel, ChannelEvent, ChannelOptions};
pub use context::{Context, RateGate, RunId, RuntimeParts};
pub use run::{Run, RunCommand};
