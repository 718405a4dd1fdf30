mod drain;
mod heartbeat;

pub use drain::DrainTask;
pub use heartbeat::{is_stale, HeartbeatTask, LivenessSample};
