//! Connection lifecycle management.
//!
//! [`ConnectionManager`] is the public handle. All record state lives in a
//! single coordinator task; the connector, backoff policy and pool are the
//! pieces it drives.

mod backoff;
mod connector;
mod coordinator;
mod pool;
mod registry;
mod types;

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use connector::Connector;
pub use coordinator::BroadcastFilter;
pub(crate) use coordinator::{Command, CommandSender};
pub use pool::ConnectionPool;
pub use registry::ConnectionManager;
pub use types::{
    Activity, BroadcastReport, ConnectionEvent, ConnectionInfo, ConnectionRecord,
    ConnectionStatus,
};
