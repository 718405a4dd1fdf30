//! Client-side manager for a bounded set of long-lived realtime connections.
//!
//! Connections are opened through a [`transport::Transport`], kept alive by a
//! heartbeat monitor, reconnected with exponential backoff, and their inbound
//! traffic is queued per connection and drained in small batches into a
//! [`dispatcher::MessageHandler`].

// Shared components
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Connection layer
pub mod connection_manager;
pub mod dispatcher;
pub mod transport;

// Supporting modules
pub mod shutdown;
pub mod tasks;
