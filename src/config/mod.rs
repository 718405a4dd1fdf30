mod settings;

pub use settings::{ConnectionConfig, EndpointConfig, Settings, TelemetryConfig};
