pub mod config;
pub mod http;
pub mod policy;
pub mod state;
pub mod topics;
pub mod types;

pub use config::{Capabilities, ControllerConfig, NetworkConfig, RuntimeConfig, Variant};
pub use http::{HeaderTable, Request, RequestHandler, Response, Route};
pub use policy::{Malformed, Recovery, RecoveryPolicy};
pub use state::{ControllerState, MemoryProbe, Snapshot};
pub use topics::*;
pub use types::{StatusBody, TelemetryReading};
