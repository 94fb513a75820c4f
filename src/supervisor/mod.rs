//! Supervisor — stdio JSON-RPC child servers behind one registry.
//!
//! This module handles:
//! - Newline-delimited JSON-RPC framing (`framing`)
//! - Spawning children and draining their stderr (`process`)
//! - Correlated, concurrent calls over one child's stdio (`client`)
//! - Named entries with start/stop/restart, health checks and restart
//!   limits (`registry`)
//! - Loading server definitions from `mcp-hub.yaml` (`config`)
//!
//! The `assistant` facade and the `mcp-hub` binary sit on top of the
//! `ServerRegistry`.

pub mod client;
pub mod config;
pub mod errors;
pub mod framing;
pub mod handle;
pub mod process;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use client::ProtocolClient;
pub use config::{find_config_path, load_config, HubConfig};
pub use errors::SupervisorError;
pub use handle::{HandleSettings, ServerHandle};
pub use registry::{HandshakeSpec, RegistrySettings, ServerRegistry, DEFAULT_CALL_TIMEOUT};
pub use types::{
    ClientHealth, LaunchSpec, LifecycleEvent, LifecycleState, MethodResult, ServerStatus,
};
