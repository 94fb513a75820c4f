//! MCP Hub — supervises stdio JSON-RPC child servers behind one registry.
//!
//! - [`supervisor`]: framing, child processes, the protocol client and the
//!   server registry with health monitoring and restart limits.
//! - [`assistant`]: the code assistant facade built on the registry.
//! - [`logging`]: tracing setup for the `mcp-hub` binary.

pub mod assistant;
pub mod logging;
pub mod supervisor;

pub use assistant::{CodeAssistant, CodeContext, CodeRequest};
pub use supervisor::{
    LaunchSpec, LifecycleState, RegistrySettings, ServerRegistry, ServerStatus, SupervisorError,
};
