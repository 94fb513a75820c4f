//! Shared types for the supervisor.
//!
//! JSON-RPC wire structures, launch specifications, lifecycle states and
//! the typed results of the MCP methods the hub knows about.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::SupervisorError;

// ─── JSON-RPC ────────────────────────────────────────────────────────────────

/// Version tag written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request: `{jsonrpc, id, method, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Outbound notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded response: a correlation id and exactly one of result or error.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub outcome: Result<Value, RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Err(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value, SupervisorError> {
        self.outcome.map_err(|err| SupervisorError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        })
    }
}

/// Anything a child may write on its output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A response to one of our requests.
    Response(RpcResponse),
    /// A child-initiated notification or request. Logged, never answered.
    ServerMessage { method: String, id: Option<Value> },
}

// ─── Launch Specification ────────────────────────────────────────────────────

/// How to start one logical child server.
///
/// Built once (directly or from configuration) and then only read; the
/// registry hands out shared references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    /// When `false` the child starts from an empty environment plus `env`.
    #[serde(default = "default_inherit_env")]
    inherit_env: bool,
}

fn default_inherit_env() -> bool {
    true
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            inherit_env: true,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Start the child from an empty environment (only `env` entries are passed).
    pub fn isolated_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn inherits_env(&self) -> bool {
        self.inherit_env
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Lifecycle state of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl LifecycleState {
    /// Whether `self → next` is a legal edge of the lifecycle graph.
    ///
    /// `Stopped` is reachable from everywhere. Leaving it is always a
    /// restart, so it counts against the restart limit.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Ready)
                | (Starting, Degraded)
                | (Ready, Degraded)
                | (Degraded, Starting)
                | (Stopped, Starting)
                | (NotStarted | Starting | Ready | Degraded, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle transition, broadcast to registry subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub server: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Counters kept by a protocol client, used as the health signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientHealth {
    pub in_flight: usize,
    pub completed: u64,
    pub consecutive_timeouts: u32,
    pub total_timeouts: u64,
    pub malformed_frames: u64,
    /// Discarded frames since the last matched response.
    pub consecutive_malformed: u64,
    pub unmatched_responses: u64,
}

/// Snapshot returned by `ServerRegistry::status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_failure: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health: Option<ClientHealth>,
    /// Most recent stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Methods whose results are decoded into typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownMethod {
    Initialize,
    Ping,
    ResourcesRead,
    ResourcesList,
    ToolsList,
    ToolsCall,
}

impl KnownMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "initialize" => Some(KnownMethod::Initialize),
            "ping" => Some(KnownMethod::Ping),
            "resources/read" => Some(KnownMethod::ResourcesRead),
            "resources/list" => Some(KnownMethod::ResourcesList),
            "tools/list" => Some(KnownMethod::ToolsList),
            "tools/call" => Some(KnownMethod::ToolsCall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KnownMethod::Initialize => "initialize",
            KnownMethod::Ping => "ping",
            KnownMethod::ResourcesRead => "resources/read",
            KnownMethod::ResourcesList => "resources/list",
            KnownMethod::ToolsList => "tools/list",
            KnownMethod::ToolsCall => "tools/call",
        }
    }
}

/// `initialize` response payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One content item of a `resources/read` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

impl ReadResourceResult {
    /// First text content, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.contents.iter().find_map(|c| c.text.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

/// One content block of a `tools/call` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallOutput {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

impl ToolCallOutput {
    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Typed result of a call, one variant per known method.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResult {
    Initialize(InitializeResult),
    Pong,
    ResourceRead(ReadResourceResult),
    ResourceList(Vec<ResourceDescriptor>),
    ToolList(Vec<ToolDescriptor>),
    ToolCall(ToolCallOutput),
    /// Any method the hub has no schema for.
    Opaque(Value),
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = RpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_response_into_result_maps_error_object() {
        let resp = RpcResponse::failure(3, -32601, "Method not found");
        match resp.into_result() {
            Err(SupervisorError::ServerError { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("python3")
            .with_arg("standards-server.py")
            .with_env("PYTHONUNBUFFERED", "1")
            .with_cwd("/srv/standards");

        assert_eq!(spec.command(), "python3");
        assert_eq!(spec.args(), ["standards-server.py"]);
        assert_eq!(spec.env().get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(spec.cwd(), Some(Path::new("/srv/standards")));
        assert!(spec.inherits_env());
        assert!(!spec.clone().isolated_env().inherits_env());
    }

    #[test]
    fn test_launch_spec_deserialize_defaults() {
        let spec: LaunchSpec = serde_yaml::from_str("command: docker").unwrap();
        assert_eq!(spec.command(), "docker");
        assert!(spec.args().is_empty());
        assert!(spec.inherits_env());
        assert!(spec.cwd().is_none());
    }

    #[rstest]
    #[case(LifecycleState::NotStarted, LifecycleState::Starting, true)]
    #[case(LifecycleState::Starting, LifecycleState::Ready, true)]
    #[case(LifecycleState::Starting, LifecycleState::Degraded, true)]
    #[case(LifecycleState::Ready, LifecycleState::Degraded, true)]
    #[case(LifecycleState::Ready, LifecycleState::Stopped, true)]
    #[case(LifecycleState::Degraded, LifecycleState::Starting, true)]
    #[case(LifecycleState::Stopped, LifecycleState::Starting, true)]
    #[case(LifecycleState::NotStarted, LifecycleState::Ready, false)]
    #[case(LifecycleState::Stopped, LifecycleState::Ready, false)]
    #[case(LifecycleState::Stopped, LifecycleState::Degraded, false)]
    #[case(LifecycleState::Degraded, LifecycleState::Ready, false)]
    #[case(LifecycleState::Stopped, LifecycleState::Stopped, false)]
    fn test_lifecycle_transitions(
        #[case] from: LifecycleState,
        #[case] to: LifecycleState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_lifecycle_state_serializes_snake_case() {
        let json = serde_json::to_string(&LifecycleState::NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");
        assert_eq!(LifecycleState::Degraded.to_string(), "degraded");
    }

    #[test]
    fn test_known_method_round_trip() {
        for method in [
            KnownMethod::Initialize,
            KnownMethod::Ping,
            KnownMethod::ResourcesRead,
            KnownMethod::ResourcesList,
            KnownMethod::ToolsList,
            KnownMethod::ToolsCall,
        ] {
            assert_eq!(KnownMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(KnownMethod::parse("echo"), None);
    }

    #[test]
    fn test_tool_call_output_text_joins_blocks() {
        let json = r#"{"content": [{"type": "text", "text": "a"}, {"type": "image"}, {"type": "text", "text": "b"}]}"#;
        let out: ToolCallOutput = serde_json::from_str(json).unwrap();
        assert_eq!(out.text(), "a\nb");
        assert!(!out.is_error);
    }
}
