//! `echo-server` — a reference child speaking line-delimited JSON-RPC on
//! stdio. Used by the integration tests and as a stand-in for the
//! standards and documentation servers.
//!
//! Methods:
//! - `initialize`, `ping`
//! - `echo` returns its params unchanged
//! - `delay {ms}` answers after `ms` milliseconds
//! - `hang` never answers
//! - `crash {code}` exits immediately with `code`
//! - `garbage {lines, answer}` writes `lines` non-JSON lines (default 1),
//!   then answers unless `answer` is false
//! - `stderr {lines}` writes `lines` lines to stderr
//! - `fail {message}` answers with an error object
//! - `resources/read {uri}` serves `standards://checklist/{language}`
//! - `tools/call` implements `resolve-library-id` and `get-library-docs`
//!
//! Flags: `--banner` prints a non-JSON line on stdout at startup,
//! `--mute` never answers anything, `--reject-initialize` fails the
//! handshake.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use mcp_hub::supervisor::framing;
use mcp_hub::supervisor::types::{RpcRequest, RpcResponse};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;
const RESOURCE_NOT_FOUND: i64 = -32002;

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    banner: bool,
    mute: bool,
    reject_initialize: bool,
}

impl Flags {
    fn from_args() -> Self {
        let mut flags = Flags::default();
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--banner" => flags.banner = true,
                "--mute" => flags.mute = true,
                "--reject-initialize" => flags.reject_initialize = true,
                other => tracing::warn!(arg = other, "ignoring unknown argument"),
            }
        }
        flags
    }
}

type SharedStdout = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let flags = Flags::from_args();
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));

    if flags.banner {
        write_line(&stdout, b"echo-server starting up (not JSON)\n").await?;
    }
    tracing::info!(pid = std::process::id(), ?flags, "echo-server ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed input line");
                continue;
            }
        };
        if value.get("id").is_none() {
            let method = value.get("method").and_then(Value::as_str).unwrap_or("?");
            tracing::debug!(method, "notification received");
            continue;
        }
        let request = match framing::decode_request(line.as_bytes()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid request");
                continue;
            }
        };
        if flags.mute {
            continue;
        }

        let stdout = Arc::clone(&stdout);
        tokio::spawn(async move {
            if let Some(response) = handle(request, flags, &stdout).await {
                match framing::encode_response(&response) {
                    Ok(bytes) => {
                        if let Err(e) = write_line(&stdout, &bytes).await {
                            tracing::warn!(error = %e, "failed to write response");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode response"),
                }
            }
        });
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn write_line(stdout: &SharedStdout, bytes: &[u8]) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(bytes).await?;
    out.flush().await
}

/// Answer one request. `None` means never answer.
async fn handle(request: RpcRequest, flags: Flags, stdout: &SharedStdout) -> Option<RpcResponse> {
    let RpcRequest {
        id, method, params, ..
    } = request;
    let params = params.unwrap_or(Value::Null);

    let response = match method.as_str() {
        "initialize" if flags.reject_initialize => {
            eprintln!("echo-server: refusing initialize");
            RpcResponse::failure(id, SERVER_ERROR, "initialization refused")
        }
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!("2024-11-05")),
                "capabilities": { "resources": {}, "tools": {} },
                "serverInfo": { "name": "echo-server", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "ping" => RpcResponse::success(id, json!({})),
        "echo" => RpcResponse::success(id, params),
        "delay" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            RpcResponse::success(id, json!({ "slept_ms": ms }))
        }
        "hang" => return None,
        "crash" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1);
            eprintln!("echo-server: crashing with code {code}");
            std::process::exit(i32::try_from(code).unwrap_or(1));
        }
        "garbage" => {
            let lines = params.get("lines").and_then(Value::as_u64).unwrap_or(1);
            for _ in 0..lines {
                if let Err(e) = write_line(stdout, b"}{ definitely not json\n").await {
                    tracing::warn!(error = %e, "failed to write garbage");
                }
            }
            if !params.get("answer").and_then(Value::as_bool).unwrap_or(true) {
                return None;
            }
            RpcResponse::success(id, json!({ "after_garbage": true }))
        }
        "stderr" => {
            let lines = params.get("lines").and_then(Value::as_u64).unwrap_or(1);
            for i in 1..=lines {
                eprintln!("echo-server stderr line {i}");
            }
            RpcResponse::success(id, json!({ "written": lines }))
        }
        "fail" => {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            RpcResponse::failure(id, SERVER_ERROR, message)
        }
        "resources/read" => read_resource(id, &params),
        "tools/call" => call_tool(id, &params),
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {other}")),
    };
    Some(response)
}

fn read_resource(id: u64, params: &Value) -> RpcResponse {
    let Some(uri) = params.get("uri").and_then(Value::as_str) else {
        return RpcResponse::failure(id, INVALID_PARAMS, "missing uri");
    };
    let Some(language) = uri.strip_prefix("standards://checklist/") else {
        return RpcResponse::failure(id, RESOURCE_NOT_FOUND, format!("resource not found: {uri}"));
    };

    RpcResponse::success(
        id,
        json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/markdown",
                "text": checklist(language),
            }]
        }),
    )
}

fn checklist(language: &str) -> String {
    match language.to_lowercase().as_str() {
        "python" => "# Python Code Review Checklist\n\n- [ ] Follows PEP 8 guidelines\n- [ ] Type hints on function parameters and returns\n- [ ] Unit tests written/updated\n".to_string(),
        "javascript" => "# JavaScript/TypeScript Code Review Checklist\n\n- [ ] ESLint rules followed\n- [ ] Async/await over Promise chains\n".to_string(),
        "sql" => "# SQL Code Review Checklist\n\n- [ ] SQL keywords in UPPERCASE\n- [ ] Parameterized queries used\n".to_string(),
        _ => format!(
            "# Language Not Found\n\nThe language '{language}' is not available in our checklist system.\n\nAvailable languages: python, javascript, sql\n"
        ),
    }
}

fn call_tool(id: u64, params: &Value) -> RpcResponse {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or(Value::Null);

    let (text, is_error) = match name {
        "resolve-library-id" => match args.get("libraryName").and_then(Value::as_str) {
            Some("unknown-lib") => ("No libraries found matching the query.".to_string(), false),
            Some(library) => (
                format!("Available Libraries:\n\n- Title: {library}\n- Context7-compatible library ID: /org/{library}\n"),
                false,
            ),
            None => ("libraryName is required".to_string(), true),
        },
        "get-library-docs" => match args.get("context7CompatibleLibraryID").and_then(Value::as_str) {
            Some(library_id) => {
                let topic = args
                    .get("topic")
                    .and_then(Value::as_str)
                    .map(|t| format!(" (topic: {t})"))
                    .unwrap_or_default();
                (format!("Documentation for {library_id}{topic}"), false)
            }
            None => ("context7CompatibleLibraryID is required".to_string(), true),
        },
        other => (format!("unknown tool: {other}"), true),
    };

    RpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }),
    )
}
