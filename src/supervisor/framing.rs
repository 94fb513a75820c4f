//! Newline-delimited JSON-RPC framing.
//!
//! One JSON object per line, in both directions. Encoding and decoding are
//! pure functions; `read_frame` borrows a reader to pull exactly one line
//! with a size bound, and owns nothing.

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::errors::SupervisorError;
use super::types::{
    Inbound, InitializeResult, KnownMethod, MethodResult, ReadResourceResult, ResourceDescriptor,
    RpcErrorObject, RpcNotification, RpcRequest, RpcResponse, ToolCallOutput, ToolDescriptor,
    JSONRPC_VERSION,
};

/// Default upper bound on a single output-stream frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Framing failures, before a server name is attached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    /// Not well-formed JSON (or not UTF-8, or too long).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Well-formed, but not a valid protocol message. `id` is set when the
    /// frame carried a usable correlation id.
    #[error("unexpected shape: {reason}")]
    UnexpectedShape { id: Option<u64>, reason: String },
}

impl FrameError {
    fn shape(id: Option<u64>, reason: impl Into<String>) -> Self {
        FrameError::UnexpectedShape {
            id,
            reason: reason.into(),
        }
    }

    /// Attach the server name.
    pub fn into_supervisor_error(self, server: &str) -> SupervisorError {
        match self {
            FrameError::Malformed(reason) => SupervisorError::MalformedMessage {
                server: server.to_string(),
                reason,
            },
            FrameError::UnexpectedShape { reason, .. } => SupervisorError::UnexpectedShape {
                server: server.to_string(),
                reason,
            },
        }
    }
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Encode a request as one complete line (trailing `\n` included).
///
/// `serde_json` escapes control characters inside strings, so the only raw
/// newline in the output is the terminator.
pub fn encode_request(request: &RpcRequest) -> Result<Vec<u8>, FrameError> {
    to_line(request)
}

/// Encode a notification as one complete line.
pub fn encode_notification(notification: &RpcNotification) -> Result<Vec<u8>, FrameError> {
    to_line(notification)
}

/// Encode a response as one complete line. Used by child implementations.
pub fn encode_response(response: &RpcResponse) -> Result<Vec<u8>, FrameError> {
    let mut object = Map::new();
    object.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
    object.insert("id".into(), Value::from(response.id));
    match &response.outcome {
        Ok(result) => {
            object.insert("result".into(), result.clone());
        }
        Err(error) => {
            let error = serde_json::to_value(error)
                .map_err(|e| FrameError::Malformed(format!("failed to encode error: {e}")))?;
            object.insert("error".into(), error);
        }
    }
    to_line(&Value::Object(object))
}

fn to_line<T: serde::Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| FrameError::Malformed(format!("failed to encode: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn parse_object(line: &[u8]) -> Result<Map<String, Value>, FrameError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Err(FrameError::Malformed("empty frame".into()));
    }
    match serde_json::from_slice::<Value>(trimmed) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(FrameError::shape(
            None,
            format!("expected a JSON object, got {}", kind_of(&other)),
        )),
        Err(e) => Err(FrameError::Malformed(e.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn correlation_id(object: &Map<String, Value>) -> Result<u64, FrameError> {
    match object.get("id") {
        None | Some(Value::Null) => Err(FrameError::shape(None, "missing id")),
        Some(id) => id
            .as_u64()
            .ok_or_else(|| FrameError::shape(None, format!("id must be a non-negative integer, got {id}"))),
    }
}

/// Decode one line from a child's output stream.
///
/// A response carries an integer `id` and exactly one of `result` or
/// `error`. A `null` on either side counts as absent, except that
/// `"result": null` alone is a valid (null) result.
pub fn decode(line: &[u8]) -> Result<Inbound, FrameError> {
    let object = parse_object(line)?;

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        return Ok(Inbound::ServerMessage {
            method: method.to_string(),
            id: object.get("id").cloned(),
        });
    }

    let id = correlation_id(&object)?;
    let error = object.get("error").filter(|v| !v.is_null());
    let result = object.get("result");

    let outcome = match (result, error) {
        (Some(result), None) => Ok(result.clone()),
        (None | Some(Value::Null), Some(error)) => {
            let error: RpcErrorObject = serde_json::from_value(error.clone())
                .map_err(|e| FrameError::shape(Some(id), format!("invalid error object: {e}")))?;
            Err(error)
        }
        (Some(_), Some(_)) => {
            return Err(FrameError::shape(
                Some(id),
                "response carries both result and error",
            ))
        }
        (None, None) => {
            return Err(FrameError::shape(
                Some(id),
                "response carries neither result nor error",
            ))
        }
    };

    Ok(Inbound::Response(RpcResponse { id, outcome }))
}

/// Decode one request line. Used by child implementations and tests.
pub fn decode_request(line: &[u8]) -> Result<RpcRequest, FrameError> {
    let object = parse_object(line)?;
    let id = correlation_id(&object)?;
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| FrameError::shape(Some(id), "request carries no method"))?
        .to_string();
    let params = object.get("params").cloned();
    Ok(RpcRequest::new(id, &method, params))
}

/// Validate a raw result against the schema of a known method.
pub fn decode_result(method: &str, value: Value) -> Result<MethodResult, FrameError> {
    let Some(known) = KnownMethod::parse(method) else {
        return Ok(MethodResult::Opaque(value));
    };

    let invalid = |e: serde_json::Error| {
        FrameError::shape(None, format!("invalid '{}' result: {e}", known.as_str()))
    };

    match known {
        KnownMethod::Initialize => serde_json::from_value::<InitializeResult>(value)
            .map(MethodResult::Initialize)
            .map_err(invalid),
        KnownMethod::Ping => Ok(MethodResult::Pong),
        KnownMethod::ResourcesRead => serde_json::from_value::<ReadResourceResult>(value)
            .map(MethodResult::ResourceRead)
            .map_err(invalid),
        KnownMethod::ResourcesList => {
            list_field::<ResourceDescriptor>(value, "resources").map(MethodResult::ResourceList)
        }
        KnownMethod::ToolsList => {
            list_field::<ToolDescriptor>(value, "tools").map(MethodResult::ToolList)
        }
        KnownMethod::ToolsCall => serde_json::from_value::<ToolCallOutput>(value)
            .map(MethodResult::ToolCall)
            .map_err(invalid),
    }
}

fn list_field<T: serde::de::DeserializeOwned>(
    mut value: Value,
    field: &str,
) -> Result<Vec<T>, FrameError> {
    let items = value
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| FrameError::shape(None, format!("result has no '{field}' list")))?;
    serde_json::from_value(items)
        .map_err(|e| FrameError::shape(None, format!("invalid '{field}' list: {e}")))
}

// ─── Bounded line reading ────────────────────────────────────────────────────

/// Outcome of reading one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameRead {
    /// `buf` holds one line (terminator included when present).
    Frame,
    /// The line exceeded the bound; this many bytes were discarded.
    Oversized(usize),
    /// The stream is closed and no bytes remain.
    Eof,
}

/// Read one `\n`-terminated line into `buf`, never buffering more than
/// `max_bytes`. Longer lines are consumed up to their terminator and dropped.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<FrameRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut discarded = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if discarded > 0 {
                FrameRead::Oversized(discarded)
            } else if buf.is_empty() {
                FrameRead::Eof
            } else {
                FrameRead::Frame
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk_len = newline.map_or(available.len(), |i| i + 1);

        if discarded > 0 || buf.len() + chunk_len > max_bytes.saturating_add(1) {
            discarded += buf.len() + chunk_len;
            buf.clear();
        } else {
            buf.extend_from_slice(&available[..chunk_len]);
        }
        reader.consume(chunk_len);

        if newline.is_some() {
            return Ok(if discarded > 0 {
                FrameRead::Oversized(discarded)
            } else {
                FrameRead::Frame
            });
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::io::BufReader;

    fn response(line: &str) -> RpcResponse {
        match decode(line.as_bytes()).unwrap() {
            Inbound::Response(resp) => resp,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_request_is_one_line() {
        let req = RpcRequest::new(7, "echo", Some(json!({"text": "line one\nline two"})));
        let bytes = encode_request(&req).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_success_response() {
        let resp = response(r#"{"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}"#);
        assert_eq!(resp.id, 1);
        assert_eq!(resp.outcome, Ok(json!({"tools": []})));
    }

    #[test]
    fn test_decode_null_result_is_valid() {
        let resp = response(r#"{"id": 4, "result": null}"#);
        assert_eq!(resp.outcome, Ok(Value::Null));
    }

    #[test]
    fn test_decode_error_response_with_null_result() {
        let resp = response(
            r#"{"jsonrpc": "2.0", "id": 2, "result": null, "error": {"code": -32601, "message": "Method not found"}}"#,
        );
        let err = resp.outcome.unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = decode(b"Starting server on stdio...").unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_empty_frame() {
        assert!(matches!(decode(b"  \n").unwrap_err(), FrameError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let err = decode(b"[1, 2, 3]").unwrap_err();
        assert_eq!(
            err,
            FrameError::UnexpectedShape {
                id: None,
                reason: "expected a JSON object, got an array".into()
            }
        );
    }

    #[test]
    fn test_decode_missing_id() {
        let err = decode(br#"{"result": 1}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: None, .. }));
    }

    #[test]
    fn test_decode_string_id_is_rejected() {
        let err = decode(br#"{"id": "abc", "result": 1}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: None, .. }));
    }

    #[test]
    fn test_decode_both_result_and_error_keeps_id() {
        let err = decode(br#"{"id": 9, "result": 1, "error": {"code": 1, "message": "x"}}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: Some(9), .. }));
    }

    #[test]
    fn test_decode_neither_result_nor_error_keeps_id() {
        let err = decode(br#"{"id": 5}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: Some(5), .. }));
    }

    #[test]
    fn test_decode_invalid_error_object() {
        let err = decode(br#"{"id": 5, "error": "boom"}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: Some(5), .. }));
    }

    #[test]
    fn test_decode_server_notification() {
        let inbound = decode(br#"{"jsonrpc": "2.0", "method": "notifications/message", "params": {}}"#)
            .unwrap();
        assert_eq!(
            inbound,
            Inbound::ServerMessage {
                method: "notifications/message".into(),
                id: None
            }
        );
    }

    #[test]
    fn test_decode_request_requires_method() {
        let err = decode_request(br#"{"id": 1, "params": {}}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { id: Some(1), .. }));
    }

    #[test]
    fn test_decode_result_initialize() {
        let value = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"resources": {}},
            "serverInfo": {"name": "standards", "version": "1.0"}
        });
        match decode_result("initialize", value).unwrap() {
            MethodResult::Initialize(init) => {
                assert_eq!(init.protocol_version.as_deref(), Some("2024-11-05"));
                assert_eq!(init.server_info.unwrap().name.as_deref(), Some("standards"));
            }
            other => panic!("expected Initialize, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_result_resource_read() {
        let value = json!({"contents": [{"uri": "standards://summary", "mimeType": "text/markdown", "text": "# Summary"}]});
        match decode_result("resources/read", value).unwrap() {
            MethodResult::ResourceRead(read) => assert_eq!(read.first_text(), Some("# Summary")),
            other => panic!("expected ResourceRead, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_result_tools_list_requires_field() {
        let err = decode_result("tools/list", json!({"items": []})).unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedShape { .. }));

        match decode_result("tools/list", json!({"tools": [{"name": "resolve-library-id"}]})).unwrap() {
            MethodResult::ToolList(tools) => assert_eq!(tools[0].name, "resolve-library-id"),
            other => panic!("expected ToolList, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_result_unknown_method_is_opaque() {
        let value = json!({"text": "hi"});
        assert_eq!(
            decode_result("echo", value.clone()).unwrap(),
            MethodResult::Opaque(value)
        );
    }

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let data: &[u8] = b"{\"id\":1}\n{\"id\":2}\npartial";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Frame);
        assert_eq!(buf, b"{\"id\":1}\n");
        assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Frame);
        assert_eq!(buf, b"{\"id\":2}\n");
        assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Frame);
        assert_eq!(buf, b"partial");
        assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), FrameRead::Eof);
    }

    #[tokio::test]
    async fn test_read_frame_discards_oversized_line() {
        let mut data = vec![b'x'; 100];
        data.push(b'\n');
        data.extend_from_slice(b"ok\n");
        // Small internal buffer so the long line arrives in several chunks.
        let mut reader = BufReader::with_capacity(16, data.as_slice());
        let mut buf = Vec::new();

        assert_eq!(
            read_frame(&mut reader, &mut buf, 32).await.unwrap(),
            FrameRead::Oversized(101)
        );
        assert_eq!(read_frame(&mut reader, &mut buf, 32).await.unwrap(), FrameRead::Frame);
        assert_eq!(buf, b"ok\n");
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 \\n\\t\"\\\\]{0,24}".prop_map(Value::from),
        ]
    }

    fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_request_round_trip(
            id in any::<u64>(),
            method in "[a-z][a-z/_-]{0,20}",
            params in prop::option::of(json_value()),
        ) {
            let req = RpcRequest::new(id, &method, params);
            let line = encode_request(&req).unwrap();
            prop_assert_eq!(decode_request(&line).unwrap(), req);
        }

        #[test]
        fn prop_response_round_trip(
            id in any::<u64>(),
            result in json_value(),
            code in any::<i64>(),
            message in "[ -~]{0,30}",
            is_error in any::<bool>(),
        ) {
            let resp = if is_error {
                RpcResponse::failure(id, code, message)
            } else {
                RpcResponse::success(id, result)
            };
            let line = encode_response(&resp).unwrap();
            prop_assert_eq!(decode(&line).unwrap(), Inbound::Response(resp));
        }
    }
}
