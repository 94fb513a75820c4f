//! Code assistant — composes the standards and documentation servers.
//!
//! Uses the `ServerRegistry` as its only way to reach child servers:
//! - `standards` serves `standards://checklist/{language}` resources
//! - `context7` resolves library names (`resolve-library-id`) and returns
//!   their documentation (`get-library-docs`)
//!
//! Gathering a `CodeContext` never fails as a whole; each source that
//! cannot be reached is recorded in `CodeContext::failures`.

pub mod analysis;
pub mod context;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use thiserror::Error;

use crate::supervisor::{MethodResult, ServerRegistry, ServerStatus, SupervisorError};

pub use analysis::{analyze_requirements, available_languages, Complexity, RequirementAnalysis};
pub use context::{CodeContext, CodeRequest, LibraryDocs, SourceFailure};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default registry name of the standards server.
pub const STANDARDS_SERVER: &str = "standards";

/// Default registry name of the documentation server.
pub const DOCS_SERVER: &str = "context7";

/// Token budget requested per library from the documentation server.
const DOCS_TOKEN_BUDGET: u32 = 5_000;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from a single facade lookup.
#[derive(Debug, Clone, Error)]
pub enum AssistantError {
    /// The registry or the child failed the call.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// A tool ran but reported an error.
    #[error("tool '{tool}' on server '{server}' failed: {message}")]
    ToolFailed {
        server: String,
        tool: String,
        message: String,
    },

    /// The answer had nothing usable in it.
    #[error("server '{server}' returned no {what}")]
    EmptyResult { server: String, what: String },
}

// ─── CodeAssistant ───────────────────────────────────────────────────────────

/// Higher-level capabilities on top of the supervised child servers.
#[derive(Debug, Clone)]
pub struct CodeAssistant {
    registry: Arc<ServerRegistry>,
    standards_server: String,
    docs_server: String,
    call_timeout: Duration,
}

impl CodeAssistant {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        let call_timeout = registry.settings().default_call_timeout;
        Self {
            registry,
            standards_server: STANDARDS_SERVER.to_string(),
            docs_server: DOCS_SERVER.to_string(),
            call_timeout,
        }
    }

    /// Use different registry entries for the two sources.
    pub fn with_servers(mut self, standards: &str, docs: &str) -> Self {
        self.standards_server = standards.to_string();
        self.docs_server = docs.to_string();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    // ─── Sources ─────────────────────────────────────────────────────────

    /// Fetch the review checklist for `language`.
    pub async fn coding_standards(&self, language: &str) -> Result<String, AssistantError> {
        let uri = format!("standards://checklist/{}", language.to_lowercase());
        let result = self
            .registry
            .dispatch_typed(
                &self.standards_server,
                "resources/read",
                Some(json!({ "uri": uri })),
                self.call_timeout,
            )
            .await?;

        match result {
            MethodResult::ResourceRead(read) => read
                .first_text()
                .map(str::to_string)
                .ok_or_else(|| AssistantError::EmptyResult {
                    server: self.standards_server.clone(),
                    what: format!("text for {uri}"),
                }),
            _ => Err(AssistantError::EmptyResult {
                server: self.standards_server.clone(),
                what: format!("resource contents for {uri}"),
            }),
        }
    }

    /// Resolve `library` to a documentation id, then fetch its docs.
    pub async fn library_documentation(
        &self,
        library: &str,
        topic: Option<&str>,
    ) -> Result<LibraryDocs, AssistantError> {
        let resolved = self
            .call_tool("resolve-library-id", json!({ "libraryName": library }))
            .await?;
        let library_id = extract_library_id(&resolved).ok_or_else(|| AssistantError::EmptyResult {
            server: self.docs_server.clone(),
            what: format!("library id for '{library}'"),
        })?;

        tracing::debug!(library, library_id = %library_id, "library resolved");

        let mut arguments = json!({
            "context7CompatibleLibraryID": library_id,
            "tokens": DOCS_TOKEN_BUDGET,
        });
        if let Some(topic) = topic {
            arguments["topic"] = json!(topic);
        }
        let content = self.call_tool("get-library-docs", arguments).await?;
        if content.trim().is_empty() {
            return Err(AssistantError::EmptyResult {
                server: self.docs_server.clone(),
                what: format!("documentation for '{library_id}'"),
            });
        }

        Ok(LibraryDocs {
            library: library.to_string(),
            library_id,
            topic: topic.map(str::to_string),
            content,
        })
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<String, AssistantError> {
        let result = self
            .registry
            .dispatch_typed(
                &self.docs_server,
                "tools/call",
                Some(json!({ "name": tool, "arguments": arguments })),
                self.call_timeout,
            )
            .await?;

        let MethodResult::ToolCall(output) = result else {
            return Err(AssistantError::EmptyResult {
                server: self.docs_server.clone(),
                what: format!("'{tool}' output"),
            });
        };
        if output.is_error {
            return Err(AssistantError::ToolFailed {
                server: self.docs_server.clone(),
                tool: tool.to_string(),
                message: output.text(),
            });
        }
        Ok(output.text())
    }

    // ─── Composition ─────────────────────────────────────────────────────

    /// Analyze `request` and gather standards and library docs for it.
    ///
    /// Library lookups run concurrently. Explicitly requested libraries come
    /// first, followed by the ones the analysis suggests.
    pub async fn gather_context(&self, request: &CodeRequest) -> CodeContext {
        let analysis = analyze_requirements(&request.request, &request.language);

        let mut libraries: Vec<&str> = Vec::new();
        for lib in request.libraries.iter().chain(&analysis.suggested_libraries) {
            if !libraries.contains(&lib.as_str()) {
                libraries.push(lib.as_str());
            }
        }

        let standards_lookup = self.coding_standards(&request.language);
        let docs_lookup = join_all(
            libraries
                .iter()
                .map(|lib| self.library_documentation(lib, None)),
        );
        let (standards, docs) = tokio::join!(standards_lookup, docs_lookup);

        let mut failures = Vec::new();
        let standards = match standards {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(language = %request.language, error = %e, "coding standards unavailable");
                failures.push(SourceFailure {
                    source: self.standards_server.clone(),
                    error: e.to_string(),
                });
                None
            }
        };

        let mut library_docs = Vec::new();
        for (lib, result) in libraries.iter().zip(docs) {
            match result {
                Ok(doc) => library_docs.push(doc),
                Err(e) => {
                    tracing::warn!(library = lib, error = %e, "library documentation unavailable");
                    failures.push(SourceFailure {
                        source: format!("{}:{lib}", self.docs_server),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            language = %request.language,
            libraries = library_docs.len(),
            failures = failures.len(),
            "code context gathered"
        );

        CodeContext {
            request: request.clone(),
            analysis,
            standards,
            library_docs,
            failures,
        }
    }

    /// Status of every supervised server.
    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.registry.statuses()
    }

    /// Whether both sources are `Ready`.
    pub fn is_ready(&self) -> bool {
        [&self.standards_server, &self.docs_server].iter().all(|name| {
            self.registry
                .status(name)
                .is_ok_and(|s| s.state == crate::supervisor::LifecycleState::Ready)
        })
    }
}

/// Pull the first `/org/project`-style id out of a resolve answer.
fn extract_library_id(text: &str) -> Option<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | '`' | '"' | '\'' | '(' | ')'))
        .map(|token| token.trim_end_matches(['.', ':', ';']))
        .find(|token| {
            token.len() > 1
                && token.starts_with('/')
                && token[1..].contains('/')
                && !token.ends_with('/')
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_library_id_plain() {
        assert_eq!(extract_library_id("/pandas-dev/pandas").as_deref(), Some("/pandas-dev/pandas"));
    }

    #[test]
    fn test_extract_library_id_from_listing() {
        let text = "Available Libraries:\n\n- Title: Requests\n- Context7-compatible library ID: /psf/requests\n- Trust Score: 9";
        assert_eq!(extract_library_id(text).as_deref(), Some("/psf/requests"));
    }

    #[test]
    fn test_extract_library_id_ignores_single_segment_paths() {
        assert_eq!(extract_library_id("see /docs for details"), None);
        assert_eq!(extract_library_id("no match here"), None);
        assert_eq!(extract_library_id("id: `/tiangolo/fastapi`.").as_deref(), Some("/tiangolo/fastapi"));
    }

    #[test]
    fn test_tool_failed_message() {
        let err = AssistantError::ToolFailed {
            server: "context7".into(),
            tool: "get-library-docs".into(),
            message: "rate limited".into(),
        };
        assert_eq!(
            err.to_string(),
            "tool 'get-library-docs' on server 'context7' failed: rate limited"
        );
    }
}
