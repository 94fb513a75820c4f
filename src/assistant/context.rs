//! Request and gathered-context types for the code assistant.

use serde::{Deserialize, Serialize};

use super::analysis::RequirementAnalysis;

/// A code generation request as received from the outer surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub request: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub include_tests: bool,
    #[serde(default = "default_true")]
    pub include_docs: bool,
}

fn default_language() -> String {
    "python".to_string()
}

fn default_true() -> bool {
    true
}

impl CodeRequest {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            language: default_language(),
            libraries: Vec::new(),
            include_tests: false,
            include_docs: true,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.libraries.push(library.into());
        self
    }
}

/// Documentation fetched for one library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryDocs {
    pub library: String,
    /// Identifier the documentation server resolved the name to.
    pub library_id: String,
    pub topic: Option<String>,
    pub content: String,
}

/// One context source that could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    /// e.g. `standards` or `context7:pandas`.
    pub source: String,
    pub error: String,
}

/// Everything gathered for one request, handed to a downstream generator.
#[derive(Debug, Clone, Serialize)]
pub struct CodeContext {
    pub request: CodeRequest,
    pub analysis: RequirementAnalysis,
    pub standards: Option<String>,
    pub library_docs: Vec<LibraryDocs>,
    pub failures: Vec<SourceFailure>,
}

impl CodeContext {
    /// Whether every source answered.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Render the context as a generation prompt.
    pub fn render_prompt(&self) -> String {
        let req = &self.request;
        let mut prompt = format!(
            "Generate {} code for the following request:\n\n{}\n\nRequirements:\n\
             - Language: {}\n- Include tests: {}\n- Include documentation: {}\n",
            req.language,
            req.request,
            req.language,
            req.include_tests || self.analysis.wants_tests,
            req.include_docs,
        );

        let libraries: Vec<&str> = self.library_docs.iter().map(|d| d.library.as_str()).collect();
        if !libraries.is_empty() {
            prompt.push_str(&format!("- Use these libraries: {}\n", libraries.join(", ")));
        }
        prompt.push_str(&format!(
            "- Standards to follow: {}\n",
            self.analysis.standards_needed.join(", ")
        ));

        if let Some(standards) = &self.standards {
            prompt.push_str("\n## Coding Standards\n\n");
            prompt.push_str(standards.trim_end());
            prompt.push('\n');
        }

        for docs in &self.library_docs {
            prompt.push_str(&format!("\n## Documentation: {} ({})\n\n", docs.library, docs.library_id));
            prompt.push_str(docs.content.trim_end());
            prompt.push('\n');
        }

        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::analysis::analyze_requirements;

    #[test]
    fn test_code_request_defaults() {
        let req: CodeRequest = serde_json::from_str(r#"{"request": "parse a csv"}"#).unwrap();
        assert_eq!(req.language, "python");
        assert!(req.libraries.is_empty());
        assert!(!req.include_tests);
        assert!(req.include_docs);
        assert_eq!(req, CodeRequest::new("parse a csv"));
    }

    #[test]
    fn test_render_prompt_includes_sources() {
        let request = CodeRequest::new("load data with pandas").with_library("pandas");
        let context = CodeContext {
            analysis: analyze_requirements(&request.request, &request.language),
            request,
            standards: Some("# Python Code Review Checklist\n- [ ] PEP 8\n".to_string()),
            library_docs: vec![LibraryDocs {
                library: "pandas".to_string(),
                library_id: "/pandas-dev/pandas".to_string(),
                topic: None,
                content: "read_csv(path)".to_string(),
            }],
            failures: vec![],
        };

        let prompt = context.render_prompt();
        assert!(prompt.starts_with("Generate python code"));
        assert!(prompt.contains("- Use these libraries: pandas\n"));
        assert!(prompt.contains("## Coding Standards\n\n# Python Code Review Checklist"));
        assert!(prompt.contains("## Documentation: pandas (/pandas-dev/pandas)"));
        assert!(context.is_complete());
    }

    #[test]
    fn test_render_prompt_without_sources() {
        let request = CodeRequest::new("reverse a string").with_language("rust");
        let context = CodeContext {
            analysis: analyze_requirements(&request.request, &request.language),
            request,
            standards: None,
            library_docs: vec![],
            failures: vec![SourceFailure {
                source: "standards".to_string(),
                error: "server 'standards' is not ready (state: stopped)".to_string(),
            }],
        };
        let prompt = context.render_prompt();
        assert!(!prompt.contains("## Coding Standards"));
        assert!(!prompt.contains("Use these libraries"));
        assert!(!context.is_complete());
    }
}
