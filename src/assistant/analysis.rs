//! Keyword-based requirement analysis.
//!
//! Decides which standards sections and libraries a code request needs
//! before any child server is queried. Matching is by lowercase substring,
//! so "database" counts as a data request and "contest" as a test request.

use serde::Serialize;

/// Languages with a standards checklist or general support.
const AVAILABLE_LANGUAGES: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "go",
    "rust",
    "sql",
    "html",
    "css",
];

/// Standards sections every request gets.
const BASE_STANDARDS: &[&str] = &["general", "testing", "documentation"];

/// Keyword groups and the libraries they suggest, in suggestion order.
const LIBRARY_HINTS: &[(&[&str], &[&str])] = &[
    (&["api", "rest"], &["requests", "fastapi"]),
    (&["data", "pandas"], &["pandas", "numpy"]),
    (&["web", "html"], &["flask", "django"]),
];

const TEST_KEYWORDS: &[&str] = &["test", "unittest"];
const SECURITY_KEYWORDS: &[&str] = &["auth", "password", "token", "secret", "security"];

/// Supported languages, in display order.
pub fn available_languages() -> &'static [&'static str] {
    AVAILABLE_LANGUAGES
}

pub fn is_supported_language(language: &str) -> bool {
    AVAILABLE_LANGUAGES
        .iter()
        .any(|l| l.eq_ignore_ascii_case(language))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// What a request needs before code can be generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementAnalysis {
    pub language: String,
    pub complexity: Complexity,
    pub suggested_libraries: Vec<String>,
    pub standards_needed: Vec<String>,
    pub wants_tests: bool,
}

/// Analyze a free-text request.
pub fn analyze_requirements(request: &str, language: &str) -> RequirementAnalysis {
    let lower = request.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    let mut suggested_libraries: Vec<String> = Vec::new();
    let mut hint_groups = 0;
    for (keywords, libraries) in LIBRARY_HINTS {
        if mentions(keywords) {
            hint_groups += 1;
            for lib in *libraries {
                if !suggested_libraries.iter().any(|l| l == lib) {
                    suggested_libraries.push((*lib).to_string());
                }
            }
        }
    }

    let mut standards_needed: Vec<String> =
        BASE_STANDARDS.iter().map(|s| (*s).to_string()).collect();
    if mentions(SECURITY_KEYWORDS) {
        standards_needed.push("security".to_string());
    }

    RequirementAnalysis {
        language: language.to_lowercase(),
        complexity: estimate_complexity(&lower, hint_groups),
        suggested_libraries,
        standards_needed,
        wants_tests: mentions(TEST_KEYWORDS),
    }
}

/// Rough size estimate from word count and how many concerns are mixed.
fn estimate_complexity(lower: &str, hint_groups: usize) -> Complexity {
    let words = lower.split_whitespace().count();
    if words > 60 || hint_groups >= 3 {
        Complexity::High
    } else if words < 12 && hint_groups == 0 {
        Complexity::Low
    } else {
        Complexity::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_request_suggests_http_libraries() {
        let analysis = analyze_requirements("Build a REST API client for the billing service", "Python");
        assert_eq!(analysis.language, "python");
        assert_eq!(analysis.suggested_libraries, vec!["requests", "fastapi"]);
        assert_eq!(analysis.standards_needed, vec!["general", "testing", "documentation"]);
        assert!(!analysis.wants_tests);
    }

    #[test]
    fn test_overlapping_keywords_do_not_duplicate() {
        let analysis = analyze_requirements("web api that serves pandas data as html", "python");
        assert_eq!(
            analysis.suggested_libraries,
            vec!["requests", "fastapi", "pandas", "numpy", "flask", "django"]
        );
        assert_eq!(analysis.complexity, Complexity::High);
    }

    #[test]
    fn test_tests_and_security_detected() {
        let analysis = analyze_requirements("password hashing helper with unittest coverage", "go");
        assert!(analysis.wants_tests);
        assert!(analysis.standards_needed.contains(&"security".to_string()));
        // "testing" stays listed once.
        assert_eq!(
            analysis.standards_needed.iter().filter(|s| *s == "testing").count(),
            1
        );
    }

    #[test]
    fn test_short_plain_request_is_low_complexity() {
        let analysis = analyze_requirements("reverse a string", "rust");
        assert_eq!(analysis.complexity, Complexity::Low);
        assert!(analysis.suggested_libraries.is_empty());
    }

    #[test]
    fn test_available_languages() {
        assert_eq!(available_languages().len(), 9);
        assert!(is_supported_language("Rust"));
        assert!(is_supported_language("sql"));
        assert!(!is_supported_language("cobol"));
    }
}
