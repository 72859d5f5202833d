use std::path::PathBuf;

use serde::Deserialize;
use warden_core::{Chunk, ReviewComment, ReviewParams, ScenarioCase, Severity, UnitTestCase};

const REVIEW_RULES: &str = "\
You are Warden, an expert code reviewer. Your job is to find genuine bugs, \
security issues, and significant problems in code changes.

Rules:
- Only comment on issues you are confident about
- Reference specific line numbers in the new version of the file
- Do not speculate about code you cannot see
- Do not comment on style, formatting, or naming unless it creates a bug
- Focus on: bugs, security vulnerabilities, logic errors, race conditions, resource leaks";

const UNIT_TEST_RULES: &str = "\
Also write unit tests for the changed code. Use the language and test \
framework the file already uses. Each test must compile on its own and \
exercise one behaviour introduced or changed by the diff.";

const SCENARIO_RULES: &str = "\
Also write functional scenario test cases a QA engineer could run by hand \
against the changed behaviour: preconditions, numbered steps and the \
expected result.";

/// Build the system prompt for one chunk review.
///
/// The response schema only lists `unit_tests` and `scenarios` when the task
/// asked for them.
///
/// # Examples
///
/// ```
/// use warden_core::ReviewParams;
/// use warden_review::prompt::build_system_prompt;
///
/// let prompt = build_system_prompt(&ReviewParams::default());
/// assert!(prompt.contains("Warden"));
/// assert!(!prompt.contains("unit_tests"));
///
/// let params = ReviewParams { unit_tests: true, ..ReviewParams::default() };
/// assert!(build_system_prompt(&params).contains("unit_tests"));
/// ```
pub fn build_system_prompt(params: &ReviewParams) -> String {
    let mut prompt = String::from(REVIEW_RULES);
    if params.unit_tests {
        prompt.push_str("\n\n");
        prompt.push_str(UNIT_TEST_RULES);
    }
    if params.scenarios {
        prompt.push_str("\n\n");
        prompt.push_str(SCENARIO_RULES);
    }

    prompt.push_str(
        "\n\nRespond with a JSON object:\n{\n  \"summary\": \"One paragraph describing the change\",\n  \"comments\": [\n    {\n      \"file\": \"path/to/file.rs\",\n      \"line\": 42,\n      \"severity\": \"bug\" | \"warning\" | \"suggestion\" | \"info\",\n      \"message\": \"Clear explanation of the issue\",\n      \"confidence\": 0-100,\n      \"suggestion\": \"Optional fix\"\n    }\n  ]",
    );
    if params.unit_tests {
        prompt.push_str(
            ",\n  \"unit_tests\": [\n    { \"file\": \"path/to/file.rs\", \"name\": \"test_name\", \"code\": \"full test source\" }\n  ]",
        );
    }
    if params.scenarios {
        prompt.push_str(
            ",\n  \"scenarios\": [\n    { \"title\": \"...\", \"preconditions\": \"...\", \"steps\": [\"...\"], \"expected\": \"...\" }\n  ]",
        );
    }
    prompt.push_str("\n}\n\nIf you find no issues, return an empty \"comments\" array.");
    prompt
}

/// Build the user prompt carrying the chunk's diff.
///
/// # Examples
///
/// ```
/// use warden_core::{Chunk, ReviewParams};
/// use warden_review::prompt::build_review_prompt;
///
/// let chunk = Chunk {
///     index: 0,
///     files: vec!["src/lib.rs".into()],
///     hunk_count: 1,
///     text: "+new line\n".into(),
///     fingerprint: String::new(),
/// };
/// let prompt = build_review_prompt(&chunk, &ReviewParams::default());
/// assert!(prompt.contains("+new line"));
/// assert!(prompt.contains("src/lib.rs"));
/// ```
pub fn build_review_prompt(chunk: &Chunk, params: &ReviewParams) -> String {
    let files: Vec<String> = chunk
        .files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let mut prompt = format!(
        "Files in this change: {}\n\nReview the following code changes:\n\n```diff\n{}\n```\n",
        files.join(", "),
        chunk.text.trim_end()
    );
    if let Some(instructions) = params.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\nAdditional instructions:\n{instructions}\n"));
    }
    prompt
}

/// Everything parsed out of one reviewer response.
#[derive(Debug, Default)]
pub struct ParsedReview {
    /// Chunk summary.
    pub summary: Option<String>,
    /// Valid comments, unfiltered.
    pub comments: Vec<ReviewComment>,
    /// Generated unit tests.
    pub unit_tests: Vec<UnitTestCase>,
    /// Generated scenarios.
    pub scenarios: Vec<ScenarioCase>,
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    comments: Vec<serde_json::Value>,
    #[serde(default)]
    unit_tests: Vec<serde_json::Value>,
    #[serde(default)]
    scenarios: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawComment {
    file: String,
    line: Option<serde_json::Value>,
    severity: String,
    message: String,
    confidence: Option<serde_json::Value>,
    suggestion: Option<String>,
}

#[derive(Deserialize)]
struct RawUnitTest {
    file: String,
    name: String,
    code: String,
}

/// Parse a reviewer response.
///
/// Code fences around the JSON are stripped. Entries that do not match the
/// schema (zero or missing line, unknown severity, missing fields) are
/// skipped one by one. A response that is not JSON at all yields an empty
/// review and a warning.
///
/// # Examples
///
/// ```
/// use warden_review::prompt::parse_review_response;
///
/// let parsed = parse_review_response("```json\n{\"comments\":[]}\n```");
/// assert!(parsed.comments.is_empty());
/// ```
pub fn parse_review_response(response: &str) -> ParsedReview {
    let cleaned = strip_code_fences(response);
    let raw: RawResponse = match serde_json::from_str(cleaned) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse reviewer response");
            return ParsedReview::default();
        }
    };

    ParsedReview {
        summary: raw.summary.filter(|s| !s.trim().is_empty()),
        comments: raw.comments.into_iter().filter_map(parse_comment).collect(),
        unit_tests: raw
            .unit_tests
            .into_iter()
            .filter_map(|v| serde_json::from_value::<RawUnitTest>(v).ok())
            .map(|t| UnitTestCase {
                file_path: PathBuf::from(t.file),
                name: t.name,
                code: t.code,
            })
            .collect(),
        scenarios: raw
            .scenarios
            .into_iter()
            .filter_map(|v| serde_json::from_value::<ScenarioCase>(v).ok())
            .collect(),
    }
}

fn parse_comment(value: serde_json::Value) -> Option<ReviewComment> {
    let c: RawComment = serde_json::from_value(value).ok()?;

    let line = match &c.line {
        Some(serde_json::Value::Number(n)) => n.as_u64().filter(|l| *l > 0)?,
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok().filter(|l| *l > 0)?,
        _ => return None,
    };
    let severity: Severity = c.severity.parse().ok()?;
    let confidence = match &c.confidence {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0).clamp(0.0, 100.0),
        _ => 50.0,
    };

    Some(ReviewComment {
        file_path: PathBuf::from(c.file),
        line: u32::try_from(line).ok()?,
        severity,
        message: c.message,
        confidence,
        suggestion: c.suggestion.filter(|s| !s.trim().is_empty()),
    })
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_lists_requested_sections() {
        let params = ReviewParams {
            unit_tests: true,
            scenarios: true,
            instructions: None,
        };
        let prompt = build_system_prompt(&params);
        assert!(prompt.contains("unit_tests"));
        assert!(prompt.contains("scenarios"));
        assert!(prompt.contains("preconditions"));
    }

    #[test]
    fn review_prompt_includes_instructions() {
        let chunk = Chunk {
            index: 0,
            files: vec![PathBuf::from("a.rs")],
            hunk_count: 1,
            text: "+x\n".into(),
            fingerprint: String::new(),
        };
        let params = ReviewParams {
            instructions: Some("Focus on auth flows".into()),
            ..ReviewParams::default()
        };
        let prompt = build_review_prompt(&chunk, &params);
        assert!(prompt.contains("```diff"));
        assert!(prompt.contains("Focus on auth flows"));
    }

    #[test]
    fn parse_full_response() {
        let json = r#"{
            "summary": "Adds session touch on open",
            "comments": [
                {"file": "src/auth.rs", "line": 42, "severity": "bug",
                 "message": "Null dereference", "confidence": 95, "suggestion": "Add a check"},
                {"file": "src/db.rs", "line": "10", "severity": "Warning",
                 "message": "SQL injection risk", "confidence": 88}
            ],
            "unit_tests": [
                {"file": "src/auth.rs", "name": "opens_session", "code": "fn opens_session() {}"},
                {"file": "src/auth.rs"}
            ],
            "scenarios": [
                {"title": "Login", "steps": ["open app", "sign in"], "expected": "dashboard shown"}
            ]
        }"#;
        let parsed = parse_review_response(json);
        assert_eq!(parsed.summary.as_deref(), Some("Adds session touch on open"));
        assert_eq!(parsed.comments.len(), 2);
        assert_eq!(parsed.comments[0].severity, Severity::Bug);
        assert_eq!(parsed.comments[1].line, 10);
        assert_eq!(parsed.unit_tests.len(), 1);
        assert_eq!(parsed.scenarios.len(), 1);
        assert_eq!(parsed.scenarios[0].steps.len(), 2);
    }

    #[test]
    fn parse_malformed_returns_empty() {
        let parsed = parse_review_response("this is not json at all");
        assert!(parsed.comments.is_empty());
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn parse_skips_invalid_entries() {
        let json = r#"{"comments": [
            {"file": "a.rs", "line": 0, "severity": "bug", "message": "bad line", "confidence": 90},
            {"file": "b.rs", "line": 5, "severity": "invalid", "message": "bad severity", "confidence": 90},
            {"file": "c.rs", "line": 7, "message": "no severity"},
            {"file": "d.rs", "line": 10, "severity": "bug", "message": "valid", "confidence": 150}
        ]}"#;
        let parsed = parse_review_response(json);
        assert_eq!(parsed.comments.len(), 1);
        assert_eq!(parsed.comments[0].file_path, PathBuf::from("d.rs"));
        assert_eq!(parsed.comments[0].confidence, 100.0);
    }

    #[test]
    fn strip_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {} "), "{}");
    }
}
