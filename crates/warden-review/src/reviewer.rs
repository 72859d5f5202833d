use async_trait::async_trait;
use warden_core::{
    Chunk, ChunkReview, ReviewComment, ReviewConfig, ReviewParams, Reviewer, WardenError,
};

use crate::llm::{ChatMessage, LlmClient};
use crate::prompt::{build_review_prompt, build_system_prompt, parse_review_response};

/// [`Reviewer`] backed by an OpenAI-compatible LLM.
///
/// One chat call per chunk returns review comments plus, when the task asks
/// for them, unit tests and scenario cases. Comments below the configured
/// confidence, outside the severity filter, or beyond the per-chunk cap are
/// dropped.
pub struct LlmReviewer {
    client: LlmClient,
    config: ReviewConfig,
}

impl LlmReviewer {
    /// Wrap `client` with the `[review]` filtering rules.
    pub fn new(client: LlmClient, config: ReviewConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    fn model(&self) -> &str {
        self.client.model()
    }

    async fn review(&self, chunk: &Chunk, params: &ReviewParams) -> Result<ChunkReview, WardenError> {
        let messages = vec![
            ChatMessage::system(build_system_prompt(params)),
            ChatMessage::user(build_review_prompt(chunk, params)),
        ];
        let response = self.client.chat(messages).await?;
        let parsed = parse_review_response(&response);

        let raw_count = parsed.comments.len();
        let comments = filter_comments(parsed.comments, &self.config);
        tracing::debug!(
            chunk = chunk.index,
            raw = raw_count,
            kept = comments.len(),
            "chunk reviewed"
        );

        Ok(ChunkReview {
            index: chunk.index,
            files: chunk.files.clone(),
            fingerprint: chunk.fingerprint.clone(),
            comments,
            summary: parsed.summary,
            unit_tests: if params.unit_tests {
                parsed.unit_tests
            } else {
                Vec::new()
            },
            scenarios: if params.scenarios {
                parsed.scenarios
            } else {
                Vec::new()
            },
        })
    }
}

/// Apply the confidence floor, severity filter and per-chunk cap, keeping
/// the most confident comments.
pub fn filter_comments(mut comments: Vec<ReviewComment>, config: &ReviewConfig) -> Vec<ReviewComment> {
    comments.retain(|c| {
        c.confidence >= config.min_confidence && config.severity_filter.contains(&c.severity)
    });
    comments.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    comments.truncate(config.max_comments);
    comments
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use warden_core::Severity;

    use super::*;

    fn comment(severity: Severity, confidence: f64) -> ReviewComment {
        ReviewComment {
            file_path: PathBuf::from("src/lib.rs"),
            line: 1,
            severity,
            message: format!("{severity} at {confidence}"),
            confidence,
            suggestion: None,
        }
    }

    #[test]
    fn filter_drops_low_confidence_and_filtered_severities() {
        let config = ReviewConfig {
            min_confidence: 80.0,
            severity_filter: vec![Severity::Bug, Severity::Warning],
            ..ReviewConfig::default()
        };
        let kept = filter_comments(
            vec![
                comment(Severity::Bug, 95.0),
                comment(Severity::Bug, 60.0),
                comment(Severity::Info, 99.0),
                comment(Severity::Warning, 85.0),
            ],
            &config,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 95.0);
        assert_eq!(kept[1].severity, Severity::Warning);
    }

    #[test]
    fn filter_caps_by_confidence() {
        let config = ReviewConfig {
            max_comments: 2,
            min_confidence: 0.0,
            ..ReviewConfig::default()
        };
        let kept = filter_comments(
            vec![
                comment(Severity::Bug, 81.0),
                comment(Severity::Bug, 99.0),
                comment(Severity::Bug, 90.0),
            ],
            &config,
        );
        let confidences: Vec<f64> = kept.iter().map(|c| c.confidence).collect();
        assert_eq!(confidences, vec![99.0, 90.0]);
    }
}
