use async_trait::async_trait;
use warden_core::{CommitRange, DiffSource, GitConfig, RepoRef, WardenError};

use crate::llm::transport_error;

const DIFF_MEDIA_TYPE: &str = "application/vnd.github.v3.diff";

/// GitHub REST client: compare diffs over `reqwest`, commit comments over
/// `octocrab`.
///
/// A token is optional; public repositories can be compared without one.
pub struct GitHubClient {
    octocrab: octocrab::Octocrab,
    http: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GitHubClient {
    /// Build a client from the `[git]` table (token falling back to `GITHUB_TOKEN`).
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Git`] if either HTTP client cannot be built.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use warden_core::GitConfig;
    /// use warden_review::github::GitHubClient;
    ///
    /// let client = GitHubClient::new(&GitConfig::default()).unwrap();
    /// ```
    pub fn new(config: &GitConfig) -> Result<Self, WardenError> {
        let token = config.resolve_token();

        let mut builder = octocrab::Octocrab::builder();
        if let Some(t) = &token {
            builder = builder.personal_token(t.clone());
        }
        if config.api_base.trim_end_matches('/') != "https://api.github.com" {
            builder = builder
                .base_uri(config.api_base.as_str())
                .map_err(|e| WardenError::Git(format!("invalid GitHub API base: {e}")))?;
        }
        let octocrab = builder
            .build()
            .map_err(|e| WardenError::Git(format!("failed to create GitHub client: {e}")))?;

        let http = reqwest::Client::builder()
            .user_agent("warden")
            .build()
            .map_err(|e| WardenError::Git(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            octocrab,
            http,
            token,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the unified diff between two revisions.
    ///
    /// # Errors
    ///
    /// Transport failures, 429 and 5xx map to transient variants; 404 and
    /// other client errors are terminal [`WardenError::Upstream`] values.
    pub async fn compare_diff(
        &self,
        owner: &str,
        repo: &str,
        range: &CommitRange,
    ) -> Result<String, WardenError> {
        let url = compare_url(&self.api_base, owner, repo, range);

        let mut request = self.http.get(&url).header("Accept", DIFF_MEDIA_TYPE);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::from_status(
                status.as_u16(),
                format!("GitHub compare {owner}/{repo} {range}: {body}"),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| WardenError::Network(format!("failed to read diff response: {e}")))
    }

    /// Post `body` as a comment on commit `sha`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Notify`] on API errors.
    pub async fn comment_on_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        body: &str,
    ) -> Result<(), WardenError> {
        let route = format!("/repos/{owner}/{repo}/commits/{sha}/comments");
        let payload = serde_json::json!({ "body": body });
        let _response: serde_json::Value = self
            .octocrab
            .post(route, Some(&payload))
            .await
            .map_err(|e| WardenError::Notify(format!("failed to comment on {owner}/{repo}@{sha}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl DiffSource for GitHubClient {
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError> {
        match repo {
            RepoRef::GitHub { owner, repo } => self.compare_diff(owner, repo, range).await,
            other => Err(WardenError::Config(format!(
                "GitHub diff source cannot read {other}"
            ))),
        }
    }
}

fn compare_url(api_base: &str, owner: &str, repo: &str, range: &CommitRange) -> String {
    format!(
        "{api_base}/repos/{owner}/{repo}/compare/{}...{}",
        range.base, range.head
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_url_uses_three_dot_range() {
        let range: CommitRange = "main..feature/x".parse().unwrap();
        assert_eq!(
            compare_url("https://api.github.com", "octocat", "hello", &range),
            "https://api.github.com/repos/octocat/hello/compare/main...feature/x"
        );
    }

    #[tokio::test]
    async fn local_repo_is_rejected() {
        let client = GitHubClient::new(&GitConfig {
            token: Some("test".into()),
            ..GitConfig::default()
        })
        .unwrap();
        let repo = RepoRef::Local {
            path: "/tmp/repo".into(),
        };
        let range: CommitRange = "a..b".parse().unwrap();
        let err = client.fetch_diff(&repo, &range).await.unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
        assert!(!err.is_transient());
    }
}
