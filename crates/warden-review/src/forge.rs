//! GitLab and Gitee compare APIs.
//!
//! Neither provider serves a raw unified diff for a commit range, so both
//! clients read the JSON file list and render it back into `git diff` form
//! for the diff parser.

use async_trait::async_trait;
use serde::Deserialize;
use warden_core::{CommitRange, DiffSource, GitConfig, RepoRef, WardenError};

use crate::llm::transport_error;

fn http_client() -> Result<reqwest::Client, WardenError> {
    reqwest::Client::builder()
        .user_agent("warden")
        .build()
        .map_err(|e| WardenError::Git(format!("failed to create HTTP client: {e}")))
}

async fn read_compare<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    what: &str,
) -> Result<T, WardenError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(WardenError::from_status(status.as_u16(), format!("{what}: {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| WardenError::Parse(format!("{what}: unexpected response: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileChange {
    Added,
    Deleted,
    Renamed,
    Modified,
}

/// Append one file of a unified diff. Files without a textual patch
/// (binary or too large) are left out.
fn render_file(out: &mut String, old: &str, new: &str, change: FileChange, patch: &str) {
    if patch.trim().is_empty() {
        return;
    }
    out.push_str(&format!("diff --git a/{old} b/{new}\n"));
    match change {
        FileChange::Added => out.push_str("new file mode 100644\n"),
        FileChange::Deleted => out.push_str("deleted file mode 100644\n"),
        FileChange::Renamed => out.push_str(&format!("rename from {old}\nrename to {new}\n")),
        FileChange::Modified => {}
    }
    if change == FileChange::Added {
        out.push_str("--- /dev/null\n");
    } else {
        out.push_str(&format!("--- a/{old}\n"));
    }
    if change == FileChange::Deleted {
        out.push_str("+++ /dev/null\n");
    } else {
        out.push_str(&format!("+++ b/{new}\n"));
    }
    out.push_str(patch);
    if !patch.ends_with('\n') {
        out.push('\n');
    }
}

#[derive(Debug, Deserialize)]
struct GitLabCompare {
    #[serde(default)]
    diffs: Vec<GitLabDiff>,
}

#[derive(Debug, Deserialize)]
struct GitLabDiff {
    old_path: String,
    new_path: String,
    #[serde(default)]
    diff: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    renamed_file: bool,
    #[serde(default)]
    deleted_file: bool,
}

fn render_gitlab(compare: &GitLabCompare) -> String {
    let mut out = String::new();
    for file in &compare.diffs {
        let change = if file.new_file {
            FileChange::Added
        } else if file.deleted_file {
            FileChange::Deleted
        } else if file.renamed_file {
            FileChange::Renamed
        } else {
            FileChange::Modified
        };
        render_file(&mut out, &file.old_path, &file.new_path, change, &file.diff);
    }
    out
}

/// GitLab `repository/compare` client.
pub struct GitLabClient {
    http: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GitLabClient {
    /// Build a client from the `[git]` table.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Git`] if the HTTP client cannot be built.
    pub fn new(config: &GitConfig) -> Result<Self, WardenError> {
        Ok(Self {
            http: http_client()?,
            token: config.resolve_gitlab_token(),
            api_base: config.gitlab_api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Unified diff of `range` in project `owner/repo`.
    ///
    /// # Errors
    ///
    /// Transport failures, 429 and 5xx are transient; other statuses and
    /// malformed bodies are terminal.
    pub async fn compare_diff(
        &self,
        owner: &str,
        repo: &str,
        range: &CommitRange,
    ) -> Result<String, WardenError> {
        let mut request = self
            .http
            .get(gitlab_compare_url(&self.api_base, owner, repo))
            .query(&[("from", range.base.as_str()), ("to", range.head.as_str())]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let compare: GitLabCompare =
            read_compare(request, &format!("GitLab compare {owner}/{repo} {range}")).await?;
        tracing::debug!(owner, repo, %range, files = compare.diffs.len(), "fetched GitLab compare");
        Ok(render_gitlab(&compare))
    }
}

fn gitlab_compare_url(api_base: &str, owner: &str, repo: &str) -> String {
    format!("{api_base}/projects/{owner}%2F{repo}/repository/compare")
}

#[async_trait]
impl DiffSource for GitLabClient {
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError> {
        match repo {
            RepoRef::GitLab { owner, repo } => self.compare_diff(owner, repo, range).await,
            other => Err(WardenError::Config(format!(
                "GitLab diff source cannot read {other}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GiteeCompare {
    #[serde(default)]
    files: Vec<GiteeFile>,
}

#[derive(Debug, Deserialize)]
struct GiteeFile {
    filename: String,
    #[serde(default)]
    previous_filename: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    patch: Option<String>,
}

fn render_gitee(compare: &GiteeCompare) -> String {
    let mut out = String::new();
    for file in &compare.files {
        let change = match file.status.as_str() {
            "added" => FileChange::Added,
            "removed" | "deleted" => FileChange::Deleted,
            "renamed" => FileChange::Renamed,
            _ => FileChange::Modified,
        };
        let old = file.previous_filename.as_deref().unwrap_or(&file.filename);
        let patch = file.patch.as_deref().unwrap_or_default();
        render_file(&mut out, old, &file.filename, change, patch);
    }
    out
}

/// Gitee `compare` client.
pub struct GiteeClient {
    http: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GiteeClient {
    /// Build a client from the `[git]` table.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Git`] if the HTTP client cannot be built.
    pub fn new(config: &GitConfig) -> Result<Self, WardenError> {
        Ok(Self {
            http: http_client()?,
            token: config.resolve_gitee_token(),
            api_base: config.gitee_api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Unified diff of `range` in repository `owner/repo`.
    ///
    /// # Errors
    ///
    /// Same classification as [`GitLabClient::compare_diff`].
    pub async fn compare_diff(
        &self,
        owner: &str,
        repo: &str,
        range: &CommitRange,
    ) -> Result<String, WardenError> {
        let mut request = self.http.get(gitee_compare_url(&self.api_base, owner, repo, range));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {token}"));
        }
        let compare: GiteeCompare =
            read_compare(request, &format!("Gitee compare {owner}/{repo} {range}")).await?;
        tracing::debug!(owner, repo, %range, files = compare.files.len(), "fetched Gitee compare");
        Ok(render_gitee(&compare))
    }
}

fn gitee_compare_url(api_base: &str, owner: &str, repo: &str, range: &CommitRange) -> String {
    format!(
        "{api_base}/repos/{owner}/{repo}/compare/{}...{}",
        range.base, range.head
    )
}

#[async_trait]
impl DiffSource for GiteeClient {
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError> {
        match repo {
            RepoRef::Gitee { owner, repo } => self.compare_diff(owner, repo, range).await,
            other => Err(WardenError::Config(format!(
                "Gitee diff source cannot read {other}"
            ))),
        }
    }
}
