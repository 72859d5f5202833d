use async_trait::async_trait;
use warden_core::{CommitRange, DiffSource, GitConfig, RepoRef, WardenError};

use crate::forge::{GitLabClient, GiteeClient};
use crate::github::GitHubClient;
use crate::local::LocalGitSource;

/// Picks the backend by [`RepoRef`] kind.
pub struct RoutingDiffSource {
    github: GitHubClient,
    gitlab: GitLabClient,
    gitee: GiteeClient,
    local: LocalGitSource,
}

impl RoutingDiffSource {
    /// Build every backend from the `[git]` table.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Git`] if an HTTP client cannot be built.
    pub fn new(config: &GitConfig) -> Result<Self, WardenError> {
        Ok(Self {
            github: GitHubClient::new(config)?,
            gitlab: GitLabClient::new(config)?,
            gitee: GiteeClient::new(config)?,
            local: LocalGitSource,
        })
    }
}

#[async_trait]
impl DiffSource for RoutingDiffSource {
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError> {
        match repo {
            RepoRef::GitHub { .. } => self.github.fetch_diff(repo, range).await,
            RepoRef::GitLab { .. } => self.gitlab.fetch_diff(repo, range).await,
            RepoRef::Gitee { .. } => self.gitee.fetch_diff(repo, range).await,
            RepoRef::Local { .. } => self.local.fetch_diff(repo, range).await,
        }
    }
}
