use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{DiffFindOptions, DiffFormat, DiffOptions, Repository};
use warden_core::{CommitRange, DiffSource, RepoRef, WardenError};

/// [`DiffSource`] over a repository on the local filesystem.
///
/// Resolves both ends of the range with `revparse`, diffs their trees with
/// rename detection and renders the result as a unified patch.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGitSource;

#[async_trait]
impl DiffSource for LocalGitSource {
    async fn fetch_diff(&self, repo: &RepoRef, range: &CommitRange) -> Result<String, WardenError> {
        let path = match repo {
            RepoRef::Local { path } => path.clone(),
            remote => {
                return Err(WardenError::Config(format!(
                    "local git source cannot read {remote}"
                )))
            }
        };
        let range = range.clone();
        tokio::task::spawn_blocking(move || diff_range(&path, &range))
            .await
            .map_err(|e| WardenError::Git(format!("diff worker failed: {e}")))?
    }
}

/// Unified diff of `range` in the repository containing `path`.
///
/// # Errors
///
/// Returns [`WardenError::Git`] if the repository cannot be opened or a
/// revision does not resolve.
pub fn diff_range(path: &Path, range: &CommitRange) -> Result<String, WardenError> {
    let repo = Repository::discover(path)
        .map_err(|e| WardenError::Git(format!("not a git repository {}: {e}", path.display())))?;

    let tree_of = |rev: &str| {
        repo.revparse_single(rev)
            .and_then(|obj| obj.peel_to_tree())
            .map_err(|e| WardenError::Git(format!("cannot resolve revision '{rev}': {e}")))
    };
    let base = tree_of(&range.base)?;
    let head = tree_of(&range.head)?;

    let mut opts = DiffOptions::new();
    opts.context_lines(3);
    let mut diff = repo
        .diff_tree_to_tree(Some(&base), Some(&head), Some(&mut opts))
        .map_err(|e| WardenError::Git(format!("failed to compute diff: {e}")))?;

    let mut find_opts = DiffFindOptions::new();
    find_opts.renames(true);
    diff.find_similar(Some(&mut find_opts))
        .map_err(|e| WardenError::Git(format!("failed to find renames: {e}")))?;

    let mut patch = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            patch.push(line.origin());
        }
        patch.push_str(&String::from_utf8_lossy(line.content()));
        true
    })
    .map_err(|e| WardenError::Git(format!("failed to render diff: {e}")))?;

    tracing::debug!(
        repo = %path.display(),
        %range,
        files = diff.deltas().len(),
        bytes = patch.len(),
        "computed local diff"
    );
    Ok(patch)
}

/// Root of the work tree containing `path`, if any.
pub fn discover_root(path: &Path) -> Option<PathBuf> {
    Repository::discover(path)
        .ok()
        .and_then(|r| r.workdir().map(Path::to_path_buf))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use git2::{Oid, Signature};

    use super::*;

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) -> Oid {
        let workdir = repo.workdir().unwrap();
        fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    #[test]
    fn diff_between_two_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let first = commit_file(&repo, "lib.rs", "fn a() {}\n", "first");
        let second = commit_file(&repo, "lib.rs", "fn a() {}\nfn b() {}\n", "second");

        let range = CommitRange {
            base: first.to_string(),
            head: second.to_string(),
        };
        let patch = diff_range(dir.path(), &range).unwrap();
        assert!(patch.contains("diff --git a/lib.rs b/lib.rs"));
        assert!(patch.contains("+fn b() {}"));
        assert!(!patch.contains("+fn a() {}"));
    }

    #[test]
    fn unknown_revision_is_git_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "a.txt", "x\n", "init");

        let range: CommitRange = "HEAD..no-such-branch".parse().unwrap();
        let err = diff_range(dir.path(), &range).unwrap_err();
        assert!(matches!(err, WardenError::Git(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn discover_root_finds_workdir() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let root = discover_root(&dir.path().join("sub")).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn github_reference_is_rejected() {
        let repo: RepoRef = "github:a/b".parse().unwrap();
        let range: CommitRange = "a..b".parse().unwrap();
        let err = LocalGitSource.fetch_diff(&repo, &range).await.unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
