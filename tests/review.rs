use std::path::Path;
use std::process::{Command, Output};

use git2::{Repository, Signature};

fn repo_with_commit(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    std::fs::write(dir.join("lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("lib.rs")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("Test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
}

fn review(dir: &Path, range: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_warden"))
        .args(["review", "--repo", ".", "--range", range, "--format", "json"])
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn empty_range_succeeds_without_llm_calls() {
    let dir = tempfile::tempdir().unwrap();
    repo_with_commit(dir.path());

    let output = review(dir.path(), "HEAD..HEAD");
    assert!(output.status.success(), "review failed: {}", String::from_utf8_lossy(&output.stderr));

    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let record = &records[0];
    assert_eq!(record["status"], "SUCCEEDED");
    assert_eq!(record["result"]["stats"]["llmCalls"], 0);
    assert_eq!(record["result"]["chunks"].as_array().unwrap().len(), 0);
}

#[test]
fn unknown_revision_fails_with_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    repo_with_commit(dir.path());

    let output = review(dir.path(), "no-such-branch..HEAD");
    assert_eq!(output.status.code(), Some(1));

    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let record = &records[0];
    assert_eq!(record["status"], "FAILED");
    assert_eq!(record["error"]["kind"], "UpstreamFetchError");
    assert_eq!(record["retryCount"], 0);
}

#[test]
fn each_range_gets_its_own_record() {
    let dir = tempfile::tempdir().unwrap();
    repo_with_commit(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_warden"))
        .args(["review", "--range", "HEAD..HEAD", "--range", "bogus..HEAD", "--format", "json"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let statuses: Vec<&str> = records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["SUCCEEDED", "FAILED"]);
}

#[test]
fn malformed_range_is_rejected_before_submission() {
    let dir = tempfile::tempdir().unwrap();

    let output = review(dir.path(), "not-a-range");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
