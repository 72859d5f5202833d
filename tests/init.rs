use std::process::Command;

#[test]
fn init_creates_valid_toml() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_warden"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(output.status.success(), "warden init failed: {}", String::from_utf8_lossy(&output.stderr));

    let config_path = dir.path().join(".warden.toml");
    assert!(config_path.exists(), ".warden.toml should exist");

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[queue]"));
    assert!(content.contains("[[notify.channels]]"));

    let config = warden_core::WardenConfig::from_toml(&content).unwrap();
    assert_eq!(config.queue.max_retry_attempts, 3);
    assert_eq!(config.notify.channels.len(), 1);
}

#[test]
fn init_refuses_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".warden.toml"), "# existing").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_warden"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let content = std::fs::read_to_string(dir.path().join(".warden.toml")).unwrap();
    assert_eq!(content, "# existing");
}
