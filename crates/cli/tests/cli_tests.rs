#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("vault.toml");
        let contents = format!(
            r#"
[storage]
type = "filesystem"
path = "{blobs}"

[metadata]
type = "sqlite"
path = "{db}"

[quota]
default_quota_bytes = 1000
"#,
            blobs = dir.path().join("blobs").display(),
            db = dir.path().join("metadata.db").display(),
        );
        fs::write(&config, contents).unwrap();
        Self { dir, config }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("vaultctl").unwrap();
        cmd.env_remove("VAULT_USER")
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn create_user(&self, name: &str) {
        self.cmd()
            .args(["user", "create", name])
            .assert()
            .success()
            .stdout(contains(format!("Created user: {name}")));
    }

    fn upload_json(&self, user: &str, path: &Path) -> serde_json::Value {
        let output = self
            .cmd()
            .args(["--json", "upload", "--user", user])
            .arg(path)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).unwrap()
    }
}

#[test]
fn user_create_and_list() {
    let ws = Workspace::new();
    ws.create_user("alice");

    ws.cmd()
        .args(["user", "list"])
        .assert()
        .success()
        .stdout(contains("alice"))
        .stdout(contains("1000 bytes"));

    ws.cmd()
        .args(["user", "create", "alice"])
        .assert()
        .failure()
        .stderr(contains("already taken"));
}

#[test]
fn upload_download_delete_roundtrip() {
    let ws = Workspace::new();
    ws.create_user("alice");
    let source = ws.file("notes.txt", b"remember the milk\n");

    let uploaded = ws.upload_json("alice", &source);
    assert_eq!(uploaded["deduplicated"], false);
    assert_eq!(uploaded["file"]["filename"], "notes.txt");
    let file_id = uploaded["file"]["id"].as_str().unwrap().to_string();

    ws.cmd()
        .args(["list", "--user", "alice"])
        .assert()
        .success()
        .stdout(contains(file_id.as_str()))
        .stdout(contains("notes.txt"));

    let target = ws.dir.path().join("out.txt");
    ws.cmd()
        .args(["download", "--user", "alice", &file_id, "--output"])
        .arg(&target)
        .assert()
        .success();
    assert_eq!(fs::read(&target).unwrap(), b"remember the milk\n");

    ws.cmd()
        .args(["download", "--user", "alice", &file_id])
        .assert()
        .success()
        .stdout("remember the milk\n");

    ws.cmd()
        .args(["delete", "--user", "alice", &file_id])
        .assert()
        .success()
        .stdout(contains("Reclaimed"));

    ws.cmd()
        .args(["show", "--user", "alice", &file_id])
        .assert()
        .failure()
        .stderr(contains("not found or access denied"));
}

#[test]
fn second_owner_upload_is_deduplicated() {
    let ws = Workspace::new();
    ws.create_user("alice");
    ws.create_user("bob");
    let source = ws.file("shared.txt", b"same bytes for everyone");

    let first = ws.upload_json("alice", &source);
    let second = ws.upload_json("bob", &source);
    assert_eq!(first["deduplicated"], false);
    assert_eq!(second["deduplicated"], true);
    assert_eq!(first["file"]["digest"], second["file"]["digest"]);

    ws.cmd()
        .args(["usage", "--user", "bob"])
        .assert()
        .success()
        .stdout(contains("Quota: 0 bytes of 1000 bytes"));
}

#[test]
fn upload_over_quota_fails() {
    let ws = Workspace::new();
    ws.create_user("alice");
    let source = ws.file("big.bin", &[7u8; 2000]);

    ws.cmd()
        .args(["upload", "--user", "alice"])
        .arg(&source)
        .assert()
        .failure()
        .stderr(contains("quota exceeded"));
}

#[test]
fn declared_type_must_match_content() {
    let ws = Workspace::new();
    ws.create_user("alice");
    let source = ws.file("fake.png", b"%PDF-1.7\n");

    ws.cmd()
        .args(["upload", "--user", "alice", "--type", "image/png"])
        .arg(&source)
        .assert()
        .failure()
        .stderr(contains("content type mismatch"));
}

#[test]
fn tags_can_be_edited() {
    let ws = Workspace::new();
    ws.create_user("alice");
    let source = ws.file("t.txt", b"tagged");

    let uploaded = ws.upload_json("alice", &source);
    let file_id = uploaded["file"]["id"].as_str().unwrap().to_string();

    ws.cmd()
        .args(["tag", "add", "--user", "alice", &file_id, "work"])
        .assert()
        .success()
        .stdout(contains("Tags: work"));
    ws.cmd()
        .args(["tag", "remove", "--user", "alice", &file_id, "work"])
        .assert()
        .success();
}

#[test]
fn unknown_user_is_reported() {
    let ws = Workspace::new();
    ws.cmd()
        .args(["list", "--user", "nobody"])
        .assert()
        .failure()
        .stderr(contains("user not found: nobody"));
}

#[test]
fn sweep_and_health() {
    let ws = Workspace::new();

    ws.cmd()
        .args(["sweep", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("dry run"));

    ws.cmd()
        .arg("health")
        .assert()
        .success()
        .stdout(contains("Metadata (sqlite): ok"))
        .stdout(contains("Storage (filesystem): ok"));
}
