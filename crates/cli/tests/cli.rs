use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Repository with four commits on `main`, each rewriting default.nix.
fn repo() -> (TempDir, Vec<String>) {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path();
    git(dir, &["init", "--quiet"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "test"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    let mut revs = Vec::new();
    for i in 0..4 {
        std::fs::write(dir.join("default.nix"), format!("c{i}")).unwrap();
        git(dir, &["add", "default.nix"]);
        git(dir, &["commit", "--quiet", "-m", &format!("c{i}")]);
        revs.push(git(dir, &["rev-parse", "HEAD"]));
    }
    (temp, revs)
}

#[allow(deprecated)]
fn nix_bisect(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("nix-bisect").expect("binary");
    cmd.current_dir(dir)
        .env("NIX_BISECT_CACHE_DIR", dir.join(".cache"))
        .env_remove("RUST_LOG");
    cmd
}

fn json(dir: &Path, args: &[&str]) -> Value {
    let output = nix_bisect(dir)
        .args(args)
        .arg("--json")
        .output()
        .expect("run nix-bisect");
    assert!(
        output.status.success(),
        "{args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json")
}

#[test]
fn help_lists_the_subcommands() {
    let temp = tempfile::tempdir().unwrap();
    nix_bisect(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build-status"))
        .stdout(predicate::str::contains("start"));
}

#[test]
fn manual_marking_converges_without_building() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let (temp, revs) = repo();
    let dir = temp.path();

    let status = json(dir, &["start", "--good", &revs[0], "--bad", &revs[3], "hello"]);
    assert_eq!(status["candidates"], 2);
    assert_eq!(status["next"], revs[1].as_str());

    let status = json(dir, &["good"]);
    assert_eq!(status["good"], revs[1].as_str());
    assert_eq!(status["next"], revs[2].as_str());

    nix_bisect(dir)
        .arg("bad")
        .assert()
        .success()
        .stdout(predicate::str::contains("bisect: bad"))
        .stdout(predicate::str::contains(format!(
            "{} is the first bad commit",
            revs[2]
        )));

    let status = json(dir, &["status"]);
    assert_eq!(status["phase"]["phase"], "converged");
    assert_eq!(status["phase"]["first_bad"], revs[2].as_str());

    nix_bisect(dir).arg("reset").assert().success();
    nix_bisect(dir)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no bisection in progress"));
}

#[test]
fn start_rejects_reversed_revisions() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let (temp, revs) = repo();
    nix_bisect(temp.path())
        .args(["start", "--good", &revs[3], "--bad", &revs[0], "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a proper ancestor"));
}

#[test]
fn env_restores_the_tree_and_reports_failed_picks() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let (temp, revs) = repo();
    let dir = temp.path();
    std::fs::write(dir.join("notes.txt"), "untracked").unwrap();

    nix_bisect(dir)
        .args(["env", "--", "sh", "-c", "test ! -e notes.txt && exit 3"])
        .assert()
        .code(3);
    assert_eq!(git(dir, &["symbolic-ref", "HEAD"]), "refs/heads/main");
    assert_eq!(git(dir, &["rev-parse", "HEAD"]), revs[3]);
    assert_eq!(
        std::fs::read_to_string(dir.join("notes.txt")).unwrap(),
        "untracked"
    );

    // c1 rewrites default.nix and conflicts with the tip.
    nix_bisect(dir)
        .args(["env", "--pick", &revs[1], "--", "true"])
        .assert()
        .code(125);
    nix_bisect(dir)
        .args(["env", "--try-pick", &revs[1], "--", "true"])
        .assert()
        .success();
    assert_eq!(git(dir, &["status", "--porcelain"]), "?? notes.txt");
}

#[test]
fn build_status_outside_a_repository_aborts() {
    let temp = tempfile::tempdir().unwrap();
    let parent = temp.path().parent().unwrap_or(temp.path()).to_path_buf();
    nix_bisect(temp.path())
        .env("GIT_CEILING_DIRECTORIES", parent)
        .args(["build-status", "hello"])
        .assert()
        .code(128);
}

#[test]
fn cache_clear_removes_entries() {
    let temp = tempfile::tempdir().unwrap();
    let cache = temp.path().join("cache");
    std::fs::create_dir_all(cache.join("entries")).unwrap();
    std::fs::write(cache.join("entries").join("x.json"), "{}").unwrap();

    nix_bisect(temp.path())
        .arg("--cache-dir")
        .arg(&cache)
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleared"));
    assert!(!cache.join("entries").exists());
}
