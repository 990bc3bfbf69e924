#![allow(dead_code)]

use std::path::{Path, PathBuf};

use quorum::config::{CouncilConfig, ReviewParams, ReviewerSpec};
use quorum::session::Protocol;

/// Write an executable shell script standing in for an agent CLI.
pub fn write_agent_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Prepend a directory to PATH so spawned basenames resolve to the fake
/// scripts. Returns the previous PATH; pair with `restore_path`.
pub fn prepend_path(dir: &Path) -> String {
    let old = std::env::var("PATH").unwrap_or_default();
    unsafe { std::env::set_var("PATH", format!("{}:{old}", dir.display())) };
    old
}

pub fn restore_path(old: String) {
    unsafe { std::env::set_var("PATH", old) };
}

/// Script body: consume the two request lines, stream `text` as one delta,
/// then go idle.
pub fn ok_reviewer_body(text: &str) -> String {
    format!(
        r#"read -r _open
read -r _prompt
printf '%s\n' '{{"event":"assistant.message_delta","deltaContent":"{text}"}}'
printf '%s\n' '{{"event":"session.idle"}}'"#
    )
}

/// Script body: append the prompt request line to `capture` (appending keeps
/// concurrent invocations from clobbering each other), then reply.
pub fn capturing_reviewer_body(capture: &Path, text: &str) -> String {
    format!(
        r#"read -r _open
read -r prompt_line
printf '%s\n' "$prompt_line" >> '{}'
printf '%s\n' '{{"event":"assistant.message_delta","deltaContent":"{text}"}}'
printf '%s\n' '{{"event":"session.idle"}}'"#,
        capture.display()
    )
}

/// The last captured prompt request line in a capture file.
pub fn last_captured_prompt(capture: &Path) -> serde_json::Value {
    let content = std::fs::read_to_string(capture).unwrap();
    let line = content.lines().rev().find(|l| !l.trim().is_empty()).unwrap();
    serde_json::from_str(line).unwrap()
}

/// Script body: fail the session outright.
pub fn failing_reviewer_body(message: &str) -> String {
    format!(
        r#"read -r _open
read -r _prompt
printf '%s\n' '{{"event":"session.error","message":"{message}"}}'"#
    )
}

/// Script body: reply with a complete `assistant.message` whose content is
/// `reply` (JSON-escaped here), then go idle. Used for decision makers.
pub fn message_reviewer_body(reply: &str) -> String {
    let event =
        serde_json::json!({ "event": "assistant.message", "content": reply }).to_string();
    format!(
        r#"read -r _open
read -r _prompt
printf '%s\n' '{event}'
printf '%s\n' '{{"event":"session.idle"}}'"#
    )
}

/// A decision-maker reply with one accepted decision.
pub fn accepted_decision_json() -> String {
    serde_json::json!({
        "overallAssessment": "Good overall",
        "decisions": [{
            "severity": "medium",
            "category": "code-quality",
            "description": "Something minor",
            "file": "src/a.rs",
            "line": 3,
            "raisedBy": ["alpha"],
            "verdict": "accepted",
            "reasoning": "Reviewer is right",
            "suggestion": "Fix it"
        }],
        "additionalFindings": []
    })
    .to_string()
}

pub fn spec(name: &str, cli: &str) -> ReviewerSpec {
    ReviewerSpec {
        name: name.to_string(),
        cli_path: cli.to_string(),
        cli_args: vec![],
        protocol: Protocol::Default,
        model: None,
        timeout_ms: Some(10_000),
        max_retries: None,
        streaming: None,
    }
}

pub fn council_config(reviewers: Vec<ReviewerSpec>, decision_maker: ReviewerSpec) -> CouncilConfig {
    CouncilConfig { reviewers, decision_maker, review: ReviewParams::default() }
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A git repo with one committed file on `main`.
pub fn setup_git_repo() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    run_git(tmp.path(), &["init"]);
    run_git(tmp.path(), &["config", "user.email", "test@test.com"]);
    run_git(tmp.path(), &["config", "user.name", "Test"]);
    std::fs::write(tmp.path().join("lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
    run_git(tmp.path(), &["add", "."]);
    run_git(tmp.path(), &["commit", "-m", "init"]);
    run_git(tmp.path(), &["branch", "-M", "main"]);
    tmp
}
