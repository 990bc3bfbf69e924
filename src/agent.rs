//! Agent Runtime: spawns agent subprocesses, drives their streaming
//! sessions, and tears them down on every exit path.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReviewerSpec;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::session::{self, Protocol, SessionEvent, SessionOptions};

/// How long a graceful stop may take before the subprocess is killed.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Positional argument values longer than this are redacted from spawn logs.
const LONG_POSITIONAL_VALUE: usize = 200;

/// Reject anything that is not a plain executable basename: empty, `.`,
/// `..`, path separators, a leading `-`, or characters outside
/// `[A-Za-z0-9._-]`.
pub fn validate_command(command: &str) -> Result<()> {
    let ok = !command.is_empty()
        && command != "."
        && command != ".."
        && !command.starts_with('-')
        && command
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok { Ok(()) } else { Err(Error::UnsafeCommand(command.to_string())) }
}

static SECRET_FLAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)api[-_]?key|token|secret|password|authorization|bearer").unwrap()
});

static SECRET_VALUE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:sk-|ghp_|glpat-)").unwrap());

static BASE64ISH_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=]{32,}").unwrap());

fn looks_like_secret(value: &str) -> bool {
    SECRET_VALUE_PREFIX_RE.is_match(value) || BASE64ISH_RUN_RE.is_match(value)
}

/// Redact secret-looking material from an argument vector before it is
/// logged. The vector handed to the subprocess is never modified.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            redact_next = false;
            out.push("[REDACTED]".to_string());
            continue;
        }
        if arg.starts_with('-') {
            if let Some((flag, value)) = arg.split_once('=') {
                if SECRET_FLAG_RE.is_match(flag) || looks_like_secret(value) {
                    out.push(format!("{flag}=[REDACTED]"));
                } else {
                    out.push(arg.clone());
                }
            } else {
                if SECRET_FLAG_RE.is_match(arg) {
                    redact_next = true;
                }
                out.push(arg.clone());
            }
            continue;
        }
        let chars = arg.chars().count();
        if chars > LONG_POSITIONAL_VALUE {
            out.push(format!("[REDACTED:{chars}]"));
        } else if looks_like_secret(arg) {
            out.push("[REDACTED]".to_string());
        } else {
            out.push(arg.clone());
        }
    }
    out
}

#[derive(Debug)]
struct HandleState {
    id: u64,
    name: String,
    model: Option<String>,
    protocol: Protocol,
    streaming: bool,
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    stopped: AtomicBool,
}

/// A live agent subprocess. Cloneable; all clones refer to the same process.
#[derive(Clone, Debug)]
pub struct AgentHandle {
    inner: Arc<HandleState>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn model(&self) -> Option<&str> {
        self.inner.model.as_deref()
    }

    /// Open a session, send one prompt, and consume events until a terminal
    /// event or the timeout. If any deltas arrived, the returned string is
    /// their concatenation in arrival order; a final `assistant.message` is
    /// authoritative only when no deltas were received.
    pub async fn prompt(
        &self,
        text: &str,
        timeout: Duration,
        sink: &dyn EventSink,
    ) -> Result<String> {
        let open = session::open_request(
            self.inner.protocol,
            &SessionOptions { streaming: self.inner.streaming, model: self.inner.model.clone() },
        );
        let request = session::prompt_request(self.inner.protocol, text);

        {
            let mut stdin_guard = self.inner.stdin.lock().await;
            if let Some(stdin) = stdin_guard.as_mut() {
                // A write failure is not terminal: the agent may already have
                // produced output and closed its end.
                if let Err(e) = write_lines(stdin, &[&open, &request]).await {
                    warn!(agent = %self.inner.name, error = %e, "failed to write session request");
                }
            } else {
                return Err(Error::Session(format!(
                    "agent '{}' session already closed",
                    self.inner.name
                )));
            }
        }

        let mut accumulated = String::new();
        let mut had_delta = false;
        let mut final_message: Option<String> = None;

        let consume = async {
            let mut lines = self.inner.stdout.lock().await;
            loop {
                let line = lines
                    .next_line()
                    .await
                    .map_err(|e| Error::Session(format!("failed to read agent stream: {e}")))?;
                let Some(line) = line else {
                    return Ok(());
                };
                match session::parse_line(self.inner.protocol, &line) {
                    Some(SessionEvent::MessageDelta(delta)) => {
                        had_delta = true;
                        accumulated.push_str(&delta);
                        sink.delta(&self.inner.name, &delta);
                    }
                    Some(SessionEvent::Message(content)) => {
                        final_message = Some(content);
                    }
                    Some(SessionEvent::Tool { name, label }) => {
                        sink.tool_activity(&self.inner.name, &name, label.as_deref());
                    }
                    Some(SessionEvent::Idle) => return Ok(()),
                    Some(SessionEvent::SessionError(message)) => {
                        return Err(Error::Session(message));
                    }
                    None => debug!(agent = %self.inner.name, "ignoring unrecognized stream line"),
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, consume).await;
        match outcome {
            Err(_) => Err(Error::Agent(format!(
                "agent '{}' timed out after {}ms",
                self.inner.name,
                timeout.as_millis()
            ))),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                if had_delta {
                    Ok(accumulated)
                } else if let Some(message) = final_message {
                    Ok(message)
                } else {
                    Err(Error::Session(format!(
                        "empty response from agent '{}'",
                        self.inner.name
                    )))
                }
            }
        }
    }

    /// Graceful stop (close stdin, SIGTERM the process group), escalating to
    /// a forceful kill after `GRACEFUL_STOP_TIMEOUT`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            self.inner.stdin.lock().await.take();
        }
        let mut child = self.inner.child.lock().await;

        #[cfg(unix)]
        if let Some(pid) = self.inner.pid {
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
        }

        let waited = tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                debug!(agent = %self.inner.name, ?status, "agent stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Agent(format!(
                "failed waiting for agent '{}': {e}",
                self.inner.name
            ))),
            Err(_) => {
                warn!(
                    agent = %self.inner.name,
                    "agent did not stop within {GRACEFUL_STOP_TIMEOUT:?}, killing"
                );
                #[cfg(unix)]
                if let Some(pid) = self.inner.pid {
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGKILL);
                    }
                }
                child
                    .kill()
                    .await
                    .map_err(|e| Error::Agent(format!("failed to kill agent '{}': {e}", self.inner.name)))
            }
        }
    }
}

async fn write_lines(stdin: &mut ChildStdin, lines: &[&str]) -> std::io::Result<()> {
    for line in lines {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }
    stdin.flush().await
}

#[derive(Default)]
struct RuntimeState {
    handles: Mutex<HashMap<u64, AgentHandle>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

/// Process-wide registry of live agent handles.
#[derive(Clone, Default)]
pub struct AgentRuntime {
    state: Arc<RuntimeState>,
}

impl AgentRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the command, resolve it on PATH, and start the subprocess
    /// with the argument vector unchanged.
    pub async fn spawn(&self, spec: &ReviewerSpec) -> Result<AgentHandle> {
        if self.state.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        validate_command(&spec.cli_path)?;
        let resolved = which::which(&spec.cli_path).map_err(|e| {
            Error::Agent(format!("cannot resolve '{}' on PATH: {e}", spec.cli_path))
        })?;

        info!(
            agent = %spec.name,
            command = %resolved.display(),
            args = ?redact_args(&spec.cli_args),
            "spawning agent"
        );

        let mut command = Command::new(&resolved);
        command
            .args(&spec.cli_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Agent(format!("failed to spawn '{}': {e}", spec.cli_path)))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent("agent stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("agent stdout is not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Agent("agent stderr is not piped".to_string()))?;

        let stderr_name = spec.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[agent:{stderr_name}] {line}");
            }
        });

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = AgentHandle {
            inner: Arc::new(HandleState {
                id,
                name: spec.name.clone(),
                model: spec.model.clone(),
                protocol: spec.protocol,
                streaming: spec.streaming.unwrap_or(true),
                pid,
                child: Mutex::new(child),
                stdin: Mutex::new(Some(stdin)),
                stdout: Mutex::new(BufReader::new(stdout).lines()),
                stopped: AtomicBool::new(false),
            }),
        };

        self.state.handles.lock().await.insert(id, handle.clone());
        Ok(handle)
    }

    /// Stop a handle and forget it.
    pub async fn stop(&self, handle: &AgentHandle) -> Result<()> {
        self.state.handles.lock().await.remove(&handle.inner.id);
        handle.stop().await
    }

    /// Refuse further spawns and stop every live handle. All stops are
    /// attempted; failures are logged.
    pub async fn shutdown(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<AgentHandle> =
            self.state.handles.lock().await.drain().map(|(_, h)| h).collect();
        let stops = handles.iter().map(|h| h.stop());
        for (handle, outcome) in handles.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = outcome {
                warn!(agent = %handle.name(), error = %e, "failed to stop agent during shutdown");
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.state.handles.lock().await.len()
    }
}

/// Catalog entry for an agent CLI this system knows how to drive.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownAgent {
    pub name: String,
    pub cli_path: String,
    pub cli_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    pub description: String,
    pub installed: bool,
}

/// Known agent CLIs, with an installed probe against PATH.
pub fn known_agents() -> Vec<KnownAgent> {
    let catalog: &[(&str, &str, &[&str], Option<Protocol>, &str)] = &[
        ("Claude", "claude", &[], None, "Anthropic Claude Code CLI"),
        ("Codex", "codex", &[], None, "OpenAI Codex CLI"),
        ("Gemini", "gemini", &[], None, "Google Gemini CLI"),
        (
            "Copilot",
            "copilot",
            &[],
            Some(Protocol::NativeCopilot),
            "GitHub Copilot CLI",
        ),
    ];
    catalog
        .iter()
        .map(|(name, cli, args, protocol, description)| KnownAgent {
            name: name.to_string(),
            cli_path: cli.to_string(),
            cli_args: args.iter().map(|s| s.to_string()).collect(),
            protocol: *protocol,
            description: description.to_string(),
            installed: which::which(cli).is_ok(),
        })
        .collect()
}
