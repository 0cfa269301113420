//! Task execution seam.
//!
//! The queue only knows [`TaskExecutor`]. [`CommandExecutor`] is the stock implementation used by
//! the daemon binary: it hands each request to an external program and reads a [`TaskOutcome`]
//! back from its stdout.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use taskrelay_common::config::ExecutorSection;
use taskrelay_common::{Message, Severity, TaskOutcome};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command as TokioCommand};
use tracing::{debug, info, warn};

const LOG_SNIPPET_LIMIT: usize = 512;

/// Payload handed to the executor for one dequeued request.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub request_id: Option<String>,
    pub kind: String,
    pub data: Map<String, Value>,
    pub enqueued_at: Instant,
}

impl TaskRequest {
    pub fn from_message(msg: &Message, enqueued_at: Instant) -> Self {
        Self {
            request_id: msg.request_id().map(str::to_owned),
            kind: msg.kind.clone(),
            data: msg.data.clone(),
            enqueued_at,
        }
    }
}

/// Performs the actual action behind a request.
///
/// An `Err` is not fatal to the queue: the worker turns it into a failed terminal message.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome>;
}

/// Runs an external program per request.
///
/// The request `data` is written to the program's stdin as one JSON object. The last JSON line
/// of stdout is read as the outcome; empty stdout with a zero exit status counts as success.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn from_config(section: &ExecutorSection) -> Result<Self> {
        let program = section
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("executor program not configured"))?;

        if Path::new(program)
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("executor program contains parent directory traversal");
        }

        let mut executor = Self::new(program, section.args.clone());
        executor.working_dir = section.working_dir.clone();
        Ok(executor)
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutcome> {
        let mut command = TokioCommand::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("TASKRELAY_REQUEST_TYPE", &request.kind);
        if let Some(id) = &request.request_id {
            command.env("TASKRELAY_REQUEST_ID", id);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        info!(
            program = %self.program,
            args = ?self.args,
            request_id = ?request.request_id,
            "Invoking executor subprocess"
        );

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        let payload = serde_json::to_vec(&request.data)?;
        let stdin = child.stdin.take();

        // Output is drained while stdin is fed; a program that writes before reading would
        // otherwise fill its pipe and stall.
        let (_, output) = tokio::join!(feed_stdin(stdin, payload), child.wait_with_output());
        let output = output.context("failed to wait for executor process")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            stdout = %summarize_for_log(&stdout),
            stderr = %summarize_for_log(&stderr),
            "Executor process finished"
        );

        if !output.status.success() {
            warn!(code = ?output.status.code(), "Executor exited with non-zero status");
            let reason = match (stderr.trim(), output.status.code()) {
                ("", Some(code)) => format!("exit code {code}"),
                ("", None) => "terminated by signal".to_string(),
                (text, _) => text.to_string(),
            };
            return Ok(TaskOutcome::failure(
                Severity::Error,
                format!("'{}' failed: {}", self.program, reason),
            ));
        }

        parse_outcome(&stdout)
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, payload: Vec<u8>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // The program may exit without draining stdin.
    if let Err(err) = stdin.write_all(&payload).await {
        debug!("Executor stdin closed early: {}", err);
    }
}

fn parse_outcome(stdout: &str) -> Result<TaskOutcome> {
    if stdout.trim().is_empty() {
        return Ok(TaskOutcome::success());
    }

    if let Ok(outcome) = serde_json::from_str::<TaskOutcome>(stdout) {
        return Ok(outcome);
    }

    for line in stdout.lines().rev() {
        let candidate = line.trim();
        if candidate.is_empty() {
            continue;
        }
        if let Ok(outcome) = serde_json::from_str::<TaskOutcome>(candidate) {
            return Ok(outcome);
        }
    }

    Err(anyhow!(
        "unable to parse executor output: {}",
        summarize_for_log(stdout)
    ))
}

fn summarize_for_log(payload: &str) -> String {
    if payload.len() <= LOG_SNIPPET_LIMIT {
        return payload.to_string();
    }
    let mut end = LOG_SNIPPET_LIMIT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}… (truncated {} chars)",
        &payload[..end],
        payload.len() - end
    )
}
