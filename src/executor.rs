//! The executor seam: how a claimed item is handed to whatever does the work.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::model::{FailureReport, RootCause, WorkItem};
use crate::router::BoundedContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub failure_report: Option<FailureReport>,
    #[serde(default)]
    pub artifacts_changed: Vec<String>,
}

impl ExecutionResult {
    pub fn succeeded(artifacts_changed: Vec<String>) -> Self {
        ExecutionResult {
            success: true,
            failure_report: None,
            artifacts_changed,
        }
    }

    pub fn failed(report: FailureReport) -> Self {
        ExecutionResult {
            success: false,
            failure_report: Some(report),
            artifacts_changed: Vec::new(),
        }
    }

    /// The report to run recovery on. A failure without a report is itself a
    /// protocol problem and is classified as such.
    pub fn failure(&self) -> Option<FailureReport> {
        if self.success {
            return None;
        }
        Some(self.failure_report.clone().unwrap_or_else(|| {
            FailureReport::new(
                RootCause::ConfigurationError,
                "executor reported failure without a failure report",
                "",
                "",
            )
        }))
    }
}

pub trait Executor: Sync {
    /// Run one dispatch. `Err` means the executor itself could not be driven
    /// (spawn failure, broken protocol); task failures are `Ok` results.
    fn dispatch(&self, item: &WorkItem, ctx: &BoundedContext) -> anyhow::Result<ExecutionResult>;
}

impl<F> Executor for F
where
    F: Fn(&WorkItem, &BoundedContext) -> anyhow::Result<ExecutionResult> + Sync,
{
    fn dispatch(&self, item: &WorkItem, ctx: &BoundedContext) -> anyhow::Result<ExecutionResult> {
        self(item, ctx)
    }
}

/// What the command executor writes to the child's stdin.
#[derive(Debug, Serialize)]
pub struct DispatchRequest<'a> {
    pub item: &'a WorkItem,
    pub context: &'a BoundedContext,
}

/// Runs an external command per dispatch.
///
/// The child receives a [`DispatchRequest`] as JSON on stdin and
/// `WORKQ_ITEM` / `WORKQ_TIER` in its environment. It answers with an
/// [`ExecutionResult`] as JSON on stdout; with empty stdout the exit status
/// decides. Each child leads its own process group. A child that overruns
/// the tier timeout is killed along with its group, and whatever it leaves
/// running in the group after a normal exit is killed too, so no stray
/// process can hold the output pipe open.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    pub command: String,
    pub args: Vec<String>,
    pub poll_interval: Duration,
}

impl CommandExecutor {
    pub fn new(command: &str, args: &[String]) -> Self {
        CommandExecutor {
            command: command.to_string(),
            args: args.to_vec(),
            poll_interval: Duration::from_millis(50),
        }
    }

    fn interpret(&self, status: ExitStatus, stdout: &str) -> anyhow::Result<ExecutionResult> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            if status.success() {
                return Ok(ExecutionResult::succeeded(Vec::new()));
            }
            return Ok(ExecutionResult::failed(FailureReport::new(
                RootCause::ImplementationBug,
                &format!("{} exited with {status}", self.command),
                "",
                "",
            )));
        }
        serde_json::from_str(trimmed)
            .with_context(|| format!("{} printed an invalid execution result", self.command))
    }
}

impl Executor for CommandExecutor {
    fn dispatch(&self, item: &WorkItem, ctx: &BoundedContext) -> anyhow::Result<ExecutionResult> {
        let payload = serde_json::to_vec(&DispatchRequest { item, context: ctx })?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("WORKQ_ITEM", &item.id)
            .env("WORKQ_TIER", ctx.tier.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command))?;

        // Feed stdin and drain stdout on their own threads so a chatty child
        // can't deadlock against us on full pipes.
        let mut stdin = child.stdin.take().context("child stdin not captured")?;
        let writer = thread::spawn(move || {
            if let Err(e) = stdin.write_all(&payload) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    warn!("failed to write dispatch request: {e}");
                }
            }
        });
        let mut stdout = child.stdout.take().context("child stdout not captured")?;
        let reader = thread::spawn(move || {
            let mut out = String::new();
            stdout.read_to_string(&mut out).map(|_| out)
        });

        let timeout = Duration::from_secs(ctx.timeout_secs);
        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("failed to poll executor")? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("{}: executor timed out after {}s, killing", item.id, ctx.timeout_secs);
                kill_group(&child);
                let _ = child.wait();
                let _ = writer.join();
                let _ = reader.join();
                return Ok(ExecutionResult::failed(FailureReport::timeout(ctx.timeout_secs)));
            }
            thread::sleep(self.poll_interval);
        };

        kill_group(&child);
        let _ = writer.join();
        let stdout = match reader.join() {
            Ok(res) => res.context("failed to read executor output")?,
            Err(_) => bail!("executor output reader panicked"),
        };
        debug!("{}: executor exited with {status}", item.id);
        self.interpret(status, &stdout)
    }
}

/// SIGKILL every process in the child's group. The group id is the child's
/// pid because it was spawned with `process_group(0)`.
fn kill_group(child: &Child) {
    unsafe { libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL) };
}
