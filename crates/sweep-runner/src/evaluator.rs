use crate::job::JobDescriptor;
use crate::spec::EvaluatorSpec;
use anyhow::Result;
use serde::Serialize;
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Search,
    FixedMapping,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Search => "search",
            Mode::FixedMapping => "fixed_mapping",
        }
    }
}

/// One call into the evaluator. `policy_or_mapping` is the mapper-policy file
/// in search mode and the stored mapping in fixed-mapping mode.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub mode: Mode,
    pub job: &'a JobDescriptor,
    pub policy_or_mapping: &'a Path,
    pub output_dir: &'a Path,
}

impl Invocation<'_> {
    /// Positional inputs, then the output designator.
    pub fn arguments(&self, output_flag: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .job
            .evaluator_inputs(self.policy_or_mapping)
            .iter()
            .map(|p| p.as_os_str().to_os_string())
            .collect();
        args.push(OsString::from(output_flag));
        args.push(self.output_dir.as_os_str().to_os_string());
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum InvocationStatus {
    Exited(i32),
    Signaled,
    TimedOut(u64),
    SpawnFailed(String),
}

impl InvocationStatus {
    pub fn success(&self) -> bool {
        matches!(self, InvocationStatus::Exited(0))
    }

    /// True when the process ran to completion on its own, whatever its code.
    pub fn completed(&self) -> bool {
        matches!(self, InvocationStatus::Exited(_))
    }

    pub fn describe(&self) -> String {
        match self {
            InvocationStatus::Exited(code) => format!("exit code {}", code),
            InvocationStatus::Signaled => "terminated by signal".to_string(),
            InvocationStatus::TimedOut(secs) => format!("timed out after {}s", secs),
            InvocationStatus::SpawnFailed(msg) => format!("failed to start: {}", msg),
        }
    }
}

impl From<ExitStatus> for InvocationStatus {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => InvocationStatus::Exited(code),
            None => InvocationStatus::Signaled,
        }
    }
}

/// The external evaluator. Implementations block until the evaluation is over.
pub trait Evaluator {
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<InvocationStatus>;

    /// File (relative to the output directory) that collects evaluator output.
    fn log_file(&self) -> Option<&str> {
        None
    }
}

/// Runs the evaluator as a child process inside the output directory, with
/// stdout and stderr appended to a log file there.
#[derive(Debug, Clone)]
pub struct ProcessEvaluator {
    command: Vec<String>,
    fixed_mapping_command: Option<Vec<String>>,
    output_flag: String,
    log_file: String,
    timeout: Option<Duration>,
}

impl ProcessEvaluator {
    pub fn from_spec(spec: &EvaluatorSpec) -> Self {
        Self {
            command: spec.command.clone(),
            fixed_mapping_command: spec.fixed_mapping_command.clone(),
            output_flag: spec.output_flag.clone(),
            log_file: spec.log_file.clone(),
            timeout: spec.timeout_seconds.map(Duration::from_secs),
        }
    }

    fn command_for(&self, mode: Mode) -> &[String] {
        match (mode, &self.fixed_mapping_command) {
            (Mode::FixedMapping, Some(cmd)) => cmd,
            _ => &self.command,
        }
    }
}

impl Evaluator for ProcessEvaluator {
    fn invoke(&self, invocation: &Invocation<'_>) -> Result<InvocationStatus> {
        let command = self.command_for(invocation.mode);
        let Some((program, prefix_args)) = command.split_first() else {
            return Ok(InvocationStatus::SpawnFailed("empty evaluator command".to_string()));
        };
        let args = invocation.arguments(&self.output_flag);

        let log_path = invocation.output_dir.join(&self.log_file);
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(
            log,
            "$ {}",
            shell_join(
                command
                    .iter()
                    .map(|s| Cow::Borrowed(s.as_str()))
                    .chain(args.iter().map(|a| a.to_string_lossy()))
            )
        )?;
        log.flush()?;

        let mut cmd = Command::new(program);
        cmd.args(prefix_args);
        cmd.args(&args);
        cmd.current_dir(invocation.output_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));

        debug!(
            mode = invocation.mode.as_str(),
            job = %invocation.job.label(),
            program = %program,
            "spawning evaluator"
        );
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::PermissionDenied => {
                return Ok(InvocationStatus::SpawnFailed(format!("{}: {}", program, e)));
            }
            Err(e) => return Err(e.into()),
        };
        wait_with_timeout(child, self.timeout)
    }

    fn log_file(&self) -> Option<&str> {
        Some(&self.log_file)
    }
}

fn wait_with_timeout(mut child: Child, timeout: Option<Duration>) -> Result<InvocationStatus> {
    let Some(timeout) = timeout else {
        return Ok(child.wait()?.into());
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.into());
        }
        if Instant::now() >= deadline {
            warn!(pid = child.id(), timeout_s = timeout.as_secs(), "evaluator timed out; killing");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(InvocationStatus::TimedOut(timeout.as_secs()));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Last non-empty line of the evaluator log, for failure messages.
pub fn log_tail(output_dir: &Path, log_file: &str) -> Option<String> {
    let path: PathBuf = output_dir.join(log_file);
    let bytes = fs::read(path).ok()?;
    String::from_utf8_lossy(&bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}

fn shell_join<'a>(parts: impl Iterator<Item = Cow<'a, str>>) -> String {
    parts.map(|p| shell_quote(&p)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
