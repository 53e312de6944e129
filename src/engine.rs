//! Reconstruction engine boundary.
//!
//! The orchestrator only needs "run this operation with these paths and tell
//! me how it ended". `CommandEngine` does that with a child process; tests
//! substitute their own engine.
use crate::config::EngineConfig;
use crate::interrupt::Interrupt;
use crate::stage::StageId;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How an engine operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    Success,
    Code(i32),
    Signal(i32),
    Interrupted,
    LaunchFailed(String),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Success)
    }

    pub fn from_status(status: &ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Success;
        }
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(-1)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "success"),
            ExitOutcome::Code(code) => write!(f, "exit status {code}"),
            ExitOutcome::Signal(signal) => write!(f, "terminated by signal {signal}"),
            ExitOutcome::Interrupted => write!(f, "interrupted"),
            ExitOutcome::LaunchFailed(reason) => write!(f, "could not launch: {reason}"),
        }
    }
}

/// One engine operation with its arguments.
#[derive(Debug, Clone, Copy)]
pub struct OperationRequest<'a> {
    pub stage: StageId,
    pub operation: &'a str,
    pub args: &'a [OsString],
}

pub trait ReconstructionEngine {
    /// Run one operation to completion. `Err` means it could not be started.
    fn execute(&self, request: &OperationRequest<'_>) -> Result<ExitOutcome>;

    /// Human-readable command line for progress records.
    fn describe(&self, request: &OperationRequest<'_>) -> String {
        let mut parts = vec![request.operation.to_string()];
        parts.extend(lossy_args(request.args));
        shell_words::join(parts)
    }
}

/// Runs operations as `<launcher...> <operation> <args...>` child processes.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    launcher: Vec<String>,
    env: BTreeMap<String, String>,
    interrupt: Interrupt,
}

impl CommandEngine {
    pub fn from_config(config: &EngineConfig, interrupt: Interrupt) -> Result<Self> {
        let launcher = shell_words::split(&config.command)
            .with_context(|| format!("parse engine command {:?}", config.command))?;
        if launcher.is_empty() {
            return Err(anyhow!("engine command is empty"));
        }
        Ok(Self {
            launcher,
            env: config.env.clone(),
            interrupt,
        })
    }
}

impl ReconstructionEngine for CommandEngine {
    fn execute(&self, request: &OperationRequest<'_>) -> Result<ExitOutcome> {
        let program = which::which(&self.launcher[0])
            .with_context(|| format!("locate engine program {:?}", self.launcher[0]))?;
        let mut cmd = Command::new(&program);
        cmd.args(&self.launcher[1..]);
        cmd.arg(request.operation);
        cmd.args(request.args);
        cmd.envs(&self.env);
        cmd.stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} {}", program.display(), request.operation))?;
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("wait for {}", request.operation))?
            {
                return Ok(ExitOutcome::from_status(&status));
            }
            if self.interrupt.is_raised() {
                tracing::warn!(operation = request.operation, "terminating engine operation");
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ExitOutcome::Interrupted);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn describe(&self, request: &OperationRequest<'_>) -> String {
        let mut parts = self.launcher.clone();
        parts.push(request.operation.to_string());
        parts.extend(lossy_args(request.args));
        shell_words::join(parts)
    }
}

fn lossy_args(args: &[OsString]) -> impl Iterator<Item = String> + '_ {
    args.iter().map(|arg| arg.to_string_lossy().into_owned())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
