/// External process execution
///
/// Commands are always built as an argument vector; nothing is routed
/// through a shell, so container names, paths and tokens never need quoting.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;
use tracing::debug;

use crate::core::error::{ManagerError, Result};

/// A program plus its arguments, ready to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// True when the argument vector contains `needle` as a contiguous run
    pub fn contains_args(&self, needle: &[&str]) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.args
            .windows(needle.len())
            .any(|w| w.iter().zip(needle).all(|(a, b)| a == b))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Child shares our stdout/stderr
    Inherit,
    /// Stdout is collected and returned trimmed
    Capture,
}

/// Runs external commands.
///
/// Production code uses [`SystemRunner`]; tests provide a recording fake.
pub trait CommandRunner: Send + Sync {
    /// Execute `command`. Returns captured stdout (empty when inheriting).
    ///
    /// A non-zero exit, a missing program and a spawn error all surface as
    /// [`ManagerError::CommandFailed`].
    fn execute<'a>(&'a self, command: &'a CommandLine, mode: OutputMode)
        -> BoxFuture<'a, Result<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run(command: &CommandLine, mode: OutputMode) -> Result<String> {
        debug!(command = %command, ?mode, "executing");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).stdin(Stdio::inherit());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let failed = |reason: String| ManagerError::CommandFailed {
            command: command.to_string(),
            reason,
        };

        match mode {
            OutputMode::Inherit => {
                let status = cmd
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()
                    .await
                    .map_err(|e| failed(e.to_string()))?;

                if !status.success() {
                    return Err(failed(status.to_string()));
                }
                Ok(String::new())
            }
            OutputMode::Capture => {
                let output = cmd
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()
                    .await
                    .map_err(|e| failed(e.to_string()))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let reason = match stderr.trim() {
                        "" => output.status.to_string(),
                        msg => format!("{}: {}", output.status, msg),
                    };
                    return Err(failed(reason));
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
        }
    }
}

impl CommandRunner for SystemRunner {
    fn execute<'a>(&'a self, command: &'a CommandLine, mode: OutputMode)
        -> BoxFuture<'a, Result<String>> {
        Self::run(command, mode).boxed()
    }
}
