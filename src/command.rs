//! Host command execution used for rescans, udev, and mount handling.
//!
//! Everything that shells out goes through [`CommandRunner`] so tests can
//! substitute scripted outcomes without spawning processes. [`SudoRunner`]
//! layers the configured privilege helper over any runner.

use std::ffi::OsString;
use std::process::Command;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised while running host commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that could not be started.
        program: String,
        /// Error message from the operating system.
        message: String,
    },
    /// Raised when the process exits with a non-zero status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Failed {
        /// Rendered command line that failed.
        program: String,
        /// Exit status reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
}

/// Seam for host commands: rescans, udev, and mount tooling.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs `program args...` and requires a zero exit status.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] when the command cannot be started and
    /// [`CommandError::Failed`] when it exits unsuccessfully.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
        let rendered = render_command(program, &argv);
        let output = self.run(program, &argv)?;
        debug!(
            command = %rendered,
            code = ?output.code,
            stdout = %output.stdout.trim(),
            stderr = %output.stderr.trim(),
            "command finished"
        );
        if output.is_success() {
            return Ok(output);
        }

        Err(CommandError::Failed {
            program: rendered,
            status: output.code,
            status_text: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Spawns host processes and captures their output.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runner that elevates every command through a privilege helper such as
/// `sudo`. With no helper configured, commands go straight to the inner
/// runner.
#[derive(Clone, Debug, Default)]
pub struct SudoRunner<R> {
    inner: R,
    sudo_bin: Option<String>,
}

impl<R> SudoRunner<R> {
    /// Wraps `inner`; a blank `sudo_bin` runs commands directly.
    #[must_use]
    pub fn new(inner: R, sudo_bin: &str) -> Self {
        let trimmed = sudo_bin.trim();
        Self {
            inner,
            sudo_bin: (!trimmed.is_empty()).then(|| trimmed.to_owned()),
        }
    }

    /// Wraps `inner` without a privilege helper.
    #[must_use]
    pub const fn direct(inner: R) -> Self {
        Self {
            inner,
            sudo_bin: None,
        }
    }
}

impl<R: CommandRunner> CommandRunner for SudoRunner<R> {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let Some(sudo) = &self.sudo_bin else {
            debug!(command = %render_command(program, args), "running command");
            return self.inner.run(program, args);
        };
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(OsString::from(program));
        argv.extend(args.iter().cloned());
        debug!(command = %render_command(sudo, &argv), "running command");
        self.inner.run(sudo, &argv)
    }
}

/// Renders a command line with shell escaping for log output.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = escape(program.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&escape(arg.to_string_lossy()));
    }
    rendered
}
