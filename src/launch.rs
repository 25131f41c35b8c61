//! Launching the child process
//!
//! The controller never touches `std::process` directly: it asks a [`Launch`]
//! implementation for a [`LaunchedChild`] and only talks to the handle's
//! streams and its [`ChildControl`]. [`StdLauncher`] is the real thing; tests
//! plug in scripted launchers.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

use crate::config::LaunchOptions;

/// How the command is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMethod {
    /// Run the command directly
    Spawn,
    /// Run the command as a script through the configured interpreter.
    /// Stdio is always captured.
    Fork,
}

impl fmt::Display for LaunchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMethod::Spawn => write!(f, "spawn"),
            LaunchMethod::Fork => write!(f, "fork"),
        }
    }
}

/// Everything a launcher needs to start one child
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub method: LaunchMethod,
    pub command: &'a str,
    pub args: &'a [String],
    pub options: &'a LaunchOptions,
}

impl<'a> LaunchRequest<'a> {
    /// The program that actually gets executed.
    pub fn program(&self) -> &'a str {
        match self.method {
            LaunchMethod::Spawn => self.command,
            LaunchMethod::Fork => self.options.resolved_interpreter(),
        }
    }

    /// Arguments passed to [`program`](Self::program).
    pub fn program_args(&self) -> Vec<String> {
        match self.method {
            LaunchMethod::Spawn => self.args.to_vec(),
            LaunchMethod::Fork => {
                let mut args = self.options.interpreter_args.clone();
                args.push(self.command.to_string());
                args.extend(self.args.iter().cloned());
                args
            }
        }
    }

    /// Whether stdout/stderr are piped back to the harness.
    pub fn captures_output(&self) -> bool {
        self.method == LaunchMethod::Fork || !self.options.inherit_stdio
    }
}

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// Exit code, `None` when the child was killed by a signal
    pub code: Option<i32>,
}

/// Control half of a live child
pub trait ChildControl: Send {
    /// Wait up to `timeout` for the child to exit. `Duration::ZERO` polls.
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<Exit>>;

    /// Ask the child to terminate. Killing an exited child is not an error.
    fn kill(&mut self) -> io::Result<()>;

    /// OS process id, when there is one
    fn id(&self) -> Option<u32> {
        None
    }
}

/// A live child: its streams and its control handle
pub struct LaunchedChild {
    pub stdin: Option<Box<dyn Write + Send>>,
    pub stdout: Option<Box<dyn Read + Send>>,
    pub stderr: Option<Box<dyn Read + Send>>,
    pub control: Box<dyn ChildControl>,
}

/// The launch capability
pub trait Launch: Send + Sync {
    fn launch(&self, request: &LaunchRequest<'_>) -> io::Result<LaunchedChild>;
}

/// Launcher backed by `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLauncher;

impl Launch for StdLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> io::Result<LaunchedChild> {
        let program = request.program();
        let args = request.program_args();
        let options = request.options;

        let mut cmd = Command::new(program);
        cmd.args(&args);
        if let Some(ref cwd) = options.cwd {
            cmd.current_dir(cwd);
        }
        if options.env_clear {
            cmd.env_clear();
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }

        cmd.stdin(Stdio::piped());
        if request.captures_output() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        let mut child = cmd.spawn()?;
        debug!(pid = child.id(), program, method = %request.method, "child started");

        Ok(LaunchedChild {
            stdin: child.stdin.take().map(|s| Box::new(s) as Box<dyn Write + Send>),
            stdout: child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            stderr: child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            control: Box::new(StdChild(child)),
        })
    }
}

struct StdChild(Child);

impl ChildControl for StdChild {
    fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<Exit>> {
        Ok(self.0.wait_timeout(timeout)?.map(|status| Exit { code: status.code() }))
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.0.kill() {
            // already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }
}

// ──────────────────────────────────────────────────────────
// LaunchError: what ends up on the `error` field
// ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchErrorKind {
    /// The child could not be started
    Spawn,
    /// The child outlived its timeout and was killed
    Timeout,
    /// Talking to the child failed after it started
    Io,
}

/// A launch failure recorded on the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    /// errno-style code (`ENOENT`, `EACCES`, `ETIMEDOUT`, ...) when known
    pub code: Option<&'static str>,
    pub message: String,
}

impl LaunchError {
    /// `spawn <program> <CODE>`, or the OS message when no code is known.
    pub fn spawn(program: &str, err: &io::Error) -> Self {
        let code = errno_name(err);
        let message = match code {
            Some(code) => format!("spawn {} {}", program, code),
            None => format!("spawn {}: {}", program, err),
        };
        Self {
            kind: LaunchErrorKind::Spawn,
            code,
            message,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: LaunchErrorKind::Timeout,
            code: Some("ETIMEDOUT"),
            message: format!("timeout: process killed after {}ms", after.as_millis()),
        }
    }

    pub fn io(context: &str, err: &io::Error) -> Self {
        let code = errno_name(err);
        let message = match code {
            Some(code) => format!("{} {}", context, code),
            None => format!("{}: {}", context, err),
        };
        Self {
            kind: LaunchErrorKind::Io,
            code,
            message,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == LaunchErrorKind::Timeout
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LaunchError {}

fn errno_name(err: &io::Error) -> Option<&'static str> {
    match err.kind() {
        io::ErrorKind::NotFound => Some("ENOENT"),
        io::ErrorKind::PermissionDenied => Some("EACCES"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        io::ErrorKind::AlreadyExists => Some("EEXIST"),
        io::ErrorKind::InvalidInput => Some("EINVAL"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_request_passes_command_through() {
        let args = vec!["--version".to_string()];
        let opts = LaunchOptions::new();
        let req = LaunchRequest {
            method: LaunchMethod::Spawn,
            command: "node",
            args: &args,
            options: &opts,
        };
        assert_eq!(req.program(), "node");
        assert_eq!(req.program_args(), vec!["--version"]);
        assert!(req.captures_output());
    }

    #[test]
    fn test_fork_request_goes_through_interpreter() {
        let args = vec!["a".to_string(), "b".to_string()];
        let opts = LaunchOptions::new().interpreter("bash").interpreter_arg("-e");
        let req = LaunchRequest {
            method: LaunchMethod::Fork,
            command: "script.sh",
            args: &args,
            options: &opts,
        };
        assert_eq!(req.program(), "bash");
        assert_eq!(req.program_args(), vec!["-e", "script.sh", "a", "b"]);
    }

    #[test]
    fn test_fork_always_captures() {
        let opts = LaunchOptions::new().inherit_stdio(true);
        let fork = LaunchRequest {
            method: LaunchMethod::Fork,
            command: "x.sh",
            args: &[],
            options: &opts,
        };
        let spawn = LaunchRequest { method: LaunchMethod::Spawn, ..fork };
        assert!(fork.captures_output());
        assert!(!spawn.captures_output());
    }

    #[test]
    fn test_spawn_error_message() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        let launch = LaunchError::spawn("/nope/unknown.sh", &err);
        assert_eq!(launch.message(), "spawn /nope/unknown.sh ENOENT");
        assert_eq!(launch.code, Some("ENOENT"));
        assert_eq!(launch.kind, LaunchErrorKind::Spawn);
    }

    #[test]
    fn test_timeout_error_message() {
        let launch = LaunchError::timeout(Duration::from_millis(2500));
        assert!(launch.is_timeout());
        assert!(launch.to_string().contains("timeout"));
        assert!(launch.to_string().contains("2500ms"));
    }
}
