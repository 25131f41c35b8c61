//! Launch options and harness defaults
//!
//! Defaults can be set from the environment:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `PROCTEST_INTERPRETER` | interpreter used by `fork` (default `sh`) |
//! | `PROCTEST_DEBUG` | echo level: `0`, `1`, `2`, `true`, `false` |
//! | `PROCTEST_TIMEOUT_MS` | kill the child after this many milliseconds |

use std::path::PathBuf;
use std::time::Duration;

/// Interpreter used by `fork` when nothing else is configured
pub const DEFAULT_INTERPRETER: &str = "sh";

pub const ENV_INTERPRETER: &str = "PROCTEST_INTERPRETER";
pub const ENV_DEBUG: &str = "PROCTEST_DEBUG";
pub const ENV_TIMEOUT_MS: &str = "PROCTEST_TIMEOUT_MS";

/// Options passed to the launcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Working directory of the child (inherits ours when unset)
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, applied in order (later entries win)
    pub env: Vec<(String, String)>,
    /// Start the child with an empty environment before applying `env`
    pub env_clear: bool,
    /// Interpreter for `fork`
    pub interpreter: Option<String>,
    /// Arguments placed between the interpreter and the script
    pub interpreter_args: Vec<String>,
    /// Kill the child once this much time has passed
    pub timeout: Option<Duration>,
    /// Let the child write straight to our stdout/stderr (spawn only).
    /// Nothing is captured in that case.
    pub inherit_stdio: bool,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options seeded from `PROCTEST_INTERPRETER` and `PROCTEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(interp) = std::env::var(ENV_INTERPRETER) {
            if !interp.trim().is_empty() {
                opts.interpreter = Some(interp);
            }
        }
        if let Ok(ms) = std::env::var(ENV_TIMEOUT_MS) {
            match ms.trim().parse::<u64>() {
                Ok(ms) => opts.timeout = Some(Duration::from_millis(ms)),
                Err(_) => tracing::warn!(value = %ms, "ignoring invalid {}", ENV_TIMEOUT_MS),
            }
        }
        opts
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_clear(mut self, clear: bool) -> Self {
        self.env_clear = clear;
        self
    }

    pub fn interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn interpreter_arg(mut self, arg: impl Into<String>) -> Self {
        self.interpreter_args.push(arg.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }

    /// The interpreter `fork` should run.
    pub fn resolved_interpreter(&self) -> &str {
        self.interpreter.as_deref().unwrap_or(DEFAULT_INTERPRETER)
    }

    /// Overlay `other` on top of `self`.
    ///
    /// Scalar options set in `other` win, environment lists are concatenated
    /// so `other`'s entries are applied last.
    pub fn merge(&self, other: &LaunchOptions) -> LaunchOptions {
        let mut env = self.env.clone();
        env.extend(other.env.iter().cloned());
        LaunchOptions {
            cwd: other.cwd.clone().or_else(|| self.cwd.clone()),
            env,
            env_clear: self.env_clear || other.env_clear,
            interpreter: other.interpreter.clone().or_else(|| self.interpreter.clone()),
            interpreter_args: if other.interpreter_args.is_empty() {
                self.interpreter_args.clone()
            } else {
                other.interpreter_args.clone()
            },
            timeout: other.timeout.or(self.timeout),
            inherit_stdio: self.inherit_stdio || other.inherit_stdio,
        }
    }
}

/// Which captured streams get echoed to the harness's own stdout/stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    #[default]
    Off,
    Stdout,
    Stderr,
    Both,
}

impl DebugLevel {
    /// Level from `PROCTEST_DEBUG`, `Off` when unset or unparseable.
    pub fn from_env() -> Self {
        match std::env::var(ENV_DEBUG) {
            Ok(v) => Self::parse(&v).unwrap_or_default(),
            Err(_) => DebugLevel::Off,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "false" | "off" => Some(DebugLevel::Off),
            "true" | "on" => Some(DebugLevel::Both),
            n => n.parse::<u8>().ok().map(DebugLevel::from),
        }
    }

    pub fn echo_stdout(self) -> bool {
        matches!(self, DebugLevel::Stdout | DebugLevel::Both)
    }

    pub fn echo_stderr(self) -> bool {
        matches!(self, DebugLevel::Stderr | DebugLevel::Both)
    }
}

impl From<bool> for DebugLevel {
    fn from(on: bool) -> Self {
        if on {
            DebugLevel::Both
        } else {
            DebugLevel::Off
        }
    }
}

impl From<u8> for DebugLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => DebugLevel::Off,
            1 => DebugLevel::Stdout,
            2 => DebugLevel::Stderr,
            _ => DebugLevel::Both,
        }
    }
}
