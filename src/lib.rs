//! emx-proctest: fluent assertions for child processes
//!
//! Launch a command or script, feed it stdin, answer its prompts, and check
//! its stdout, stderr, exit code and launch error once it terminates.
//!
//! # Overview
//!
//! ```rust,ignore
//! use emx_proctest::{fork, Field, Prompt};
//!
//! fork("tests/fixtures/prompt.sh")
//!     .prompt(Prompt::new("Are you waiting?", "yes"))
//!     .expect(Field::Stdout, "Are you waiting? yes\n")
//!     .expect(Field::Code, 0)
//!     .end_with(|this, outcome| {
//!         outcome.expect("expectations hold");
//!         assert!(this.expect(Field::Stderr, "").is_ok());
//!     });
//! ```
//!
//! A [`Process`] is a builder: nothing runs until it is sealed with
//! [`Process::end_with`] (callback on the calling thread) or [`Process::end`]
//! (a [`Deferred`] result supervised on a background thread). Expectations are
//! checked in registration order after the child has exited and its output
//! streams have closed; the first failure is reported.
//!
//! # Expectations
//!
//! | Expected value | Holds when |
//! |----------------|------------|
//! | text | the field is exactly this text |
//! | integer | the exit code is exactly this integer |
//! | [`regex::Regex`] | the field, as text, matches (absent values never match) |
//! | [`Expected::error`] | the launch error has this message |
//! | [`Expected::Absent`] | the field holds nothing |
//! | list | every element holds |
//!
//! `not_expect` negates each element of the list on its own.
//!
//! # Environment
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `PROCTEST_INTERPRETER` | interpreter used by `fork` (default `sh`) |
//! | `PROCTEST_DEBUG` | echo captured output: `0`, `1`, `2`, `true`, `false` |
//! | `PROCTEST_TIMEOUT_MS` | default timeout |

mod config;
mod error;
mod launch;
pub mod logging;
mod process;
mod prompt;
mod rule;
mod runner;
mod settle;
mod state;

pub use config::{DebugLevel, LaunchOptions, DEFAULT_INTERPRETER, ENV_DEBUG, ENV_INTERPRETER, ENV_TIMEOUT_MS};
pub use error::{ErrorKind, HarnessError};
pub use launch::{
    ChildControl, Exit, Launch, LaunchError, LaunchErrorKind, LaunchMethod, LaunchRequest, LaunchedChild,
    StdLauncher,
};
pub use process::{Finished, Input, Process, Ready};
pub use prompt::{Progress, Prompt, PromptDriver, Prompts, Question};
pub use rule::{unescape, Expectation, Expected, Field};
pub use runner::{fork, fork_instance, fork_with, run_and_assert, spawn, spawn_instance, spawn_with, Instance};
pub use settle::{Deferred, Outcome};
pub use state::ProcessResult;

// Re-exported so callers can build pattern expectations without a direct dependency
pub use regex::Regex;
