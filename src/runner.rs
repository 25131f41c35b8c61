//! Entry points
//!
//! `spawn` runs a command directly, `fork` runs a script through the configured
//! interpreter. Both return a [`Process`] in its registration phase. An
//! [`Instance`] carries default options (and optionally a launcher) that every
//! process it creates starts from.

use std::sync::Arc;

use crate::config::LaunchOptions;
use crate::launch::{Launch, LaunchMethod, StdLauncher};
use crate::process::Process;
use crate::state::ProcessResult;

/// Start a command directly, with options from the environment.
pub fn spawn(command: impl Into<String>) -> Process {
    Process::new(LaunchMethod::Spawn, command, Vec::<String>::new(), LaunchOptions::from_env())
}

/// Start a command directly with arguments and options.
pub fn spawn_with<I, S>(command: impl Into<String>, args: I, options: &LaunchOptions) -> Process
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Process::new(LaunchMethod::Spawn, command, args, LaunchOptions::from_env().merge(options))
}

/// Run a script through the interpreter, with options from the environment.
pub fn fork(script: impl Into<String>) -> Process {
    Process::new(LaunchMethod::Fork, script, Vec::<String>::new(), LaunchOptions::from_env())
}

/// Run a script through the interpreter with arguments and options.
pub fn fork_with<I, S>(script: impl Into<String>, args: I, options: &LaunchOptions) -> Process
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Process::new(LaunchMethod::Fork, script, args, LaunchOptions::from_env().merge(options))
}

/// A process factory with default options
#[derive(Clone)]
pub struct Instance {
    method: LaunchMethod,
    options: LaunchOptions,
    launcher: Arc<dyn Launch>,
}

impl Instance {
    /// Create an instance. `options` are overlaid on the environment defaults.
    pub fn new(method: LaunchMethod, options: LaunchOptions) -> Self {
        Self {
            method,
            options: LaunchOptions::from_env().merge(&options),
            launcher: Arc::new(StdLauncher),
        }
    }

    /// Use a custom launcher for every process this instance creates
    pub fn launcher(mut self, launcher: impl Launch + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn method(&self) -> LaunchMethod {
        self.method
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Create a process with the instance defaults
    pub fn run(&self, command: impl Into<String>) -> Process {
        self.run_with(command, Vec::<String>::new(), &LaunchOptions::default())
    }

    /// Create a process; per-call options win over the instance defaults
    pub fn run_with<I, S>(&self, command: impl Into<String>, args: I, options: &LaunchOptions) -> Process
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Process::new(self.method, command, args, self.options.merge(options)).shared_launcher(self.launcher.clone())
    }
}

/// Instance that spawns commands directly
pub fn spawn_instance(options: LaunchOptions) -> Instance {
    Instance::new(LaunchMethod::Spawn, options)
}

/// Instance that forks scripts through the interpreter
pub fn fork_instance(options: LaunchOptions) -> Instance {
    Instance::new(LaunchMethod::Fork, options)
}

/// Run a process to completion and panic with a readable report on failure.
///
/// Usage in cargo tests:
/// ```rust,ignore
/// #[test]
/// fn test_greeting() {
///     let process = emx_proctest::fork("tests/fixtures/hello.sh")
///         .expect(emx_proctest::Field::Stdout, "hello");
///     emx_proctest::run_and_assert(process);
/// }
/// ```
pub fn run_and_assert(process: Process) -> ProcessResult {
    let mut report = None;
    process.end_with(|this, outcome| {
        report = Some(match outcome {
            Ok(result) => Ok(result),
            Err(err) => Err(format!(
                "{}\n  command: {} {} {}\n  stdout: {:?}\n  stderr: {:?}\n  code: {:?}",
                err,
                this.method(),
                this.command(),
                this.args().join(" "),
                this.stdout,
                this.stderr,
                this.code,
            )),
        });
    });
    match report {
        Some(Ok(result)) => result,
        Some(Err(msg)) => panic!("{}", msg),
        None => panic!("process settled without an outcome"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::launch::{ChildControl, Exit, LaunchRequest, LaunchedChild};
    use crate::rule::Field;

    /// Records what it was asked to launch and prints the resolved program line
    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(String, Vec<String>, LaunchOptions)>>>,
    }

    struct Exited;

    impl ChildControl for Exited {
        fn wait_timeout(&mut self, _timeout: Duration) -> io::Result<Option<Exit>> {
            Ok(Some(Exit { code: Some(0) }))
        }

        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Launch for Recorder {
        fn launch(&self, request: &LaunchRequest<'_>) -> io::Result<LaunchedChild> {
            let program = request.program().to_string();
            let args = request.program_args();
            let line = format!("{} {}", program, args.join(" "));
            self.seen.lock().unwrap().push((program, args, request.options.clone()));
            Ok(LaunchedChild {
                stdin: None,
                stdout: Some(Box::new(io::Cursor::new(line.into_bytes()))),
                stderr: None,
                control: Box::new(Exited),
            })
        }
    }

    #[test]
    fn test_instance_merges_options() {
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let instance = fork_instance(LaunchOptions::new().interpreter("bash").env("A", "1").cwd("/base"))
            .launcher(recorder);

        let call = LaunchOptions::new().cwd("/call").env("A", "2");
        let result = run_and_assert(
            instance
                .run_with("script.sh", ["x"], &call)
                .expect(Field::Stdout, "bash script.sh x"),
        );
        assert_eq!(result.code, Some(0));

        let seen = seen.lock().unwrap();
        let (program, args, options) = &seen[0];
        assert_eq!(program, "bash");
        assert_eq!(args, &vec!["script.sh".to_string(), "x".to_string()]);
        assert_eq!(options.cwd.as_deref(), Some(std::path::Path::new("/call")));
        assert_eq!(options.env.last(), Some(&("A".to_string(), "2".to_string())));
    }

    #[test]
    fn test_instance_shares_launcher_across_runs() {
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let instance = spawn_instance(LaunchOptions::new()).launcher(recorder);

        run_and_assert(instance.run("first"));
        run_and_assert(instance.run("second").arg("--flag"));

        let programs: Vec<String> = seen.lock().unwrap().iter().map(|(p, _, _)| p.clone()).collect();
        assert_eq!(programs, vec!["first", "second"]);
        assert_eq!(instance.method(), LaunchMethod::Spawn);
    }

    #[test]
    #[should_panic(expected = "AssertionError [stdout]")]
    fn test_run_and_assert_panics_on_failure() {
        let process = spawn("anything")
            .launcher(Recorder::default())
            .expect(Field::Stdout, "something else");
        run_and_assert(process);
    }
}
