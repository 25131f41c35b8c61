//! The process controller
//!
//! [`Process`] is a builder. Expectations, stdin writes, prompts and the ready
//! callback are registered by value, and nothing runs until [`Process::end`] or
//! [`Process::end_with`] seals it. Sealing launches the child and runs a single
//! supervision loop that owns all mutable state. Reader threads, the stdin
//! writer thread and the ready callback only exchange events with it, so a
//! child that never reads its input cannot stall the loop or its timeout.
//!
//! The child counts as terminated once it has exited and every captured stream
//! has reached end-of-file. Expectations are then checked in registration
//! order and the first failure is reported.

use std::io::{self, Read, Write};
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::{DebugLevel, LaunchOptions};
use crate::error::HarnessError;
use crate::launch::{ChildControl, Exit, Launch, LaunchError, LaunchMethod, LaunchRequest, LaunchedChild, StdLauncher};
use crate::prompt::{Progress, Prompt, PromptDriver, Prompts};
use crate::rule::{Expectation, Field, Rule};
use crate::settle::{Deferred, Outcome, Settle};
use crate::state::{lock, ProcessResult, SharedCapture};

/// How long the loop blocks on one source before looking at the others
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to keep reading output after we killed the child
const STREAM_GRACE: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 8 * 1024;

type ReadyFn = Box<dyn FnOnce(Ready) + Send>;

/// Text written to the child's stdin right after launch
#[derive(Debug, Clone, Default)]
pub struct Input(Vec<String>);

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input(vec![s.to_string()])
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input(vec![s])
    }
}

impl<S: Into<String>> From<Vec<S>> for Input {
    fn from(list: Vec<S>) -> Self {
        Input(list.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Input {
    fn from(list: [S; N]) -> Self {
        Input(list.into_iter().map(Into::into).collect())
    }
}

/// A child process under test, in its registration phase
pub struct Process {
    method: LaunchMethod,
    command: String,
    args: Vec<String>,
    options: LaunchOptions,
    echo: DebugLevel,
    input: Vec<String>,
    prompts: Vec<Prompt>,
    rules: Vec<Rule>,
    ready: Option<ReadyFn>,
    launcher: Arc<dyn Launch>,
}

impl Process {
    pub fn new<I, S>(method: LaunchMethod, command: impl Into<String>, args: I, options: LaunchOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            options,
            echo: DebugLevel::from_env(),
            input: Vec::new(),
            prompts: Vec::new(),
            rules: Vec::new(),
            ready: None,
            launcher: Arc::new(StdLauncher),
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

    /// Overlay launch options on the ones already set.
    pub fn options(mut self, options: &LaunchOptions) -> Self {
        self.options = self.options.merge(options);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.push((key.into(), value.into()));
        self
    }

    /// Kill the child and record a timeout error if it is still running after `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.options.timeout = Some(limit);
        self
    }

    /// Replace the launcher. Defaults to [`StdLauncher`].
    pub fn launcher(mut self, launcher: impl Launch + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub(crate) fn shared_launcher(mut self, launcher: Arc<dyn Launch>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Echo captured output to our own stdout/stderr as it arrives.
    ///
    /// Accepts a [`DebugLevel`], a `bool` (both streams) or a `u8`
    /// (`1` stdout, `2` stderr, anything else above zero both).
    pub fn debug(mut self, level: impl Into<DebugLevel>) -> Self {
        self.echo = level.into();
        self
    }

    pub fn expect(mut self, field: Field, expectation: impl Into<Expectation>) -> Self {
        self.rules.push(Rule::new(field, expectation.into(), false));
        self
    }

    pub fn not_expect(mut self, field: Field, expectation: impl Into<Expectation>) -> Self {
        self.rules.push(Rule::new(field, expectation.into(), true));
        self
    }

    /// Queue text for the child's stdin. Chunks are written in order at launch.
    pub fn write(mut self, input: impl Into<Input>) -> Self {
        self.input.extend(input.into().0);
        self
    }

    /// Run `callback` on its own thread once the child is up.
    ///
    /// The callback gets a [`Ready`] handle to peek at captured output and to
    /// stop the child. Registering a second callback replaces the first.
    /// If the callback panics the child is killed and the outcome is an
    /// internal error.
    pub fn ready<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Ready) + Send + 'static,
    {
        if self.ready.is_some() {
            warn!(command = %self.command, "ready callback registered twice, keeping the last one");
        }
        self.ready = Some(Box::new(callback));
        self
    }

    /// Answer questions the child prints on stdout.
    ///
    /// With prompts registered stdin stays open after the initial writes and
    /// is closed once the last answer is sent.
    pub fn prompt(mut self, prompts: impl Into<Prompts>) -> Self {
        self.prompts.extend(prompts.into().0);
        self
    }

    /// Seal the builder and supervise the child on a background thread.
    pub fn end(self) -> Deferred {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::spawn(move || {
            let (finished, outcome) = self.supervise();
            Settle::Deferred(tx).settle(&finished, outcome);
        });
        Deferred::new(rx, handle)
    }

    /// Seal the builder, supervise the child on this thread and hand the
    /// outcome to `callback` exactly once.
    pub fn end_with<F>(self, callback: F)
    where
        F: FnOnce(&Finished, Outcome),
    {
        let (finished, outcome) = self.supervise();
        Settle::Callback(Box::new(callback)).settle(&finished, outcome);
    }

    fn supervise(self) -> (Finished, Outcome) {
        let Process {
            method,
            command,
            args,
            options,
            echo,
            input,
            prompts,
            rules,
            ready,
            launcher,
        } = self;

        let capture = SharedCapture::default();
        let request = LaunchRequest {
            method,
            command: &command,
            args: &args,
            options: &options,
        };
        debug!(%method, command = %command, args = ?args, "launching");

        let started = Instant::now();
        let mut failure = None;
        match launcher.launch(&request) {
            Ok(child) => {
                let (mut supervisor, events) =
                    Supervisor::new(child, capture.clone(), echo, options.timeout, started);
                supervisor.open_input(input, prompts);
                if let Some(callback) = ready {
                    spawn_ready(
                        callback,
                        Ready {
                            events,
                            capture: capture.clone(),
                        },
                    );
                }
                failure = supervisor.run().err();
            }
            Err(err) => {
                let err = LaunchError::spawn(request.program(), &err);
                warn!(error = %err, "launch failed");
                lock(&capture).record_error(err);
            }
        }

        let result = lock(&capture).snapshot();
        let outcome = match failure {
            Some(err) => Err(err),
            None => evaluate(&rules, &result),
        };
        (Finished::new(method, command, args, result), outcome)
    }
}

/// Run the ready callback on its own thread. A panic there stops the child.
fn spawn_ready(callback: ReadyFn, handle: Ready) {
    let events = handle.events.clone();
    thread::spawn(move || {
        if panic::catch_unwind(AssertUnwindSafe(move || callback(handle))).is_err() {
            let _ = events.send(Event::ReadyPanicked);
        }
    });
}

fn evaluate(rules: &[Rule], result: &ProcessResult) -> Outcome {
    for rule in rules {
        if let Err(err) = rule.validate(result) {
            debug!(field = %rule.field(), "expectation failed");
            return Err(err);
        }
    }
    Ok(result.clone())
}

/// Handle given to the ready callback
pub struct Ready {
    events: Sender<Event>,
    capture: SharedCapture,
}

impl Ready {
    /// Stdout captured so far
    pub fn stdout(&self) -> String {
        lock(&self.capture).stdout.clone()
    }

    /// Stderr captured so far
    pub fn stderr(&self) -> String {
        lock(&self.capture).stderr.clone()
    }

    /// Poll captured stdout until it contains `needle` or `timeout` passes.
    pub fn wait_for_stdout(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if lock(&self.capture).stdout.contains(needle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill the child. Termination is then reported the usual way.
    pub fn done(&self) {
        if self.events.send(Event::Terminate).is_err() {
            trace!("done() after the child already terminated");
        }
    }
}

/// The frozen process state handed to completion callbacks
#[derive(Debug, Clone)]
pub struct Finished {
    method: LaunchMethod,
    command: String,
    args: Vec<String>,
    result: ProcessResult,
}

impl Finished {
    pub(crate) fn new(method: LaunchMethod, command: String, args: Vec<String>, result: ProcessResult) -> Self {
        Self {
            method,
            command,
            args,
            result,
        }
    }

    pub fn method(&self) -> LaunchMethod {
        self.method
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn result(&self) -> &ProcessResult {
        &self.result
    }

    pub fn into_result(self) -> ProcessResult {
        self.result
    }
}

impl Deref for Finished {
    type Target = ProcessResult;

    fn deref(&self) -> &ProcessResult {
        &self.result
    }
}

// ──────────────────────────────────────────────────────────
// Supervision loop
// ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn event(self, chunk: String) -> Event {
        match self {
            Stream::Stdout => Event::Stdout(chunk),
            Stream::Stderr => Event::Stderr(chunk),
        }
    }
}

enum Event {
    Stdout(String),
    Stderr(String),
    Closed(Stream),
    /// The stdin writer is gone, with the error that stopped it if any
    InputDone(Option<io::Error>),
    Terminate,
    ReadyPanicked,
}

struct Supervisor {
    capture: SharedCapture,
    echo: DebugLevel,
    /// Feeds the stdin writer thread; dropping it closes stdin
    input: Option<Sender<String>>,
    writer_running: bool,
    driver: Option<PromptDriver>,
    control: Box<dyn ChildControl>,
    events: Receiver<Event>,
    open_streams: usize,
    started: Instant,
    timeout: Option<Duration>,
    timed_out: bool,
    killed_at: Option<Instant>,
    ready_panicked: bool,
}

impl Supervisor {
    fn new(
        child: LaunchedChild,
        capture: SharedCapture,
        echo: DebugLevel,
        timeout: Option<Duration>,
        started: Instant,
    ) -> (Self, Sender<Event>) {
        let LaunchedChild {
            stdin,
            stdout,
            stderr,
            control,
        } = child;
        let (tx, rx) = mpsc::channel();

        let mut open_streams = 0;
        for (stream, reader) in [(Stream::Stdout, stdout), (Stream::Stderr, stderr)] {
            if let Some(reader) = reader {
                spawn_reader(stream, reader, tx.clone());
                open_streams += 1;
            }
        }

        let input = stdin.map(|stdin| {
            let (chunks, queue) = mpsc::channel();
            spawn_writer(stdin, queue, tx.clone());
            chunks
        });

        let supervisor = Self {
            capture,
            echo,
            writer_running: input.is_some(),
            input,
            driver: None,
            control,
            events: rx,
            open_streams,
            started,
            timeout,
            timed_out: false,
            killed_at: None,
            ready_panicked: false,
        };
        (supervisor, tx)
    }

    fn open_input(&mut self, input: Vec<String>, prompts: Vec<Prompt>) {
        for chunk in input {
            self.send_input(chunk);
        }

        let driver = PromptDriver::new(prompts);
        if driver.is_exhausted() {
            self.close_input();
        } else {
            self.driver = Some(driver);
        }
    }

    /// Supervise until termination. Fails only when the ready callback panicked.
    fn run(mut self) -> Result<(), HarnessError> {
        let mut exit: Option<Exit> = None;

        loop {
            let wait = if self.open_streams > 0 || exit.is_some() {
                POLL_INTERVAL
            } else {
                Duration::ZERO
            };
            match self.events.recv_timeout(wait) {
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.open_streams > 0 || self.writer_running {
                        warn!(open = self.open_streams, "output readers went away");
                        self.open_streams = 0;
                        self.writer_running = false;
                    }
                }
            }
            while let Ok(event) = self.events.try_recv() {
                self.handle(event);
            }

            // the deadline also covers output held open after the child exited
            self.check_deadline();

            if exit.is_none() {
                let block = if self.open_streams == 0 { POLL_INTERVAL } else { Duration::ZERO };
                exit = self.poll_exit(block);
            }

            if let Some(status) = exit {
                if self.drained() {
                    return self.finish(status);
                }
            }
        }
    }

    /// Every stream is at EOF and stdin, once closed, has been flushed out.
    /// After a kill we stop waiting once the grace period is over.
    fn drained(&self) -> bool {
        let quiet = self.open_streams == 0 && (self.input.is_some() || !self.writer_running);
        quiet || self.killed_at.map_or(false, |at| at.elapsed() >= STREAM_GRACE)
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Stdout(chunk) => {
                if self.echo.echo_stdout() {
                    echo(&mut io::stdout(), &chunk);
                }
                lock(&self.capture).stdout.push_str(&chunk);
                self.drive_prompts(&chunk);
            }
            Event::Stderr(chunk) => {
                if self.echo.echo_stderr() {
                    echo(&mut io::stderr(), &chunk);
                }
                lock(&self.capture).stderr.push_str(&chunk);
            }
            Event::Closed(stream) => {
                self.open_streams = self.open_streams.saturating_sub(1);
                trace!(?stream, "stream closed");
            }
            Event::InputDone(failure) => {
                self.writer_running = false;
                if let Some(err) = failure {
                    self.input_failed(err);
                }
                self.close_input();
            }
            Event::Terminate => self.terminate("ready callback signalled done"),
            Event::ReadyPanicked => {
                warn!("ready callback panicked");
                self.ready_panicked = true;
                self.terminate("ready callback panicked");
            }
        }
    }

    fn drive_prompts(&mut self, chunk: &str) {
        if self.input.is_none() {
            return;
        }
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let mut answer = Vec::new();
        match driver.feed(chunk, &mut answer) {
            Ok(progress) => {
                if !answer.is_empty() {
                    self.send_input(String::from_utf8_lossy(&answer).into_owned());
                }
                if progress == Progress::Exhausted {
                    self.driver = None;
                    self.close_input();
                }
            }
            Err(err) => self.input_failed(err),
        }
    }

    fn send_input(&mut self, chunk: String) {
        let sent = self.input.as_ref().map_or(false, |queue| queue.send(chunk).is_ok());
        if !sent {
            self.input = None;
        }
    }

    fn input_failed(&mut self, err: io::Error) {
        if err.kind() == io::ErrorKind::BrokenPipe {
            debug!("child closed its stdin early");
        } else {
            warn!(error = %err, "writing to stdin failed");
            lock(&self.capture).record_error(LaunchError::io("write stdin", &err));
        }
        self.driver = None;
        self.input = None;
    }

    fn close_input(&mut self) {
        if self.input.take().is_some() {
            trace!("stdin closed");
        }
    }

    fn check_deadline(&mut self) {
        let Some(limit) = self.timeout else {
            return;
        };
        if self.timed_out || self.started.elapsed() < limit {
            return;
        }
        self.timed_out = true;
        warn!(timeout_ms = limit.as_millis() as u64, "child outlived its timeout");
        lock(&self.capture).record_error(LaunchError::timeout(limit));
        self.terminate("timeout");
    }

    fn terminate(&mut self, reason: &str) {
        if self.killed_at.is_some() {
            return;
        }
        self.killed_at = Some(Instant::now());
        debug!(reason, pid = ?self.control.id(), "killing child");
        if let Err(err) = self.control.kill() {
            warn!(error = %err, "kill failed");
        }
        self.close_input();
    }

    fn poll_exit(&mut self, block: Duration) -> Option<Exit> {
        match self.control.wait_timeout(block) {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = %err, "waiting on child failed");
                lock(&self.capture).record_error(LaunchError::io("wait", &err));
                Some(Exit { code: None })
            }
        }
    }

    fn finish(mut self, exit: Exit) -> Result<(), HarnessError> {
        self.close_input();
        lock(&self.capture).code = exit.code;
        debug!(code = ?exit.code, "child terminated");
        if self.ready_panicked {
            return Err(HarnessError::internal("ready callback panicked"));
        }
        Ok(())
    }
}

fn echo(out: &mut dyn Write, chunk: &str) {
    let _ = out.write_all(chunk.as_bytes());
    let _ = out.flush();
}

/// Write queued chunks to stdin until the queue is dropped, then close stdin.
fn spawn_writer(mut stdin: Box<dyn Write + Send>, queue: Receiver<String>, events: Sender<Event>) {
    thread::spawn(move || {
        let mut failure = None;
        for chunk in queue {
            if let Err(err) = stdin.write_all(chunk.as_bytes()).and_then(|()| stdin.flush()) {
                failure = Some(err);
                break;
            }
        }
        drop(stdin);
        let _ = events.send(Event::InputDone(failure));
    });
}

fn spawn_reader(stream: Stream, mut reader: Box<dyn Read + Send>, events: Sender<Event>) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut pending);
                    if !text.is_empty() && events.send(stream.event(text)).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(?stream, error = %err, "reading child output failed");
                    break;
                }
            }
        }
        if !pending.is_empty() {
            let _ = events.send(stream.event(String::from_utf8_lossy(&pending).into_owned()));
        }
        let _ = events.send(Event::Closed(stream));
    });
}

/// Take the decodable prefix of `pending`, leaving a trailing partial
/// character for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        // truncated sequence at the end
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
