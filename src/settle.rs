//! Single-use completion channel
//!
//! A supervised process settles exactly once. [`Settle`] is consumed by value
//! when it delivers, so a second delivery cannot be expressed. The two
//! adapters are a caller-supplied callback and a [`Deferred`] value that the
//! caller waits on.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::error::HarnessError;
use crate::process::Finished;
use crate::state::ProcessResult;

/// What a supervised process settles with
pub type Outcome = Result<ProcessResult, HarnessError>;

/// Where the outcome goes
pub(crate) enum Settle<'cb> {
    Callback(Box<dyn FnOnce(&Finished, Outcome) + 'cb>),
    Deferred(mpsc::SyncSender<Outcome>),
}

impl Settle<'_> {
    pub(crate) fn settle(self, finished: &Finished, outcome: Outcome) {
        match self {
            Settle::Callback(cb) => cb(finished, outcome),
            Settle::Deferred(tx) => {
                if tx.send(outcome).is_err() {
                    debug!(command = %finished.command(), "deferred result dropped before settling");
                }
            }
        }
    }
}

/// A result that becomes available once the process has been supervised to
/// completion on a background thread
pub struct Deferred {
    rx: mpsc::Receiver<Outcome>,
    handle: Option<JoinHandle<()>>,
}

impl Deferred {
    pub(crate) fn new(rx: mpsc::Receiver<Outcome>, handle: JoinHandle<()>) -> Self {
        Self {
            rx,
            handle: Some(handle),
        }
    }

    /// Block until the process settles.
    pub fn wait(mut self) -> Outcome {
        match self.rx.recv() {
            Ok(outcome) => {
                self.join();
                outcome
            }
            Err(_) => Err(self.abandoned()),
        }
    }

    /// Block for at most `timeout`. Gives the deferred value back if it has
    /// not settled yet.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<Outcome, Deferred> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.join();
                Ok(outcome)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => Err(self),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Err(self.abandoned())),
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn abandoned(&mut self) -> HarnessError {
        match self.handle.take().map(|h| h.join()) {
            Some(Err(_)) => HarnessError::internal("supervision thread panicked"),
            _ => HarnessError::internal("supervision ended without a result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchMethod;

    fn finished() -> Finished {
        Finished::new(LaunchMethod::Spawn, "true".into(), Vec::new(), ProcessResult::default())
    }

    #[test]
    fn test_callback_receives_outcome() {
        let mut seen = None;
        Settle::Callback(Box::new(|_: &Finished, outcome: Outcome| seen = Some(outcome.is_ok())))
            .settle(&finished(), Ok(ProcessResult::default()));
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn test_deferred_resolves() {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = std::thread::spawn(move || {
            Settle::Deferred(tx).settle(&finished(), Ok(ProcessResult::default()));
        });
        let outcome = Deferred::new(rx, handle).wait();
        assert_eq!(outcome.unwrap(), ProcessResult::default());
    }

    #[test]
    fn test_deferred_reports_panicked_thread() {
        let (tx, rx) = mpsc::sync_channel::<Outcome>(1);
        let handle = std::thread::spawn(move || {
            let _tx = tx;
            panic!("boom");
        });
        let err = Deferred::new(rx, handle).wait().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
        assert!(err.message.contains("panicked"));
    }

    #[test]
    fn test_wait_timeout_hands_back_pending_value() {
        let (tx, rx) = mpsc::sync_channel(1);
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _ = go_rx.recv();
            Settle::Deferred(tx).settle(&finished(), Ok(ProcessResult::default()));
        });

        let pending = match Deferred::new(rx, handle).wait_timeout(Duration::from_millis(10)) {
            Err(pending) => pending,
            Ok(_) => panic!("settled before being released"),
        };
        go_tx.send(()).unwrap();
        assert!(pending.wait().is_ok());
    }
}
