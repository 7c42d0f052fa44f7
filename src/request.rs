use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use tracing::{debug, warn};

pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Running,
    Completed,
}

/// Handle to one worker thread producing a single `T`. `take` and `dispose`
/// consume the handle and dropping it disposes, so a request is released
/// exactly once. Disposal waits at most `dispose_timeout` before detaching.
pub struct Request<T> {
    name: String,
    stop: StopSignal,
    rx: Receiver<T>,
    result: Option<T>,
    worker_gone: bool,
    worker: Option<JoinHandle<()>>,
    dispose_timeout: Duration,
}

impl<T: Send + 'static> Request<T> {
    pub fn issue<F>(name: impl Into<String>, dispose_timeout: Duration, work: F) -> io::Result<Self>
    where
        F: FnOnce(&StopSignal) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = StopSignal::new();
        let (tx, rx) = bounded(1);
        let worker_stop = stop.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            let result = work(&worker_stop);
            let _ = tx.send(result);
        })?;
        debug!(request = %name, "request issued");

        Ok(Self {
            name,
            stop,
            rx,
            result: None,
            worker_gone: false,
            worker: Some(worker),
            dispose_timeout,
        })
    }
}

impl<T> Request<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&mut self) -> bool {
        if self.result.is_some() || self.worker_gone {
            return true;
        }
        match self.rx.try_recv() {
            Ok(value) => {
                self.result = Some(value);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.worker_gone = true;
                true
            }
        }
    }

    pub fn state(&mut self) -> RequestState {
        if self.is_done() {
            RequestState::Completed
        } else {
            RequestState::Running
        }
    }

    pub fn cancel(&self) {
        self.stop.request_stop();
    }

    /// Returns `None` when the worker panicked or is still running; a running
    /// request is disposed.
    pub fn take(mut self) -> Option<T> {
        if !self.is_done() {
            self.release();
            return None;
        }
        let result = self.result.take();
        self.release();
        result
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        if !self.is_done() {
            self.stop.request_stop();
            match self.rx.recv_timeout(self.dispose_timeout) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        request = %self.name,
                        timeout_ms = self.dispose_timeout.as_millis() as u64,
                        "worker did not stop in time; detaching"
                    );
                    return;
                }
            }
        }

        if worker.join().is_err() {
            warn!(request = %self.name, "request worker panicked");
        }
        debug!(request = %self.name, "request disposed");
    }
}

impl<T> Drop for Request<T> {
    fn drop(&mut self) {
        self.release();
    }
}
