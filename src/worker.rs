//! A worker thread with a bounded, timed join, shared by the file manager's
//! send loop and the connection's event loop (§5: both must give up and log
//! rather than block forever if the other side wedges).

use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Worker {
    handle: Option<JoinHandle<()>>,
    done_rx: crossbeam::channel::Receiver<()>,
    name: String,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                f();
                let _ = done_tx.send(());
            })
            .expect("failed to spawn worker thread");
        Worker {
            handle: Some(handle),
            done_rx,
            name,
        }
    }

    /// Returns true if this worker is the thread currently executing, to
    /// let callers avoid joining themselves.
    pub fn is_current_thread(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    /// Waits up to `timeout` for the worker to finish. Logs and returns
    /// `false` without killing the thread if it doesn't.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        if self.handle.is_none() {
            return true;
        }
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
                true
            }
            Err(_) => {
                tracing::error!(worker = %self.name, ?timeout, "worker thread did not exit within timeout");
                false
            }
        }
    }
}
