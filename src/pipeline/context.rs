//! Execution context: a thread owning an event queue that other threads post
//! one-shot jobs to (surface setup, presentation state changes).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{JoinHandle, ThreadId};

use flume::{Receiver, Sender};
use tracing::{debug, info, instrument, warn};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Stop,
}

/// Cloneable handle for posting work onto an [`ExecutionContext`]
#[derive(Clone)]
pub struct ContextHandle {
    tx: Sender<Message>,
    /// Cleared by shutdown under the write lock, so every accepted job is
    /// queued ahead of `Stop`.
    accepting: Arc<RwLock<bool>>,
    thread: ThreadId,
    name: Arc<str>,
}

impl ContextHandle {
    /// Queue `job` on the context. Never blocks; returns false once the
    /// context has stopped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let accepting = self.accepting.read().unwrap_or_else(PoisonError::into_inner);
        *accepting && self.tx.send(Message::Run(Box::new(job))).is_ok()
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `job` inline when already on the context thread, post it otherwise.
    pub fn run_or_post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            job();
            true
        } else {
            self.post(job)
        }
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct ExecutionContext {
    handle: ContextHandle,
    worker: Option<JoinHandle<usize>>,
}

impl ExecutionContext {
    #[instrument]
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let worker = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(rx))?;

        info!("Execution context started");
        Ok(Self {
            handle: ContextHandle {
                tx,
                accepting: Arc::new(RwLock::new(true)),
                thread: worker.thread().id(),
                name: Arc::from(name),
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Finish already queued jobs, then stop the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut accepting = self
                .handle
                .accepting
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *accepting = false;
            let _ = self.handle.tx.send(Message::Stop);
        }
        if self.handle.is_current() {
            // Dropped from one of its own jobs; the loop exits on Stop.
            return;
        }
        match worker.join() {
            Ok(executed) => {
                info!(context = %self.handle.name, executed, "Execution context stopped")
            }
            Err(_) => warn!(context = %self.handle.name, "Execution context thread panicked"),
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rx: Receiver<Message>) -> usize {
    let mut executed = 0;
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                executed += 1;
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("Context job panicked");
                }
            }
            Message::Stop => break,
        }
    }
    debug!(executed, "Context loop exiting");
    executed
}
