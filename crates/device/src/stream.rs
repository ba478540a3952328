//! Ordered asynchronous command streams.
//!
//! A stream owns one worker thread that executes queued commands strictly in
//! submission order. Submitting never blocks; [`CommandStream::synchronize`]
//! waits for everything queued before it and reports the first failure since
//! the previous synchronization point.
//!
//! Failures are sticky: once a command fails, the remaining commands of the
//! same synchronization window are skipped. The window is cleared by the next
//! `synchronize`, after which the stream is usable again.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use pf_common::DeviceError;

use crate::buffer::{DeviceRegion, PinnedBuffer};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(0);

type Command = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

enum Message {
    Run { label: String, command: Command },
    Fence(Sender<Option<DeviceError>>),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Counters for one stream since creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Commands dropped because an earlier command in the window failed.
    pub skipped: u64,
}

/// An in-order asynchronous queue of device commands.
pub struct CommandStream {
    id: u64,
    ordinal: u32,
    tx: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl CommandStream {
    pub(crate) fn new(ordinal: u32) -> Result<Self, DeviceError> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded();
        let counters = Arc::new(Counters::default());

        let worker_counters = counters.clone();
        let worker = thread::Builder::new()
            .name(format!("pf-stream-{id}"))
            .spawn(move || run_commands(rx, worker_counters))
            .map_err(|e| DeviceError::CommandFailed {
                label: "create_stream".into(),
                reason: e.to_string(),
            })?;

        debug!(stream = id, ordinal, "Created command stream");
        Ok(Self {
            id,
            ordinal,
            tx: Some(tx),
            worker: Some(worker),
            counters,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `command`. `label` names it in error reports.
    pub fn enqueue<F>(&self, label: impl Into<String>, command: F) -> Result<(), DeviceError>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.send(Message::Run {
            label: label.into(),
            command: Box::new(command),
        })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a copy of `dst.len()` bytes from `src[src_offset..]` into `dst`.
    ///
    /// Bounds are checked at submission time.
    pub fn copy_htod(
        &self,
        label: impl Into<String>,
        src: &PinnedBuffer,
        src_offset: usize,
        dst: &DeviceRegion,
    ) -> Result<(), DeviceError> {
        let len = dst.len();
        match src_offset.checked_add(len) {
            Some(end) if end <= src.size() => {}
            _ => {
                return Err(DeviceError::OutOfBounds {
                    offset: src_offset,
                    len,
                    size: src.size(),
                })
            }
        }

        let src = src.clone();
        let dst = dst.clone();
        self.enqueue(label, move || {
            let host = src.host_slice();
            dst.with_mut(|d| d.copy_from_slice(&host[src_offset..src_offset + len]));
            Ok(())
        })
    }

    /// Block until every command queued so far has finished.
    ///
    /// Returns the first failure of the window, if any.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(Message::Fence(ack_tx))?;
        match ack_rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err(DeviceError::StreamClosed),
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    fn send(&self, msg: Message) -> Result<(), DeviceError> {
        self.tx
            .as_ref()
            .ok_or(DeviceError::StreamClosed)?
            .send(msg)
            .map_err(|_| DeviceError::StreamClosed)
    }
}

fn run_commands(rx: Receiver<Message>, counters: Arc<Counters>) {
    let mut sticky: Option<DeviceError> = None;

    for msg in rx.iter() {
        match msg {
            Message::Run { label, command } => {
                if sticky.is_some() {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(command))
                    .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
                match outcome {
                    Ok(()) => {
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(reason) => {
                        warn!(label = %label, reason = %reason, "Stream command failed");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        sticky = Some(DeviceError::CommandFailed { label, reason });
                    }
                }
            }
            Message::Fence(ack) => {
                // The waiter may have given up; nothing to report then.
                let _ = ack.send(sticky.take());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(stream = self.id, "Command stream worker panicked");
            }
        }
        debug!(stream = self.id, "Destroyed command stream");
    }
}
