//! Command queue worker - runs on a dedicated thread per device.
//!
//! Owns the [`DeviceSession`] exclusively and executes queued calls one at a
//! time in FIFO order. Panics inside a device method are caught and reported
//! as call failures; only a lost connection stops the loop early.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::UnboundedSender;

use super::{
    CallError, CallId, CallOutcome, CallbackRegistry, CommandQueue, DeviceEvent, DeviceSession, MethodTable, PendingCall,
};
use crate::constants::WORKER_POLL_INTERVAL;

/// Everything a worker thread needs, moved onto that thread.
pub(super) struct Worker<D> {
    pub(super) device: String,
    pub(super) session: D,
    pub(super) methods: MethodTable<D>,
    pub(super) queue: Arc<CommandQueue>,
    pub(super) callbacks: Arc<CallbackRegistry>,
    pub(super) events: Option<UnboundedSender<DeviceEvent>>,
}

impl<D: DeviceSession> Worker<D> {
    /// Start the worker on a named thread.
    pub(super) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("labrelay-{}", self.device))
            .spawn(move || self.run())
    }

    /// Worker loop - runs until `close` executes or the connection is lost.
    fn run(mut self) {
        log::info!("[Worker] {} started", self.device);

        while self.queue.is_running() {
            let Some(call) = self.queue.next(WORKER_POLL_INTERVAL) else {
                continue;
            };

            if call.is_close() {
                self.execute_close(&call);
                break;
            }

            match self.execute(&call) {
                Err(CallError::ConnectionLost(reason)) => {
                    self.abandon(call.id, reason);
                    break;
                }
                outcome => self.callbacks.deliver(call.id, outcome),
            }
        }

        log::info!("[Worker] {} stopped", self.device);
        self.emit(DeviceEvent::Stopped {
            device: self.device.clone(),
        });
    }

    /// Invoke one method, turning a panic into a call failure.
    fn execute(&mut self, call: &PendingCall) -> CallOutcome {
        log::debug!("[Worker] {} executing #{} {}", self.device, call.id, call.method);

        let methods = &self.methods;
        let session = &mut self.session;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| methods.invoke(session, &call.method, &call.args)))
            .unwrap_or_else(|payload| Err(CallError::Failed(panic_message(payload.as_ref()))));

        if let Err(e) = &outcome {
            log::warn!("[Worker] {} call #{} {} failed: {e}", self.device, call.id, call.method);
        }
        outcome
    }

    fn execute_close(&mut self, call: &PendingCall) {
        let session = &mut self.session;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.close()))
            .unwrap_or_else(|payload| Err(CallError::Failed(panic_message(payload.as_ref()))));
        if let Err(e) = &outcome {
            log::warn!("[Worker] {} close failed: {e}", self.device);
        }

        let discarded = self.queue.stop();
        self.callbacks.release(&discarded, &CallError::Closed);
        self.callbacks.deliver(call.id, outcome);
    }

    /// Tear down after a lost connection.
    ///
    /// The failing call and everything still queued are released as
    /// [`CallError::Closed`]; the connection loss itself is only reported
    /// out-of-band.
    fn abandon(&mut self, failed: CallId, reason: String) {
        log::error!("[Worker] {} connection lost: {reason}", self.device);

        let mut abandoned = vec![failed];
        abandoned.extend(self.queue.stop());
        self.callbacks.release(&abandoned, &CallError::Closed);

        self.emit(DeviceEvent::ConnectionLost {
            device: self.device.clone(),
            reason,
            abandoned,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                log::debug!("[Worker] {} event receiver dropped", self.device);
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("method panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("method panicked: {s}")
    } else {
        "method panicked".to_string()
    }
}
