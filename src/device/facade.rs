//! Non-blocking handle over a device worker.
//!
//! [`AsyncDevice::call`] enqueues and returns a correlation id immediately;
//! the outcome is picked up with [`AsyncDevice::on_result`] or, from async
//! code, [`AsyncDevice::request`]. Handles are cheap to clone and all clones
//! share the same worker.
//!
//! A handle created with [`AsyncDevice::disconnected`] stands in for a device
//! that is not wired up: every call fails synchronously with
//! [`CallError::NotConnected`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use super::worker::Worker;
use super::{
    CallArgs, CallError, CallId, CallOutcome, CallbackRegistry, CommandQueue, DeviceEvent, DeviceSession,
    PendingCall, QueueOptions, Registration,
};
use crate::constants::CLOSE_METHOD;

struct Connected {
    queue: Arc<CommandQueue>,
    callbacks: Arc<CallbackRegistry>,
    methods: HashSet<String>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    events: Option<UnboundedSender<DeviceEvent>>,
}

/// Async façade over one device session.
#[derive(Clone)]
pub struct AsyncDevice {
    name: Arc<str>,
    inner: Option<Arc<Connected>>,
}

impl fmt::Debug for AsyncDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDevice")
            .field("name", &self.name)
            .field("dummy", &self.is_dummy())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AsyncDevice {
    /// Move `session` onto a new worker thread and return its handle.
    pub fn spawn<D: DeviceSession>(name: impl Into<String>, session: D, options: QueueOptions) -> std::io::Result<Self> {
        Self::spawn_inner(name.into(), session, options, None)
    }

    /// Like [`AsyncDevice::spawn`], reporting out-of-band events to `events`.
    pub fn spawn_with_events<D: DeviceSession>(
        name: impl Into<String>,
        session: D,
        options: QueueOptions,
        events: UnboundedSender<DeviceEvent>,
    ) -> std::io::Result<Self> {
        Self::spawn_inner(name.into(), session, options, Some(events))
    }

    fn spawn_inner<D: DeviceSession>(
        name: String,
        session: D,
        options: QueueOptions,
        events: Option<UnboundedSender<DeviceEvent>>,
    ) -> std::io::Result<Self> {
        let methods = session.methods();
        let mut names: HashSet<String> = methods.names().map(str::to_string).collect();
        names.insert(CLOSE_METHOD.to_string());

        let queue = Arc::new(CommandQueue::new(options));
        let callbacks = Arc::new(CallbackRegistry::new());

        let handle = Worker {
            device: name.clone(),
            session,
            methods,
            queue: Arc::clone(&queue),
            callbacks: Arc::clone(&callbacks),
            events: events.clone(),
        }
        .spawn()?;

        Ok(Self {
            name: name.into(),
            inner: Some(Arc::new(Connected {
                queue,
                callbacks,
                methods: names,
                next_id: AtomicU64::new(1),
                worker: Mutex::new(Some(handle)),
                events,
            })),
        })
    }

    /// Handle for a device that is not connected.
    pub fn disconnected(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            inner: None,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle has no device behind it.
    pub fn is_dummy(&self) -> bool {
        self.inner.is_none()
    }

    /// Whether the worker still accepts calls.
    pub fn is_running(&self) -> bool {
        self.inner.as_ref().is_some_and(|c| c.queue.is_running())
    }

    /// Whether `method` can be called on this device.
    pub fn has_method(&self, method: &str) -> bool {
        self.inner.as_ref().is_some_and(|c| c.methods.contains(method))
    }

    fn connected(&self) -> Result<&Arc<Connected>, CallError> {
        self.inner.as_ref().ok_or(CallError::NotConnected)
    }

    /// Enqueue `method` with `args` and return its correlation id.
    ///
    /// Never blocks on device I/O. Unknown methods, a full queue without
    /// eviction, and a stopped worker are reported synchronously. Calling
    /// `close` this way stops the worker without waiting for it.
    pub fn call(&self, method: &str, args: CallArgs) -> Result<CallId, CallError> {
        let conn = self.connected()?;
        if !conn.methods.contains(method) {
            return Err(CallError::UnknownMethod {
                method: method.to_string(),
            });
        }

        let id = conn.next_id.fetch_add(1, Ordering::Relaxed);
        let call = PendingCall::new(id, method, args);

        if call.is_close() {
            let discarded = conn.queue.push_close(call)?;
            conn.callbacks.release(&discarded, &CallError::Closed);
            return Ok(id);
        }

        let evicted = conn.queue.push(call)?;
        if !evicted.is_empty() {
            log::warn!("[Device] {} evicted {} stale call(s)", self.name, evicted.len());
            conn.callbacks.release(&evicted, &CallError::Evicted);
            if let Some(tx) = &conn.events {
                let _ = tx.send(DeviceEvent::Evicted {
                    device: self.name.to_string(),
                    ids: evicted,
                });
            }
        }
        Ok(id)
    }

    /// Run `handler` once with the outcome of call `id`.
    ///
    /// Safe to call before or after the result arrives. Returns
    /// [`Registration::Evicted`] (and drops `handler`) if the call was
    /// evicted or discarded and will never complete.
    pub fn on_result<F>(&self, id: CallId, handler: F) -> Registration
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        match &self.inner {
            Some(conn) => conn.callbacks.register(id, Box::new(handler)),
            None => Registration::Evicted,
        }
    }

    /// Enqueue a call and get its outcome through a oneshot channel.
    pub fn request(&self, method: &str, args: CallArgs) -> Result<oneshot::Receiver<CallOutcome>, CallError> {
        let id = self.call(method, args)?;
        let (tx, rx) = oneshot::channel();
        if self.on_result(id, move |outcome| {
            let _ = tx.send(outcome);
        }) == Registration::Evicted
        {
            return Err(CallError::Evicted);
        }
        Ok(rx)
    }

    /// Stop the worker and wait for its thread to exit.
    ///
    /// Pending calls are discarded. This blocks the caller; from async code
    /// wrap it in `spawn_blocking`. Closing a disconnected or already
    /// stopped device is a no-op.
    pub fn close(&self) -> Result<(), CallError> {
        let Some(conn) = &self.inner else {
            return Ok(());
        };

        if conn.queue.is_running() {
            match self.call(CLOSE_METHOD, CallArgs::none()) {
                // Nobody reads the close outcome; claim it so it is not buffered.
                Ok(id) => {
                    conn.callbacks.register(id, Box::new(|_| {}));
                }
                Err(CallError::Closed) => {}
                Err(e) => return Err(e),
            }
        }

        let handle = conn
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Closing from inside a result handler; the loop exits on its own.
                return Ok(());
            }
            handle
                .join()
                .map_err(|_| CallError::Failed(format!("worker for {} panicked", self.name)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MethodTable, Value};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Session that records overlap and call order.
    struct Probe {
        busy: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<u64>>>,
    }

    impl DeviceSession for Probe {
        fn methods(&self) -> MethodTable<Self> {
            MethodTable::new()
                .with("work", |p: &mut Probe, args| {
                    if p.busy.fetch_add(1, Ordering::SeqCst) > 0 {
                        p.overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    p.order.lock().unwrap().push(args.arg(0)?);
                    thread::sleep(Duration::from_millis(1));
                    p.busy.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Unit)
                })
                .with("fail", |_, _| Err(CallError::Failed("bad reading".into())))
                .with("panic", |_, _| panic!("driver bug"))
                .with("drop", |_, _| Err(CallError::ConnectionLost("cable pulled".into())))
        }
    }

    fn probe() -> (Probe, Arc<AtomicUsize>, Arc<Mutex<Vec<u64>>>) {
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let session = Probe {
            busy: Arc::new(AtomicUsize::new(0)),
            overlaps: Arc::clone(&overlaps),
            order: Arc::clone(&order),
        };
        (session, overlaps, order)
    }

    fn wait_outcome(device: &AsyncDevice, id: CallId) -> CallOutcome {
        let (tx, rx) = mpsc::channel();
        device.on_result(id, move |outcome| tx.send(outcome).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_calls_run_in_order_without_overlap() {
        let (session, overlaps, order) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();

        let mut last = 0;
        for i in 0..50u64 {
            last = device.call("work", CallArgs::positional([i.to_string()])).unwrap();
        }
        wait_outcome(&device, last).unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
        device.close().unwrap();
    }

    #[test]
    fn test_ids_are_monotonic() {
        let (session, _, _) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();
        let a = device.call("work", CallArgs::positional(["1"])).unwrap();
        let b = device.call("work", CallArgs::positional(["2"])).unwrap();
        assert!(b > a);
        device.close().unwrap();
    }

    #[test]
    fn test_unknown_method_rejected_at_enqueue() {
        let (session, _, _) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();
        let err = device.call("missing", CallArgs::none()).unwrap_err();
        assert!(matches!(err, CallError::UnknownMethod { .. }));
        device.close().unwrap();
    }

    #[test]
    fn test_failures_and_panics_do_not_stop_worker() {
        let (session, _, _) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();

        let failed = device.call("fail", CallArgs::none()).unwrap();
        assert_eq!(wait_outcome(&device, failed), Err(CallError::Failed("bad reading".into())));

        let panicked = device.call("panic", CallArgs::none()).unwrap();
        assert!(matches!(wait_outcome(&device, panicked), Err(CallError::Failed(_))));

        let ok = device.call("work", CallArgs::positional(["3"])).unwrap();
        assert_eq!(wait_outcome(&device, ok), Ok(Value::Unit));
        device.close().unwrap();
    }

    #[test]
    fn test_close_is_terminal() {
        let (session, _, _) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();
        device.close().unwrap();

        assert!(!device.is_running());
        assert_eq!(
            device.call("work", CallArgs::positional(["1"])).unwrap_err(),
            CallError::Closed
        );
        // Second close is a no-op.
        device.close().unwrap();
    }

    #[test]
    fn test_connection_lost_is_reported_out_of_band() {
        let (session, _, _) = probe();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let device = AsyncDevice::spawn_with_events("probe", session, QueueOptions::default(), tx).unwrap();

        let id = device.call("drop", CallArgs::none()).unwrap();

        let event = rx.blocking_recv().unwrap();
        match event {
            DeviceEvent::ConnectionLost { device: name, abandoned, .. } => {
                assert_eq!(name, "probe");
                assert_eq!(abandoned[0], id);
            }
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
        assert!(!device.is_running());
        // Abandoned calls never complete through the normal path.
        assert_eq!(device.on_result(id, |_| {}), Registration::Evicted);
        device.close().unwrap();
    }

    #[test]
    fn test_abandoned_calls_are_released_as_closed() {
        let (session, _, _) = probe();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let device = AsyncDevice::spawn_with_events("probe", session, QueueOptions::default(), tx).unwrap();

        let (outcome_tx, outcome_rx) = mpsc::channel();
        let mut pending = 0;
        for method in ["drop", "work"] {
            // The worker may already have stopped by the second call.
            let Ok(id) = device.call(method, CallArgs::positional(["1"])) else {
                continue;
            };
            let outcome_tx = outcome_tx.clone();
            if device.on_result(id, move |outcome| outcome_tx.send(outcome).unwrap()) == Registration::Pending {
                pending += 1;
            }
        }
        drop(outcome_tx);

        assert!(matches!(rx.blocking_recv(), Some(DeviceEvent::ConnectionLost { .. })));
        let outcomes: Vec<CallOutcome> = outcome_rx.iter().collect();
        assert_eq!(outcomes.len(), pending);
        assert!(outcomes.iter().all(|o| *o == Err(CallError::Closed)), "got {outcomes:?}");
        device.close().unwrap();
    }

    #[test]
    fn test_dummy_device_fails_synchronously() {
        let device = AsyncDevice::disconnected("ghost");
        assert!(device.is_dummy());
        assert_eq!(device.call("work", CallArgs::none()).unwrap_err(), CallError::NotConnected);
        assert!(device.close().is_ok());
    }

    #[tokio::test]
    async fn test_request_resolves_through_oneshot() {
        let (session, _, _) = probe();
        let device = AsyncDevice::spawn("probe", session, QueueOptions::default()).unwrap();
        let rx = device.request("work", CallArgs::positional(["5"])).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(Value::Unit));
        tokio::task::spawn_blocking(move || device.close()).await.unwrap().unwrap();
    }
}
