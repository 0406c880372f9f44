//! Serialized access to blocking device sessions.
//!
//! A device session is an open connection to one instrument. Its methods
//! block while they talk to the hardware, so every session is owned by a
//! dedicated worker thread that drains a FIFO of pending calls one at a
//! time. Callers only ever see the non-blocking [`AsyncDevice`] handle.
//!
//! # Architecture
//!
//! ```text
//! caller ──call()──► CommandQueue ──► Worker thread ──► DeviceSession
//!    ▲                                     │
//!    └──── handler ◄── CallbackRegistry ◄──┘
//! ```
//!
//! Methods are resolved through a [`MethodTable`] built once when the worker
//! is spawned; unknown names are rejected at enqueue time.

pub mod callbacks;
pub mod events;
pub mod facade;
pub mod queue;
pub mod virtual_device;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub use callbacks::{CallOutcome, CallbackRegistry, Registration};
pub use events::DeviceEvent;
pub use facade::AsyncDevice;
pub use queue::{CallId, CommandQueue, EvictionPolicy, PendingCall, QueueOptions};
pub use virtual_device::VirtualDevice;

/// An open, stateful connection to one instrument.
///
/// Implementors expose their operations through [`DeviceSession::methods`].
/// The session is moved onto its worker thread and never touched from
/// anywhere else.
pub trait DeviceSession: Send + 'static {
    /// Build the table of callable methods.
    ///
    /// Called exactly once, before the worker starts.
    fn methods(&self) -> MethodTable<Self>
    where
        Self: Sized;

    /// Close the underlying connection.
    ///
    /// Runs on the worker thread as the last call it ever executes.
    fn close(&mut self) -> Result<Value, CallError> {
        Ok(Value::Unit)
    }
}

/// A method bound to a concrete session type.
pub type Method<D> = Box<dyn Fn(&mut D, &CallArgs) -> Result<Value, CallError> + Send>;

/// Name → method lookup for one session type.
pub struct MethodTable<D> {
    methods: HashMap<String, Method<D>>,
}

impl<D> fmt::Debug for MethodTable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

impl<D> Default for MethodTable<D> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<D> MethodTable<D> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(&mut D, &CallArgs) -> Result<Value, CallError> + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(method));
        self
    }

    /// Builder form of [`MethodTable::register`].
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&mut D, &CallArgs) -> Result<Value, CallError> + Send + 'static,
    {
        self.register(name, method);
        self
    }

    /// Whether a method with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Iterate over registered method names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Invoke `name` on `device`.
    pub(crate) fn invoke(&self, device: &mut D, name: &str, args: &CallArgs) -> Result<Value, CallError> {
        match self.methods.get(name) {
            Some(method) => method(device, args),
            None => Err(CallError::UnknownMethod {
                method: name.to_string(),
            }),
        }
    }
}

/// Positional and keyword arguments of one call.
///
/// Arguments travel as text (they come off the wire or out of a script);
/// methods parse them into the types they need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    /// Positional arguments in order.
    pub positional: Vec<String>,
    /// Keyword arguments.
    pub keyword: BTreeMap<String, String>,
}

impl CallArgs {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments only.
    pub fn positional<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: args.into_iter().map(Into::into).collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Add a keyword argument.
    #[must_use]
    pub fn with_keyword(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    /// Whether there are no arguments at all.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Parse positional argument `index`.
    pub fn arg<T>(&self, index: usize) -> Result<T, CallError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.positional.get(index).ok_or_else(|| {
            CallError::InvalidArguments(format!(
                "missing positional argument {index} ({} given)",
                self.positional.len()
            ))
        })?;
        parse_text(raw)
    }

    /// Parse keyword argument `key`, if present.
    pub fn kwarg<T>(&self, key: &str) -> Result<Option<T>, CallError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.keyword.get(key).map(|raw| parse_text(raw)).transpose()
    }

    /// Fail unless exactly `count` positional and no keyword arguments were given.
    pub fn expect_exactly(&self, count: usize) -> Result<(), CallError> {
        if self.positional.len() != count || !self.keyword.is_empty() {
            return Err(CallError::InvalidArguments(format!(
                "expected {count} positional argument(s), got {} positional and {} keyword",
                self.positional.len(),
                self.keyword.len()
            )));
        }
        Ok(())
    }
}

fn parse_text<T>(raw: &str) -> Result<T, CallError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| CallError::InvalidArguments(format!("cannot parse \"{raw}\": {e}")))
}

/// Return value of a device method.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No meaningful return value.
    Unit,
    /// Boolean reading or flag.
    Bool(bool),
    /// Integer reading.
    Int(i64),
    /// Floating point reading.
    Float(f64),
    /// Free text (identification strings, status words).
    Text(String),
    /// Several values at once.
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Errors produced anywhere along the call pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The session has no method with this name.
    UnknownMethod {
        /// Requested method name.
        method: String,
    },
    /// Arguments could not be interpreted by the method.
    InvalidArguments(String),
    /// The device method ran and reported a failure.
    Failed(String),
    /// The connection to the instrument is gone.
    ConnectionLost(String),
    /// The queue is full and no eviction policy is configured.
    QueueFull {
        /// Configured `max_queue`.
        capacity: usize,
    },
    /// The worker has terminated; no further calls are accepted.
    Closed,
    /// No device is connected behind this handle.
    NotConnected,
    /// The call was dropped from the queue before it ran.
    Evicted,
}

impl CallError {
    /// Whether this error means the whole session is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMethod { method } => write!(f, "Unknown method \"{method}\""),
            Self::InvalidArguments(msg) => write!(f, "Invalid arguments: {msg}"),
            Self::Failed(msg) => write!(f, "Device call failed: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {msg}"),
            Self::QueueFull { capacity } => write!(f, "Too many tasks in queue (capacity {capacity})"),
            Self::Closed => write!(f, "Worker is not running"),
            Self::NotConnected => write!(f, "No connection established"),
            Self::Evicted => write!(f, "Call was evicted before execution"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Meter {
        reading: f64,
    }

    #[test]
    fn test_method_table_invokes_registered_method() {
        let table = MethodTable::<Meter>::new()
            .with("read", |m, _| Ok(Value::Float(m.reading)))
            .with("set", |m, args| {
                m.reading = args.arg(0)?;
                Ok(Value::Unit)
            });
        let mut meter = Meter { reading: 1.5 };

        assert_eq!(table.invoke(&mut meter, "read", &CallArgs::none()), Ok(Value::Float(1.5)));
        table
            .invoke(&mut meter, "set", &CallArgs::positional(["2.25"]))
            .unwrap();
        assert!((meter.reading - 2.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_method_table_rejects_unknown_name() {
        let table = MethodTable::<Meter>::new();
        let mut meter = Meter { reading: 0.0 };
        let err = table.invoke(&mut meter, "nope", &CallArgs::none()).unwrap_err();
        assert_eq!(
            err,
            CallError::UnknownMethod {
                method: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_call_args_parse_errors_are_invalid_arguments() {
        let args = CallArgs::positional(["abc"]).with_keyword("channel", "2");
        assert!(matches!(args.arg::<f64>(0), Err(CallError::InvalidArguments(_))));
        assert!(matches!(args.arg::<f64>(3), Err(CallError::InvalidArguments(_))));
        assert_eq!(args.kwarg::<u8>("channel").unwrap(), Some(2));
        assert_eq!(args.kwarg::<u8>("missing").unwrap(), None);
        assert!(args.expect_exactly(1).is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Unit.to_string(), "");
        assert_eq!(Value::Float(23.5).to_string(), "23.5");
        assert_eq!(Value::from("ok").to_string(), "ok");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Bool(true)]).to_string(),
            "[1, true]"
        );
    }
}
