//! In-memory instrument used by `labrelay serve` and the test suite.
//!
//! Each configured parameter `p` gets a `pSet(value)` / `pGet()` method
//! pair, so a virtual laser with parameters `rf` and `rr` answers the same
//! `rfSet(23)` / `rrSet(10)` commands a script would send to real hardware.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use super::{CallArgs, CallError, DeviceSession, MethodTable, Value};

/// Simulated instrument with named floating point parameters.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    identity: String,
    parameters: BTreeMap<String, f64>,
    latency: Duration,
}

impl VirtualDevice {
    /// Create a device that identifies itself as `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            parameters: BTreeMap::new(),
            latency: Duration::ZERO,
        }
    }

    /// Add a parameter with its initial value.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, initial: f64) -> Self {
        self.parameters.insert(name.into(), initial);
        self
    }

    /// Make every call block for `latency`, like a slow serial line.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Current value of a parameter.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    fn settle(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }

    fn set(&mut self, name: &str, args: &CallArgs) -> Result<Value, CallError> {
        args.expect_exactly(1)?;
        let value: f64 = args.arg(0)?;
        self.settle();
        self.parameters.insert(name.to_string(), value);
        Ok(Value::Unit)
    }

    fn get(&self, name: &str, args: &CallArgs) -> Result<Value, CallError> {
        args.expect_exactly(0)?;
        self.settle();
        self.parameters
            .get(name)
            .copied()
            .map(Value::Float)
            .ok_or_else(|| CallError::Failed(format!("no parameter \"{name}\"")))
    }
}

impl DeviceSession for VirtualDevice {
    fn methods(&self) -> MethodTable<Self> {
        let mut table = MethodTable::new()
            .with("idn", |dev: &mut Self, _| {
                dev.settle();
                Ok(Value::Text(dev.identity.clone()))
            })
            .with("echo", |dev: &mut Self, args| {
                dev.settle();
                let mut parts = args.positional.clone();
                parts.extend(args.keyword.iter().map(|(k, v)| format!("{k}={v}")));
                Ok(Value::Text(parts.join(",")))
            })
            .with("fail", |_, args| {
                let reason = args
                    .positional
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "simulated connection loss".to_string());
                Err(CallError::ConnectionLost(reason))
            });

        for name in self.parameters.keys() {
            let set_name = name.clone();
            table.register(format!("{name}Set"), move |dev: &mut Self, args| dev.set(&set_name, args));
            let get_name = name.clone();
            table.register(format!("{name}Get"), move |dev: &mut Self, args| dev.get(&get_name, args));
        }
        table
    }

    fn close(&mut self) -> Result<Value, CallError> {
        log::debug!("[VirtualDevice] {} closed", self.identity);
        Ok(Value::Unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laser() -> VirtualDevice {
        VirtualDevice::new("virtual laser")
            .with_parameter("rf", 0.0)
            .with_parameter("rr", 1.0)
    }

    #[test]
    fn test_parameter_methods_are_generated() {
        let dev = laser();
        let table = dev.methods();
        for name in ["rfSet", "rfGet", "rrSet", "rrGet", "idn", "echo", "fail"] {
            assert!(table.contains(name), "missing {name}");
        }
        assert_eq!(table.len(), 7);
    }

    #[test]
    fn test_set_then_get() {
        let mut dev = laser();
        let table = dev.methods();
        table
            .invoke(&mut dev, "rfSet", &CallArgs::positional(["23"]))
            .unwrap();
        assert_eq!(dev.parameter("rf"), Some(23.0));
        assert_eq!(
            table.invoke(&mut dev, "rfGet", &CallArgs::none()),
            Ok(Value::Float(23.0))
        );
    }

    #[test]
    fn test_set_rejects_bad_arguments() {
        let mut dev = laser();
        let table = dev.methods();
        assert!(matches!(
            table.invoke(&mut dev, "rfSet", &CallArgs::positional(["hot"])),
            Err(CallError::InvalidArguments(_))
        ));
        assert!(matches!(
            table.invoke(&mut dev, "rfSet", &CallArgs::none()),
            Err(CallError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_echo_joins_arguments() {
        let mut dev = laser();
        let table = dev.methods();
        let args = CallArgs::positional(["a", "b"]).with_keyword("k", "v");
        assert_eq!(table.invoke(&mut dev, "echo", &args), Ok(Value::from("a,b,k=v")));
    }

    #[test]
    fn test_fail_reports_connection_lost() {
        let mut dev = laser();
        let table = dev.methods();
        let err = table.invoke(&mut dev, "fail", &CallArgs::none()).unwrap_err();
        assert!(err.is_connection_lost());
    }
}
