//! Line protocol of the command server.
//!
//! Requests are plain text, one per line or per read:
//!
//! ```text
//! LASER                     liveness probe
//! LASER:rfGet               call without arguments
//! LASER:rfSet:23            colon form
//! LASER:rfSet(23,mode=cw)   parenthesised form (what scripts send)
//! ```
//!
//! Every reply starts with a numeric class and a dash. Synchronous replies
//! use `0-` to `4-`; the asynchronous result of a call is `0-<value>` on
//! success and `1-<error>` on failure.

use std::fmt;

use crate::device::{CallArgs, CallError, CallOutcome};

/// One request line split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    /// Target device name.
    pub device: &'a str,
    /// Method name; `None` for a liveness probe.
    pub method: Option<&'a str>,
    /// Raw, still comma-separated argument list.
    pub args: &'a str,
}

impl<'a> Request<'a> {
    /// Split a request line. Never fails; argument syntax is checked by
    /// [`parse_args`].
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let Some((device, rest)) = line.split_once(':') else {
            return Self {
                device: line,
                method: None,
                args: "",
            };
        };

        let paren = rest.find('(');
        let colon = rest.find(':');
        let (method, args) = match (paren, colon) {
            (Some(open), colon) if colon.map_or(true, |c| open < c) => {
                let inner = &rest[open + 1..];
                (&rest[..open], inner.strip_suffix(')').unwrap_or(inner))
            }
            _ => rest.split_once(':').unwrap_or((rest, "")),
        };

        let method = method.trim();
        Self {
            device: device.trim(),
            method: (!method.is_empty()).then_some(method),
            args: args.trim(),
        }
    }
}

/// Parse a comma-separated argument list.
///
/// Tokens containing `=` become keyword arguments and must be exactly
/// `name=value`. On failure the offending token is returned.
pub fn parse_args(raw: &str) -> Result<CallArgs, String> {
    let mut args = CallArgs::none();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !token.contains('=') {
            args.positional.push(token.to_string());
            continue;
        }
        let mut parts = token.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(value), None) if !name.trim().is_empty() => {
                args.keyword
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
            _ => return Err(token.to_string()),
        }
    }
    Ok(args)
}

/// Reply written back to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `0-Ok`: the device exists and is connected.
    Ok,
    /// `1-`: no device with this name is registered.
    UnknownDevice {
        /// Requested name.
        device: String,
        /// Registered names.
        known: Vec<String>,
    },
    /// `2-`: the device is registered but not connected.
    NotConnected,
    /// `3-`: a keyword argument was not `name=value`.
    BadKeyword {
        /// Offending token.
        token: String,
    },
    /// `4-`: the call was rejected before it was queued.
    Rejected {
        /// Device name.
        device: String,
        /// Method name.
        method: String,
        /// Parsed arguments.
        args: CallArgs,
        /// Why the call was rejected.
        error: CallError,
    },
    /// Asynchronous outcome of a queued call.
    Outcome(CallOutcome),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("0-Ok"),
            Self::UnknownDevice { device, known } => {
                write!(f, "1-Device {device} not in device list {known:?}")
            }
            Self::NotConnected => f.write_str("2-Device connection is not established"),
            Self::BadKeyword { token } => write!(
                f,
                "3-Key word arguments must be of \"name=value\", provided was \"{token}\""
            ),
            Self::Rejected {
                device,
                method,
                args,
                error,
            } => write!(
                f,
                "4-Got error while calling function \"{method}({:?}, {:?})\" for device \"{device}\": {error}",
                args.positional, args.keyword
            ),
            Self::Outcome(Ok(value)) => write!(f, "0-{value}"),
            Self::Outcome(Err(error)) => write!(f, "1-{error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Value;

    #[test]
    fn test_parse_probe() {
        let req = Request::parse("LASER\r\n");
        assert_eq!(req.device, "LASER");
        assert_eq!(req.method, None);
    }

    #[test]
    fn test_parse_colon_form() {
        let req = Request::parse("LASER:rfSet:23,mode=cw");
        assert_eq!(req.method, Some("rfSet"));
        assert_eq!(req.args, "23,mode=cw");

        let bare = Request::parse("LASER:idn");
        assert_eq!(bare.method, Some("idn"));
        assert_eq!(bare.args, "");
    }

    #[test]
    fn test_parse_paren_form() {
        let req = Request::parse("LASER:rfSet(23)");
        assert_eq!(req.device, "LASER");
        assert_eq!(req.method, Some("rfSet"));
        assert_eq!(req.args, "23");

        let empty = Request::parse("UNKNOWN:foo()");
        assert_eq!(empty.method, Some("foo"));
        assert_eq!(empty.args, "");
    }

    #[test]
    fn test_empty_method_is_probe() {
        assert_eq!(Request::parse("LASER:").method, None);
    }

    #[test]
    fn test_parse_args_splits_keywords() {
        let args = parse_args("23, 24 ,mode=cw").unwrap();
        assert_eq!(args.positional, vec!["23", "24"]);
        assert_eq!(args.keyword.get("mode").map(String::as_str), Some("cw"));
        assert!(parse_args("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_args_rejects_malformed_keyword() {
        assert_eq!(parse_args("abc=1=2").unwrap_err(), "abc=1=2");
        assert_eq!(parse_args("1,=5").unwrap_err(), "=5");
    }

    #[test]
    fn test_reply_codes() {
        let unknown = Reply::UnknownDevice {
            device: "UNKNOWN".into(),
            known: vec!["LASER".into()],
        };
        assert_eq!(unknown.to_string(), "1-Device UNKNOWN not in device list [\"LASER\"]");
        assert_eq!(Reply::NotConnected.to_string(), "2-Device connection is not established");
        assert!(Reply::BadKeyword { token: "a=b=c".into() }
            .to_string()
            .starts_with("3-"));
        assert_eq!(Reply::Outcome(Ok(Value::Float(23.0))).to_string(), "0-23");
        assert_eq!(Reply::Outcome(Ok(Value::Unit)).to_string(), "0-");
        assert!(Reply::Outcome(Err(CallError::Evicted)).to_string().starts_with("1-"));
    }

    #[test]
    fn test_rejected_reply_names_call() {
        let reply = Reply::Rejected {
            device: "LASER".into(),
            method: "warp".into(),
            args: CallArgs::positional(["9"]),
            error: CallError::UnknownMethod { method: "warp".into() },
        };
        assert_eq!(
            reply.to_string(),
            "4-Got error while calling function \"warp([\"9\"], {})\" for device \"LASER\": Unknown method \"warp\""
        );
    }
}
