//! Process boundary envelope
//!
//! The host and the runner exchange one JSON document per line over the
//! runner's stdin/stdout:
//!
//! ```text
//! host -> runner   {"type":"storyrun/run-state","args":[{event,eventInfo}],"from":"server"}
//! runner -> host   {"type":"ready"}
//!                  {"type":"uncaught-error","payload":{message,name,stack}}
//!                  {"type":"storyrun/status","args":[...],"from":"runner"}
//!                  {"type":"<anything else>","args":[...]}
//! ```

use crate::store::{WireEvent, CHANNELS};
use crate::types::ErrorLike;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const READY: &str = "ready";
pub const UNCAUGHT_ERROR: &str = "uncaught-error";

/// One line on the process boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// An inbound envelope, classified
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    Ready,
    UncaughtError(ErrorLike),
    Channel {
        name: String,
        events: Vec<WireEvent>,
    },
    Other {
        kind: String,
        args: Vec<Value>,
    },
}

impl Envelope {
    pub fn ready() -> Self {
        Self {
            kind: READY.to_string(),
            args: Vec::new(),
            from: None,
            payload: None,
        }
    }

    pub fn uncaught_error(error: &ErrorLike) -> Self {
        Self {
            kind: UNCAUGHT_ERROR.to_string(),
            args: Vec::new(),
            from: None,
            payload: serde_json::to_value(error).ok(),
        }
    }

    /// A replicated store message for `channel`
    pub fn channel(channel: &str, event: WireEvent, from: &str) -> Self {
        Self {
            kind: channel.to_string(),
            args: vec![serde_json::to_value(event).unwrap_or(Value::Null)],
            from: Some(from.to_string()),
            payload: None,
        }
    }

    /// An arbitrary event to be re-emitted on the other side
    pub fn event(kind: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            args,
            from: None,
            payload: None,
        }
    }

    pub fn is_channel(&self) -> bool {
        CHANNELS.contains(&self.kind.as_str())
    }

    /// Decode the `args` of a channel envelope
    pub fn wire_events(&self) -> Result<Vec<WireEvent>> {
        self.args
            .iter()
            .map(|arg| serde_json::from_value(arg.clone()).map_err(Error::from))
            .collect()
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line; lines that are not envelopes are protocol errors
    pub fn from_line(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Err(Error::Protocol(format!("Not an envelope: {}", trimmed)));
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    pub fn classify(self) -> Result<ChildMessage> {
        match self.kind.as_str() {
            READY => Ok(ChildMessage::Ready),
            UNCAUGHT_ERROR => {
                let payload = self
                    .payload
                    .ok_or_else(|| Error::Protocol("uncaught-error without payload".into()))?;
                Ok(ChildMessage::UncaughtError(serde_json::from_value(payload)?))
            }
            _ if self.is_channel() => {
                let events = self.wire_events()?;
                Ok(ChildMessage::Channel {
                    name: self.kind,
                    events,
                })
            }
            _ => Ok(ChildMessage::Other {
                kind: self.kind,
                args: self.args,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RUN_STATE_CHANNEL;

    #[test]
    fn test_classify_ready_and_crash() {
        let ready = Envelope::from_line(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready.classify().unwrap(), ChildMessage::Ready);

        let crash = Envelope::from_line(
            r#"{"type":"uncaught-error","payload":{"name":"panic","message":"index out of bounds","stack":"at main"}}"#,
        )
        .unwrap();
        match crash.classify().unwrap() {
            ChildMessage::UncaughtError(err) => {
                assert_eq!(err.name, "panic");
                assert_eq!(err.stack.as_deref(), Some("at main"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_types_pass_through() {
        let env = Envelope::from_line(r#"{"type":"storyrun/telemetry","args":[1,"x"]}"#).unwrap();
        assert_eq!(
            env.classify().unwrap(),
            ChildMessage::Other {
                kind: "storyrun/telemetry".into(),
                args: vec![serde_json::json!(1), serde_json::json!("x")],
            }
        );
    }

    #[test]
    fn test_plain_output_is_not_an_envelope() {
        assert!(Envelope::from_line("vite v5.0.0 ready in 300ms").is_err());
    }

    #[test]
    fn test_channel_envelope_keeps_server_origin() {
        let line = r#"{"type":"storyrun/run-state","args":[{"event":{"kind":"event","body":{"type":"CANCEL_RUN"}},"eventInfo":{"actor":{"id":"a","environment":"server"},"version":3}}],"from":"server"}"#;
        let env = Envelope::from_line(line).unwrap();
        assert_eq!(env.from.as_deref(), Some("server"));
        match env.classify().unwrap() {
            ChildMessage::Channel { name, events } => {
                assert_eq!(name, RUN_STATE_CHANNEL);
                assert_eq!(events[0].event_info.version, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
