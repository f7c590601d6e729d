//! Wire protocol between the supervisor and its workers.
//!
//! Every message is a single JSON object on its own line:
//!
//! ```text
//! {"name":"register","payload":{"events":["load_source","toggle"]}}
//! {"name":"raw","payload":{"code":"0123456789"}}
//! {"name":"tick"}
//! ```
//!
//! Frames carry no origin; the supervisor knows which pipe a line came from.

use jukebox_core::{names, Event, Origin, Payload, PayloadValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version announced by workers in their `ready` frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable holding the worker's configured name.
pub const WORKER_ID_ENV: &str = "JUKEBOX_WORKER_ID";

/// Payload field of `ready` carrying [`PROTOCOL_VERSION`].
pub const PROTOCOL_VERSION_FIELD: &str = "protocol_version";

/// One event as it crosses a worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame '{name}': {source}")]
    Encode {
        name: String,
        source: serde_json::Error,
    },
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame has an empty event name")]
    EmptyName,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// `ready` frame announcing this crate's protocol version.
    pub fn ready() -> Self {
        Self::new(names::READY).with_field(PROTOCOL_VERSION_FIELD, PROTOCOL_VERSION as i64)
    }

    pub fn tick() -> Self {
        Self::new(names::TICK)
    }

    pub fn terminate() -> Self {
        Self::new(names::TERMINATE)
    }

    /// Serialize to a single line without the trailing newline.
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|source| FrameError::Encode {
            name: self.name.clone(),
            source,
        })
    }

    pub fn decode(line: &str) -> Result<Self, FrameError> {
        let frame: Frame = serde_json::from_str(line.trim())?;
        if frame.name.trim().is_empty() {
            return Err(FrameError::EmptyName);
        }
        Ok(frame)
    }

    pub fn into_event(self, origin: Origin) -> Event {
        Event::new(self.name, origin).with_payload(self.payload)
    }
}

impl From<&Event> for Frame {
    fn from(event: &Event) -> Self {
        Self {
            name: event.name().to_string(),
            payload: event.payload().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_core::WorkerId;

    #[test]
    fn empty_payload_is_omitted() {
        let json = Frame::tick().encode().unwrap();
        assert_eq!(json, r#"{"name":"tick"}"#);
    }

    #[test]
    fn frame_without_payload_decodes() {
        let frame = Frame::decode("{\"name\":\"12_short\"}\n").unwrap();
        assert_eq!(frame.name, "12_short");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn register_payload_keeps_list() {
        let frame =
            Frame::decode(r#"{"name":"register","payload":{"events":["toggle","next"]}}"#).unwrap();
        assert_eq!(
            frame.payload[names::EVENTS_FIELD].as_list(),
            Some(&["toggle".to_string(), "next".to_string()][..])
        );
    }

    #[test]
    fn empty_name_rejected() {
        let err = Frame::decode(r#"{"name":"  "}"#).unwrap_err();
        assert!(matches!(err, FrameError::EmptyName));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn into_event_attaches_origin() {
        let origin = Origin::Worker(WorkerId::new("rfid_reader"));
        let event = Frame::new("raw")
            .with_field("code", "0123456789")
            .into_event(origin.clone());
        assert_eq!(event.origin(), &origin);
        assert_eq!(Frame::from(&event).payload["code"].to_string(), "0123456789");
    }
}
