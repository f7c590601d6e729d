use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved event names the router interprets itself.
pub mod names {
    /// A worker subscribes to one or more event names.
    pub const REGISTER: &str = "register";
    /// A worker revokes one or more subscriptions.
    pub const UNREGISTER: &str = "unregister";
    /// A worker (or, when emitted by the core, the whole box) became busy.
    pub const BUSY: &str = "busy";
    /// A worker (or, when emitted by the core, the whole box) became idle.
    pub const IDLE: &str = "idle";
    /// Periodic timer notification.
    pub const TICK: &str = "tick";
    /// Stop one worker (`target` payload field) or all of them.
    pub const TERMINATE: &str = "terminate";
    /// The box is about to power off.
    pub const SHUTDOWN: &str = "shutdown";
    /// A worker finished its initialization phase.
    pub const READY: &str = "ready";
    /// Every worker finished initializing (or the startup window elapsed).
    pub const FINISHED_LOADING: &str = "finished_loading";

    /// Payload field naming the worker a `terminate` is aimed at.
    pub const TARGET_FIELD: &str = "target";
    /// Payload field carrying the names for `register`/`unregister`.
    pub const EVENTS_FIELD: &str = "events";

    /// Names that can never be subscribed to.
    pub fn is_unsubscribable(name: &str) -> bool {
        matches!(name, REGISTER | UNREGISTER | READY | TICK)
    }
}

/// Stable identifier of a worker: the plugin's configured name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who put an event on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Core,
    Worker(WorkerId),
}

impl Origin {
    /// Name used when matching event map rules; the core matches as `core`.
    pub fn as_str(&self) -> &str {
        match self {
            Origin::Core => "core",
            Origin::Worker(id) => id.as_str(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WorkerId> for Origin {
    fn from(value: WorkerId) -> Self {
        Origin::Worker(value)
    }
}

/// A single payload value: a scalar or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl PayloadValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PayloadValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            PayloadValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Bool(value) => write!(f, "{value}"),
            PayloadValue::Integer(value) => write!(f, "{value}"),
            PayloadValue::Float(value) => write!(f, "{value}"),
            PayloadValue::Text(value) => f.write_str(value),
            PayloadValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_owned())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Integer(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<Vec<String>> for PayloadValue {
    fn from(value: Vec<String>) -> Self {
        PayloadValue::List(value)
    }
}

pub type Payload = BTreeMap<String, PayloadValue>;

/// A named, payload-carrying message on the bus.
///
/// Events are immutable once built; the `with_*` constructors consume `self`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    payload: Payload,
    origin: Origin,
}

impl Event {
    pub fn new(name: impl Into<String>, origin: Origin) -> Self {
        Self {
            name: name.into(),
            payload: Payload::new(),
            origin,
        }
    }

    /// An event emitted by the supervisor itself.
    pub fn core(name: impl Into<String>) -> Self {
        Self::new(name, Origin::Core)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn field(&self, key: &str) -> Option<&PayloadValue> {
        self.payload.get(key)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }
}
