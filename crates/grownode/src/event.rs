//! Events carried by the bus and delivered into leaf mailboxes.

use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

/// Largest payload an event carries; longer payloads are truncated.
pub const EVENT_PAYLOAD_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NetworkConnected,
    NetworkDisconnected,
    ServerConnected,
    ServerDisconnected,
    NodeStarted,
    KeepaliveTick,
    /// External request to mutate a leaf parameter.
    ParamChangeRequest,
    /// A parameter was committed; payload is the new value as text.
    ParamChanged,
    RebootRequest,
    UpdateRequest,
    ResetRequest,
    DisplayLog,
    LeafAdded,
}

/// How long a poster may wait when the bus is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Short bounded wait, then give up.
    Lossy,
    /// Wait as long as it takes; these must not be dropped.
    Guaranteed,
}

impl EventKind {
    pub fn delivery(self) -> Delivery {
        match self {
            EventKind::ParamChanged | EventKind::KeepaliveTick | EventKind::DisplayLog => {
                Delivery::Lossy
            }
            _ => Delivery::Guaranteed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NetworkConnected => "network_connected",
            EventKind::NetworkDisconnected => "network_disconnected",
            EventKind::ServerConnected => "server_connected",
            EventKind::ServerDisconnected => "server_disconnected",
            EventKind::NodeStarted => "node_started",
            EventKind::KeepaliveTick => "keepalive_tick",
            EventKind::ParamChangeRequest => "param_change_request",
            EventKind::ParamChanged => "param_changed",
            EventKind::RebootRequest => "reboot_request",
            EventKind::UpdateRequest => "update_request",
            EventKind::ResetRequest => "reset_request",
            EventKind::DisplayLog => "display_log",
            EventKind::LeafAdded => "leaf_added",
        }
    }

    /// Connectivity losses are also fanned out to every leaf.
    pub fn is_connectivity_loss(self) -> bool {
        matches!(
            self,
            EventKind::NetworkDisconnected | EventKind::ServerDisconnected
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub leaf: Option<String>,
    pub param: Option<String>,
    payload: Vec<u8>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            leaf: None,
            param: None,
            payload: Vec::new(),
        }
    }

    /// Leaf-addressed event. The payload is truncated to
    /// [`EVENT_PAYLOAD_MAX`] bytes.
    pub fn for_param(
        kind: EventKind,
        leaf: impl Into<String>,
        param: impl Into<String>,
        payload: impl AsRef<[u8]>,
    ) -> Self {
        let payload = payload.as_ref();
        let len = payload.len().min(EVENT_PAYLOAD_MAX);
        Self {
            kind,
            leaf: Some(leaf.into()),
            param: Some(param.into()),
            payload: payload[..len].to_vec(),
        }
    }

    pub fn change_request(leaf: &str, param: &str, payload: impl AsRef<[u8]>) -> Self {
        Self::for_param(EventKind::ParamChangeRequest, leaf, param, payload)
    }

    pub fn log(message: &str) -> Self {
        let mut ev = Self::new(EventKind::DisplayLog);
        let len = message.len().min(EVENT_PAYLOAD_MAX);
        ev.payload = message.as_bytes()[..len].to_vec();
        ev
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text with surrounding whitespace and a trailing NUL removed.
    pub fn payload_str(&self) -> Cow<'_, str> {
        let bytes = self.payload.strip_suffix(&[0]).unwrap_or(&self.payload);
        match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(s) => Cow::Borrowed(s.trim()),
            Cow::Owned(s) => Cow::Owned(s.trim().to_string()),
        }
    }

    /// True when the event addresses `param` on `leaf`.
    pub fn targets(&self, leaf: &str, param: &str) -> bool {
        self.leaf.as_deref() == Some(leaf) && self.param.as_deref() == Some(param)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
