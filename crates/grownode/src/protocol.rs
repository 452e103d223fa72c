//! MQTT wire format: topic layout, inbound command parsing and outbound
//! status payloads.

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind};

// ---------------------------------------------------------------------------
// Topic layout
// ---------------------------------------------------------------------------

/// Topic builder for one base prefix (`P`).
///
/// | topic                     | direction | payload                    |
/// |---------------------------|-----------|----------------------------|
/// | `P/status`                | out       | `{"deviceName": ...}`      |
/// | `P/{leaf}/status`         | out       | parameter snapshot         |
/// | `P/{leaf}/command`        | in        | `{"param": .., "value": ..}` |
/// | `P/{leaf}/command/{param}`| in        | raw value text             |
/// | `P/command`               | in        | `RBT` / `OTA` / `RST`      |
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn node_status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn node_command(&self) -> String {
        format!("{}/command", self.prefix)
    }

    pub fn leaf_status(&self, leaf: &str) -> String {
        format!("{}/{leaf}/status", self.prefix)
    }

    pub fn leaf_command(&self, leaf: &str) -> String {
        format!("{}/{leaf}/command", self.prefix)
    }

    pub fn leaf_param_command(&self, leaf: &str, param: &str) -> String {
        format!("{}/{leaf}/command/{param}", self.prefix)
    }

    /// Filters the node subscribes to after every (re)connect.
    pub fn subscriptions(&self) -> [String; 3] {
        [
            self.node_command(),
            format!("{}/+/command", self.prefix),
            format!("{}/+/command/+", self.prefix),
        ]
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Node announce on `P/status`. `action` is only present on maintenance
/// notices.
#[derive(Debug, Serialize)]
pub struct NodeAnnounce<'a> {
    #[serde(rename = "deviceName")]
    pub device_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CommandMsg {
    param: String,
    value: serde_json::Value,
}

/// What an inbound broker message asks the node to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ParamChange {
        leaf: String,
        param: String,
        payload: Vec<u8>,
    },
    Maintenance(EventKind),
}

impl Inbound {
    pub fn into_event(self) -> Event {
        match self {
            Inbound::ParamChange {
                leaf,
                param,
                payload,
            } => Event::change_request(&leaf, &param, payload),
            Inbound::Maintenance(kind) => Event::new(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn clean_payload(payload: &[u8]) -> &[u8] {
    let payload = payload.strip_suffix(&[0]).unwrap_or(payload);
    let start = payload
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(payload.len());
    let end = payload
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &payload[start..end]
}

/// Parse `RBT` / `OTA` / `RST` (case-insensitive).
pub fn parse_maintenance(payload: &[u8]) -> Option<EventKind> {
    let s = String::from_utf8_lossy(clean_payload(payload)).to_uppercase();
    match s.as_str() {
        "RBT" => Some(EventKind::RebootRequest),
        "OTA" => Some(EventKind::UpdateRequest),
        "RST" => Some(EventKind::ResetRequest),
        _ => None,
    }
}

fn json_value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(true) => Some("1".to_string()),
        serde_json::Value::Bool(false) => Some("0".to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map an inbound `(topic, payload)` to a request, or `None` when the topic
/// is not ours or the payload is unusable.
pub fn parse_inbound(topics: &Topics, topic: &str, payload: &[u8]) -> Option<Inbound> {
    let rest = topic
        .strip_prefix(topics.prefix())
        .and_then(|r| r.strip_prefix('/'))?;

    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        ["command"] => parse_maintenance(payload).map(Inbound::Maintenance),
        [leaf, "command", param] if !leaf.is_empty() && !param.is_empty() => {
            Some(Inbound::ParamChange {
                leaf: leaf.to_string(),
                param: param.to_string(),
                payload: clean_payload(payload).to_vec(),
            })
        }
        [leaf, "command"] if !leaf.is_empty() => {
            let msg: CommandMsg = serde_json::from_slice(clean_payload(payload)).ok()?;
            let text = json_value_text(&msg.value)?;
            if msg.param.is_empty() {
                return None;
            }
            Some(Inbound::ParamChange {
                leaf: leaf.to_string(),
                param: msg.param,
                payload: text.into_bytes(),
            })
        }
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("gh/node1")
    }

    fn change(leaf: &str, param: &str, payload: &str) -> Option<Inbound> {
        Some(Inbound::ParamChange {
            leaf: leaf.into(),
            param: param.into(),
            payload: payload.as_bytes().to_vec(),
        })
    }

    // -- topic building -----------------------------------------------------

    #[test]
    fn builds_topics() {
        let t = topics();
        assert_eq!(t.node_status(), "gh/node1/status");
        assert_eq!(t.leaf_status("pump"), "gh/node1/pump/status");
        assert_eq!(t.leaf_command("pump"), "gh/node1/pump/command");
        assert_eq!(
            t.leaf_param_command("pump", "power"),
            "gh/node1/pump/command/power"
        );
    }

    #[test]
    fn prefix_slashes_are_trimmed() {
        assert_eq!(Topics::new("/gh/").node_status(), "gh/status");
    }

    #[test]
    fn subscriptions_cover_all_command_forms() {
        let subs = topics().subscriptions();
        assert!(subs.contains(&"gh/node1/command".to_string()));
        assert!(subs.contains(&"gh/node1/+/command".to_string()));
        assert!(subs.contains(&"gh/node1/+/command/+".to_string()));
    }

    // -- announce -----------------------------------------------------------

    #[test]
    fn announce_serializes_device_name() {
        let json = serde_json::to_string(&NodeAnnounce {
            device_name: "greenhouse",
            action: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"deviceName":"greenhouse"}"#);
    }

    #[test]
    fn maintenance_notice_carries_action() {
        let json = serde_json::to_value(NodeAnnounce {
            device_name: "greenhouse",
            action: Some("reboot"),
        })
        .unwrap();
        assert_eq!(json["action"], "reboot");
    }

    // -- parse_inbound: sub-topic form -------------------------------------

    #[test]
    fn param_subtopic_raw_payload() {
        let t = topics();
        assert_eq!(
            parse_inbound(&t, "gh/node1/relay/command/status", b"1"),
            change("relay", "status", "1")
        );
    }

    #[test]
    fn param_subtopic_strips_nul_terminator() {
        let t = topics();
        assert_eq!(
            parse_inbound(&t, "gh/node1/relay/command/status", b"0\0"),
            change("relay", "status", "0")
        );
    }

    // -- parse_inbound: payload-field form ---------------------------------

    #[test]
    fn json_command_with_string_value() {
        let t = topics();
        let payload = br#"{"param":"wat_time","value":"30"}"#;
        assert_eq!(
            parse_inbound(&t, "gh/node1/watering/command", payload),
            change("watering", "wat_time", "30")
        );
    }

    #[test]
    fn json_command_with_bool_and_number_values() {
        let t = topics();
        assert_eq!(
            parse_inbound(&t, "gh/node1/w/command", br#"{"param":"active","value":true}"#),
            change("w", "active", "1")
        );
        assert_eq!(
            parse_inbound(&t, "gh/node1/w/command", br#"{"param":"wat_int","value":120}"#),
            change("w", "wat_int", "120")
        );
    }

    #[test]
    fn json_command_malformed_is_ignored() {
        let t = topics();
        assert_eq!(parse_inbound(&t, "gh/node1/w/command", b"not json"), None);
        assert_eq!(
            parse_inbound(&t, "gh/node1/w/command", br#"{"param":"","value":"1"}"#),
            None
        );
        assert_eq!(
            parse_inbound(&t, "gh/node1/w/command", br#"{"param":"a","value":[1]}"#),
            None
        );
    }

    // -- parse_inbound: maintenance ----------------------------------------

    #[test]
    fn maintenance_commands() {
        let t = topics();
        assert_eq!(
            parse_inbound(&t, "gh/node1/command", b"RBT"),
            Some(Inbound::Maintenance(EventKind::RebootRequest))
        );
        assert_eq!(
            parse_inbound(&t, "gh/node1/command", b"ota\n"),
            Some(Inbound::Maintenance(EventKind::UpdateRequest))
        );
        assert_eq!(
            parse_inbound(&t, "gh/node1/command", b"RST"),
            Some(Inbound::Maintenance(EventKind::ResetRequest))
        );
        assert_eq!(parse_inbound(&t, "gh/node1/command", b"DANCE"), None);
    }

    // -- parse_inbound: foreign topics -------------------------------------

    #[test]
    fn foreign_prefix_ignored() {
        let t = topics();
        assert_eq!(parse_inbound(&t, "other/relay/command/status", b"1"), None);
        assert_eq!(parse_inbound(&t, "gh/node10/relay/command/status", b"1"), None);
    }

    #[test]
    fn status_topics_are_not_commands() {
        let t = topics();
        assert_eq!(parse_inbound(&t, "gh/node1/status", b"{}"), None);
        assert_eq!(parse_inbound(&t, "gh/node1/relay/status", b"{}"), None);
    }

    #[test]
    fn too_many_segments_ignored() {
        let t = topics();
        assert_eq!(parse_inbound(&t, "gh/node1/a/command/b/c", b"1"), None);
    }

    #[test]
    fn into_event_builds_change_request() {
        let ev = change("relay", "status", "1").unwrap().into_event();
        assert_eq!(ev.kind, EventKind::ParamChangeRequest);
        assert!(ev.targets("relay", "status"));
        assert_eq!(ev.payload(), b"1");
    }
}
