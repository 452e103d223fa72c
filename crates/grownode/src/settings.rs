//! TOML settings loading, environment overrides and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Upper bound for node, leaf and parameter names.
pub const MAX_NAME_LEN: usize = 32;

/// Leaf kinds the node binary knows how to build.
pub const LEAF_KINDS: &[&str] = &["relay", "pump", "water_level", "temperature", "watering"];

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeSection,
    pub mqtt: MqttSection,
    pub store: StoreSection,
    pub runtime: RuntimeSection,
    pub web: WebSection,
    pub leaves: Vec<LeafEntry>,
    pub watering: WateringSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,
    /// Prefix for every broker topic (`P` in `P/{leaf}/status`).
    pub base_topic: String,
    pub keepalive_sec: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "grownode".to_string(),
            base_topic: "grownode".to_string(),
            keepalive_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub outbox_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "grownode".to_string(),
            outbox_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// e.g. "sqlite:grownode.db?mode=rwc" or "sqlite::memory:" in tests.
    pub url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: "sqlite:grownode.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub bus_capacity: usize,
    /// Depth of each leaf mailbox. 1 keeps the one-pending-event backpressure.
    pub mailbox_capacity: usize,
    pub max_leaves: usize,
    /// How long a leaf waits on its mailbox before doing periodic work.
    pub leaf_poll_ms: u64,
    pub leaf_yield_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            bus_capacity: 32,
            mailbox_capacity: 1,
            max_leaves: 16,
            leaf_poll_ms: 100,
            leaf_yield_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeafEntry {
    pub name: String,
    pub kind: String,
    /// Output pin for relay/pump leaves.
    #[serde(default)]
    pub gpio: Option<i64>,
    #[serde(default)]
    pub active_low: Option<bool>,
    /// Probe count for temperature leaves.
    #[serde(default)]
    pub probes: Option<usize>,
}

/// Supervisor tuning plus the names of the sibling leaves it drives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WateringSection {
    pub poll_ms: u64,
    pub max_thermal_cycle_sec: u64,
    pub water_level: String,
    pub temperature: String,
    pub plate_a: String,
    pub plate_b: String,
    pub conditioning_pump: String,
    pub irrigation_pump: String,
}

impl Default for WateringSection {
    fn default() -> Self {
        Self {
            poll_ms: 1000,
            max_thermal_cycle_sec: 300,
            water_level: "waterlevelin".to_string(),
            temperature: "ds18b20".to_string(),
            plate_a: "plt_a".to_string(),
            plate_b: "plt_b".to_string(),
            conditioning_pump: "hcc".to_string(),
            irrigation_pump: "waterpumpin".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Checks a node/leaf/parameter name against the naming rules. Returns the
/// violation text, if any.
pub fn check_name(name: &str) -> Option<String> {
    if name.trim().is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_NAME_LEN {
        Some(format!("name '{name}' longer than {MAX_NAME_LEN} bytes"))
    } else if name.contains(['/', '+', '#']) {
        Some(format!("name '{name}' contains a topic separator or wildcard"))
    } else {
        None
    }
}

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_node(&mut errors);
        self.validate_runtime(&mut errors);
        self.validate_leaves(&mut errors);
        self.validate_watering(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_node(&self, errors: &mut Vec<String>) {
        if let Some(e) = check_name(&self.node.name) {
            errors.push(format!("node: {e}"));
        }

        let topic = &self.node.base_topic;
        if topic.trim().is_empty() {
            errors.push("node: base_topic is empty".to_string());
        } else if topic.contains(['+', '#']) {
            errors.push(format!("node: base_topic '{topic}' contains a wildcard"));
        } else if topic.starts_with('/') || topic.ends_with('/') {
            errors.push(format!(
                "node: base_topic '{topic}' must not start or end with '/'"
            ));
        }

        if self.node.keepalive_sec == 0 {
            errors.push("node: keepalive_sec must be positive".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".to_string());
        }
        if self.mqtt.outbox_capacity == 0 {
            errors.push("mqtt: outbox_capacity must be at least 1".to_string());
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        let rt = &self.runtime;
        if rt.bus_capacity == 0 {
            errors.push("runtime: bus_capacity must be at least 1".to_string());
        }
        if rt.mailbox_capacity == 0 {
            errors.push("runtime: mailbox_capacity must be at least 1".to_string());
        }
        if rt.max_leaves == 0 {
            errors.push("runtime: max_leaves must be at least 1".to_string());
        }
        if rt.leaf_poll_ms == 0 {
            errors.push("runtime: leaf_poll_ms must be positive".to_string());
        }
    }

    fn validate_leaves(&self, errors: &mut Vec<String>) {
        let mut seen_pins: HashSet<i64> = HashSet::new();

        if self.leaves.len() > self.runtime.max_leaves {
            errors.push(format!(
                "leaves: {} configured but max_leaves is {}",
                self.leaves.len(),
                self.runtime.max_leaves
            ));
        }

        for (i, leaf) in self.leaves.iter().enumerate() {
            let ctx = || {
                if leaf.name.is_empty() {
                    format!("leaves[{i}]")
                } else {
                    format!("leaf '{}'", leaf.name)
                }
            };

            if let Some(e) = check_name(&leaf.name) {
                errors.push(format!("{}: {e}", ctx()));
            }

            if !LEAF_KINDS.contains(&leaf.kind.as_str()) {
                errors.push(format!(
                    "{}: unknown kind '{}' (known: {})",
                    ctx(),
                    leaf.kind,
                    LEAF_KINDS.join(", ")
                ));
            }

            if let Some(pin) = leaf.gpio {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx()
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!(
                        "{}: gpio {pin} is already used by another leaf",
                        ctx()
                    ));
                }
            }

            if leaf.kind == "temperature" && leaf.probes == Some(0) {
                errors.push(format!("{}: probes must be at least 1", ctx()));
            }
        }
    }

    fn validate_watering(&self, errors: &mut Vec<String>) {
        let w = &self.watering;
        if w.poll_ms == 0 {
            errors.push("watering: poll_ms must be positive".to_string());
        }
        if w.max_thermal_cycle_sec == 0 {
            errors.push("watering: max_thermal_cycle_sec must be positive".to_string());
        }
        for (field, name) in [
            ("water_level", &w.water_level),
            ("temperature", &w.temperature),
            ("plate_a", &w.plate_a),
            ("plate_b", &w.plate_b),
            ("conditioning_pump", &w.conditioning_pump),
            ("irrigation_pump", &w.irrigation_pump),
        ] {
            if let Some(e) = check_name(name) {
                errors.push(format!("watering: {field}: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply overrides using `lookup` for variable access. Unparseable
    /// numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("NODE_NAME") {
            self.node.name = v;
        }
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            match v.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring unparseable MQTT_PORT"),
            }
        }
        if let Some(v) = lookup("STORE_URL") {
            self.store.url = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            match v.parse() {
                Ok(port) => self.web.port = port,
                Err(_) => tracing::warn!(value = %v, "ignoring unparseable WEB_PORT"),
            }
        }
        // Many common relay boards are active-low. This sets the default for
        // leaves that do not say otherwise.
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            let active_low = v == "1" || v.eq_ignore_ascii_case("true");
            for leaf in self.leaves.iter_mut().filter(|l| l.active_low.is_none()) {
                leaf.active_low = Some(active_low);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse settings from TOML text without validating them.
pub fn from_toml_str(contents: &str) -> Result<Settings> {
    toml::from_str(contents).context("failed to parse settings")
}

/// Read the settings file (defaults if absent), apply environment
/// overrides, then validate.
pub fn load(path: &str) -> Result<Settings> {
    let mut settings = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {path}"))?;
        from_toml_str(&contents).with_context(|| format!("in {path}"))?
    } else {
        tracing::warn!(path, "settings file not found, using defaults");
        Settings::default()
    };

    settings.apply_overrides(|k| std::env::var(k).ok());
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;

    tracing::info!(
        node = %settings.node.name,
        leaves = settings.leaves.len(),
        "settings loaded"
    );
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // -- Helper: a settings value that passes validation -------------------

    fn valid_settings() -> Settings {
        from_toml_str(
            r#"
            [node]
            name = "greenhouse"
            base_topic = "gh/node1"

            [[leaves]]
            name = "plt_a"
            kind = "relay"
            gpio = 17

            [[leaves]]
            name = "ds18b20"
            kind = "temperature"
            probes = 2
            "#,
        )
        .unwrap()
    }

    /// Assert that validation fails and the error message contains `needle`.
    fn assert_validation_err(settings: &Settings, needle: &str) {
        let err = settings.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing '{needle}', got:\n{msg}"
        );
    }

    // -- Baseline -----------------------------------------------------------

    #[test]
    fn valid_settings_pass() {
        valid_settings().validate().unwrap();
    }

    #[test]
    fn shipped_settings_file_is_valid() {
        let s = from_toml_str(include_str!("../../node/grownode.toml")).unwrap();
        s.validate().unwrap();
        assert_eq!(s.leaves.len(), 7);
        assert_eq!(s.leaves.last().unwrap().kind, "watering");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let s = from_toml_str("").unwrap();
        assert_eq!(s.node.name, "grownode");
        assert_eq!(s.runtime.mailbox_capacity, 1);
        assert_eq!(s.watering.poll_ms, 1000);
        assert_eq!(s.watering.water_level, "waterlevelin");
        s.validate().unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = load("/nonexistent/grownode.toml").unwrap();
        assert_eq!(s.mqtt.port, 1883);
    }

    // -- Node section -------------------------------------------------------

    #[test]
    fn wildcard_in_base_topic_rejected() {
        let mut s = valid_settings();
        s.node.base_topic = "gh/+".into();
        assert_validation_err(&s, "wildcard");
    }

    #[test]
    fn trailing_slash_in_base_topic_rejected() {
        let mut s = valid_settings();
        s.node.base_topic = "gh/".into();
        assert_validation_err(&s, "must not start or end");
    }

    #[test]
    fn overlong_node_name_rejected() {
        let mut s = valid_settings();
        s.node.name = "x".repeat(MAX_NAME_LEN + 1);
        assert_validation_err(&s, "longer than");
    }

    // -- Runtime section ----------------------------------------------------

    #[test]
    fn zero_mailbox_capacity_rejected() {
        let mut s = valid_settings();
        s.runtime.mailbox_capacity = 0;
        assert_validation_err(&s, "mailbox_capacity");
    }

    #[test]
    fn too_many_leaves_rejected() {
        let mut s = valid_settings();
        s.runtime.max_leaves = 1;
        assert_validation_err(&s, "max_leaves is 1");
    }

    // -- Leaves -------------------------------------------------------------

    #[test]
    fn unknown_leaf_kind_rejected() {
        let mut s = valid_settings();
        s.leaves[0].kind = "servo".into();
        assert_validation_err(&s, "unknown kind 'servo'");
    }

    #[test]
    fn reserved_gpio_rejected() {
        let mut s = valid_settings();
        s.leaves[0].gpio = Some(1);
        assert_validation_err(&s, "not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_gpio_rejected() {
        let mut s = valid_settings();
        s.leaves.push(LeafEntry {
            name: "plt_b".into(),
            kind: "relay".into(),
            gpio: Some(17),
            active_low: None,
            probes: None,
        });
        assert_validation_err(&s, "already used");
    }

    #[test]
    fn duplicate_leaf_names_are_allowed() {
        let mut s = valid_settings();
        s.leaves.push(LeafEntry {
            name: "plt_a".into(),
            kind: "relay".into(),
            gpio: None,
            active_low: None,
            probes: None,
        });
        s.validate().unwrap();
    }

    #[test]
    fn multiple_errors_reported_together() {
        let mut s = valid_settings();
        s.runtime.bus_capacity = 0;
        s.leaves[0].name = String::new();
        s.watering.poll_ms = 0;
        let msg = format!("{:#}", s.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got:\n{msg}");
    }

    // -- Overrides ----------------------------------------------------------

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("RELAY_ACTIVE_LOW", "false"),
        ]
        .into_iter()
        .collect();

        let mut s = valid_settings();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(s.mqtt.host, "broker.local");
        assert_eq!(s.mqtt.port, 8883);
        assert_eq!(s.leaves[0].active_low, Some(false));
    }

    #[test]
    fn bad_port_override_is_ignored() {
        let mut s = valid_settings();
        s.apply_overrides(|k| (k == "MQTT_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(s.mqtt.port, 1883);
    }

    #[test]
    fn check_name_rules() {
        assert!(check_name("relay_1").is_none());
        assert!(check_name("").is_some());
        assert!(check_name("a/b").is_some());
        assert!(check_name("a#").is_some());
    }
}
