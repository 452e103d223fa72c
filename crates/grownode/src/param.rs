//! Typed leaf parameters and the per-leaf parameter table.

use serde::Serialize;
use std::collections::HashMap;

use crate::error::{GrowError, Result};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Bool(bool),
    Double(f64),
}

const TAG_STR: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_DOUBLE: u8 = 0x03;

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Str(_) => "string",
            ParamValue::Bool(_) => "bool",
            ParamValue::Double(_) => "double",
        }
    }

    pub fn same_type(&self, other: &ParamValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Text form carried by `ParamChanged` events: `"1"`/`"0"` for booleans,
    /// six decimals for doubles, verbatim for strings.
    pub fn to_payload(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Bool(true) => "1".to_string(),
            ParamValue::Bool(false) => "0".to_string(),
            ParamValue::Double(d) => format!("{d:.6}"),
        }
    }

    /// Parse request text into a value of the same type as `self`.
    pub fn parse_as(&self, text: &str) -> Result<ParamValue> {
        let text = text.trim();
        match self {
            ParamValue::Str(_) => Ok(ParamValue::Str(text.to_string())),
            ParamValue::Bool(_) => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(ParamValue::Bool(true)),
                "0" | "false" | "off" => Ok(ParamValue::Bool(false)),
                _ => Err(GrowError::invalid(format!("'{text}' is not a boolean"))),
            },
            ParamValue::Double(_) => text
                .parse::<f64>()
                .map(ParamValue::Double)
                .map_err(|_| GrowError::invalid(format!("'{text}' is not a number"))),
        }
    }

    /// Tagged binary encoding used by the persisted store. Doubles are
    /// stored as their IEEE-754 bits so they round-trip exactly.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ParamValue::Str(s) => {
                let mut out = Vec::with_capacity(s.len() + 1);
                out.push(TAG_STR);
                out.extend_from_slice(s.as_bytes());
                out
            }
            ParamValue::Bool(b) => vec![TAG_BOOL, u8::from(*b)],
            ParamValue::Double(d) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&d.to_le_bytes());
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<ParamValue> {
        let (tag, body) = bytes.split_first()?;
        match *tag {
            TAG_STR => String::from_utf8(body.to_vec()).ok().map(ParamValue::Str),
            TAG_BOOL => match body {
                [b] => Some(ParamValue::Bool(*b != 0)),
                _ => None,
            },
            TAG_DOUBLE => {
                let raw: [u8; 8] = body.try_into().ok()?;
                Some(ParamValue::Double(f64::from_le_bytes(raw)))
            }
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

// ---------------------------------------------------------------------------
// Access, storage, validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    Network,
}

impl Access {
    pub fn is_writable(self) -> bool {
        self != Access::Read
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    Transient,
    Persisted,
}

/// Validator verdict. On `BelowMin`/`AboveMax` the carried value is the
/// boundary that gets committed instead of the proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Passed,
    BelowMin(ParamValue),
    AboveMax(ParamValue),
    Error,
}

pub type Validator = fn(&ParamValue) -> Validation;

/// Range check for double parameters, for use inside validators.
pub fn check_range(value: &ParamValue, min: f64, max: f64) -> Validation {
    match value.as_f64() {
        None => Validation::Error,
        Some(v) if v.is_nan() => Validation::Error,
        Some(v) if v < min => Validation::BelowMin(ParamValue::Double(min)),
        Some(v) if v > max => Validation::AboveMax(ParamValue::Double(max)),
        Some(_) => Validation::Passed,
    }
}

// ---------------------------------------------------------------------------
// Parameter + table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
    pub access: Access,
    pub storage: Storage,
    pub validator: Option<Validator>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamView {
    pub name: String,
    pub value: ParamValue,
    pub access: Access,
    pub storage: Storage,
}

/// Parameters of one leaf, unique by name, enumerated in insertion order.
#[derive(Debug, Default)]
pub struct ParamTable {
    params: Vec<Param>,
    index: HashMap<String, usize>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new parameter. A duplicate name is rejected and the existing
    /// entry is kept.
    pub fn insert(&mut self, param: Param) -> std::result::Result<(), Param> {
        if self.index.contains_key(&param.name) {
            return Err(param);
        }
        self.index.insert(param.name.clone(), self.params.len());
        self.params.push(param);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        match self.index.get(name) {
            Some(&i) => self.params.get_mut(i),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// `{ "<param>": <value>, ... }` in insertion order.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for p in &self.params {
            let v = serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null);
            map.insert(p.name.clone(), v);
        }
        serde_json::Value::Object(map)
    }

    pub fn views(&self) -> Vec<ParamView> {
        self.params
            .iter()
            .map(|p| ParamView {
                name: p.name.clone(),
                value: p.value.clone(),
                access: p.access,
                storage: p.storage,
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
