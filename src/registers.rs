//! Register metadata and the typed values decoded from register words.

use crate::derived::Derived;
use crate::discovery::Discovery;
use std::collections::BTreeMap;

/// The tag that partitions the register catalog into independently polled sets.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::VariantArray,
    clap::ValueEnum,
)]
pub enum RegisterGroup {
    #[serde(rename = "now-base")]
    #[strum(serialize = "now-base")]
    #[value(name = "now-base")]
    Base,
    #[serde(rename = "now-grid")]
    #[strum(serialize = "now-grid")]
    #[value(name = "now-grid")]
    Grid,
    #[serde(rename = "now-inverter")]
    #[strum(serialize = "now-inverter")]
    #[value(name = "now-inverter")]
    Inverter,
    #[serde(rename = "now-backup")]
    #[strum(serialize = "now-backup")]
    #[value(name = "now-backup")]
    Backup,
    #[serde(rename = "now-battery")]
    #[strum(serialize = "now-battery")]
    #[value(name = "now-battery")]
    Battery,
    #[serde(rename = "now-pv")]
    #[strum(serialize = "now-pv")]
    #[value(name = "now-pv")]
    Pv,
    #[serde(rename = "config")]
    #[strum(serialize = "config")]
    Config,
    #[serde(rename = "day")]
    #[strum(serialize = "day")]
    Day,
    #[serde(rename = "total")]
    #[strum(serialize = "total")]
    Total,
    #[serde(rename = "static")]
    #[strum(serialize = "static")]
    Static,
}

impl RegisterGroup {
    /// Groups that are read one per base tick, in round-robin order.
    pub const SECONDARY: [Self; 5] = [Self::Grid, Self::Inverter, Self::Backup, Self::Battery, Self::Pv];
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum FieldType {
    U16,
    I16,
    U32,
    I32,
    /// Each word split into two decimal bytes.
    Byte,
    /// Each word rendered as a 16 digit binary string.
    Bit,
    /// Three words packing `YY MM DD hh mm ss`.
    Dat,
    /// Packed ASCII, two characters per word.
    Str,
}

/// Post-processing applied to the decoded text of a register before it is published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Render {
    #[default]
    Plain,
    /// `"01 02  03 04"` becomes `"V01.02-V03.04"`.
    Firmware,
    /// `"hi lo"` equipment code looked up in the model table.
    Equipment,
}

/// Catalog key: a physical register address or the name of a computed pseudo-register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterKey {
    Address(u16),
    Derived(Derived),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("`{0}` is not a valid register address")]
    InvalidAddress(String),
    #[error("`{0}` is not a known pseudo-register")]
    UnknownDerived(String),
}

impl std::str::FromStr for RegisterKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u16>()
                .map(Self::Address)
                .map_err(|_| KeyError::InvalidAddress(s.to_string()));
        }
        s.parse::<Derived>()
            .map(Self::Derived)
            .map_err(|_| KeyError::UnknownDerived(s.to_string()))
    }
}

impl std::fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterKey::Address(a) => write!(f, "{a}"),
            RegisterKey::Derived(d) => write!(f, "{d}"),
        }
    }
}

impl serde::Serialize for RegisterKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn one() -> u16 {
    1
}

/// Decoding and publishing metadata of a single catalog entry.
///
/// Entries without a `field_type` are filler: they occupy `length` words of a read span but never
/// produce a value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    /// Parameter name used in the published topic. Entries without one are read but not published.
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default, rename = "type")]
    pub field_type: Option<FieldType>,
    #[serde(default = "one")]
    pub length: u16,
    #[serde(default = "one")]
    pub scale: u16,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_items: BTreeMap<u32, String>,
    #[serde(default)]
    pub group: Option<RegisterGroup>,
    #[serde(default)]
    pub render: Render,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Discovery>,
}

impl RegisterDescriptor {
    pub fn new(name: &str, field_type: Option<FieldType>, length: u16) -> Self {
        Self {
            name: name.to_string(),
            param: None,
            field_type,
            length,
            scale: 1,
            unit: String::new(),
            writable: false,
            value_items: BTreeMap::new(),
            group: None,
            render: Render::Plain,
            discovery: None,
        }
    }

    /// Translate a value received from a remote `set` request into the raw register word.
    ///
    /// Display strings from the enum table map back to their code; anything else must be a number
    /// in display units, which gets multiplied by the scale.
    pub fn encode_write(&self, input: &str) -> Result<u16, WriteError> {
        if !self.writable {
            return Err(WriteError::ReadOnly);
        }
        if self.length != 1 {
            return Err(WriteError::MultiWord(self.length));
        }
        let input = input.trim();
        if let Some((&code, _)) = self.value_items.iter().find(|(_, d)| d.as_str() == input) {
            return u16::try_from(code).map_err(|_| WriteError::OutOfRange(input.to_string()));
        }
        let number = input
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| WriteError::NotNumeric(input.to_string()))?;
        let raw = (number * f64::from(self.scale)).round();
        if raw < f64::from(i16::MIN) || raw > f64::from(u16::MAX) {
            return Err(WriteError::OutOfRange(input.to_string()));
        }
        let raw = raw as i32;
        Ok(if raw < 0 { raw as i16 as u16 } else { raw as u16 })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WriteError {
    #[error("register is read-only")]
    ReadOnly,
    #[error("writing {0}-word registers is not supported")]
    MultiWord(u16),
    #[error("`{0}` is neither a number nor a known option")]
    NotNumeric(String),
    #[error("`{0}` does not fit into a register")]
    OutOfRange(String),
}

/// A typed register or pseudo-register value.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    /// Space separated groups of 16 binary digits, most significant word first.
    Bits(String),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Integer(n) => Some(n as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Replace negative numbers with zero.
    pub fn clamp_negative(self) -> Self {
        match self {
            Value::Integer(n) if n < 0 => Value::Integer(0),
            Value::Float(f) if f < 0.0 => Value::Float(0.0),
            v => v,
        }
    }

    /// Render the value as an MQTT payload.
    pub fn to_payload(&self, float_precision: usize) -> String {
        match self {
            Value::Float(f) => format!("{f:.float_precision$}"),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            v => v.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Text(s) | Value::Bits(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A decoded register value together with its display metadata.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct DecodedValue {
    pub name: String,
    pub value: Value,
    pub unit: String,
}
