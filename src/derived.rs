//! Pseudo-registers computed from decoded registers, and display conversions of raw values.

use crate::catalog::Catalog;
use crate::registers::{DecodedValue, RegisterGroup, RegisterKey, Render, Value};
use std::collections::BTreeMap;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::VariantArray,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Derived {
    /// Household power draw.
    Consumption,
    ConsumptionDay,
    AutarkyDay,
    #[strum(serialize = "ownconsumption-day")]
    OwnConsumptionDay,
    ConsumptionTotal,
    AutarkyTotal,
    #[strum(serialize = "ownconsumption-total")]
    OwnConsumptionTotal,
    /// Local wall-clock time of the bridge.
    ApiDate,
}

pub const GRID_POWER: u16 = 11000;
pub const INVERTER_POWER: u16 = 11016;

/// Addresses of the energy counters of one accounting period.
#[derive(Clone, Copy, Debug)]
pub struct Accumulators {
    pub grid_feed: u16,
    pub grid_purchase: u16,
    pub battery_charge: u16,
    pub battery_discharge: u16,
    pub pv: u16,
}

pub const DAY: Accumulators = Accumulators {
    grid_feed: 31000,
    grid_purchase: 31001,
    battery_charge: 31003,
    battery_discharge: 31004,
    pv: 31005,
};

pub const TOTAL: Accumulators = Accumulators {
    grid_feed: 31102,
    grid_purchase: 31104,
    battery_charge: 31108,
    battery_discharge: 31110,
    pv: 31112,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("input register {0} was not read")]
    MissingInput(u16),
    #[error("input register {0} does not hold a number")]
    NotNumeric(u16),
}

type Inputs = BTreeMap<u16, DecodedValue>;

fn input(values: &Inputs, address: u16) -> Result<&Value, ResolveError> {
    let value = values
        .get(&address)
        .map(|v| &v.value)
        .ok_or(ResolveError::MissingInput(address))?;
    match value {
        Value::Integer(_) | Value::Float(_) => Ok(value),
        _ => Err(ResolveError::NotNumeric(address)),
    }
}

/// Sum of `plus` minus sum of `minus`. Stays an integer as long as every input is one.
fn balance(values: &Inputs, plus: &[u16], minus: &[u16]) -> Result<Value, ResolveError> {
    let mut integer = Some(0i64);
    let mut float = 0f64;
    for (addresses, sign) in [(plus, 1), (minus, -1)] {
        for &address in addresses {
            let value = input(values, address)?;
            integer = match (integer, value) {
                (Some(acc), Value::Integer(n)) => acc.checked_add(sign * n),
                _ => None,
            };
            float += sign as f64 * value.as_f64().unwrap_or_default();
        }
    }
    Ok(integer.map_or(Value::Float(float), Value::Integer))
}

fn percentage_not_covered(part: f64, whole: f64) -> Value {
    Value::Float(if whole > 0.0 {
        100.0 * (1.0 - part / whole)
    } else {
        0.0
    })
}

impl Derived {
    fn consumption(values: &Inputs, period: Accumulators) -> Result<Value, ResolveError> {
        balance(
            values,
            &[period.pv, period.grid_purchase, period.battery_discharge],
            &[period.battery_charge, period.grid_feed],
        )
    }

    fn autarky(values: &Inputs, period: Accumulators) -> Result<Value, ResolveError> {
        let consumption = Self::consumption(values, period)?;
        let purchase = input(values, period.grid_purchase)?;
        Ok(percentage_not_covered(
            purchase.as_f64().unwrap_or_default(),
            consumption.as_f64().unwrap_or_default(),
        ))
    }

    fn own_consumption(values: &Inputs, period: Accumulators) -> Result<Value, ResolveError> {
        let feed = input(values, period.grid_feed)?;
        let pv = input(values, period.pv)?;
        Ok(percentage_not_covered(
            feed.as_f64().unwrap_or_default(),
            pv.as_f64().unwrap_or_default(),
        ))
    }

    /// Compute this pseudo-register from the registers decoded in the same poll.
    pub fn evaluate(self, values: &Inputs, now: &jiff::Zoned) -> Result<Value, ResolveError> {
        match self {
            Derived::Consumption => balance(values, &[INVERTER_POWER], &[GRID_POWER]),
            Derived::ConsumptionDay => Self::consumption(values, DAY),
            Derived::AutarkyDay => Self::autarky(values, DAY),
            Derived::OwnConsumptionDay => Self::own_consumption(values, DAY),
            Derived::ConsumptionTotal => Self::consumption(values, TOTAL),
            Derived::AutarkyTotal => Self::autarky(values, TOTAL),
            Derived::OwnConsumptionTotal => Self::own_consumption(values, TOTAL),
            Derived::ApiDate => Ok(Value::Text(now.strftime("%Y-%m-%d %H:%M:%S").to_string())),
        }
    }
}

/// Translate an enum-coded register value into its description.
///
/// Integer codes map to a single entry. Bit fields list every known bit that is set, lowest bit
/// first, or `OK` when none are.
pub fn convert_code(value: &Value, items: &BTreeMap<u32, String>) -> Option<Value> {
    match value {
        Value::Integer(n) => Some(Value::Text(
            u32::try_from(*n)
                .ok()
                .and_then(|code| items.get(&code))
                .map_or("Unknown", String::as_str)
                .to_string(),
        )),
        Value::Bits(bits) => {
            let digits = bits.bytes().filter(|b| *b != b' ').rev().collect::<Vec<_>>();
            let set = items
                .iter()
                .filter(|(bit, _)| digits.get(**bit as usize) == Some(&b'1'))
                .map(|(_, description)| description.as_str())
                .collect::<Vec<_>>();
            Some(Value::Text(if set.is_empty() {
                "OK".to_string()
            } else {
                set.join(", ")
            }))
        }
        _ => None,
    }
}

/// `"01 02  03 04"` to `"V01.02-V03.04"`.
pub fn firmware_version(text: &str) -> Option<String> {
    let (first, second) = text.split_once("  ")?;
    Some(format!("V{}-V{}", first.replace(' ', "."), second.replace(' ', ".")))
}

/// Look up the inverter model from the `"series model"` byte pair of the equipment register.
pub fn equipment_model(text: &str) -> String {
    let code = text
        .split_once(' ')
        .and_then(|(hi, lo)| Some((hi.parse::<u8>().ok()?, lo.parse::<u8>().ok()?)));
    let model = match code {
        Some((2, 0)) => "3K-25",
        Some((2, 1)) => "4K-25",
        Some((2, 2)) => "5K-25",
        Some((3, 0)) => "6K-30",
        Some((3, 1)) => "8K-30",
        Some((3, 2)) => "10K-30",
        Some((3, 3)) => "12K-30",
        Some((8, 0)) => "8K-25",
        Some((8, 1)) => "10K-25",
        Some((8, 2)) => "12K-25",
        _ => "unknown",
    };
    model.to_string()
}

fn render(value: Value, hint: Render) -> Value {
    match (hint, value) {
        (Render::Firmware, Value::Text(text)) => match firmware_version(&text) {
            Some(version) => Value::Text(version),
            None => Value::Text(text),
        },
        (Render::Equipment, Value::Text(text)) => Value::Text(equipment_model(&text)),
        (_, value) => value,
    }
}

/// A value ready to be published under its parameter name.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ResolvedValue {
    pub param: String,
    pub name: String,
    pub value: Value,
    pub unit: String,
}

/// Produce the publishable values of `group` from the registers decoded for it.
///
/// A pseudo-register whose inputs are missing is left out; every other value is unaffected.
pub fn resolve(
    catalog: &Catalog,
    group: RegisterGroup,
    decoded: &Inputs,
    now: &jiff::Zoned,
) -> Vec<ResolvedValue> {
    let mut resolved = Vec::new();
    for entry in catalog.group(group) {
        let descriptor = &entry.descriptor;
        let Some(param) = &descriptor.param else {
            continue;
        };
        let value = match entry.key {
            RegisterKey::Address(address) => {
                let Some(decoded) = decoded.get(&address) else {
                    continue;
                };
                let value = render(decoded.value.clone(), descriptor.render);
                if descriptor.value_items.is_empty() {
                    value
                } else {
                    convert_code(&value, &descriptor.value_items).unwrap_or(value)
                }
            }
            RegisterKey::Derived(derived) => match derived.evaluate(decoded, now) {
                Ok(value) => value.clamp_negative(),
                Err(e) => {
                    tracing::warn!(%group, register = %derived, err = %e, "cannot compute pseudo-register");
                    continue;
                }
            },
        };
        resolved.push(ResolvedValue {
            param: param.clone(),
            name: descriptor.name.clone(),
            value,
            unit: descriptor.unit.clone(),
        });
    }
    resolved
}
