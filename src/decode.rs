use crate::cluster::Cluster;
use crate::registers::{DecodedValue, FieldType, RegisterDescriptor, Value};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register at offset {offset} with length {length} exceeds the {available} words read")]
    Bounds {
        offset: usize,
        length: usize,
        available: usize,
    },
    #[error("register is a filler and carries no value")]
    Filler,
    #[error("could not decode {field_type} at offset {offset} with length {length}")]
    Malformed {
        field_type: FieldType,
        offset: usize,
        length: usize,
        #[source]
        reason: Malformation,
    },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Malformation {
    #[error("the field type does not support this word length")]
    UnsupportedLength,
    #[error("string is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Decode the register described by `descriptor` starting at word `offset` of `words`.
pub fn decode(
    words: &[u16],
    offset: usize,
    descriptor: &RegisterDescriptor,
) -> Result<DecodedValue, DecodeError> {
    let length = usize::from(descriptor.length);
    let Some(field) = words.get(offset..offset + length) else {
        return Err(DecodeError::Bounds {
            offset,
            length,
            available: words.len(),
        });
    };
    let field_type = descriptor.field_type.ok_or(DecodeError::Filler)?;
    let malformed = |reason: Malformation| DecodeError::Malformed {
        field_type,
        offset,
        length,
        reason,
    };
    let value = match (field_type, field) {
        (FieldType::U16, &[w]) => Value::Integer(i64::from(w)),
        (FieldType::I16, &[w]) => Value::Integer(i64::from(w as i16)),
        (FieldType::U32, &[hi, lo]) => Value::Integer(i64::from(u32::from(hi) << 16 | u32::from(lo))),
        (FieldType::I32, &[hi, lo]) => {
            Value::Integer(i64::from((u32::from(hi) << 16 | u32::from(lo)) as i32))
        }
        (FieldType::Byte, &[_] | &[_, _] | &[_, _, _, _]) => {
            let half = field.len().div_ceil(2);
            let render = |words: &[u16]| {
                words
                    .iter()
                    .flat_map(|w| w.to_be_bytes())
                    .map(|b| format!("{b:02}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            if field.len() == 1 {
                Value::Text(render(field))
            } else {
                Value::Text(format!("{}  {}", render(&field[..half]), render(&field[half..])))
            }
        }
        (FieldType::Bit, [_, ..]) => Value::Bits(
            field
                .iter()
                .map(|w| format!("{w:016b}"))
                .collect::<Vec<_>>()
                .join(" "),
        ),
        (FieldType::Dat, &[a, b, c]) => {
            let [yy, mo] = a.to_be_bytes();
            let [dd, hh] = b.to_be_bytes();
            let [mi, ss] = c.to_be_bytes();
            Value::Text(format!("{yy:02}-{mo:02}-{dd:02} {hh:02}:{mi:02}:{ss:02}"))
        }
        (FieldType::Str, [_, ..]) => {
            let bytes = field.iter().flat_map(|w| w.to_be_bytes()).collect::<Vec<_>>();
            let text = std::str::from_utf8(&bytes).map_err(|e| malformed(e.into()))?;
            Value::Text(text.trim_end_matches(['\0', ' ']).to_string())
        }
        _ => return Err(malformed(Malformation::UnsupportedLength)),
    };
    let value = match value {
        Value::Integer(n) if descriptor.scale > 1 => Value::Float(n as f64 / f64::from(descriptor.scale)),
        v => v,
    };
    Ok(DecodedValue {
        name: descriptor.name.clone(),
        value,
        unit: descriptor.unit.clone(),
    })
}

/// Decode every typed member of `cluster` from the words read for it.
///
/// Members that fail to decode are logged and left out.
pub fn decode_cluster(words: &[u16], cluster: &Cluster) -> BTreeMap<u16, DecodedValue> {
    let mut values = BTreeMap::new();
    for member in &cluster.members {
        match decode(words, usize::from(member.offset), &member.descriptor) {
            Ok(value) => {
                values.insert(member.address, value);
            }
            Err(DecodeError::Filler) => {}
            Err(e) => {
                tracing::error!(register.address = member.address, err = ?e, "decoding failed");
            }
        }
    }
    values
}
