//! Definition-driven field decoding.
//!
//! [`decode`] applies a [`PacketLayout`] to a packet body and produces a [`DecodedRecord`]. It
//! is a pure function of its inputs, so packets may be decoded on any number of threads.
//!
//! Fields that extend past the end of the body decode to [`Value::OutOfRange`] and the record is
//! flagged; the remaining fields are still decoded.
mod bits;

#[cfg(feature = "serde")]
use serde::Serialize;
use tracing::debug;

pub use bits::{extract_bits, extract_bytes, sign_extend, swap_bytes};

use crate::layout::{ByteOrder, FieldSpec, PacketLayout, ValueType};
use crate::spacepacket::{Apid, PrimaryHeader, RawPacket};

/// Column names used for primary header values when header annotation is enabled.
pub const HEADER_COLUMNS: [&str; 7] = [
    "CCSDS_VERSION",
    "CCSDS_PACKET_TYPE",
    "CCSDS_SECONDARY_FLAG",
    "CCSDS_SEQUENCE_FLAG",
    "CCSDS_APID",
    "CCSDS_SEQUENCE_COUNT",
    "CCSDS_PACKET_LENGTH",
];

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(untagged))]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Flag(bool),
    /// Placeholder for a field that could not be decoded, either because it extends past the
    /// end of the packet body or because the field itself is invalid.
    OutOfRange,
}

impl Value {
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Signed(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Flag(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange)
    }
}

/// Non-fatal anomalies found while decoding a record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum RecordFlag {
    /// The field extends past the end of the body.
    FieldOutOfRange {
        field: String,
        bit_end: usize,
        body_bits: usize,
    },
    /// The field's width, type or byte order cannot be decoded; see [`FieldSpec::validate`].
    InvalidField { field: String, reason: String },
    /// The body is shorter than the layout's expected length.
    ShortBody {
        expected_bits: usize,
        body_bits: usize,
    },
    /// The body has more whole bytes than the layout's expected length needs.
    LongBody {
        expected_bits: usize,
        body_bits: usize,
    },
}

/// Decoded values for a single packet, in layout order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DecodedRecord {
    pub apid: Apid,
    pub sequence_count: u16,
    pub fields: Vec<(String, Value)>,
    /// Empty unless decoding found an anomaly.
    pub flags: Vec<RecordFlag>,
}

impl DecodedRecord {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find_map(|(n, v)| if n == name { Some(v) } else { None })
    }

    #[must_use]
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, v)| v)
    }

    #[must_use]
    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Number of fields that extended past the end of the body.
    #[must_use]
    pub fn out_of_range_count(&self) -> usize {
        self.flags
            .iter()
            .filter(|f| matches!(f, RecordFlag::FieldOutOfRange { .. }))
            .count()
    }
}

/// Extract a field's raw bits, reordering bytes for little-endian fields.
fn extract_ordered(field: &FieldSpec, body: &[u8]) -> Option<u64> {
    let raw = extract_bits(body, field.bit_offset, field.bit_width)?;
    match field.byte_order {
        ByteOrder::Big => Some(raw),
        ByteOrder::Little => Some(swap_bytes(raw, field.bit_width)),
    }
}

fn interpret(field: &FieldSpec, body: &[u8]) -> Option<Value> {
    let value = match field.value_type {
        ValueType::Bytes => {
            return extract_bytes(body, field.bit_offset, field.bit_width).map(Value::Bytes)
        }
        ValueType::Unsigned => Value::Unsigned(extract_ordered(field, body)?),
        ValueType::Signed => {
            let raw = extract_ordered(field, body)?;
            Value::Signed(sign_extend(raw, field.bit_width))
        }
        ValueType::Float => {
            let raw = extract_ordered(field, body)?;
            if field.bit_width == 32 {
                // only the low 32 bits are set
                Value::Float(f64::from(f32::from_bits(raw as u32)))
            } else {
                Value::Float(f64::from_bits(raw))
            }
        }
        ValueType::Flag => {
            Value::Flag(extract_bits(body, field.bit_offset, field.bit_width)? != 0)
        }
    };

    let Some(transform) = field.transform else {
        return Some(value);
    };
    let scalar = match value {
        Value::Unsigned(v) => v as f64,
        Value::Signed(v) => v as f64,
        Value::Float(v) => v,
        other => return Some(other),
    };
    Some(Value::Float(transform.apply(scalar)))
}

fn decode_into<F>(layout: &PacketLayout, body: &[u8], record: &mut DecodedRecord, skip: F)
where
    F: Fn(&str) -> bool,
{
    let body_bits = body.len() * 8;
    if let Some(expected_bits) = layout.expected_bits {
        if body_bits < expected_bits {
            record.flags.push(RecordFlag::ShortBody {
                expected_bits,
                body_bits,
            });
        } else if body.len() > expected_bits.div_ceil(8) {
            record.flags.push(RecordFlag::LongBody {
                expected_bits,
                body_bits,
            });
        }
    }

    for field in &layout.fields {
        if skip(&field.name) {
            continue;
        }
        if let Err(err) = field.validate() {
            debug!(apid = layout.apid, field = %field.name, "invalid field: {err}");
            record.flags.push(RecordFlag::InvalidField {
                field: field.name.clone(),
                reason: err.to_string(),
            });
            record.fields.push((field.name.clone(), Value::OutOfRange));
            continue;
        }
        let value = match interpret(field, body) {
            Some(value) => value,
            None => {
                debug!(
                    apid = layout.apid,
                    field = %field.name,
                    bit_end = field.bit_end(),
                    body_bits,
                    "field out of range"
                );
                record.flags.push(RecordFlag::FieldOutOfRange {
                    field: field.name.clone(),
                    bit_end: field.bit_end(),
                    body_bits,
                });
                Value::OutOfRange
            }
        };
        record.fields.push((field.name.clone(), value));
    }
}

/// Decode `body` according to `layout`.
///
/// The returned record has a sequence count of 0; see [`decode_packet`] to carry header values.
///
/// `layout` is expected to have passed [`PacketLayout::validate`], as every layout in a
/// registry has. A field that would fail [`FieldSpec::validate`] is not decoded; it gets the
/// [`Value::OutOfRange`] placeholder and a [`RecordFlag::InvalidField`] flag.
///
/// # Example
/// ```
/// use spackit::decode::{decode, Value};
/// use spackit::layout::{FieldSpec, PacketLayout, ValueType};
///
/// let layout = PacketLayout::new(100, vec![
///     FieldSpec::new("MODE", 0, 3, ValueType::Unsigned),
///     FieldSpec::new("COUNT", 3, 13, ValueType::Unsigned),
/// ]);
/// let record = decode(&layout, &[0xa5, 0x3c]);
/// assert_eq!(record.get("MODE"), Some(&Value::Unsigned(0xa5 >> 5)));
/// assert_eq!(record.get("COUNT"), Some(&Value::Unsigned(0xa53c & 0x1fff)));
/// ```
#[must_use]
pub fn decode(layout: &PacketLayout, body: &[u8]) -> DecodedRecord {
    let mut record = DecodedRecord {
        apid: layout.apid,
        sequence_count: 0,
        fields: Vec::with_capacity(layout.fields.len()),
        flags: Vec::new(),
    };
    decode_into(layout, body, &mut record, |_| false);
    record
}

/// Primary header values in [`HEADER_COLUMNS`] order.
#[must_use]
pub fn header_values(header: &PrimaryHeader) -> [Value; 7] {
    [
        Value::Unsigned(header.version.into()),
        Value::Unsigned(header.type_flag.into()),
        Value::Unsigned(u64::from(header.has_secondary_header)),
        Value::Unsigned(header.sequence_flags.into()),
        Value::Unsigned(header.apid.into()),
        Value::Unsigned(header.sequence_id.into()),
        Value::Unsigned(header.len_minus1.into()),
    ]
}

/// Decode a framed packet's body according to `layout`.
///
/// When `include_header` is set the record starts with the [`HEADER_COLUMNS`] values and any
/// layout field with the same name as a header column is skipped.
#[must_use]
pub fn decode_packet(
    layout: &PacketLayout,
    packet: &RawPacket,
    include_header: bool,
) -> DecodedRecord {
    let header_len = if include_header { HEADER_COLUMNS.len() } else { 0 };
    let mut record = DecodedRecord {
        apid: packet.apid(),
        sequence_count: packet.sequence_count(),
        fields: Vec::with_capacity(header_len + layout.fields.len()),
        flags: Vec::new(),
    };
    if include_header {
        record.fields.extend(
            HEADER_COLUMNS
                .iter()
                .zip(header_values(&packet.header))
                .map(|(name, value)| ((*name).to_string(), value)),
        );
        decode_into(layout, &packet.body, &mut record, |name| {
            HEADER_COLUMNS.contains(&name)
        });
    } else {
        decode_into(layout, &packet.body, &mut record, |_| false);
    }
    record
}
