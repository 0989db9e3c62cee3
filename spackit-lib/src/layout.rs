//! Packet body layouts.
//!
//! A [`PacketLayout`] describes how to decode the body of every packet with a given APID as an
//! ordered list of bit-addressed [`FieldSpec`]s. Bit offsets are relative to the first bit of the
//! packet body, i.e., the first byte after the primary header, and bits are numbered most
//! significant first.
//!
//! Layouts are validated when they are registered (see [`crate::registry`]); a layout that
//! fails [`PacketLayout::validate`] is never used for decoding.
use std::collections::HashSet;
#[cfg(feature = "serde")]
use std::{fs::File, io::BufReader, io::Read, path::Path};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::spacepacket::{Apid, PrimaryHeader};

/// The closed set of value interpretations a field may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ValueType {
    /// Unsigned integer, 1 to 64 bits.
    Unsigned,
    /// Two's complement signed integer, 1 to 64 bits.
    Signed,
    /// IEEE-754 single (32 bit) or double (64 bit) float.
    Float,
    /// Opaque bytes; width must be a multiple of 8 bits.
    Bytes,
    /// Boolean, true when any extracted bit is set.
    Flag,
}

impl ValueType {
    /// Maximum width in bits for integer and flag values.
    pub const MAX_INT_BITS: usize = 64;

    fn allows_transform(self) -> bool {
        matches!(self, Self::Unsigned | Self::Signed | Self::Float)
    }

    fn allows_byte_order(self) -> bool {
        matches!(self, Self::Unsigned | Self::Signed | Self::Float)
    }
}

/// Byte order of a multi-byte integer or float field.
///
/// Bits are always numbered most significant first within the body; a little-endian field is
/// extracted like a big-endian one and then has its bytes reversed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    #[must_use]
    pub fn is_big(&self) -> bool {
        matches!(self, Self::Big)
    }
}

/// Linear transform applied after type interpretation: `value * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Transform {
    #[cfg_attr(feature = "serde", serde(default = "Transform::default_scale"))]
    pub scale: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub offset: f64,
}

impl Transform {
    #[must_use]
    pub fn new(scale: f64, offset: f64) -> Self {
        Self { scale, offset }
    }

    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        value * self.scale + self.offset
    }

    #[cfg(feature = "serde")]
    fn default_scale() -> f64 {
        1.0
    }
}

/// A single named, bit-addressed field in a packet body.
///
/// # Example
/// ```
/// use spackit::layout::{FieldSpec, Transform, ValueType};
///
/// let temp = FieldSpec::builder()
///     .name("BOARD_TEMP")
///     .bit_offset(16)
///     .bit_width(12)
///     .value_type(ValueType::Unsigned)
///     .transform(Transform::new(0.1, -40.0))
///     .unit("degC")
///     .build();
/// assert_eq!(temp.bit_end(), 28);
/// assert_eq!(temp.column_type(), ValueType::Float);
/// ```
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldSpec {
    #[builder(setter(into))]
    pub name: String,
    pub bit_offset: usize,
    pub bit_width: usize,
    pub value_type: ValueType,
    #[builder(default)]
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "ByteOrder::is_big"))]
    pub byte_order: ByteOrder,
    #[builder(default, setter(strip_option))]
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub transform: Option<Transform>,
    #[builder(default, setter(strip_option, into))]
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub description: Option<String>,
    #[builder(default, setter(strip_option, into))]
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub unit: Option<String>,
}

impl FieldSpec {
    /// Shorthand for a field with no transform or annotations.
    pub fn new<S: Into<String>>(
        name: S,
        bit_offset: usize,
        bit_width: usize,
        value_type: ValueType,
    ) -> Self {
        Self::builder()
            .name(name)
            .bit_offset(bit_offset)
            .bit_width(bit_width)
            .value_type(value_type)
            .build()
    }

    /// One past the last bit of this field.
    #[must_use]
    pub fn bit_end(&self) -> usize {
        self.bit_offset.saturating_add(self.bit_width)
    }

    /// The type of the decoded values for this field. Transformed values are always floats.
    #[must_use]
    pub fn column_type(&self) -> ValueType {
        if self.transform.is_some() {
            ValueType::Float
        } else {
            self.value_type
        }
    }

    /// Check the width, type, byte order and transform of this field on its own.
    ///
    /// # Errors
    /// The first problem found.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let name = || self.name.clone();
        if self.bit_width == 0 {
            return Err(LayoutError::ZeroWidth(name()));
        }
        match self.value_type {
            ValueType::Unsigned | ValueType::Signed | ValueType::Flag => {
                if self.bit_width > ValueType::MAX_INT_BITS {
                    return Err(LayoutError::WidthTooLarge {
                        name: name(),
                        width: self.bit_width,
                        max: ValueType::MAX_INT_BITS,
                    });
                }
            }
            ValueType::Float => {
                if self.bit_width != 32 && self.bit_width != 64 {
                    return Err(LayoutError::InvalidFloatWidth {
                        name: name(),
                        width: self.bit_width,
                    });
                }
            }
            ValueType::Bytes => {
                if self.bit_width % 8 != 0 {
                    return Err(LayoutError::UnalignedBytes {
                        name: name(),
                        width: self.bit_width,
                    });
                }
            }
        }
        if self.byte_order == ByteOrder::Little
            && (!self.value_type.allows_byte_order() || self.bit_width % 8 != 0)
        {
            return Err(LayoutError::InvalidByteOrder {
                name: name(),
                value_type: self.value_type,
                width: self.bit_width,
            });
        }
        if self.transform.is_some() && !self.value_type.allows_transform() {
            return Err(LayoutError::TransformNotAllowed {
                name: name(),
                value_type: self.value_type,
            });
        }
        Ok(())
    }
}

/// Reasons a layout is rejected at registration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("apid {0} does not fit in 11 bits")]
    InvalidApid(Apid),
    #[error("field at index {0} has an empty name")]
    EmptyName(usize),
    #[error("duplicate field name {0:?}")]
    DuplicateName(String),
    #[error("field {0:?} has zero width")]
    ZeroWidth(String),
    #[error("field {name:?} is {width} bits wide, max is {max}")]
    WidthTooLarge {
        name: String,
        width: usize,
        max: usize,
    },
    #[error("float field {name:?} must be 32 or 64 bits wide, got {width}")]
    InvalidFloatWidth { name: String, width: usize },
    #[error("bytes field {name:?} width {width} is not a multiple of 8")]
    UnalignedBytes { name: String, width: usize },
    #[error("little-endian {value_type:?} field {name:?} must be a whole number of bytes, got {width} bits")]
    InvalidByteOrder {
        name: String,
        value_type: ValueType,
        width: usize,
    },
    #[error("field {first:?} overlaps field {second:?}")]
    Overlap { first: String, second: String },
    #[error("transform not supported for {value_type:?} field {name:?}")]
    TransformNotAllowed { name: String, value_type: ValueType },
    #[error("field {name:?} ends at bit {end}, past the expected length of {expected} bits")]
    ExceedsExpectedLength {
        name: String,
        end: usize,
        expected: usize,
    },
}

/// The ordered set of fields describing one APID's packet body.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PacketLayout {
    pub apid: Apid,
    /// Human readable packet name
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    pub fields: Vec<FieldSpec>,
    /// Expected total body length in bits, if known.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub expected_bits: Option<usize>,
}

impl PacketLayout {
    #[must_use]
    pub fn new(apid: Apid, fields: Vec<FieldSpec>) -> Self {
        Self {
            apid,
            name: None,
            fields,
            expected_bits: None,
        }
    }

    #[must_use]
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_expected_bits(mut self, bits: usize) -> Self {
        self.expected_bits = Some(bits);
        self
    }

    /// Number of bits spanned by the fields, i.e., the largest field end.
    #[must_use]
    pub fn bit_len(&self) -> usize {
        self.fields.iter().map(FieldSpec::bit_end).max().unwrap_or(0)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check that this layout can be used for decoding.
    ///
    /// # Errors
    /// The first [`LayoutError`] found, checking each field in order, then overlaps, then the
    /// expected length.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.apid > PrimaryHeader::APID_MAX {
            return Err(LayoutError::InvalidApid(self.apid));
        }

        let mut names: HashSet<&str> = HashSet::with_capacity(self.fields.len());
        for (idx, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(LayoutError::EmptyName(idx));
            }
            if !names.insert(field.name.as_str()) {
                return Err(LayoutError::DuplicateName(field.name.clone()));
            }
            field.validate()?;
        }

        let mut by_offset: Vec<&FieldSpec> = self.fields.iter().collect();
        by_offset.sort_by_key(|f| (f.bit_offset, f.bit_end()));
        // widest-reaching field seen so far; any later field starting before its end overlaps
        let mut reach: Option<&FieldSpec> = None;
        for field in by_offset {
            if let Some(prev) = reach {
                if field.bit_offset < prev.bit_end() {
                    return Err(LayoutError::Overlap {
                        first: prev.name.clone(),
                        second: field.name.clone(),
                    });
                }
            }
            if reach.map_or(true, |prev| field.bit_end() > prev.bit_end()) {
                reach = Some(field);
            }
        }

        if let Some(expected) = self.expected_bits {
            if let Some(field) = self.fields.iter().find(|f| f.bit_end() > expected) {
                return Err(LayoutError::ExceedsExpectedLength {
                    name: field.name.clone(),
                    end: field.bit_end(),
                    expected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Wrapped { layouts: Vec<PacketLayout> },
    Bare(Vec<PacketLayout>),
}

/// Read layouts from a JSON document.
///
/// The document is either an array of layouts or an object with a `layouts` array. Each layout
/// is validated.
///
/// # Example
/// ```
/// use spackit::layout::{load_layouts, ValueType};
///
/// let doc = r#"{"layouts": [
///     {"apid": 100, "name": "HK", "fields": [
///         {"name": "MODE", "bit_offset": 0, "bit_width": 3, "value_type": "unsigned"},
///         {"name": "VOLTS", "bit_offset": 8, "bit_width": 16, "value_type": "signed",
///          "transform": {"scale": 0.01}}
///     ]}
/// ]}"#;
/// let layouts = load_layouts(doc.as_bytes()).unwrap();
/// assert_eq!(layouts[0].fields[1].column_type(), ValueType::Float);
/// ```
///
/// # Errors
/// [`crate::Error::Json`] if the document cannot be parsed, or
/// [`crate::Error::MalformedLayout`] for the first invalid layout.
#[cfg(feature = "serde")]
pub fn load_layouts<R: Read>(reader: R) -> crate::Result<Vec<PacketLayout>> {
    let layouts = match serde_json::from_reader(reader)? {
        Document::Wrapped { layouts } | Document::Bare(layouts) => layouts,
    };
    for layout in &layouts {
        layout.validate()?;
    }
    Ok(layouts)
}

/// Packet definitions loaded from a JSON layout file.
#[cfg(feature = "serde")]
#[derive(Debug, Clone)]
pub struct JsonDefinitions {
    name: String,
    layouts: Vec<PacketLayout>,
}

#[cfg(feature = "serde")]
impl JsonDefinitions {
    /// # Errors
    /// See [`load_layouts`].
    pub fn from_reader<S: Into<String>, R: Read>(name: S, reader: R) -> crate::Result<Self> {
        Ok(Self {
            name: name.into(),
            layouts: load_layouts(reader)?,
        })
    }

    /// # Errors
    /// IO errors opening `path` or any error from [`load_layouts`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_reader(path.to_string_lossy(), BufReader::new(file))
    }
}

#[cfg(feature = "serde")]
impl crate::registry::PacketDefinitions for JsonDefinitions {
    fn name(&self) -> &str {
        &self.name
    }

    fn layouts(&self) -> Vec<PacketLayout> {
        self.layouts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn unsigned(name: &str, offset: usize, width: usize) -> FieldSpec {
        FieldSpec::new(name, offset, width, ValueType::Unsigned)
    }

    #[test]
    fn valid_layout() {
        let layout = PacketLayout::new(
            100,
            vec![
                unsigned("A", 0, 3),
                unsigned("B", 3, 13),
                FieldSpec::new("C", 16, 32, ValueType::Float),
                FieldSpec::new("D", 48, 16, ValueType::Bytes),
                FieldSpec::new("E", 64, 1, ValueType::Flag),
            ],
        )
        .with_expected_bits(72);

        assert!(layout.validate().is_ok());
        assert_eq!(layout.bit_len(), 65);
        assert_eq!(layout.field("C").map(|f| f.bit_offset), Some(16));
    }

    #[test]
    fn empty_layout_is_valid() {
        assert!(PacketLayout::new(1, vec![]).validate().is_ok());
    }

    #[test_case(vec![unsigned("A", 0, 0)], LayoutError::ZeroWidth("A".into()); "zero width")]
    #[test_case(
        vec![unsigned("A", 0, 8), unsigned("A", 8, 8)],
        LayoutError::DuplicateName("A".into());
        "duplicate"
    )]
    #[test_case(vec![unsigned("", 0, 8)], LayoutError::EmptyName(0); "empty name")]
    #[test_case(
        vec![unsigned("A", 0, 65)],
        LayoutError::WidthTooLarge { name: "A".into(), width: 65, max: 64 };
        "too wide"
    )]
    #[test_case(
        vec![FieldSpec::new("F", 0, 16, ValueType::Float)],
        LayoutError::InvalidFloatWidth { name: "F".into(), width: 16 };
        "half float"
    )]
    #[test_case(
        vec![FieldSpec::new("B", 0, 12, ValueType::Bytes)],
        LayoutError::UnalignedBytes { name: "B".into(), width: 12 };
        "unaligned bytes"
    )]
    #[test_case(
        vec![unsigned("A", 0, 8), unsigned("B", 7, 8)],
        LayoutError::Overlap { first: "A".into(), second: "B".into() };
        "overlap"
    )]
    #[test_case(
        vec![unsigned("WIDE", 0, 32), unsigned("B", 4, 4), unsigned("C", 16, 4)],
        LayoutError::Overlap { first: "WIDE".into(), second: "B".into() };
        "contained"
    )]
    fn invalid_layout(fields: Vec<FieldSpec>, expected: LayoutError) {
        let layout = PacketLayout::new(1, fields);
        assert_eq!(layout.validate(), Err(expected));
    }

    #[test]
    fn overlap_found_after_narrow_field() {
        // B is inside A even though a narrower field sits between them in offset order
        let layout = PacketLayout::new(
            1,
            vec![unsigned("A", 0, 16), unsigned("N", 0, 1), unsigned("B", 12, 2)],
        );
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::Overlap { .. })
        ));
    }

    #[test]
    fn transform_on_flag_rejected() {
        let field = FieldSpec::builder()
            .name("F")
            .bit_offset(0)
            .bit_width(1)
            .value_type(ValueType::Flag)
            .transform(Transform::new(2.0, 0.0))
            .build();
        let layout = PacketLayout::new(1, vec![field]);
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::TransformNotAllowed { .. })
        ));
    }

    #[test_case(ValueType::Unsigned, 12; "unsigned partial byte")]
    #[test_case(ValueType::Signed, 4; "signed nibble")]
    #[test_case(ValueType::Flag, 8; "flag")]
    #[test_case(ValueType::Bytes, 16; "bytes")]
    fn little_endian_rejected(value_type: ValueType, width: usize) {
        let field = FieldSpec::builder()
            .name("LE")
            .bit_offset(0)
            .bit_width(width)
            .value_type(value_type)
            .byte_order(ByteOrder::Little)
            .build();
        assert_eq!(
            PacketLayout::new(1, vec![field]).validate(),
            Err(LayoutError::InvalidByteOrder {
                name: "LE".into(),
                value_type,
                width
            })
        );
    }

    #[test]
    fn little_endian_accepted() {
        let le = |name: &str, offset, width, value_type| {
            FieldSpec::builder()
                .name(name)
                .bit_offset(offset)
                .bit_width(width)
                .value_type(value_type)
                .byte_order(ByteOrder::Little)
                .build()
        };
        let layout = PacketLayout::new(
            1,
            vec![
                le("U", 0, 16, ValueType::Unsigned),
                le("S", 16, 24, ValueType::Signed),
                le("F", 40, 32, ValueType::Float),
            ],
        );
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn exceeds_expected_length() {
        let layout = PacketLayout::new(1, vec![unsigned("A", 0, 8), unsigned("B", 8, 9)])
            .with_expected_bits(16);
        assert_eq!(
            layout.validate(),
            Err(LayoutError::ExceedsExpectedLength {
                name: "B".into(),
                end: 17,
                expected: 16
            })
        );
    }

    #[test]
    fn apid_out_of_range() {
        let layout = PacketLayout::new(0x800, vec![]);
        assert_eq!(layout.validate(), Err(LayoutError::InvalidApid(0x800)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn load_bare_array() {
        let doc = r#"[
            {"apid": 5, "fields": [
                {"name": "X", "bit_offset": 0, "bit_width": 8, "value_type": "bytes"},
                {"name": "Y", "bit_offset": 8, "bit_width": 1, "value_type": "flag",
                 "description": "enabled", "unit": "bool"}
            ], "expected_bits": 16}
        ]"#;
        let layouts = load_layouts(doc.as_bytes()).unwrap();

        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].apid, 5);
        assert_eq!(layouts[0].expected_bits, Some(16));
        assert_eq!(layouts[0].fields[1].value_type, ValueType::Flag);
        assert_eq!(layouts[0].fields[1].description.as_deref(), Some("enabled"));
        assert_eq!(layouts[0].fields[1].byte_order, ByteOrder::Big);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn load_byte_order() {
        let doc = r#"[{"apid": 5, "fields": [
            {"name": "LE", "bit_offset": 0, "bit_width": 16, "value_type": "unsigned",
             "byte_order": "little"},
            {"name": "BE", "bit_offset": 16, "bit_width": 16, "value_type": "unsigned",
             "byte_order": "big"}
        ]}]"#;
        let layouts = load_layouts(doc.as_bytes()).unwrap();
        assert_eq!(layouts[0].fields[0].byte_order, ByteOrder::Little);
        assert_eq!(layouts[0].fields[1].byte_order, ByteOrder::Big);

        let bad = r#"[{"apid": 5, "fields": [
            {"name": "LE", "bit_offset": 0, "bit_width": 12, "value_type": "unsigned",
             "byte_order": "little"}
        ]}]"#;
        assert!(matches!(
            load_layouts(bad.as_bytes()),
            Err(crate::Error::MalformedLayout(LayoutError::InvalidByteOrder { .. }))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn load_rejects_malformed_layout() {
        let doc = r#"[{"apid": 5, "fields": [
            {"name": "X", "bit_offset": 0, "bit_width": 0, "value_type": "unsigned"}
        ]}]"#;
        let err = load_layouts(doc.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::MalformedLayout(LayoutError::ZeroWidth(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn load_rejects_bad_json() {
        let err = load_layouts(&b"{\"layouts\": 3}"[..]).unwrap_err();
        assert!(matches!(err, crate::Error::Json(_)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn transform_scale_defaults_to_one() {
        let doc = r#"[{"apid": 1, "fields": [
            {"name": "T", "bit_offset": 0, "bit_width": 8, "value_type": "unsigned",
             "transform": {"offset": -5.0}}
        ]}]"#;
        let layouts = load_layouts(doc.as_bytes()).unwrap();
        assert_eq!(
            layouts[0].fields[0].transform,
            Some(Transform::new(1.0, -5.0))
        );
    }
}
