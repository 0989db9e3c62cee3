//! Collects decoded records into per-APID tables and tracks per-packet diagnostics.
use std::collections::{BTreeMap, HashMap};

#[cfg(feature = "serde")]
use serde::Serialize;
use tracing::{debug, warn};

use crate::decode::{decode_packet, DecodedRecord, Value, HEADER_COLUMNS};
use crate::layout::{PacketLayout, ValueType};
use crate::spacepacket::{missing_packets, Apid, FramingError, PrimaryHeader, RawPacket};

/// A named, typed table column.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub unit: Option<String>,
}

/// `(name, type, unit)` of each column produced for `layout`, in record field order.
fn column_specs(
    layout: &PacketLayout,
    include_header: bool,
) -> impl Iterator<Item = (&str, ValueType, Option<&str>)> + '_ {
    let header = HEADER_COLUMNS
        .into_iter()
        .filter(move |_| include_header)
        .map(|name| (name, ValueType::Unsigned, None));
    let fields = layout
        .fields
        .iter()
        .filter(move |f| !(include_header && HEADER_COLUMNS.contains(&f.name.as_str())))
        .map(|f| (f.name.as_str(), f.column_type(), f.unit.as_deref()));
    header.chain(fields)
}

/// Columns produced for `layout`, in record field order.
#[must_use]
pub fn columns(layout: &PacketLayout, include_header: bool) -> Vec<Column> {
    column_specs(layout, include_header)
        .map(|(name, value_type, unit)| Column {
            name: name.to_string(),
            value_type,
            unit: unit.map(str::to_string),
        })
        .collect()
}

/// Decoded records for a single APID in stream order.
///
/// Every record has one value per column, in column order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Table {
    pub apid: Apid,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
    pub columns: Vec<Column>,
    pub records: Vec<DecodedRecord>,
}

impl Table {
    #[must_use]
    pub fn new(layout: &PacketLayout, include_header: bool) -> Self {
        Self {
            apid: layout.apid,
            name: layout.name.clone(),
            columns: columns(layout, include_header),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// True if `record`, decoded with `layout`, has exactly this table's columns.
    #[must_use]
    pub fn fits(
        &self,
        layout: &PacketLayout,
        record: &DecodedRecord,
        include_header: bool,
    ) -> bool {
        record.fields.len() == self.columns.len()
            && self
                .columns
                .iter()
                .zip(&record.fields)
                .all(|(column, (name, _))| column.name == *name)
            && self
                .columns
                .iter()
                .map(|c| (c.name.as_str(), c.value_type, c.unit.as_deref()))
                .eq(column_specs(layout, include_header))
    }

    /// All values for the named column, one per record.
    #[must_use]
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(
            self.records
                .iter()
                .filter_map(|r| r.fields.get(idx).map(|(_, v)| v))
                .collect(),
        )
    }
}

/// Aggregate per-packet anomalies for a decode run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Diagnostics {
    /// Packets framed successfully.
    pub packets: usize,
    /// Records decoded and added to tables.
    pub records: usize,
    /// Packets skipped because no layout is registered for their APID.
    pub unknown_apids: BTreeMap<Apid, usize>,
    /// Number of missing packets per APID according to the sequence counter.
    pub sequence_gaps: BTreeMap<Apid, usize>,
    /// Fields decoded as [`Value::OutOfRange`].
    pub out_of_range_fields: usize,
    /// Records with at least one decode flag.
    pub flagged_records: usize,
    pub truncated_packets: usize,
    pub header_too_short: usize,
    /// Records dropped because their fields did not match the columns of their APID's table,
    /// e.g., a different layout than the one the table was created with.
    pub layout_mismatches: usize,
    /// Framing was stopped by cancellation.
    pub cancelled: bool,
    /// Description of the error that ended framing, if any.
    pub terminal_error: Option<String>,
}

impl Diagnostics {
    /// Total packets with unknown APIDs.
    #[must_use]
    pub fn unknown_packets(&self) -> usize {
        self.unknown_apids.values().sum()
    }

    /// Total missing packets across all APIDs.
    #[must_use]
    pub fn missing_packets(&self) -> usize {
        self.sequence_gaps.values().sum()
    }
}

/// Result of a decode run.
#[derive(Debug)]
pub struct Decoded {
    pub tables: BTreeMap<Apid, Table>,
    pub diagnostics: Diagnostics,
    /// The error that stopped framing early. Tables contain everything decoded before it.
    pub framing_error: Option<FramingError>,
}

impl Decoded {
    #[must_use]
    pub fn table(&self, apid: Apid) -> Option<&Table> {
        self.tables.get(&apid)
    }

    /// Total records across all tables.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Table::len).sum()
    }

    /// True if the whole stream was framed, i.e., no framing error and no cancellation.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.framing_error.is_none() && !self.diagnostics.cancelled
    }
}

/// Consumes packets in framing order and assembles [`Table`]s and [`Diagnostics`].
///
/// # Example
/// ```
/// use spackit::aggregate::Aggregator;
/// use spackit::layout::{FieldSpec, PacketLayout, ValueType};
/// use spackit::spacepacket::frame_packets;
///
/// let layout = PacketLayout::new(1369, vec![FieldSpec::new("X", 0, 8, ValueType::Unsigned)]);
/// let dat: &[u8] = &[0xd, 0x59, 0xc0, 0x01, 0x0, 0x0, 0x2a];
///
/// let mut aggregator = Aggregator::new(false);
/// for packet in frame_packets(dat).filter_map(Result::ok) {
///     aggregator.push(&packet, Some(&layout));
/// }
/// let decoded = aggregator.finish();
/// assert_eq!(decoded.table(1369).unwrap().len(), 1);
/// ```
#[derive(Debug)]
pub struct Aggregator {
    include_header: bool,
    tables: BTreeMap<Apid, Table>,
    last_sequence: HashMap<Apid, u16>,
    diagnostics: Diagnostics,
    framing_error: Option<FramingError>,
}

impl Aggregator {
    /// `include_header` controls whether tables carry the primary header columns.
    #[must_use]
    pub fn new(include_header: bool) -> Self {
        Self {
            include_header,
            tables: BTreeMap::new(),
            last_sequence: HashMap::new(),
            diagnostics: Diagnostics::default(),
            framing_error: None,
        }
    }

    /// Decode `packet` with `layout`, if there is one, and add the result.
    pub fn push(&mut self, packet: &RawPacket, layout: Option<&PacketLayout>) {
        let include_header = self.include_header;
        let decoded = layout.map(|layout| (layout, decode_packet(layout, packet, include_header)));
        self.accept(&packet.header, decoded);
    }

    /// Add a packet that has already been decoded, or `None` if its APID is unknown.
    ///
    /// Must be called in framing order.
    pub fn accept(
        &mut self,
        header: &PrimaryHeader,
        decoded: Option<(&PacketLayout, DecodedRecord)>,
    ) {
        let apid = header.apid;
        self.diagnostics.packets += 1;

        if let Some(last) = self.last_sequence.insert(apid, header.sequence_id) {
            let missing = missing_packets(header.sequence_id, last);
            if missing > 0 {
                debug!(apid, last, cur = header.sequence_id, missing, "sequence gap");
                *self.diagnostics.sequence_gaps.entry(apid).or_default() += missing as usize;
            }
        }

        let Some((layout, record)) = decoded else {
            let count = self.diagnostics.unknown_apids.entry(apid).or_default();
            if *count == 0 {
                debug!(apid, "no layout registered for apid; skipping its packets");
            }
            *count += 1;
            return;
        };

        let include_header = self.include_header;
        let table = self.tables.entry(apid).or_insert_with(|| {
            if include_header {
                for field in &layout.fields {
                    if HEADER_COLUMNS.contains(&field.name.as_str()) {
                        warn!(
                            apid,
                            field = %field.name,
                            "field shadowed by primary header column"
                        );
                    }
                }
            }
            Table::new(layout, include_header)
        });
        if !table.fits(layout, &record, include_header) {
            if self.diagnostics.layout_mismatches == 0 {
                warn!(
                    apid,
                    seq = header.sequence_id,
                    "record does not match the table columns for its apid; dropping"
                );
            }
            self.diagnostics.layout_mismatches += 1;
            return;
        }

        self.diagnostics.records += 1;
        self.diagnostics.out_of_range_fields += record.out_of_range_count();
        if record.is_flagged() {
            self.diagnostics.flagged_records += 1;
        }
        table.records.push(record);
    }

    /// Record the error that ended framing.
    pub fn fail(&mut self, err: FramingError) {
        match err {
            FramingError::HeaderTooShort { .. } => self.diagnostics.header_too_short += 1,
            FramingError::TruncatedPacket { .. } => self.diagnostics.truncated_packets += 1,
            _ => {}
        }
        self.diagnostics.terminal_error = Some(err.to_string());
        self.framing_error = Some(err);
    }

    /// Note that framing was cancelled before the end of the stream.
    pub fn cancel(&mut self) {
        self.diagnostics.cancelled = true;
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[must_use]
    pub fn finish(self) -> Decoded {
        Decoded {
            tables: self.tables,
            diagnostics: self.diagnostics,
            framing_error: self.framing_error,
        }
    }
}
