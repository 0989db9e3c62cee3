mod error;
mod summary;

use std::fmt::Display;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub use error::FramingError;
pub use summary::{ApidSummary, Summary};

pub type Apid = u16;

/// Packet is the first packet in a packet group
pub const SEQ_FIRST: u8 = 1;
/// Packet is a part of a packet group, but not first and not last
pub const SEQ_CONTINUATION: u8 = 0;
/// Packet is the last packet in a packet group
pub const SEQ_LAST: u8 = 2;
/// Packet is not part of a packet group, i.e., standalone.
pub const SEQ_UNSEGMENTED: u8 = 3;

/// CCSDS Primary Header
///
/// The primary header format is common to all CCSDS space packets and is always big-endian.
///
/// # Example
/// ```
/// use spackit::spacepacket::PrimaryHeader;
///
/// // bytes from a SNPP CrIS packet
/// let header = PrimaryHeader::decode(&[0xd, 0x59, 0xd2, 0xab, 0xa, 0x8f]).unwrap();
/// assert_eq!(header.apid, 1369);
/// assert_eq!(header.sequence_id, 4779);
/// assert_eq!(header.body_len(), 2704);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    /// Defines a packets grouping. See the `SEQ_*` values.
    pub sequence_flags: u8,
    pub sequence_id: u16,
    /// Packet data length field, i.e., the body length minus one.
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    pub const SEQ_MAX: u16 = 16383;
    /// Modulus of the 14-bit sequence counter
    pub const SEQ_MODULUS: u32 = Self::SEQ_MAX as u32 + 1;
    pub const APID_MAX: Apid = 0x7ff;

    /// Decode from bytes. Returns `None` if there are not enough bytes to construct the
    /// header.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Some(PrimaryHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Encode to header bytes. Values wider than their header fields are masked.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let d1 = (u16::from(self.version) & 0x7) << 13
            | (u16::from(self.type_flag) & 0x1) << 12
            | u16::from(self.has_secondary_header) << 11
            | (self.apid & 0x7ff);
        let d2 = (u16::from(self.sequence_flags) & 0x3) << 14 | (self.sequence_id & 0x3fff);
        let [a, b] = d1.to_be_bytes();
        let [c, d] = d2.to_be_bytes();
        let [e, f] = self.len_minus1.to_be_bytes();
        [a, b, c, d, e, f]
    }

    /// Number of body bytes following the header.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.len_minus1 as usize + 1
    }
}

/// A single framed packet: its primary header and the body bytes that followed it.
///
/// Raw packets are produced by [`PacketFramer`] and are intended to be consumed by the decoder
/// straight away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub header: PrimaryHeader,
    /// Packet body, i.e., everything after the primary header including any secondary header.
    pub body: Vec<u8>,
    /// Offset of the first header byte in the framed stream.
    pub offset: usize,
}

impl Display for RawPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RawPacket{{header: {:?}, offset={}, body:[len={}]}}",
            self.header,
            self.offset,
            self.body.len()
        )
    }
}

impl RawPacket {
    #[must_use]
    pub fn apid(&self) -> Apid {
        self.header.apid
    }

    #[must_use]
    pub fn sequence_count(&self) -> u16 {
        self.header.sequence_id
    }

    #[must_use]
    pub fn sequence_flags(&self) -> u8 {
        self.header.sequence_flags
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.header.sequence_flags == SEQ_FIRST
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.header.sequence_flags == SEQ_LAST
    }

    #[must_use]
    pub fn is_cont(&self) -> bool {
        self.header.sequence_flags == SEQ_CONTINUATION
    }

    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.header.sequence_flags == SEQ_UNSEGMENTED
    }

    /// Decode a single packet from the start of `dat`. Returns `None` if there are not enough
    /// bytes for the header or for the body length the header declares.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<RawPacket> {
        let header = PrimaryHeader::decode(dat)?;
        let end = PrimaryHeader::LEN + header.body_len();
        if dat.len() < end {
            return None;
        }
        Some(RawPacket {
            header,
            body: dat[PrimaryHeader::LEN..end].to_vec(),
            offset: 0,
        })
    }

    /// Total number of bytes this packet occupied in the stream.
    #[must_use]
    pub fn len(&self) -> usize {
        PrimaryHeader::LEN + self.body.len()
    }

    /// Same as `len() == 0`, which never holds since every packet has a header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Calculate the number of missing sequence ids.
///
/// `cur` is the current sequence id. `last` is the sequence id seen before `cur`. The expected
/// id is `(last + 1) mod 16384`, so a repeated id counts as a complete wrap.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let modulus = PrimaryHeader::SEQ_MODULUS;
    let cur = u32::from(cur) % modulus;
    let expected = (u32::from(last) + 1) % modulus;
    // result is < modulus, which fits in u16
    ((cur + modulus - expected) % modulus) as u16
}

/// Shared flag used to cooperatively stop framing.
///
/// The framer only checks the flag between packets, so a cancelled stream never ends in the
/// middle of a packet.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read until `buf` is full or the reader is exhausted, returning the number of bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Iterator splitting a byte stream into [`RawPacket`]s using the primary header packet length.
///
/// Each packet consumes exactly `6 + len_minus1 + 1` bytes. A [`FramingError`] is always the
/// last item produced; after it, or after a clean end of stream, the iterator is exhausted.
pub struct PacketFramer<R>
where
    R: Read,
{
    reader: R,
    offset: usize,
    done: bool,
    cancel: Option<CancelToken>,
    cancelled: bool,
}

impl<R> PacketFramer<R>
where
    R: Read,
{
    pub fn new(reader: R) -> Self {
        Self::resume(reader, 0)
    }

    /// Continue framing a stream whose reader is already positioned at `offset`.
    ///
    /// `offset` is only used to report packet and error offsets.
    pub fn resume(reader: R, offset: usize) -> Self {
        PacketFramer {
            reader,
            offset,
            done: false,
            cancel: None,
            cancelled: false,
        }
    }

    /// Stop producing packets once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stream offset of the next header to be read.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// True if framing stopped because of cancellation.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn fail(&mut self, err: FramingError) -> Option<Result<RawPacket, FramingError>> {
        debug!(offset = self.offset, "framing stopped: {err}");
        self.done = true;
        Some(Err(err))
    }
}

impl<R> Iterator for PacketFramer<R>
where
    R: Read,
{
    type Item = Result<RawPacket, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            debug!(offset = self.offset, "framing cancelled");
            self.cancelled = true;
            self.done = true;
            return None;
        }

        let mut buf = [0u8; PrimaryHeader::LEN];
        let available = match read_full(&mut self.reader, &mut buf) {
            Ok(n) => n,
            Err(err) => return self.fail(err.into()),
        };
        if available == 0 {
            self.done = true;
            return None;
        }
        let Some(header) = PrimaryHeader::decode(&buf[..available]) else {
            return self.fail(FramingError::HeaderTooShort {
                offset: self.offset,
                available,
            });
        };

        let declared = header.body_len();
        let mut body = vec![0u8; declared];
        let got = match read_full(&mut self.reader, &mut body) {
            Ok(n) => n,
            Err(err) => return self.fail(err.into()),
        };
        if got < declared {
            return self.fail(FramingError::TruncatedPacket {
                offset: self.offset,
                apid: header.apid,
                declared,
                available: got,
            });
        }

        let packet = RawPacket {
            header,
            body,
            offset: self.offset,
        };
        trace!(apid = header.apid, seq = header.sequence_id, offset = self.offset, "framed");
        self.offset += packet.len();
        Some(Ok(packet))
    }
}

/// Return an iterator providing [`RawPacket`]s framed from `reader`.
///
/// # Examples
/// ```
/// use spackit::spacepacket::frame_packets;
///
/// let dat: &[u8] = &[
///     // primary header bytes
///     0xd, 0x59, 0xd2, 0xab, 0x0, 0x7,
///     // CDS timecode bytes in secondary header
///     0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb,
/// ];
///
/// frame_packets(dat).for_each(|zult| {
///     let packet = zult.unwrap();
///     assert_eq!(packet.header.apid, 1369);
///     assert_eq!(packet.body.len(), 8);
/// });
/// ```
pub fn frame_packets<R>(reader: R) -> PacketFramer<R>
where
    R: Read,
{
    PacketFramer::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_decode_header() {
        let dat: [u8; 6] = [
            // bytes from a SNPP CrIS packet
            0xd, 0x59, 0xd2, 0xab, 0xa, 0x8f,
        ];
        let ph = PrimaryHeader::decode(&dat).unwrap();

        assert_eq!(ph.version, 0);
        assert_eq!(ph.type_flag, 0);
        assert!(ph.has_secondary_header);
        assert_eq!(ph.apid, 1369);
        assert_eq!(ph.sequence_flags, 3);
        assert_eq!(ph.sequence_id, 4779);
        assert_eq!(ph.len_minus1, 2703);
        assert_eq!(ph.encode(), dat);
    }

    #[test]
    fn test_decode_packet() {
        #[rustfmt::skip]
        let dat: [u8; 15] = [
            // Primary/secondary header and a single byte of user data
            0xd, 0x59, 0xd2, 0xab, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
        ];
        let packet = RawPacket::decode(&dat).unwrap();

        assert_eq!(packet.header.version, 0);
        assert_eq!(packet.body, &dat[6..]);
        assert_eq!(packet.len(), 15);
        assert!(!packet.is_empty());
        assert!(RawPacket::decode(&dat[..14]).is_none());
    }

    #[test]
    fn framer_iter() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            // Primary/secondary header and a single byte of user data
            // byte 4 is sequence number 1 & 2
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
            0xd, 0x59, 0xc0, 0x02, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
        ];

        let packets: Vec<RawPacket> = frame_packets(dat).map(Result::unwrap).collect();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].apid(), 1369);
        assert_eq!(packets[0].sequence_count(), 1);
        assert_eq!(packets[0].offset, 0);
        assert_eq!(&packets[0].body[..], &dat[6..15]);
        assert_eq!(packets[1].sequence_count(), 2);
        assert_eq!(packets[1].offset, 15);
        assert_eq!(&packets[1].body[..], &dat[21..]);
    }

    #[test]
    fn packet_len_counts_header() {
        let packet = RawPacket {
            header: PrimaryHeader::decode(&[0xd, 0x59, 0xc0, 0x01, 0x0, 0x0]).unwrap(),
            body: vec![],
            offset: 0,
        };
        assert_eq!(packet.len(), PrimaryHeader::LEN);
        assert_eq!(packet.is_empty(), packet.len() == 0);
    }

    #[test]
    fn framer_empty_stream() {
        let dat: &[u8] = &[];
        assert_eq!(frame_packets(dat).count(), 0);
    }

    #[test]
    fn framer_header_too_short() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x0, 0xff,
            0xd, 0x59, 0xc0,
        ];

        let mut framer = frame_packets(dat);
        assert!(framer.next().unwrap().is_ok());
        let err = framer.next().unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                FramingError::HeaderTooShort {
                    offset: 7,
                    available: 3
                }
            ),
            "got {err:?}"
        );
        assert!(framer.next().is_none());
    }

    #[test]
    fn framer_truncated_stops_stream() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            // declares 9 body bytes, only 4 present
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0,
        ];

        let items: Vec<_> = frame_packets(dat).collect();
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(FramingError::TruncatedPacket {
                offset,
                apid,
                declared,
                available,
            }) => {
                assert_eq!(*offset, 0);
                assert_eq!(*apid, 1369);
                assert_eq!(*declared, 9);
                assert_eq!(*available, 4);
            }
            other => panic!("expected truncated packet, got {other:?}"),
        }
    }

    #[test]
    fn framer_resume_reports_offsets() {
        let dat: &[u8] = &[0xd, 0x59, 0xc0, 0x05, 0x0, 0x0, 0xaa];
        let packet = PacketFramer::resume(dat, 100).next().unwrap().unwrap();
        assert_eq!(packet.offset, 100);
    }

    #[test]
    fn framer_cancel_between_packets() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x0, 0xff,
            0xd, 0x59, 0xc0, 0x02, 0x0, 0x0, 0xff,
        ];
        let token = CancelToken::new();
        let mut framer = frame_packets(dat).with_cancel(token.clone());

        assert!(framer.next().unwrap().is_ok());
        token.cancel();
        assert!(framer.next().is_none());
        assert!(framer.was_cancelled());
        assert_eq!(framer.offset(), 7);
    }

    #[test_case(5, 4, 0; "consecutive")]
    #[test_case(5, 3, 1; "one missing")]
    #[test_case(12, 10, 1; "ten to twelve")]
    #[test_case(0, PrimaryHeader::SEQ_MAX, 0; "wrap")]
    #[test_case(0, PrimaryHeader::SEQ_MAX - 1, 1; "missing across wrap")]
    #[test_case(2, 16380, 5; "several across wrap")]
    #[test_case(0, 0, PrimaryHeader::SEQ_MAX; "repeated")]
    fn test_missing_packets(cur: u16, last: u16, expected: u16) {
        assert_eq!(missing_packets(cur, last), expected);
    }
}
