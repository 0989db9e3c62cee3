use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{missing_packets, Apid, RawPacket};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApidSummary {
    pub count: usize,
    pub bytes: usize,
    pub missing: usize,
    pub first_sequence_id: u16,
    pub last_sequence_id: u16,
}

/// Tracks framing stats without decoding any packet bodies.
///
/// # Example
/// ```
/// use spackit::spacepacket::{frame_packets, Summary};
/// let dat: &[u8] = &[0xd, 0x59, 0xc0, 0x01, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff];
///
/// let mut summary = Summary::default();
/// frame_packets(dat)
///     .filter_map(Result::ok)
///     .for_each(|p| summary.add(&p));
/// assert_eq!(summary.count, 1);
/// ```
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Summary {
    pub count: usize,
    pub bytes: usize,
    pub missing: usize,
    pub apids: BTreeMap<Apid, ApidSummary>,
}

impl Summary {
    pub fn add(&mut self, packet: &RawPacket) {
        self.count += 1;
        self.bytes += packet.len();

        let seq = packet.sequence_count();
        match self.apids.get_mut(&packet.apid()) {
            Some(apid) => {
                let missing = missing_packets(seq, apid.last_sequence_id) as usize;
                apid.count += 1;
                apid.bytes += packet.len();
                apid.missing += missing;
                apid.last_sequence_id = seq;
                self.missing += missing;
            }
            None => {
                self.apids.insert(
                    packet.apid(),
                    ApidSummary {
                        count: 1,
                        bytes: packet.len(),
                        missing: 0,
                        first_sequence_id: seq,
                        last_sequence_id: seq,
                    },
                );
            }
        }
    }
}

impl<'a> FromIterator<&'a RawPacket> for Summary {
    fn from_iter<T: IntoIterator<Item = &'a RawPacket>>(iter: T) -> Self {
        let mut summary = Summary::default();
        iter.into_iter().for_each(|p| summary.add(p));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary() {
        #[rustfmt::skip]
        let dat: &[u8] = &[
            // Primary/secondary header and a single byte of user data
            // byte 4 is sequence number 1 & 3
            0xd, 0x59, 0xc0, 0x01, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
            0xd, 0x59, 0xc0, 0x03, 0x0, 0x8, 0x52, 0xc0, 0x0, 0x0, 0x0, 0xa7, 0x0, 0xdb, 0xff,
        ];

        let first = RawPacket::decode(&dat[0..15]).unwrap();
        let second = RawPacket::decode(&dat[15..]).unwrap();
        let summary: Summary = [&first, &second].into_iter().collect();

        assert_eq!(summary.count, 2);
        assert_eq!(summary.bytes, 30);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.apids.len(), 1);
        assert_eq!(summary.apids[&1369].count, 2);
        assert_eq!(summary.apids[&1369].bytes, 30);
        assert_eq!(summary.apids[&1369].missing, 1);
        assert_eq!(summary.apids[&1369].first_sequence_id, 1);
        assert_eq!(summary.apids[&1369].last_sequence_id, 3);
    }
}
