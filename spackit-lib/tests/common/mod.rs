use spackit::spacepacket::{Apid, PrimaryHeader, SEQ_UNSEGMENTED};

/// Encode a standalone packet with the given body.
pub fn packet_bytes(apid: Apid, seq: u16, body: &[u8]) -> Vec<u8> {
    assert!(!body.is_empty(), "packet bodies must have at least one byte");
    let header = PrimaryHeader {
        version: 0,
        type_flag: 0,
        has_secondary_header: false,
        apid,
        sequence_flags: SEQ_UNSEGMENTED,
        sequence_id: seq,
        len_minus1: u16::try_from(body.len() - 1).expect("body too long"),
    };
    let mut dat = header.encode().to_vec();
    dat.extend_from_slice(body);
    dat
}

/// Concatenate packets into a single stream.
pub fn stream<I>(packets: I) -> Vec<u8>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    packets.into_iter().flatten().collect()
}
