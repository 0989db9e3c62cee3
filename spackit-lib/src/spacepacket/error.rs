use super::Apid;

/// Stream-level framing failures.
///
/// Every variant is terminal for the stream being framed: once a header or body cannot be
/// read in full there is no reliable way to locate the next primary header.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FramingError {
    /// IO error reading the stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Fewer than [`PrimaryHeader::LEN`](super::PrimaryHeader::LEN) bytes remained where a
    /// header was expected.
    #[error("header too short at offset {offset}: {available} bytes available")]
    HeaderTooShort {
        /// Stream offset where the header should have started
        offset: usize,
        /// Number of bytes that were available
        available: usize,
    },

    /// The header declared more body bytes than remained in the stream.
    #[error(
        "truncated packet apid={apid} at offset {offset}: declared {declared} body bytes, {available} available"
    )]
    TruncatedPacket {
        offset: usize,
        apid: Apid,
        declared: usize,
        available: usize,
    },
}
