//! Error types surfaced by the protocol engine.

use std::io;

use thiserror::Error;

/// Errors raised while encoding or decoding a message.
///
/// Inbound traffic never surfaces these to callers: a malformed datagram is
/// absorbed locally (logged, and answered with RST when it was confirmable).
/// Outbound construction surfaces them from `send`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The buffer ended before the fixed header was complete.
    #[error("message truncated")]
    Truncated,

    /// Declared token length cannot be represented on the wire.
    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),

    /// An option used the reserved delta nibble 15.
    #[error("invalid option delta")]
    InvalidOptionDelta,

    /// An option length field overran the buffer or used the reserved
    /// nibble 15.
    #[error("invalid option length")]
    InvalidOptionLength,

    /// An integer-format option value exceeded its declared width.
    #[error("option value of {actual} bytes exceeds the {max} byte bound")]
    OptionValueTooLong { actual: usize, max: usize },

    /// Version field was not 1.
    #[error("unknown protocol version {0}")]
    InvalidVersion(u8),

    /// A payload marker was present with nothing after it.
    #[error("payload marker with empty payload")]
    PayloadMarkerWithoutPayload,

    /// The encoded message exceeds the configured maximum message size.
    #[error("message of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),

    /// The request URI is relative, carries a fragment, or uses an
    /// unrecognized scheme.
    #[error("invalid request uri: {0}")]
    InvalidUri(String),
}

/// Errors surfaced to callers of the client façade.
#[derive(Debug, Error)]
pub enum Error {
    /// The retransmission limit was exceeded without an acknowledgement.
    #[error("confirmable request timed out after retransmission limit")]
    Timeout,

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The peer rejected the exchange with RST.
    #[error("peer reset the exchange")]
    Reset,

    /// An outbound message could not be encoded.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// The caller supplied an option with an unrecognized critical number.
    #[error("unrecognized critical option {0} on outbound request")]
    BadOption(u16),

    /// Socket bind/send/recv or DNS lookup failure.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// A multicast request was awaited as if it had a single response.
    #[error("multicast request awaited without a response handler")]
    MulticastWithoutHandler,
}

impl Error {
    /// Whether the error is a cancellation (explicit or by timeout).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
