//! Protocol error types.
//!
//! Every violation of the framing contract maps to a distinct variant so
//! that tests can assert on the exact rejection reason. The server treats
//! all of these as BAD_REQUEST-class failures: unparsable datagrams are
//! dropped, parsable-but-invalid requests get an error reply.

use thiserror::Error;

use crate::TlvType;

/// Convenience alias used throughout the codec.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the structure it should contain.
    #[error("message too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Magic number is not 0xD5D5.
    #[error("invalid magic number: {0:#06x}")]
    InvalidMagic(u16),

    /// Protocol version is not 1.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Header length field is not 32.
    #[error("invalid header length: {0}")]
    InvalidHeaderLength(u16),

    /// Message type byte outside the REQ/REP/CBK set.
    #[error("unknown message type: {0}")]
    UnknownMsgType(u8),

    /// Operation code not in the protocol table.
    #[error("unknown operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Semantics byte outside the ALO/AMO set.
    #[error("unknown semantics: {0}")]
    UnknownSemantics(u8),

    /// Status code outside the defined range.
    #[error("unknown status code: {0}")]
    UnknownStatus(u16),

    /// A reserved flag bit (2..7) is set.
    #[error("reserved flag bits set: {0:#010b}")]
    ReservedFlags(u8),

    /// Non-zero status on a request or callback.
    #[error("non-zero status {status} in message type {msg_type}")]
    UnexpectedStatus { msg_type: u8, status: u16 },

    /// Error flag disagrees with the status field.
    #[error("error flag does not match status {status}")]
    ErrorFlagMismatch { status: u16 },

    /// Payload length exceeds the datagram limit.
    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Datagram longer than header + payload + trailer.
    #[error("trailing bytes after message: expected {expected} bytes, got {actual}")]
    TrailingBytes { expected: usize, actual: usize },

    /// TLV type code not in the protocol table.
    #[error("unknown TLV type: {0:#06x}")]
    UnknownTlvType(u16),

    /// Fixed-width TLV with the wrong length.
    #[error("invalid length for {tlv_type:?} TLV: expected {expected}, got {actual}")]
    InvalidTlvLength {
        tlv_type: TlvType,
        expected: usize,
        actual: usize,
    },

    /// String-kind TLV whose value is not valid UTF-8.
    #[error("invalid UTF-8 in {0:?} TLV")]
    InvalidUtf8(TlvType),

    /// Currency byte outside the defined set.
    #[error("unknown currency: {0}")]
    UnknownCurrency(u8),

    /// A required TLV is absent from the payload.
    #[error("missing required TLV: {0:?}")]
    MissingTlv(TlvType),

    /// A TLV is present but carries the wrong value kind.
    #[error("TLV {0:?} accessed with the wrong value kind")]
    WrongValueKind(TlvType),

    /// CRC32 trailer does not match header + payload.
    #[error("CRC mismatch: received {received:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { received: u32, computed: u32 },
}
