//! Wire protocol for the ledgerwire banking service.
//!
//! A message is a fixed 32-byte header followed by a TLV-encoded payload and
//! an optional CRC32 trailer. All multi-byte integers are Big Endian. The
//! header is raw binary so the server can route and deduplicate requests
//! without touching the payload; the payload is a flat sequence of typed
//! fields consumed until `payload_len` is exhausted exactly.
//!
//! Byte offsets and field widths are contractual: any conforming peer in any
//! language must produce bit-identical framing.

pub mod errors;
mod header;
mod message;
mod tlv;

pub use errors::{ProtocolError, Result};
pub use header::MessageHeader;
pub use message::Message;
pub use tlv::{Payload, TlvField, TlvType, ValueKind};

/// Default server port.
pub const DEFAULT_PORT: u16 = 8888;

/// Message type discriminator (header offset 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Client request.
    Req = 0,
    /// Server reply.
    Rep = 1,
    /// Server-initiated callback notification.
    Cbk = 2,
}

impl MsgType {
    /// Convert from wire byte. `None` if unrecognized.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Req),
            1 => Some(Self::Rep),
            2 => Some(Self::Cbk),
            _ => None,
        }
    }

    /// Wire byte for this message type.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Invocation semantics requested by the client (header offset 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Semantics {
    /// At-Least-Once: every received request is executed.
    Alo = 0,
    /// At-Most-Once: duplicates are suppressed via the server reply cache.
    #[default]
    Amo = 1,
}

impl Semantics {
    /// Convert from wire byte. `None` if unrecognized.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Alo),
            1 => Some(Self::Amo),
            _ => None,
        }
    }

    /// Wire byte for this semantics value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Operation codes (header offset 6).
///
/// Codes at 0x8000 and above are server-to-client only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    OpenAccount = 0x0001,
    CloseAccount = 0x0002,
    Deposit = 0x0003,
    Withdraw = 0x0004,
    RegisterCallback = 0x0005,
    UnregisterCallback = 0x0006,
    QueryBalance = 0x0101,
    Transfer = 0x0102,
    /// Balance-change notification fanned out to registered monitors.
    AccountUpdate = 0x8001,
}

impl OpCode {
    /// Convert from wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::OpenAccount),
            0x0002 => Some(Self::CloseAccount),
            0x0003 => Some(Self::Deposit),
            0x0004 => Some(Self::Withdraw),
            0x0005 => Some(Self::RegisterCallback),
            0x0006 => Some(Self::UnregisterCallback),
            0x0101 => Some(Self::QueryBalance),
            0x0102 => Some(Self::Transfer),
            0x8001 => Some(Self::AccountUpdate),
            _ => None,
        }
    }

    /// Wire value for this operation.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether repeating this operation repeats its effect.
    ///
    /// Non-idempotent operations should be sent with [`Semantics::Amo`] so
    /// that retransmissions cannot execute twice.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Self::RegisterCallback | Self::UnregisterCallback | Self::QueryBalance
        )
    }
}

/// Reply status codes (header offset 10). Zero in requests and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    BadRequest = 1,
    AuthFail = 2,
    NotFound = 3,
    InsufficientFunds = 4,
    CurrencyMismatch = 5,
    AlreadyExists = 6,
    InternalError = 7,
}

impl StatusCode {
    /// Convert from wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::BadRequest),
            2 => Some(Self::AuthFail),
            3 => Some(Self::NotFound),
            4 => Some(Self::InsufficientFunds),
            5 => Some(Self::CurrencyMismatch),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Wire value for this status.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this status indicates success.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::BadRequest => "BAD_REQUEST",
            Self::AuthFail => "AUTH_FAIL",
            Self::NotFound => "NOT_FOUND",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::CurrencyMismatch => "CURRENCY_MISMATCH",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Account currency, carried as a single-byte TLV value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Currency {
    Sgd = 0,
    Usd = 1,
    Eur = 2,
    Gbp = 3,
    Jpy = 4,
    Cny = 5,
}

impl Currency {
    /// Convert from wire byte. `None` if unrecognized.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Sgd),
            1 => Some(Self::Usd),
            2 => Some(Self::Eur),
            3 => Some(Self::Gbp),
            4 => Some(Self::Jpy),
            5 => Some(Self::Cny),
            _ => None,
        }
    }

    /// Wire byte for this currency.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// ISO 4217 code, used in logs and the client shell.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Sgd => "SGD",
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
            Self::Jpy => "JPY",
            Self::Cny => "CNY",
        }
    }

    /// Parse an ISO 4217 code (case-insensitive).
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "SGD" => Some(Self::Sgd),
            "USD" => Some(Self::Usd),
            "EUR" => Some(Self::Eur),
            "GBP" => Some(Self::Gbp),
            "JPY" => Some(Self::Jpy),
            "CNY" => Some(Self::Cny),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Header flags bitfield (header offset 9).
///
/// bit0 = CRC32 trailer present, bit1 = error reply. Bits 2..7 are reserved
/// and must be zero on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// bit0: CRC32 trailer follows the payload.
    pub const CHECKSUM: u8 = 0b0000_0001;
    /// bit1: reply carries a non-OK status.
    pub const ERROR: u8 = 0b0000_0010;

    const RESERVED: u8 = !(Self::CHECKSUM | Self::ERROR);

    /// Wrap a raw flags byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }

    /// Raw flags byte.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self.0
    }

    /// Whether the checksum bit is set.
    #[must_use]
    pub fn has_checksum(self) -> bool {
        self.0 & Self::CHECKSUM != 0
    }

    /// Whether the error bit is set.
    #[must_use]
    pub fn has_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    /// Whether any reserved bit is set.
    #[must_use]
    pub fn has_reserved(self) -> bool {
        self.0 & Self::RESERVED != 0
    }

    /// Set or clear the checksum bit.
    #[must_use]
    pub fn with_checksum(self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | Self::CHECKSUM)
        } else {
            Self(self.0 & !Self::CHECKSUM)
        }
    }

    /// Set or clear the error bit.
    #[must_use]
    pub fn with_error(self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | Self::ERROR)
        } else {
            Self(self.0 & !Self::ERROR)
        }
    }
}

/// Compose a request identifier from its parts.
///
/// The identifier is stable across retransmissions of one logical request:
/// high 32 bits carry the client id, low 32 bits the per-client sequence
/// number.
#[must_use]
pub fn compose_request_id(client_id: u32, seq_no: u32) -> u64 {
    (u64::from(client_id) << 32) | u64::from(seq_no)
}
