//! Message header implementation with zero-copy parsing.
//!
//! The `MessageHeader` is a fixed 32-byte structure serialized as raw binary
//! (Big Endian). Fields are stored as byte arrays to avoid alignment issues,
//! which lets the server peek at routing fields (`request_id`, `client_id`)
//! without deserializing the payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    errors::{ProtocolError, Result},
    MessageFlags, MsgType, OpCode, Semantics, StatusCode,
};

/// Fixed 32-byte message header (Big Endian network byte order).
///
/// Offsets are contractual:
///
/// | Offset | Width | Field       |
/// |--------|-------|-------------|
/// | 0      | 2     | magic       |
/// | 2      | 1     | version     |
/// | 3      | 1     | msg_type    |
/// | 4      | 2     | header_len  |
/// | 6      | 2     | op_code     |
/// | 8      | 1     | semantics   |
/// | 9      | 1     | flags       |
/// | 10     | 2     | status      |
/// | 12     | 8     | request_id  |
/// | 20     | 4     | client_id   |
/// | 24     | 4     | seq_no      |
/// | 28     | 4     | payload_len |
///
/// The `#[repr(C, packed)]` layout with zerocopy traits means the struct can
/// be cast from untrusted network bytes without undefined behavior; semantic
/// validation happens in [`MessageHeader::from_bytes`].
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MessageHeader {
    magic: [u8; 2],
    version: u8,
    msg_type: u8,
    header_len: [u8; 2],
    op_code: [u8; 2],
    semantics: u8,
    flags: u8,
    status: [u8; 2],
    request_id: [u8; 8],
    client_id: [u8; 4],
    seq_no: [u8; 4],
    pub(crate) payload_len: [u8; 4],
}

impl MessageHeader {
    /// Size of the serialized header (32 bytes).
    pub const SIZE: usize = 32;

    /// Magic number identifying protocol datagrams.
    pub const MAGIC: u16 = 0xD5D5;

    /// Current protocol version.
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size that fits a single UDP datagram.
    pub const MAX_PAYLOAD_SIZE: u32 = 65000;

    /// Create a header with the given message type and operation.
    ///
    /// All identity fields start at zero; callers fill them in via setters.
    #[must_use]
    pub fn new(msg_type: MsgType, op_code: OpCode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            msg_type: msg_type.to_u8(),
            header_len: (Self::SIZE as u16).to_be_bytes(),
            op_code: op_code.to_u16().to_be_bytes(),
            semantics: Semantics::default().to_u8(),
            flags: 0,
            status: [0; 2],
            request_id: [0; 8],
            client_id: [0; 4],
            seq_no: [0; 4],
            payload_len: [0; 4],
        }
    }

    /// Parse and validate a header from network bytes (zero-copy).
    ///
    /// Validation order is cheapest-first: size, magic, version, header
    /// length, then the enum-coded fields, flags, and the cross-field laws
    /// (status must be zero outside replies; the error flag is set iff the
    /// status is non-zero).
    ///
    /// # Errors
    ///
    /// One [`ProtocolError`] variant per violated rule; see `errors.rs`.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::TooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u16::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(u16::from_be_bytes(header.magic)));
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        let header_len = u16::from_be_bytes(header.header_len);
        if header_len != Self::SIZE as u16 {
            return Err(ProtocolError::InvalidHeaderLength(header_len));
        }

        let msg_type = MsgType::from_u8(header.msg_type)
            .ok_or(ProtocolError::UnknownMsgType(header.msg_type))?;
        Semantics::from_u8(header.semantics)
            .ok_or(ProtocolError::UnknownSemantics(header.semantics))?;
        let op_code = u16::from_be_bytes(header.op_code);
        OpCode::from_u16(op_code).ok_or(ProtocolError::UnknownOpCode(op_code))?;
        let status = u16::from_be_bytes(header.status);
        StatusCode::from_u16(status).ok_or(ProtocolError::UnknownStatus(status))?;

        let flags = MessageFlags::from_u8(header.flags);
        if flags.has_reserved() {
            return Err(ProtocolError::ReservedFlags(header.flags));
        }
        if msg_type != MsgType::Rep && status != 0 {
            return Err(ProtocolError::UnexpectedStatus {
                msg_type: header.msg_type,
                status,
            });
        }
        if flags.has_error() != (status != 0) {
            return Err(ProtocolError::ErrorFlagMismatch { status });
        }

        let payload_len = u32::from_be_bytes(header.payload_len);
        if payload_len > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Protocol magic number (0xD5D5).
    #[must_use]
    pub fn magic(&self) -> u16 {
        u16::from_be_bytes(self.magic)
    }

    /// Protocol version byte (currently 0x01).
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Message type as raw byte.
    #[must_use]
    pub fn msg_type_raw(&self) -> u8 {
        self.msg_type
    }

    /// Message type as enum. `None` if unrecognized.
    #[must_use]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn op_code_raw(&self) -> u16 {
        u16::from_be_bytes(self.op_code)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_u16(self.op_code_raw())
    }

    /// Requested invocation semantics. `None` if unrecognized.
    #[must_use]
    pub fn semantics(&self) -> Option<Semantics> {
        Semantics::from_u8(self.semantics)
    }

    /// Header flags bitfield.
    #[must_use]
    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_u8(self.flags)
    }

    /// Reply status as raw u16.
    #[must_use]
    pub fn status_raw(&self) -> u16 {
        u16::from_be_bytes(self.status)
    }

    /// Reply status as enum. `None` if unrecognized.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status_raw())
    }

    /// Request identifier, stable across retransmissions.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        u64::from_be_bytes(self.request_id)
    }

    /// Origin client identifier.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        u32::from_be_bytes(self.client_id)
    }

    /// Per-client monotonic sequence number.
    #[must_use]
    pub fn seq_no(&self) -> u32 {
        u32::from_be_bytes(self.seq_no)
    }

    /// Payload size in bytes (excludes the CRC trailer).
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        u32::from_be_bytes(self.payload_len)
    }

    /// Update the message type.
    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type.to_u8();
    }

    /// Update the operation code.
    pub fn set_op_code(&mut self, op_code: OpCode) {
        self.op_code = op_code.to_u16().to_be_bytes();
    }

    /// Update the invocation semantics.
    pub fn set_semantics(&mut self, semantics: Semantics) {
        self.semantics = semantics.to_u8();
    }

    /// Replace the flags byte.
    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags.to_u8();
    }

    /// Set the reply status and force the error flag to match it.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status.to_u16().to_be_bytes();
        self.flags = MessageFlags::from_u8(self.flags)
            .with_error(!status.is_ok())
            .to_u8();
    }

    /// Set the request identifier directly.
    pub fn set_request_id(&mut self, request_id: u64) {
        self.request_id = request_id.to_be_bytes();
    }

    /// Update the client identifier.
    pub fn set_client_id(&mut self, client_id: u32) {
        self.client_id = client_id.to_be_bytes();
    }

    /// Update the sequence number.
    pub fn set_seq_no(&mut self, seq_no: u32) {
        self.seq_no = seq_no.to_be_bytes();
    }

    /// Set the payload length (done by the encoder, never by hand).
    pub fn set_payload_len(&mut self, len: u32) {
        self.payload_len = len.to_be_bytes();
    }

    /// Recompute `request_id` from `client_id` and `seq_no`.
    pub fn derive_request_id(&mut self) {
        let id = crate::compose_request_id(self.client_id(), self.seq_no());
        self.request_id = id.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHeader")
            .field("magic", &format!("{:#06x}", self.magic()))
            .field("version", &self.version())
            .field("msg_type", &self.msg_type())
            .field("op_code", &format!("{:#06x}", self.op_code_raw()))
            .field("semantics", &self.semantics())
            .field("flags", &format!("{:#04x}", self.flags().to_u8()))
            .field("status", &self.status_raw())
            .field("request_id", &self.request_id())
            .field("client_id", &self.client_id())
            .field("seq_no", &self.seq_no())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for MessageHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for MessageHeader {}
