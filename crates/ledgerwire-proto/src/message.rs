//! Complete wire message: header, TLV payload, optional CRC32 trailer.
//!
//! The encoder recomputes `payload_len` from the payload and forces the
//! error flag from the status, so a `Message` cannot be serialized with
//! inconsistent framing. When the checksum flag is set, a CRC32 over
//! header ∥ payload (Big Endian) follows the payload; the trailer is not
//! counted in `payload_len`.

use bytes::BufMut;

use crate::{
    errors::{ProtocolError, Result},
    MessageHeader, MsgType, OpCode, Payload, Semantics, StatusCode, TlvField, TlvType,
};

/// Width of the CRC32 trailer.
const CRC32_SIZE: usize = 4;

/// A unit of wire traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Fixed 32-byte header.
    pub header: MessageHeader,
    /// TLV payload (possibly empty).
    pub payload: Payload,
}

impl Message {
    /// Build a request for the given operation.
    ///
    /// Derives `request_id` from `client_id` and `seq_no`; the identifier
    /// must stay stable across retransmissions of this logical request.
    #[must_use]
    pub fn request(op: OpCode, client_id: u32, seq_no: u32, semantics: Semantics) -> Self {
        let mut header = MessageHeader::new(MsgType::Req, op);
        header.set_client_id(client_id);
        header.set_seq_no(seq_no);
        header.set_semantics(semantics);
        header.derive_request_id();
        Self {
            header,
            payload: Payload::new(),
        }
    }

    /// Build a reply correlated to `request`.
    ///
    /// Copies opCode, clientId, seqNo, requestId and semantics from the
    /// request, and mirrors its checksum flag so a client that asked for
    /// integrity protection gets it on the way back too.
    #[must_use]
    pub fn reply_to(request: &Message, status: StatusCode) -> Self {
        let req = &request.header;
        let op = req.op_code().unwrap_or(OpCode::QueryBalance);
        let mut header = MessageHeader::new(MsgType::Rep, op);
        header.set_client_id(req.client_id());
        header.set_seq_no(req.seq_no());
        header.set_request_id(req.request_id());
        if let Some(semantics) = req.semantics() {
            header.set_semantics(semantics);
        }
        header.set_flags(header.flags().with_checksum(req.flags().has_checksum()));
        header.set_status(status);
        Self {
            header,
            payload: Payload::new(),
        }
    }

    /// Build a server-initiated callback notification.
    #[must_use]
    pub fn callback(op: OpCode) -> Self {
        Self {
            header: MessageHeader::new(MsgType::Cbk, op),
            payload: Payload::new(),
        }
    }

    /// Append a TLV field, replacing any prior field of the same type.
    pub fn push(mut self, field: TlvField) -> Self {
        self.payload.insert(field);
        self
    }

    /// Enable or disable the CRC32 trailer.
    #[must_use]
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.header
            .set_flags(self.header.flags().with_checksum(enabled));
        self
    }

    /// Required TLV types for a request (or callback) carrying `op`.
    #[must_use]
    pub fn required_fields(op: OpCode) -> &'static [TlvType] {
        match op {
            OpCode::OpenAccount => &[TlvType::Username, TlvType::Password, TlvType::Currency],
            OpCode::CloseAccount => &[TlvType::Username, TlvType::Password, TlvType::AccountNo],
            OpCode::Deposit | OpCode::Withdraw => &[
                TlvType::Username,
                TlvType::Password,
                TlvType::AccountNo,
                TlvType::AmountCents,
            ],
            OpCode::RegisterCallback => &[TlvType::TtlSeconds],
            OpCode::UnregisterCallback => &[],
            OpCode::QueryBalance => &[TlvType::Username, TlvType::Password, TlvType::AccountNo],
            OpCode::Transfer => &[
                TlvType::Username,
                TlvType::Password,
                TlvType::AccountNo,
                TlvType::ToAccountNo,
                TlvType::AmountCents,
            ],
            OpCode::AccountUpdate => &[TlvType::AccountNo, TlvType::AmountCents],
        }
    }

    /// Check that all required TLVs for this message's operation are present.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MissingTlv`] naming the first absent field, or
    /// [`ProtocolError::UnknownOpCode`] if the header's opCode is not in
    /// the table.
    pub fn validate_required(&self) -> Result<()> {
        let op = self
            .header
            .op_code()
            .ok_or(ProtocolError::UnknownOpCode(self.header.op_code_raw()))?;
        for tlv_type in Self::required_fields(op) {
            if !self.payload.contains(*tlv_type) {
                return Err(ProtocolError::MissingTlv(*tlv_type));
            }
        }
        Ok(())
    }

    /// Total encoded size.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let crc = if self.header.flags().has_checksum() {
            CRC32_SIZE
        } else {
            0
        };
        MessageHeader::SIZE + self.payload.encoded_len() + crc
    }

    /// Encode the message to a fresh byte vector.
    ///
    /// Recomputes `payload_len`, forces the error flag from the status,
    /// validates required TLVs for requests and callbacks (reply payloads
    /// vary by outcome and are not table-checked), and appends the CRC32
    /// trailer when the checksum flag is set.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::PayloadTooLarge`] if the payload exceeds the
    /// datagram limit, or a validation error for an incomplete request.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload_len = self.payload.encoded_len();
        if payload_len > MessageHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MessageHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        if matches!(self.header.msg_type(), Some(MsgType::Req) | Some(MsgType::Cbk)) {
            self.validate_required()?;
        }

        let mut header = self.header;
        header.set_payload_len(payload_len as u32);
        if let Some(status) = header.status() {
            header.set_status(status); // re-derives the error flag
        }

        let mut wire = Vec::with_capacity(self.encoded_len());
        wire.put_slice(&header.to_bytes());
        self.payload.encode(&mut wire);

        if header.flags().has_checksum() {
            let crc = crc32fast::hash(&wire);
            wire.put_u32(crc);
        }

        Ok(wire)
    }

    /// Decode a complete datagram.
    ///
    /// Validates the header (see [`MessageHeader::from_bytes`]), that the
    /// datagram holds exactly header + payload (+ trailer), that the TLV
    /// scan consumes the payload region exactly, and the CRC32 trailer when
    /// the checksum flag is set.
    ///
    /// # Errors
    ///
    /// One [`ProtocolError`] variant per violated rule.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = *MessageHeader::from_bytes(bytes)?;

        let payload_len = header.payload_len() as usize;
        let crc = if header.flags().has_checksum() {
            CRC32_SIZE
        } else {
            0
        };
        let expected = MessageHeader::SIZE + payload_len + crc;

        if bytes.len() < expected {
            return Err(ProtocolError::TooShort {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(ProtocolError::TrailingBytes {
                expected,
                actual: bytes.len(),
            });
        }

        let payload_end = MessageHeader::SIZE + payload_len;
        if header.flags().has_checksum() {
            let received = u32::from_be_bytes([
                bytes[payload_end],
                bytes[payload_end + 1],
                bytes[payload_end + 2],
                bytes[payload_end + 3],
            ]);
            let computed = crc32fast::hash(&bytes[..payload_end]);
            if received != computed {
                return Err(ProtocolError::ChecksumMismatch { received, computed });
            }
        }

        let payload = Payload::decode(&bytes[MessageHeader::SIZE..payload_end])?;

        Ok(Self { header, payload })
    }

    /// Decode only the header of a datagram, without touching the payload.
    ///
    /// Used by the server to log the request id of a datagram it is about
    /// to drop in loss simulation.
    pub fn peek_header(bytes: &[u8]) -> Result<MessageHeader> {
        MessageHeader::from_bytes(bytes).copied()
    }
}
