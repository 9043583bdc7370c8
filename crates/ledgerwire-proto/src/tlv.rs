//! TLV payload encoding.
//!
//! A payload is a flat sequence of (type: u16, length: u16, value) fields,
//! Big Endian, consumed until the header's `payload_len` is exhausted
//! exactly. Fixed-width kinds (currency, ttl, amount) must carry exactly
//! their declared width; string kinds must be valid UTF-8. A duplicate type
//! replaces the earlier value but keeps its original position, so encoding
//! is order-preserving.

use bytes::{BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    Currency,
};

/// TLV field type codes. New codes must use 0x0009 and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlvType {
    Username = 0x0001,
    Password = 0x0002,
    AccountNo = 0x0003,
    Currency = 0x0004,
    AmountCents = 0x0005,
    ToAccountNo = 0x0006,
    TtlSeconds = 0x0007,
    Note = 0x0008,
}

/// Value kind carried by a TLV type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// UTF-8 string, any length.
    Str,
    /// Single byte (currency enum).
    U8,
    /// Big-endian u32.
    U32,
    /// Big-endian i64.
    I64,
}

impl TlvType {
    /// Convert from wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Username),
            0x0002 => Some(Self::Password),
            0x0003 => Some(Self::AccountNo),
            0x0004 => Some(Self::Currency),
            0x0005 => Some(Self::AmountCents),
            0x0006 => Some(Self::ToAccountNo),
            0x0007 => Some(Self::TtlSeconds),
            0x0008 => Some(Self::Note),
            _ => None,
        }
    }

    /// Wire value for this type.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// The value kind this type carries.
    #[must_use]
    pub fn value_kind(self) -> ValueKind {
        match self {
            Self::Username | Self::Password | Self::AccountNo | Self::ToAccountNo | Self::Note => {
                ValueKind::Str
            }
            Self::Currency => ValueKind::U8,
            Self::TtlSeconds => ValueKind::U32,
            Self::AmountCents => ValueKind::I64,
        }
    }

    /// Required value width for fixed-width kinds; `None` for strings.
    #[must_use]
    fn fixed_width(self) -> Option<usize> {
        match self.value_kind() {
            ValueKind::Str => None,
            ValueKind::U8 => Some(1),
            ValueKind::U32 => Some(4),
            ValueKind::I64 => Some(8),
        }
    }
}

/// A single decoded or to-be-encoded TLV field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvField {
    tlv_type: TlvType,
    value: Bytes,
}

impl TlvField {
    /// Bytes of type + length framing per field.
    const FRAMING: usize = 4;

    /// Build a string field. Panics never: all string types accept any length.
    #[must_use]
    pub fn string(tlv_type: TlvType, value: &str) -> Self {
        debug_assert_eq!(tlv_type.value_kind(), ValueKind::Str);
        Self {
            tlv_type,
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    /// Build the username field.
    #[must_use]
    pub fn username(value: &str) -> Self {
        Self::string(TlvType::Username, value)
    }

    /// Build the password field.
    #[must_use]
    pub fn password(value: &str) -> Self {
        Self::string(TlvType::Password, value)
    }

    /// Build the account-number field.
    #[must_use]
    pub fn account_no(value: &str) -> Self {
        Self::string(TlvType::AccountNo, value)
    }

    /// Build the destination-account field.
    #[must_use]
    pub fn to_account_no(value: &str) -> Self {
        Self::string(TlvType::ToAccountNo, value)
    }

    /// Build the free-text note field.
    #[must_use]
    pub fn note(value: &str) -> Self {
        Self::string(TlvType::Note, value)
    }

    /// Build the currency field.
    #[must_use]
    pub fn currency(value: Currency) -> Self {
        Self {
            tlv_type: TlvType::Currency,
            value: Bytes::copy_from_slice(&[value.to_u8()]),
        }
    }

    /// Build the amount field (minor units, may be negative).
    #[must_use]
    pub fn amount_cents(value: i64) -> Self {
        Self {
            tlv_type: TlvType::AmountCents,
            value: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// Build the callback TTL field.
    #[must_use]
    pub fn ttl_seconds(value: u32) -> Self {
        Self {
            tlv_type: TlvType::TtlSeconds,
            value: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// Field type code.
    #[must_use]
    pub fn tlv_type(&self) -> TlvType {
        self.tlv_type
    }

    /// Raw value bytes.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.value
    }

    /// Value as a string slice.
    pub fn as_str(&self) -> Result<&str> {
        if self.tlv_type.value_kind() != ValueKind::Str {
            return Err(ProtocolError::WrongValueKind(self.tlv_type));
        }
        std::str::from_utf8(&self.value).map_err(|_| ProtocolError::InvalidUtf8(self.tlv_type))
    }

    /// Value as a signed 64-bit amount.
    pub fn as_i64(&self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .value
            .as_ref()
            .try_into()
            .map_err(|_| ProtocolError::WrongValueKind(self.tlv_type))?;
        if self.tlv_type.value_kind() != ValueKind::I64 {
            return Err(ProtocolError::WrongValueKind(self.tlv_type));
        }
        Ok(i64::from_be_bytes(bytes))
    }

    /// Value as an unsigned 32-bit integer.
    pub fn as_u32(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .value
            .as_ref()
            .try_into()
            .map_err(|_| ProtocolError::WrongValueKind(self.tlv_type))?;
        if self.tlv_type.value_kind() != ValueKind::U32 {
            return Err(ProtocolError::WrongValueKind(self.tlv_type));
        }
        Ok(u32::from_be_bytes(bytes))
    }

    /// Value as a currency.
    pub fn as_currency(&self) -> Result<Currency> {
        if self.tlv_type != TlvType::Currency || self.value.len() != 1 {
            return Err(ProtocolError::WrongValueKind(self.tlv_type));
        }
        Currency::from_u8(self.value[0]).ok_or(ProtocolError::UnknownCurrency(self.value[0]))
    }

    /// Encoded size of this field including framing.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::FRAMING + self.value.len()
    }

    /// Write the field to a buffer: type (u16) | length (u16) | value.
    pub fn encode(&self, dst: &mut impl BufMut) {
        debug_assert!(self.value.len() <= u16::MAX as usize);
        dst.put_u16(self.tlv_type.to_u16());
        dst.put_u16(self.value.len() as u16);
        dst.put_slice(&self.value);
    }

    /// Decode one field from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Rejects truncated framing or value, unknown type codes, fixed-width
    /// violations, invalid UTF-8 in string kinds, and unknown currency
    /// bytes (the only enum-valued kind).
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < Self::FRAMING {
            return Err(ProtocolError::TooShort {
                expected: Self::FRAMING,
                actual: bytes.len(),
            });
        }

        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let tlv_type =
            TlvType::from_u16(raw_type).ok_or(ProtocolError::UnknownTlvType(raw_type))?;
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        if bytes.len() < Self::FRAMING + len {
            return Err(ProtocolError::TooShort {
                expected: Self::FRAMING + len,
                actual: bytes.len(),
            });
        }
        if let Some(width) = tlv_type.fixed_width() {
            if len != width {
                return Err(ProtocolError::InvalidTlvLength {
                    tlv_type,
                    expected: width,
                    actual: len,
                });
            }
        }

        let value = Bytes::copy_from_slice(&bytes[Self::FRAMING..Self::FRAMING + len]);
        let field = Self { tlv_type, value };

        // Value-level validation so downstream accessors cannot fail on
        // structural grounds.
        match tlv_type.value_kind() {
            ValueKind::Str => {
                field.as_str()?;
            }
            ValueKind::U8 => {
                field.as_currency()?;
            }
            ValueKind::U32 | ValueKind::I64 => {}
        }

        Ok((field, Self::FRAMING + len))
    }
}

/// Ordered TLV field collection.
///
/// Insertion replaces an existing field of the same type in place, matching
/// the later-replaces-earlier rule for duplicate types on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    fields: Vec<TlvField>,
}

impl Payload {
    /// Empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any existing field of the same type.
    pub fn insert(&mut self, field: TlvField) -> &mut Self {
        match self.fields.iter_mut().find(|f| f.tlv_type == field.tlv_type) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Look up a field by type.
    #[must_use]
    pub fn get(&self, tlv_type: TlvType) -> Option<&TlvField> {
        self.fields.iter().find(|f| f.tlv_type == tlv_type)
    }

    /// Whether a field of the given type is present.
    #[must_use]
    pub fn contains(&self, tlv_type: TlvType) -> bool {
        self.get(tlv_type).is_some()
    }

    /// All fields in encoding order.
    #[must_use]
    pub fn fields(&self) -> &[TlvField] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the payload carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total encoded size of all fields.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.fields.iter().map(TlvField::encoded_len).sum()
    }

    /// Write all fields to a buffer in order.
    pub fn encode(&self, dst: &mut impl BufMut) {
        for field in &self.fields {
            field.encode(dst);
        }
    }

    /// Decode a payload region, consuming it exactly.
    ///
    /// # Errors
    ///
    /// Any field-level error, or [`ProtocolError::TooShort`] when a field
    /// runs past the region. Exact consumption is guaranteed by decoding
    /// against the bounded slice.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut payload = Self::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (field, consumed) = TlvField::decode(&bytes[offset..])?;
            payload.insert(field);
            offset += consumed;
        }
        Ok(payload)
    }

    /// Required string field accessor.
    pub fn str_field(&self, tlv_type: TlvType) -> Result<&str> {
        self.get(tlv_type)
            .ok_or(ProtocolError::MissingTlv(tlv_type))?
            .as_str()
    }

    /// Username field.
    pub fn username(&self) -> Result<&str> {
        self.str_field(TlvType::Username)
    }

    /// Password field.
    pub fn password(&self) -> Result<&str> {
        self.str_field(TlvType::Password)
    }

    /// Account-number field.
    pub fn account_no(&self) -> Result<&str> {
        self.str_field(TlvType::AccountNo)
    }

    /// Destination-account field.
    pub fn to_account_no(&self) -> Result<&str> {
        self.str_field(TlvType::ToAccountNo)
    }

    /// Amount field.
    pub fn amount_cents(&self) -> Result<i64> {
        self.get(TlvType::AmountCents)
            .ok_or(ProtocolError::MissingTlv(TlvType::AmountCents))?
            .as_i64()
    }

    /// Amount field when optional (e.g. OPEN_ACCOUNT initial balance).
    pub fn amount_cents_opt(&self) -> Result<Option<i64>> {
        self.get(TlvType::AmountCents).map(TlvField::as_i64).transpose()
    }

    /// Currency field.
    pub fn currency(&self) -> Result<Currency> {
        self.get(TlvType::Currency)
            .ok_or(ProtocolError::MissingTlv(TlvType::Currency))?
            .as_currency()
    }

    /// Currency field when optional (e.g. DEPOSIT/WITHDRAW validation).
    pub fn currency_opt(&self) -> Result<Option<Currency>> {
        self.get(TlvType::Currency).map(TlvField::as_currency).transpose()
    }

    /// Callback TTL field.
    pub fn ttl_seconds(&self) -> Result<u32> {
        self.get(TlvType::TtlSeconds)
            .ok_or(ProtocolError::MissingTlv(TlvType::TtlSeconds))?
            .as_u32()
    }
}
