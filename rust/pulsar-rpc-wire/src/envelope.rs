use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CORRELATION_ID_LEN, Code, CorrelationId, Metadata, Status};

/// First two bytes of every encoded envelope.
pub const ENVELOPE_MAGIC: [u8; 2] = *b"PR";

/// Current envelope layout version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Maximum varint length in bytes.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on metadata entries per envelope.
pub const MAX_METADATA_ENTRIES: usize = 256;

/// Upper bound on a metadata key length.
pub const MAX_METADATA_KEY_LEN: usize = 256;

/// Protocol event carried by an envelope.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Headers = 1,
    Message = 2,
    HalfClose = 3,
    Status = 4,
}

impl Kind {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Kind::Headers),
            2 => Some(Kind::Message),
            3 => Some(Kind::HalfClose),
            4 => Some(Kind::Status),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Headers => "headers",
            Kind::Message => "message",
            Kind::HalfClose => "half-close",
            Kind::Status => "status",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error decoding an envelope from broker bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the envelope was complete.
    Truncated,
    /// Magic bytes did not match.
    BadMagic,
    /// Layout version is not supported.
    UnsupportedVersion(u8),
    /// Kind byte is not a known kind.
    UnknownKind(u8),
    /// Varint did not terminate within 10 bytes.
    VarintTooLong,
    /// Length field does not fit in memory.
    LengthOverflow,
    /// Too many metadata entries.
    TooManyMetadataEntries(u64),
    /// Metadata key too long or not ASCII.
    InvalidMetadataKey,
    /// Status description is not UTF-8.
    InvalidStatusMessage,
    /// Bytes left over after the envelope.
    TrailingBytes(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "envelope truncated"),
            WireError::BadMagic => write!(f, "bad envelope magic"),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported envelope version {}", v),
            WireError::UnknownKind(k) => write!(f, "unknown envelope kind {}", k),
            WireError::VarintTooLong => write!(f, "varint exceeds {} bytes", MAX_VARINT_LEN),
            WireError::LengthOverflow => write!(f, "length field overflows"),
            WireError::TooManyMetadataEntries(n) => {
                write!(
                    f,
                    "{} metadata entries exceeds limit of {}",
                    n, MAX_METADATA_ENTRIES
                )
            }
            WireError::InvalidMetadataKey => write!(f, "invalid metadata key"),
            WireError::InvalidStatusMessage => write!(f, "status message is not valid UTF-8"),
            WireError::TrailingBytes(n) => write!(f, "{} trailing bytes after envelope", n),
        }
    }
}

impl std::error::Error for WireError {}

/// One protocol event of one call, as published to a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    /// Per-call, per-direction sequence number. HEADERS is always 0.
    pub seq: u64,
    pub kind: Kind,
    pub metadata: Metadata,
    pub payload: Option<Bytes>,
    /// Present exactly when `kind` is [`Kind::Status`].
    pub status: Option<Status>,
}

impl Envelope {
    pub fn headers(correlation_id: CorrelationId, seq: u64, metadata: Metadata) -> Self {
        Self {
            correlation_id,
            seq,
            kind: Kind::Headers,
            metadata,
            payload: None,
            status: None,
        }
    }

    pub fn message(correlation_id: CorrelationId, seq: u64, payload: Bytes) -> Self {
        Self {
            correlation_id,
            seq,
            kind: Kind::Message,
            metadata: Metadata::new(),
            payload: Some(payload),
            status: None,
        }
    }

    pub fn half_close(correlation_id: CorrelationId, seq: u64) -> Self {
        Self {
            correlation_id,
            seq,
            kind: Kind::HalfClose,
            metadata: Metadata::new(),
            payload: None,
            status: None,
        }
    }

    pub fn status(
        correlation_id: CorrelationId,
        seq: u64,
        status: Status,
        trailers: Metadata,
    ) -> Self {
        Self {
            correlation_id,
            seq,
            kind: Kind::Status,
            metadata: trailers,
            payload: None,
            status: Some(status),
        }
    }

    /// Serialize into broker payload bytes.
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len());
        let mut buf = BytesMut::with_capacity(32 + payload_len);

        buf.put_slice(&ENVELOPE_MAGIC);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_slice(self.correlation_id.as_bytes());
        put_varint(&mut buf, self.seq);

        put_varint(&mut buf, self.metadata.len() as u64);
        for (key, value) in self.metadata.iter() {
            put_varint(&mut buf, key.len() as u64);
            buf.put_slice(key.as_bytes());
            put_varint(&mut buf, value.len() as u64);
            buf.put_slice(value);
        }

        match &self.payload {
            Some(payload) => {
                buf.put_u8(1);
                put_varint(&mut buf, payload.len() as u64);
                buf.put_slice(payload);
            }
            None => buf.put_u8(0),
        }

        if self.kind == Kind::Status {
            let status = self.status.clone().unwrap_or_else(Status::ok);
            put_varint(&mut buf, status.code().as_u32() as u64);
            put_varint(&mut buf, status.message().len() as u64);
            buf.put_slice(status.message().as_bytes());
        }

        buf.freeze()
    }

    /// Parse broker payload bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.remaining() < ENVELOPE_MAGIC.len() + 2 + CORRELATION_ID_LEN {
            return Err(WireError::Truncated);
        }
        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != ENVELOPE_MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let kind_byte = buf.get_u8();
        let kind = Kind::from_u8(kind_byte).ok_or(WireError::UnknownKind(kind_byte))?;
        let mut id = [0u8; CORRELATION_ID_LEN];
        buf.copy_to_slice(&mut id);
        let seq = get_varint(&mut buf)?;

        let entries = get_varint(&mut buf)?;
        if entries > MAX_METADATA_ENTRIES as u64 {
            return Err(WireError::TooManyMetadataEntries(entries));
        }
        let mut metadata = Metadata::new();
        for _ in 0..entries {
            let key = get_bytes(&mut buf)?;
            if key.len() > MAX_METADATA_KEY_LEN || !key.is_ascii() {
                return Err(WireError::InvalidMetadataKey);
            }
            let key = std::str::from_utf8(key).map_err(|_| WireError::InvalidMetadataKey)?;
            let value = get_bytes(&mut buf)?;
            metadata.insert(key, Bytes::copy_from_slice(value));
        }

        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let payload = match buf.get_u8() {
            0 => None,
            _ => Some(Bytes::copy_from_slice(get_bytes(&mut buf)?)),
        };

        let status = if kind == Kind::Status {
            let code = get_varint(&mut buf)?;
            let code = u32::try_from(code).map_or(Code::Unknown, Code::from_u32);
            let message = get_bytes(&mut buf)?;
            let message =
                std::str::from_utf8(message).map_err(|_| WireError::InvalidStatusMessage)?;
            Some(Status::new(code, message))
        } else {
            None
        };

        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            correlation_id: CorrelationId::from_bytes(id),
            seq,
            kind,
            metadata,
            payload,
            status,
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, WireError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(WireError::VarintTooLong)
}

fn get_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let len = get_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| WireError::LengthOverflow)?;
    if buf.len() < len {
        return Err(WireError::Truncated);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}
