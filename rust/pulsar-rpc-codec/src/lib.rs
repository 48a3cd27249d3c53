#![deny(unsafe_code)]

//! Payload codecs.
//!
//! The RPC core never looks inside request or response payloads. Each method
//! descriptor carries a [`Marshaller`] per direction that turns typed values
//! into opaque bytes and back. [`SerdeMarshaller`] adapts any serde type
//! through a [`Codec`] (postcard or JSON); [`RawMarshaller`] passes bytes
//! through untouched.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Which codec produced a payload, for errors and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Compact binary; the default for generated stubs.
    Postcard,
    /// Human-readable, for tooling and interop.
    Json,
    /// Bytes passed through as-is.
    Raw,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Postcard => write!(f, "postcard"),
            Encoding::Json => write!(f, "json"),
            Encoding::Raw => write!(f, "raw"),
        }
    }
}

/// A value could not be turned into payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError {
    pub encoding: Encoding,
    pub message: String,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} encode failed: {}", self.encoding, self.message)
    }
}

impl std::error::Error for EncodeError {}

/// Payload bytes do not match the expected codec or type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub encoding: Encoding,
    pub message: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} decode failed: {}", self.encoding, self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Codec trait for serde-based payload serialization.
pub trait Codec: Send + Sync + 'static {
    /// The encoding type this codec implements.
    const ENCODING: Encoding;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, DecodeError>;
}

/// Postcard codec: compact, deterministic binary encoding.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, EncodeError> {
        ::postcard::to_allocvec(val).map_err(|e| EncodeError {
            encoding: Self::ENCODING,
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, DecodeError> {
        ::postcard::from_bytes(buf).map_err(|e| DecodeError {
            encoding: Self::ENCODING,
            message: e.to_string(),
        })
    }
}

/// JSON codec, for payloads that must stay human-readable on the broker.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(val).map_err(|e| EncodeError {
            encoding: Self::ENCODING,
            message: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(buf).map_err(|e| DecodeError {
            encoding: Self::ENCODING,
            message: e.to_string(),
        })
    }
}

/// Converts one message type to and from payload bytes.
///
/// Object safe so method descriptors can hold `Arc<dyn Marshaller<T>>`.
pub trait Marshaller<T>: Send + Sync + 'static {
    fn encoding(&self) -> Encoding;

    fn encode(&self, value: &T) -> Result<Bytes, EncodeError>;

    fn decode(&self, buf: &[u8]) -> Result<T, DecodeError>;
}

/// [`Marshaller`] for any serde type through codec `C`.
pub struct SerdeMarshaller<C, T> {
    _marker: PhantomData<fn() -> (C, T)>,
}

impl<C, T> SerdeMarshaller<C, T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<C, T> Default for SerdeMarshaller<C, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, T> Marshaller<T> for SerdeMarshaller<C, T>
where
    C: Codec,
    T: Serialize + DeserializeOwned + 'static,
{
    fn encoding(&self) -> Encoding {
        C::ENCODING
    }

    fn encode(&self, value: &T) -> Result<Bytes, EncodeError> {
        C::encode(value).map(Bytes::from)
    }

    fn decode(&self, buf: &[u8]) -> Result<T, DecodeError> {
        C::decode(buf)
    }
}

/// Postcard-backed marshaller, the default for generated descriptors.
pub fn postcard<T>() -> SerdeMarshaller<PostcardCodec, T> {
    SerdeMarshaller::new()
}

/// JSON-backed marshaller.
pub fn json<T>() -> SerdeMarshaller<JsonCodec, T> {
    SerdeMarshaller::new()
}

/// Raw marshaller: the payload is the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMarshaller;

impl Marshaller<Bytes> for RawMarshaller {
    fn encoding(&self) -> Encoding {
        Encoding::Raw
    }

    fn encode(&self, value: &Bytes) -> Result<Bytes, EncodeError> {
        Ok(value.clone())
    }

    fn decode(&self, buf: &[u8]) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(buf))
    }
}
