use std::fmt;

/// Width of a correlation id on the wire.
pub const CORRELATION_ID_LEN: usize = 16;

/// Opaque token tagging every envelope of one RPC invocation.
///
/// Generated from 128 random bits, so two calls in flight never share one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId([u8; CORRELATION_ID_LEN]);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub const fn from_bytes(bytes: [u8; CORRELATION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        &self.0
    }

    /// Low 64 bits, used to pick a registry shard.
    pub fn low_bits(&self) -> u64 {
        let mut low = [0u8; 8];
        low.copy_from_slice(&self.0[8..]);
        u64::from_le_bytes(low)
    }

    /// Lowercase hex rendering, used as the broker message key.
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut out = String::with_capacity(CORRELATION_ID_LEN * 2);
        for byte in self.0 {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.to_hex())
    }
}
