//! 63-bit trace identifiers.
//!
//! An identifier is eight random bytes with the top bit cleared, so the value
//! always fits a signed 64-bit integer on the collecting side. Rendering to an
//! arbitrary radix uses long division over two 32-bit words, which keeps every
//! intermediate value inside `u64` arithmetic.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Error types for identifier generation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The OS random source could not be read
    #[error("random source unavailable: {0}")]
    RandomSource(String),
}

/// An immutable 63-bit identifier stored as a big-endian byte buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceIdentifier([u8; 8]);

impl TraceIdentifier {
    /// Draws a fresh identifier from the OS random source.
    pub fn generate() -> Result<Self, IdentifierError> {
        let mut buffer = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut buffer)
            .map_err(|e| IdentifierError::RandomSource(e.to_string()))?;
        Ok(Self::from_bytes(buffer))
    }

    /// Builds an identifier from raw bytes, clearing the most significant bit.
    pub fn from_bytes(mut bytes: [u8; 8]) -> Self {
        bytes[0] &= 0x7f;
        Self(bytes)
    }

    /// Builds an identifier from an integer, masking it to 63 bits.
    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(value.to_be_bytes())
    }

    /// The all-zero identifier, used as the parent of root spans.
    pub const fn zero() -> Self {
        Self([0; 8])
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    /// Renders the identifier in the given radix using lowercase digits.
    ///
    /// # Panics
    ///
    /// Panics if `radix` is outside `2..=36`.
    pub fn to_radix_string(&self, radix: u32) -> String {
        assert!(
            (2..=36).contains(&radix),
            "radix must be in 2..=36, got {}",
            radix
        );
        let radix = u64::from(radix);
        let mut high = u64::from(u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]));
        let mut low = u64::from(u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]));

        let mut digits = Vec::with_capacity(64);
        loop {
            // (high % radix) < 36, so the shifted remainder stays below 2^38.
            let remainder = ((high % radix) << 32) | low;
            high /= radix;
            low = remainder / radix;
            digits.push(DIGITS[(remainder % radix) as usize]);
            if high == 0 && low == 0 {
                break;
            }
        }

        digits.reverse();
        digits.into_iter().map(char::from).collect()
    }
}

impl fmt::Display for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_radix_string(10))
    }
}

impl fmt::LowerHex for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_radix_string(16))
    }
}

impl fmt::Debug for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceIdentifier({:x})", self)
    }
}

impl Serialize for TraceIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_radix_string(16))
    }
}

/// Source of fresh trace identifiers.
pub trait IdentifierGenerator: Send + Sync {
    fn generate(&self) -> Result<TraceIdentifier, IdentifierError>;
}

/// Generator backed by the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandomGenerator;

impl IdentifierGenerator for OsRandomGenerator {
    fn generate(&self) -> Result<TraceIdentifier, IdentifierError> {
        TraceIdentifier::generate()
    }
}

/// Trace, span and parent identifiers attached to one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceIdentifier,
    pub span_id: TraceIdentifier,
    /// Parent span, present when the trace was adopted from an upstream tracer
    pub parent_id: Option<TraceIdentifier>,
}
