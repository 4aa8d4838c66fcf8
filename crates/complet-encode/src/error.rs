//! Error types for complet encoding.

use std::fmt;

/// Errors raised while building or encoding complet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A bit offset/size pair does not fit the container.
    OutOfRange {
        field: &'static str,
        start: usize,
        size: usize,
        capacity: usize,
    },
    /// A complet already holds the maximum number of children.
    TooManyChildren { max: usize, format: &'static str },
    /// A leaf of a different kind than the complet declares was added.
    MixedLeafKinds {
        expected: &'static str,
        actual: &'static str,
    },
    /// A batch would mix compressed and uncompressed triangles.
    MixedCompression,
    /// A batch was fed two different compression precisions.
    PrecisionMismatch { expected: u8, actual: u8 },
    /// Compression precision outside `0..=31`.
    InvalidPrecision(u8),
    /// The batch has no room for another triangle.
    BatchFull { capacity: usize },
    /// The requested feature is not available on the compute target.
    UnsupportedFeatureForTarget {
        feature: &'static str,
        target: &'static str,
    },
    /// The serializer wrote a different number of bytes than predicted.
    SerializationSizeMismatch { expected: u64, actual: u64 },
    /// A record region ended somewhere other than its predicted offset.
    EncodingMismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },
    /// A fixed-capacity arena was asked to grow.
    ArenaExhausted {
        arena: &'static str,
        capacity: usize,
    },
    /// An id does not resolve to an arena entry.
    UnknownEntity { arena: &'static str, index: usize },
    /// Input to the decoder is shorter than the record it describes.
    Truncated { needed: usize, actual: usize },
    /// A batch was encoded while its last compression block is still open.
    UnfinishedBatch,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange {
                field,
                start,
                size,
                capacity,
            } => write!(
                f,
                "{field}: bit range {start}+{size} exceeds capacity of {capacity} bits"
            ),
            Self::TooManyChildren { max, format } => {
                write!(f, "complet ({format}) cannot hold more than {max} children")
            }
            Self::MixedLeafKinds { expected, actual } => {
                write!(f, "complet holds {expected} leaves, cannot add {actual}")
            }
            Self::MixedCompression => {
                write!(f, "triangle batch cannot mix compressed and uncompressed data")
            }
            Self::PrecisionMismatch { expected, actual } => write!(
                f,
                "triangle batch precision is fixed at {expected} bits, got {actual}"
            ),
            Self::InvalidPrecision(precision) => {
                write!(f, "compression precision {precision} is outside 0..=31")
            }
            Self::BatchFull { capacity } => {
                write!(f, "triangle batch is full ({capacity} lines)")
            }
            Self::UnsupportedFeatureForTarget { feature, target } => {
                write!(f, "{feature} is not supported on target {target}")
            }
            Self::SerializationSizeMismatch { expected, actual } => write!(
                f,
                "serialized {actual} bytes but the tree predicts {expected}"
            ),
            Self::EncodingMismatch {
                field,
                expected,
                actual,
            } => write!(f, "{field}: expected {expected}, got {actual}"),
            Self::ArenaExhausted { arena, capacity } => {
                write!(f, "{arena} arena is full ({capacity} entries reserved)")
            }
            Self::UnknownEntity { arena, index } => {
                write!(f, "{arena} arena has no entry {index}")
            }
            Self::Truncated { needed, actual } => {
                write!(f, "need {needed} bytes, got {actual}")
            }
            Self::UnfinishedBatch => {
                write!(f, "triangle batch still has an open compression block")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Result type for encoding operations.
pub type EncodeResult<T> = Result<T, EncodeError>;
