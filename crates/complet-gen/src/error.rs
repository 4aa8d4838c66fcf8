//! Error types for random BVH generation.

use std::fmt;

use complet_encode::EncodeError;

/// Errors raised while generating a random BVH.
#[derive(Debug, Clone, PartialEq)]
pub enum GenError {
    /// Building or encoding an entity failed.
    Encode(EncodeError),
    /// The build parameters are inconsistent.
    InvalidParams(String),
    /// A random stream ended the count and build phases in different states.
    RngDivergence {
        stream: &'static str,
        count_phase: u32,
        build_phase: u32,
    },
    /// The count phase predicted a different number of entities than were built.
    PhaseCountMismatch {
        entity: &'static str,
        counted: usize,
        built: usize,
    },
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "encoding failed: {err}"),
            Self::InvalidParams(msg) => write!(f, "invalid build parameters: {msg}"),
            Self::RngDivergence {
                stream,
                count_phase,
                build_phase,
            } => write!(
                f,
                "{stream} stream diverged: count phase next value {count_phase:#010x}, \
                 build phase {build_phase:#010x}"
            ),
            Self::PhaseCountMismatch {
                entity,
                counted,
                built,
            } => write!(f, "counted {counted} {entity}, built {built}"),
        }
    }
}

impl std::error::Error for GenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<EncodeError> for GenError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}

/// Result type for generation.
pub type GenResult<T> = Result<T, GenError>;
