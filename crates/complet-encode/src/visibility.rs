//! Per-triangle opacity masks.

use crate::CACHE_LINE_SIZE;
use crate::error::{EncodeError, EncodeResult};

/// Subdivision level of a visibility block: `4^5 = 1024` micro-triangles.
pub const VISIBILITY_LEVEL: u8 = 5;

/// 1024 one-bit opacity flags for one triangle.
#[derive(Clone, PartialEq, Eq)]
pub struct VisibilityBlock {
    bytes: [u8; CACHE_LINE_SIZE],
}

impl std::fmt::Debug for VisibilityBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityBlock")
            .field("opaque", &self.opaque_count())
            .finish()
    }
}

impl Default for VisibilityBlock {
    fn default() -> Self {
        Self::transparent()
    }
}

impl VisibilityBlock {
    /// Number of flags in a block.
    pub const FLAGS: usize = CACHE_LINE_SIZE * 8;

    #[must_use]
    pub const fn transparent() -> Self {
        Self {
            bytes: [0; CACHE_LINE_SIZE],
        }
    }

    #[must_use]
    pub const fn opaque() -> Self {
        Self {
            bytes: [0xFF; CACHE_LINE_SIZE],
        }
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; CACHE_LINE_SIZE]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CACHE_LINE_SIZE] {
        &self.bytes
    }

    pub fn set(&mut self, index: usize, opaque: bool) -> EncodeResult<()> {
        if index >= Self::FLAGS {
            return Err(EncodeError::OutOfRange {
                field: "visibility flag",
                start: index,
                size: 1,
                capacity: Self::FLAGS,
            });
        }
        let mask = 1u8 << (index % 8);
        if opaque {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<bool> {
        (index < Self::FLAGS).then(|| self.bytes[index / 8] & (1 << (index % 8)) != 0)
    }

    #[must_use]
    pub fn opaque_count(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }
}
