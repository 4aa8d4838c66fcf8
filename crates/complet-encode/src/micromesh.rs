//! Displaced micromesh leaves.
//!
//! # Format
//!
//! A micromesh occupies two cache lines: a 128-byte record followed by one
//! 128-byte displacement sub-block. Record bit layout:
//!
//! - `0..288`: base triangle, 9 × f32 (v0 xyz, v1 xyz, v2 xyz)
//! - `288..432`: displacement directions, 9 × f16
//! - `448..464`: sub-triangle descriptor (level, block format, count - 1)
//! - `464..496`: displacement scale, f32
//! - `512..554`: displacement payload pointer, `address >> 7`
//! - `554..606`: visibility block pointer, absolute bytes (0 when absent)
//! - `960..992`: base triangle id
//! - `992..995`: no-cull, opaque, has-visibility flags
//! - `1021..1024`: encoding mode tag

use crate::bits::LinePacker;
use crate::error::{EncodeError, EncodeResult};
use crate::geometry::{BoundingBox, Triangle, Vertex, vertex_bits};
use crate::half::f32_to_f16_bits;
use crate::triangles::{EncodingMode, MODE_BIT, MODE_SIZE, TriangleFlags};
use crate::visibility::VisibilityBlock;
use crate::CACHE_LINE_SIZE;

pub(crate) const BASE_TRIANGLE_BIT: usize = 0;
pub(crate) const DIRECTIONS_BIT: usize = 288;
pub(crate) const SUBTRIANGLE_BIT: usize = 448;
pub(crate) const SCALE_BIT: usize = 464;
pub(crate) const PAYLOAD_POINTER_BIT: usize = 512;
pub(crate) const PAYLOAD_POINTER_SIZE: usize = 42;
pub(crate) const VISIBILITY_POINTER_BIT: usize = 554;
pub(crate) const VISIBILITY_POINTER_SIZE: usize = 52;
pub(crate) const BASE_ID_BIT: usize = 960;
pub(crate) const FLAGS_BIT: usize = 992;

/// Micro-triangle subdivision level of the single supported sub-triangle.
pub const SUBTRIANGLE_LEVEL: u8 = 3;
/// Block format tag for a 128-byte displacement sub-block.
pub const SUBTRIANGLE_FORMAT: u8 = 1;

/// Fixed encoded size: record plus one displacement sub-block.
pub const MICROMESH_SIZE: usize = 2 * CACHE_LINE_SIZE;

/// Sub-triangle descriptor word.
#[must_use]
pub const fn subtriangle_descriptor() -> u64 {
    (SUBTRIANGLE_LEVEL as u64) | ((SUBTRIANGLE_FORMAT as u64) << 4)
}

/// A base triangle displaced along per-vertex directions.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacedMicromesh {
    pub base: Triangle,
    pub directions: [Vertex; 3],
    pub scale: f32,
    pub displacement: [u8; CACHE_LINE_SIZE],
    pub visibility: Option<VisibilityBlock>,
    pub flags: TriangleFlags,
}

impl DisplacedMicromesh {
    #[must_use]
    pub fn new(base: Triangle, directions: [Vertex; 3], scale: f32) -> Self {
        Self {
            base,
            directions,
            scale,
            displacement: [0; CACHE_LINE_SIZE],
            visibility: None,
            flags: TriangleFlags::default(),
        }
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        MICROMESH_SIZE
    }

    #[must_use]
    pub const fn visibility_size(&self) -> usize {
        if self.visibility.is_some() {
            CACHE_LINE_SIZE
        } else {
            0
        }
    }

    /// Bounds of the base triangle and its fully displaced vertices.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        let base = self.base.vertices();
        let mut points = base.to_vec();
        points.extend(
            base.iter()
                .zip(self.directions)
                .map(|(v, d)| *v + d * self.scale),
        );
        BoundingBox::from_points(&points)
    }

    /// Encode record and payload into `out` (exactly [`MICROMESH_SIZE`] bytes).
    pub fn encode(&self, address: u64, visibility_address: u64, out: &mut [u8]) -> EncodeResult<()> {
        if out.len() != MICROMESH_SIZE {
            return Err(EncodeError::EncodingMismatch {
                field: "micromesh size",
                expected: MICROMESH_SIZE as u64,
                actual: out.len() as u64,
            });
        }

        let payload_address = address + CACHE_LINE_SIZE as u64;
        if payload_address % CACHE_LINE_SIZE as u64 != 0 {
            return Err(EncodeError::EncodingMismatch {
                field: "displacement payload alignment",
                expected: 0,
                actual: payload_address % CACHE_LINE_SIZE as u64,
            });
        }

        let mut packer = LinePacker::new();
        for (v, vertex) in self.base.vertices().iter().enumerate() {
            for (axis, bits) in vertex_bits(*vertex).iter().enumerate() {
                packer.set_bits(BASE_TRIANGLE_BIT + (v * 3 + axis) * 32, 32, u64::from(*bits))?;
            }
        }
        for (v, direction) in self.directions.iter().enumerate() {
            for axis in 0..3 {
                let half = f32_to_f16_bits(direction[axis]);
                packer.set_bits(DIRECTIONS_BIT + (v * 3 + axis) * 16, 16, u64::from(half))?;
            }
        }
        packer.set_bits(SUBTRIANGLE_BIT, 16, subtriangle_descriptor())?;
        packer.set_f32(SCALE_BIT, self.scale)?;

        let payload_pointer = payload_address >> 7;
        check_pointer("displacement pointer", payload_pointer, PAYLOAD_POINTER_SIZE)?;
        packer.set_bits(PAYLOAD_POINTER_BIT, PAYLOAD_POINTER_SIZE, payload_pointer)?;

        if self.visibility.is_some() {
            check_pointer("visibility pointer", visibility_address, VISIBILITY_POINTER_SIZE)?;
            packer.set_bits(
                VISIBILITY_POINTER_BIT,
                VISIBILITY_POINTER_SIZE,
                visibility_address,
            )?;
        }

        packer.set_bits(BASE_ID_BIT, 32, u64::from(self.base.id))?;
        packer.set_bits(FLAGS_BIT, 2, self.flags.bits())?;
        packer.set_bit(FLAGS_BIT + 2, self.visibility.is_some())?;
        packer.set_bits(MODE_BIT, MODE_SIZE, EncodingMode::Micromesh as u64)?;

        let (record, payload) = out.split_at_mut(CACHE_LINE_SIZE);
        packer.write_le_bytes(record)?;
        payload.copy_from_slice(&self.displacement);
        Ok(())
    }

    /// Copy the visibility block, if any, into `out`.
    pub fn write_visibility(&self, out: &mut [u8]) -> EncodeResult<()> {
        if out.len() != self.visibility_size() {
            return Err(EncodeError::EncodingMismatch {
                field: "visibility size",
                expected: self.visibility_size() as u64,
                actual: out.len() as u64,
            });
        }
        if let Some(block) = &self.visibility {
            out.copy_from_slice(block.as_bytes());
        }
        Ok(())
    }
}

fn check_pointer(field: &'static str, value: u64, bits: usize) -> EncodeResult<()> {
    if value >> bits == 0 {
        Ok(())
    } else {
        Err(EncodeError::OutOfRange {
            field,
            start: 0,
            size: crate::bits::bit_width(value) as usize,
            capacity: bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn mesh() -> DisplacedMicromesh {
        let base = Triangle::new(
            42,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        DisplacedMicromesh::new(base, [Vec3::Z, Vec3::Z, Vec3::new(0.0, 0.5, 1.0)], 0.25)
    }

    #[test]
    fn bounds_include_displacement() {
        let bounds = mesh().bounds();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::new(1.0, 1.125, 0.25));
    }

    #[test]
    fn encodes_payload_after_record() {
        let mut m = mesh();
        m.displacement[0] = 0xAA;
        m.displacement[127] = 0x55;
        let mut out = vec![0; MICROMESH_SIZE];
        m.encode(0x1000, 0, &mut out).unwrap();

        assert_eq!(out[128], 0xAA);
        assert_eq!(out[255], 0x55);
        assert_eq!(out[127] >> 5, EncodingMode::Micromesh as u8);
        assert_eq!(&out[120..124], &42u32.to_le_bytes());
        // Payload pointer (0x1080 >> 7) at byte 64.
        assert_eq!(out[64], 0x21);
    }

    #[test]
    fn rejects_misaligned_payload() {
        let mut out = vec![0; MICROMESH_SIZE];
        assert!(matches!(
            mesh().encode(0x1010, 0, &mut out),
            Err(EncodeError::EncodingMismatch { .. })
        ));
    }

    #[test]
    fn visibility_adds_a_line() {
        let mut m = mesh();
        assert_eq!(m.visibility_size(), 0);
        m.visibility = Some(VisibilityBlock::opaque());
        assert_eq!(m.visibility_size(), CACHE_LINE_SIZE);

        let mut vis = vec![0; CACHE_LINE_SIZE];
        m.write_visibility(&mut vis).unwrap();
        assert!(vis.iter().all(|b| *b == 0xFF));
    }
}
