//! Boxes, triangles and child-box quantization.

use glam::Vec3;

use crate::bits::LinePacker;
use crate::error::EncodeResult;

/// Vertex position. Equality is exact per component.
pub type Vertex = Vec3;

/// Raw IEEE-754 bit patterns of a vertex, x first.
#[must_use]
pub fn vertex_bits(vertex: Vertex) -> [u32; 3] {
    [vertex.x.to_bits(), vertex.y.to_bits(), vertex.z.to_bits()]
}

/// Vertex from raw IEEE-754 bit patterns.
#[must_use]
pub fn vertex_from_bits(bits: [u32; 3]) -> Vertex {
    Vec3::new(
        f32::from_bits(bits[0]),
        f32::from_bits(bits[1]),
        f32::from_bits(bits[2]),
    )
}

/// A triangle with its primitive id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub id: u32,
    pub v0: Vertex,
    pub v1: Vertex,
    pub v2: Vertex,
}

impl Triangle {
    #[must_use]
    pub const fn new(id: u32, v0: Vertex, v1: Vertex, v2: Vertex) -> Self {
        Self { id, v0, v1, v2 }
    }

    #[must_use]
    pub const fn vertices(&self) -> [Vertex; 3] {
        [self.v0, self.v1, self.v2]
    }

    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::from_points(&self.vertices())
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    /// A box that contains nothing; `union` with it is the identity.
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };

    #[must_use]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Build from the `[min_x, min_y, min_z, max_x, max_y, max_z]` layout.
    #[must_use]
    pub const fn from_array(values: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(values[0], values[1], values[2]),
            max: Vec3::new(values[3], values[4], values[5]),
        }
    }

    #[must_use]
    pub fn from_points(points: &[Vertex]) -> Self {
        points.iter().fold(Self::EMPTY, |bounds, p| Self {
            min: bounds.min.min(*p),
            max: bounds.max.max(*p),
        })
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[must_use]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// `min <= max` on every axis.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.min.cmple(other.min).all() && other.max.cmple(self.max).all()
    }

    /// Clamp a point into the box.
    #[must_use]
    pub fn clamp(&self, point: Vertex) -> Vertex {
        point.clamp(self.min, self.max)
    }

    /// Index of the longest axis (ties favour the lower index).
    #[must_use]
    pub fn longest_axis(&self) -> usize {
        let extent = self.extent();
        let mut axis = 0;
        if extent.y > extent.x {
            axis = 1;
        }
        if extent.z > extent[axis] {
            axis = 2;
        }
        axis
    }
}

/// Power-of-two ceiling of an edge length, as a biased IEEE-754 exponent.
///
/// The exponent field of `length` is bumped by one whenever any mantissa bit
/// is set, so `2^(e - 127)` is never shorter than the edge.
#[must_use]
pub fn exponent_ceiling(length: f32) -> u8 {
    let bits = length.to_bits();
    let exponent = ((bits >> 23) & 0xFF) as u8;
    if bits & 0x007F_FFFF != 0 {
        exponent.saturating_add(1)
    } else {
        exponent
    }
}

/// Per-axis scale exponents of a box.
#[must_use]
pub fn scale_exponents(bounds: &BoundingBox) -> [u8; 3] {
    let extent = bounds.extent();
    [
        exponent_ceiling(extent.x),
        exponent_ceiling(extent.y),
        exponent_ceiling(extent.z),
    ]
}

/// Axis length described by a biased scale exponent.
#[must_use]
pub fn axis_length(exponent: u8) -> f64 {
    2f64.powi(i32::from(exponent) - 127)
}

/// Quantized child box inside its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    pub lo: [u8; 3],
    pub hi: [u8; 3],
    /// Ray mask byte.
    pub rval: u8,
    /// Leaf-kind dependent payload.
    pub data: u8,
}

impl ChildSlot {
    /// Unused slot. `lo = 255, hi = 0` cannot come out of [`quantize_child`]
    /// because a valid child always has `hi >= lo - 1`.
    pub const INVALID: Self = Self {
        lo: [0xFF; 3],
        hi: [0x00; 3],
        rval: 0,
        data: 0,
    };

    /// Size of an encoded slot in bytes.
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn is_valid(&self) -> bool {
        !(self.lo == Self::INVALID.lo && self.hi == Self::INVALID.hi)
    }

    #[must_use]
    pub const fn with_data(mut self, data: u8) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 8] {
        [
            self.lo[0], self.lo[1], self.lo[2], self.hi[0], self.hi[1], self.hi[2], self.rval,
            self.data,
        ]
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            lo: [bytes[0], bytes[1], bytes[2]],
            hi: [bytes[3], bytes[4], bytes[5]],
            rval: bytes[6],
            data: bytes[7],
        }
    }

    /// Pack the slot at bit offset `start`.
    pub fn write(&self, packer: &mut LinePacker, start: usize) -> EncodeResult<()> {
        for (i, byte) in self.to_bytes().iter().enumerate() {
            packer.set_bits(start + i * 8, 8, u64::from(*byte))?;
        }
        Ok(())
    }

    /// Unpack a slot from bit offset `start`.
    pub fn read(packer: &LinePacker, start: usize) -> EncodeResult<Self> {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = packer.get_bits(start + i * 8, 8)? as u8;
        }
        Ok(Self::from_bytes(bytes))
    }

    /// Dequantize against the parent origin and exponents.
    #[must_use]
    pub fn dequantize(&self, origin: Vec3, exponents: [u8; 3]) -> BoundingBox {
        let mut min = origin;
        let mut max = origin;
        for axis in 0..3 {
            let step = axis_length(exponents[axis]) / 256.0;
            min[axis] = (f64::from(origin[axis]) + f64::from(self.lo[axis]) * step) as f32;
            max[axis] = (f64::from(origin[axis]) + (f64::from(self.hi[axis]) + 1.0) * step) as f32;
        }
        BoundingBox::new(min, max)
    }
}

/// Quantize `child` to 8-bit fixed point inside `parent`.
///
/// `parent.min` is the quantization origin; the grid spans the power-of-two
/// ceiling of each parent edge.
#[must_use]
pub fn quantize_child(parent: &BoundingBox, child: &BoundingBox) -> ChildSlot {
    debug_assert!(
        parent.contains(child),
        "child box {child:?} escapes parent {parent:?}"
    );

    let exponents = scale_exponents(parent);
    let mut slot = ChildSlot {
        lo: [0; 3],
        hi: [0; 3],
        rval: 0xFF,
        data: 0,
    };

    for axis in 0..3 {
        let length = axis_length(exponents[axis]);
        let origin = f64::from(parent.min[axis]);
        let lo = (256.0 * (f64::from(child.min[axis]) - origin) / length).floor();
        let hi = (256.0 * (f64::from(child.max[axis]) - origin) / length - 1.0).ceil();
        slot.lo[axis] = lo.clamp(0.0, 255.0) as u8;
        slot.hi[axis] = hi.clamp(0.0, 255.0) as u8;
    }

    slot
}
