//! Readers for encoded records.
//!
//! These invert the encoders closely enough to inspect and test a serialized
//! tree: they recover field values, not the builder-side objects.

use glam::Vec3;

use crate::CACHE_LINE_SIZE;
use crate::bits::LinePacker;
use crate::complet::{
    CHILD_BIT, CHILD_HIGH_BIT, EXPONENTS_BIT, Format, LEAF_POINTER_BIT, LeafKind, MAX_SLOTS,
    MODE_BIT, ORIGIN_BIT, PARENT_BIT, PARENT_HIGH_BIT, PARENT_LEAF_INDEX_BIT, POINTER_BITS,
    POINTER_HIGH_BITS, SHEAR_COEFF0_BIT, SHEAR_COEFF1_BIT, SHEAR_ENABLE_BIT, SHEAR_SELECT_BIT,
    SHEARED_POINTER_BITS, SLOTS_BIT, ShearSelect,
};
use crate::error::{EncodeError, EncodeResult};
use crate::geometry::{BoundingBox, ChildSlot, Triangle, vertex_from_bits};
use crate::half::f16_bits_to_f32;
use crate::micromesh::{
    BASE_ID_BIT as MM_BASE_ID_BIT, BASE_TRIANGLE_BIT, DIRECTIONS_BIT, FLAGS_BIT as MM_FLAGS_BIT,
    PAYLOAD_POINTER_BIT, PAYLOAD_POINTER_SIZE, SCALE_BIT, VISIBILITY_POINTER_BIT,
    VISIBILITY_POINTER_SIZE,
};
use crate::triangles::{
    BASE_ID_BIT, EncodingMode, HEADER_BIT, ID_PREC_BIT, MODE_BIT as LEAF_MODE_BIT, MODE_SIZE,
    NUM_TRIS_BIT, POSITIONS_BIT, PREC_SIZE, RAW_COUNT_SIZE, RAW_HEADER_BIT, RAW_NO_CULL_BIT,
    RAW_TRIANGLE_BITS, SHIFT_BIT, TRIANGLE_FLAG_BITS, TRIANGLES_PER_LINE, TriangleFlags,
    VERTEX_ID_BITS, VM_INFO_BIT, VM_OFFSET_BIT, VM_OFFSET_SIZE, dequantize, quantize,
};

/// Leaf pointer word of a complet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafPointer {
    Absolute(u64),
    /// Byte offset from the record itself.
    Relative(i64),
    Sheared {
        address: u64,
        select: ShearSelect,
        coeff0: u8,
        coeff1: u8,
    },
}

/// Parent or child pointer of a complet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletPointer {
    Absolute(u64),
    Relative(i64),
}

impl CompletPointer {
    /// Resolve against the address of the record holding the pointer.
    #[must_use]
    pub const fn resolve(self, record_address: u64) -> u64 {
        match self {
            Self::Absolute(address) => address,
            Self::Relative(offset) => record_address.wrapping_add_signed(offset),
        }
    }
}

/// Decoded complet record.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletRecord {
    pub leaf_kind: LeafKind,
    pub format: Format,
    pub exponents: [u8; 3],
    /// Stored min floats with the micromesh offset bits cleared.
    pub origin: Vec3,
    /// Shear exponent offset recovered from the origin LSBs (micromesh only).
    pub exponent_offset: u8,
    pub leaf_pointer: LeafPointer,
    pub parent: CompletPointer,
    pub first_child: CompletPointer,
    pub parent_leaf_index: u8,
    pub slots: [ChildSlot; MAX_SLOTS],
}

impl CompletRecord {
    /// Slots that hold a child.
    pub fn valid_slots(&self) -> impl Iterator<Item = &ChildSlot> {
        self.slots.iter().filter(|slot| slot.is_valid())
    }

    /// Dequantized box of slot `index`.
    #[must_use]
    pub fn slot_bounds(&self, index: usize) -> Option<BoundingBox> {
        let slot = self.slots.get(index)?;
        slot.is_valid()
            .then(|| slot.dequantize(self.origin, self.exponents))
    }
}

fn line(bytes: &[u8]) -> EncodeResult<LinePacker> {
    LinePacker::from_le_bytes(bytes)
}

fn enum_field<T>(
    field: &'static str,
    value: u64,
    parse: impl Fn(u8) -> Option<T>,
) -> EncodeResult<T> {
    parse(value as u8).ok_or(EncodeError::EncodingMismatch {
        field,
        expected: 0,
        actual: value,
    })
}

/// Decode a 128-byte complet record.
pub fn decode_complet(bytes: &[u8]) -> EncodeResult<CompletRecord> {
    let packer = line(bytes)?;
    let mode = packer.get_bits(MODE_BIT, 8)?;
    let leaf_kind = enum_field("leaf kind", mode & 0b11, LeafKind::from_code)?;
    let relative_leaf = mode & 0b100 != 0;
    let relative_complet = mode & 0b1000 != 0;
    let format = enum_field("complet format", mode >> 4, Format::from_code)?;

    let mut exponents = [0u8; 3];
    for (axis, exponent) in exponents.iter_mut().enumerate() {
        *exponent = packer.get_bits(EXPONENTS_BIT + axis * 8, 8)? as u8;
    }

    let mut origin_bits = [0u32; 3];
    let mut exponent_offset = 0;
    for (axis, bits) in origin_bits.iter_mut().enumerate() {
        *bits = packer.get_bits(ORIGIN_BIT + axis * 32, 32)? as u32;
        if leaf_kind == LeafKind::Micromesh {
            exponent_offset |= ((*bits & 1) as u8) << axis;
            *bits &= !1;
        }
    }

    let leaf_pointer = if packer.get_bit(SHEAR_ENABLE_BIT)? {
        LeafPointer::Sheared {
            address: packer.get_bits(LEAF_POINTER_BIT, SHEARED_POINTER_BITS)?,
            select: enum_field(
                "shear select",
                packer.get_bits(SHEAR_SELECT_BIT, 2)?,
                ShearSelect::from_code,
            )?,
            coeff0: packer.get_bits(SHEAR_COEFF0_BIT, 4)? as u8,
            coeff1: packer.get_bits(SHEAR_COEFF1_BIT, 4)? as u8,
        }
    } else if relative_leaf {
        LeafPointer::Relative(packer.get_signed(LEAF_POINTER_BIT, 32)?)
    } else {
        LeafPointer::Absolute(packer.get_bits(LEAF_POINTER_BIT, POINTER_BITS)?)
    };

    let complet_pointer = |low: usize, high: usize| -> EncodeResult<CompletPointer> {
        if relative_complet {
            Ok(CompletPointer::Relative(packer.get_signed(low, 32)?))
        } else {
            let high = packer.get_bits(high, POINTER_HIGH_BITS)?;
            Ok(CompletPointer::Absolute(packer.get_bits(low, 32)? | (high << 32)))
        }
    };

    let mut slots = [ChildSlot::INVALID; MAX_SLOTS];
    for (i, slot) in slots.iter_mut().enumerate() {
        *slot = ChildSlot::read(&packer, SLOTS_BIT + i * 64)?;
    }

    Ok(CompletRecord {
        leaf_kind,
        format,
        exponents,
        origin: vertex_from_bits(origin_bits),
        exponent_offset,
        leaf_pointer,
        parent: complet_pointer(PARENT_BIT, PARENT_HIGH_BIT)?,
        first_child: complet_pointer(CHILD_BIT, CHILD_HIGH_BIT)?,
        parent_leaf_index: packer.get_bits(PARENT_LEAF_INDEX_BIT, 4)? as u8,
        slots,
    })
}

/// Encoding mode tag of a leaf line.
pub fn leaf_mode(bytes: &[u8]) -> EncodeResult<EncodingMode> {
    let packer = line(bytes)?;
    enum_field(
        "encoding mode",
        packer.get_bits(LEAF_MODE_BIT, MODE_SIZE)?,
        EncodingMode::from_bits,
    )
}

/// Decode the raw triangles of an uncompressed batch starting at `bytes`.
pub fn decode_uncompressed(bytes: &[u8]) -> EncodeResult<(Vec<Triangle>, TriangleFlags)> {
    let first = line(bytes)?;
    let count = first.get_bits(RAW_HEADER_BIT, RAW_COUNT_SIZE)? as usize + 1;
    let flags = TriangleFlags {
        no_cull: first.get_bit(RAW_NO_CULL_BIT)?,
        opaque: true,
    };

    let lines = count.div_ceil(TRIANGLES_PER_LINE);
    if bytes.len() < lines * CACHE_LINE_SIZE {
        return Err(EncodeError::Truncated {
            needed: lines * CACHE_LINE_SIZE,
            actual: bytes.len(),
        });
    }

    let mut triangles = Vec::with_capacity(count);
    for (index, chunk) in bytes.chunks_exact(CACHE_LINE_SIZE).take(lines).enumerate() {
        let packer = line(chunk)?;
        let in_line = (count - index * TRIANGLES_PER_LINE).min(TRIANGLES_PER_LINE);
        for slot in 0..in_line {
            let base = slot * RAW_TRIANGLE_BITS;
            let id = packer.get_bits(base, 32)? as u32;
            let mut vertices = [Vec3::ZERO; 3];
            for (v, vertex) in vertices.iter_mut().enumerate() {
                let mut bits = [0u32; 3];
                for (axis, b) in bits.iter_mut().enumerate() {
                    *b = packer.get_bits(base + 32 + (v * 3 + axis) * 32, 32)? as u32;
                }
                *vertex = vertex_from_bits(bits);
            }
            triangles.push(Triangle::new(id, vertices[0], vertices[1], vertices[2]));
        }
    }
    Ok((triangles, flags))
}

/// Decoded compressed triangle block.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub mode: EncodingMode,
    pub prec: u8,
    pub id_prec: u8,
    pub shift: u8,
    pub flags: TriangleFlags,
    pub triangles: Vec<Triangle>,
    /// End-of-interval triangles, empty without motion blur.
    pub end_triangles: Vec<Triangle>,
    /// Signed byte offset from this line to its first visibility block.
    pub visibility_offset: Option<i64>,
}

/// Decode one compressed 128-byte block.
pub fn decode_compressed_block(bytes: &[u8]) -> EncodeResult<DecodedBlock> {
    let packer = line(bytes)?;
    let mode = enum_field(
        "encoding mode",
        packer.get_bits(LEAF_MODE_BIT, MODE_SIZE)?,
        EncodingMode::from_bits,
    )?;
    if matches!(mode, EncodingMode::Uncompressed | EncodingMode::Micromesh) {
        return Err(EncodeError::EncodingMismatch {
            field: "compressed block mode",
            expected: EncodingMode::Compressed as u64,
            actual: mode as u64,
        });
    }
    let motion_blur = mode.is_motion_blur();

    let prec = packer.get_bits(HEADER_BIT, PREC_SIZE)? as u8;
    let id_prec = packer.get_bits(ID_PREC_BIT, 5)? as usize + 1;
    let n = packer.get_bits(NUM_TRIS_BIT, 4)? as usize + 1;
    let shift = packer.get_bits(SHIFT_BIT, 5)? as u8;
    let base_id = packer.get_bits(BASE_ID_BIT, 32)? as u32;

    let mut base = [0u32; 3];
    for (axis, bits) in base.iter_mut().enumerate() {
        *bits = packer.get_bits(axis * 32, 32)? as u32;
    }

    let (top, visibility_offset) = if mode.has_visibility() {
        (
            VM_INFO_BIT,
            Some(packer.get_signed(VM_OFFSET_BIT, VM_OFFSET_SIZE)?),
        )
    } else {
        (BASE_ID_BIT, None)
    };
    let flags =
        TriangleFlags::from_bits(packer.get_bits(top - TRIANGLE_FLAG_BITS, TRIANGLE_FLAG_BITS)?);

    let vertices_per_triangle = if motion_blur { 6 } else { 3 };
    let explicit = if motion_blur { n } else { n - 1 };
    let entry = vertices_per_triangle * VERTEX_ID_BITS + TRIANGLE_FLAG_BITS;
    let vertex_id_start = top - TRIANGLE_FLAG_BITS - explicit * entry;
    let triangle_id_start = vertex_id_start - (n - 1) * id_prec;

    let mut vertex_ids: Vec<Vec<usize>> = Vec::with_capacity(n);
    if !motion_blur {
        vertex_ids.push(vec![0, 1, 2]);
    }
    let mut cursor = vertex_id_start;
    for _ in 0..explicit {
        cursor += TRIANGLE_FLAG_BITS;
        let mut ids = Vec::with_capacity(vertices_per_triangle);
        for _ in 0..vertices_per_triangle {
            ids.push(packer.get_bits(cursor, VERTEX_ID_BITS)? as usize);
            cursor += VERTEX_ID_BITS;
        }
        vertex_ids.push(ids);
    }

    let entries = vertex_ids.iter().flatten().copied().max().unwrap_or(0);
    let entry_bits = 3 * usize::from(prec);
    let mut positions = Vec::with_capacity(entries + 1);
    let quantized_base = base.map(|bits| quantize(bits, shift, prec));
    positions.push(dequantize_vertex(base, quantized_base, shift, prec));
    for i in 0..entries {
        let mut q = [0u32; 3];
        for (axis, value) in q.iter_mut().enumerate() {
            let bit = POSITIONS_BIT + i * entry_bits + axis * usize::from(prec);
            *value = packer.get_bits(bit, usize::from(prec))? as u32;
        }
        positions.push(dequantize_vertex(base, q, shift, prec));
    }

    let mut ids = Vec::with_capacity(n);
    ids.push(base_id);
    cursor = triangle_id_start;
    for _ in 1..n {
        ids.push(base_id ^ packer.get_bits(cursor, id_prec)? as u32);
        cursor += id_prec;
    }

    let mut triangles = Vec::with_capacity(n);
    let mut end_triangles = Vec::new();
    for (id, vids) in ids.iter().zip(&vertex_ids) {
        let v = |i: usize| positions[vids[i]];
        triangles.push(Triangle::new(*id, v(0), v(1), v(2)));
        if motion_blur {
            end_triangles.push(Triangle::new(*id, v(3), v(4), v(5)));
        }
    }

    Ok(DecodedBlock {
        mode,
        prec,
        id_prec: id_prec as u8,
        shift,
        flags,
        triangles,
        end_triangles,
        visibility_offset,
    })
}

fn dequantize_vertex(base: [u32; 3], q: [u32; 3], shift: u8, prec: u8) -> Vec3 {
    vertex_from_bits([
        dequantize(base[0], q[0], shift, prec),
        dequantize(base[1], q[1], shift, prec),
        dequantize(base[2], q[2], shift, prec),
    ])
}

/// Decoded micromesh record.
#[derive(Debug, Clone, PartialEq)]
pub struct MicromeshRecord {
    pub base: Triangle,
    pub directions: [Vec3; 3],
    pub scale: f32,
    pub payload_address: u64,
    pub visibility_address: Option<u64>,
    pub flags: TriangleFlags,
}

/// Decode the first line of a micromesh leaf.
pub fn decode_micromesh(bytes: &[u8]) -> EncodeResult<MicromeshRecord> {
    let packer = line(bytes)?;
    let mode = packer.get_bits(LEAF_MODE_BIT, MODE_SIZE)?;
    if mode != EncodingMode::Micromesh as u64 {
        return Err(EncodeError::EncodingMismatch {
            field: "micromesh mode",
            expected: EncodingMode::Micromesh as u64,
            actual: mode,
        });
    }

    let mut vertices = [Vec3::ZERO; 3];
    for (v, vertex) in vertices.iter_mut().enumerate() {
        let mut bits = [0u32; 3];
        for (axis, b) in bits.iter_mut().enumerate() {
            *b = packer.get_bits(BASE_TRIANGLE_BIT + (v * 3 + axis) * 32, 32)? as u32;
        }
        *vertex = vertex_from_bits(bits);
    }

    let mut directions = [Vec3::ZERO; 3];
    for (v, direction) in directions.iter_mut().enumerate() {
        for axis in 0..3 {
            let half = packer.get_bits(DIRECTIONS_BIT + (v * 3 + axis) * 16, 16)? as u16;
            direction[axis] = f16_bits_to_f32(half);
        }
    }

    let has_visibility = packer.get_bit(MM_FLAGS_BIT + 2)?;
    let id = packer.get_bits(MM_BASE_ID_BIT, 32)? as u32;
    Ok(MicromeshRecord {
        base: Triangle::new(id, vertices[0], vertices[1], vertices[2]),
        directions,
        scale: packer.get_f32(SCALE_BIT)?,
        payload_address: packer.get_bits(PAYLOAD_POINTER_BIT, PAYLOAD_POINTER_SIZE)? << 7,
        visibility_address: has_visibility
            .then(|| packer.get_bits(VISIBILITY_POINTER_BIT, VISIBILITY_POINTER_SIZE))
            .transpose()?,
        flags: TriangleFlags::from_bits(packer.get_bits(MM_FLAGS_BIT, 2)?),
    })
}
