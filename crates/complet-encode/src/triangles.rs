//! Triangle batch leaves, plain and compressed.
//!
//! A batch occupies up to [`MAX_BATCH_LINES`] cache lines. Uncompressed
//! batches store three raw triangles per line. Compressed batches store one
//! [`CompressionBlock`] per line: a raw base vertex, a deduplicated list of
//! quantized positions growing upward from bit 96, and three regions growing
//! downward from the header (vertex ids, triangle-id deltas, visibility
//! descriptors). Each downward region is written from a precomputed start
//! and must land exactly on its precomputed end.

use tracing::trace;

use crate::bits::{LinePacker, bit_width};
use crate::error::{EncodeError, EncodeResult};
use crate::geometry::{BoundingBox, Triangle, Vertex, vertex_bits};
use crate::visibility::{VISIBILITY_LEVEL, VisibilityBlock};
use crate::{CACHE_LINE_BITS, CACHE_LINE_SIZE};

/// Maximum cache lines (compression blocks) per batch.
pub const MAX_BATCH_LINES: usize = 7;
/// Maximum triangles in one compression block.
pub const MAX_BLOCK_TRIANGLES: usize = 16;
/// Raw triangles per uncompressed line.
pub const TRIANGLES_PER_LINE: usize = 3;
/// Maximum triangles in an uncompressed batch.
pub const MAX_UNCOMPRESSED_TRIANGLES: usize = TRIANGLES_PER_LINE * MAX_BATCH_LINES;
/// Largest supported compression precision.
pub const MAX_PRECISION: u8 = 31;
/// Quantized positions addressable by a 4-bit vertex id (id 0 is the base).
pub const MAX_POSITION_ENTRIES: usize = 15;

// Bit offsets shared by every leaf line.
pub(crate) const MODE_BIT: usize = 1021;
pub(crate) const MODE_SIZE: usize = 3;

// Compressed block layout.
pub(crate) const POSITIONS_BIT: usize = 96;
pub(crate) const HEADER_BIT: usize = 992;
pub(crate) const PREC_SIZE: usize = 5;
pub(crate) const ID_PREC_BIT: usize = HEADER_BIT + 3 * PREC_SIZE;
pub(crate) const NUM_TRIS_BIT: usize = ID_PREC_BIT + 5;
pub(crate) const SHIFT_BIT: usize = NUM_TRIS_BIT + 4;
pub(crate) const BASE_ID_BIT: usize = 960;
pub(crate) const VM_OFFSET_SIZE: usize = 43;
pub(crate) const VM_OFFSET_BIT: usize = BASE_ID_BIT - VM_OFFSET_SIZE;
pub(crate) const VM_INFO_SIZE: usize = 7;
pub(crate) const VM_INFO_BIT: usize = VM_OFFSET_BIT - VM_INFO_SIZE;
pub(crate) const TRIANGLE_FLAG_BITS: usize = 2;
pub(crate) const VERTEX_ID_BITS: usize = 4;
pub(crate) const VM_DESCRIPTOR_BITS: usize = 6;
pub(crate) const VM_OFFSET_ENTRY_BITS: usize = 12;

// Uncompressed line layout.
pub(crate) const RAW_TRIANGLE_BITS: usize = 320;
pub(crate) const RAW_HEADER_BIT: usize = 960;
pub(crate) const RAW_COUNT_SIZE: usize = 5;
pub(crate) const RAW_NO_CULL_BIT: usize = RAW_HEADER_BIT + RAW_COUNT_SIZE;

/// The 3-bit tag at the top of every leaf line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncodingMode {
    Uncompressed = 0,
    Compressed = 1,
    CompressedMotionBlur = 2,
    CompressedVisibility = 3,
    CompressedMotionBlurVisibility = 4,
    Micromesh = 5,
}

impl EncodingMode {
    #[must_use]
    pub const fn compressed(motion_blur: bool, visibility: bool) -> Self {
        match (motion_blur, visibility) {
            (false, false) => Self::Compressed,
            (true, false) => Self::CompressedMotionBlur,
            (false, true) => Self::CompressedVisibility,
            (true, true) => Self::CompressedMotionBlurVisibility,
        }
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Uncompressed,
            1 => Self::Compressed,
            2 => Self::CompressedMotionBlur,
            3 => Self::CompressedVisibility,
            4 => Self::CompressedMotionBlurVisibility,
            5 => Self::Micromesh,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn is_motion_blur(self) -> bool {
        matches!(
            self,
            Self::CompressedMotionBlur | Self::CompressedMotionBlurVisibility
        )
    }

    #[must_use]
    pub const fn has_visibility(self) -> bool {
        matches!(
            self,
            Self::CompressedVisibility | Self::CompressedMotionBlurVisibility
        )
    }
}

/// Cull and alpha bits written for every triangle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleFlags {
    pub no_cull: bool,
    pub opaque: bool,
}

impl Default for TriangleFlags {
    fn default() -> Self {
        Self {
            no_cull: false,
            opaque: true,
        }
    }
}

impl TriangleFlags {
    #[must_use]
    pub const fn bits(self) -> u64 {
        (self.no_cull as u64) | ((self.opaque as u64) << 1)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            no_cull: bits & 1 != 0,
            opaque: bits & 2 != 0,
        }
    }
}

/// Construction options for a [`TriangleBatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub motion_blur: bool,
    pub visibility_masks: bool,
    pub flags: TriangleFlags,
}

/// One compressed cache line worth of triangles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionBlock {
    /// Triangles in this block.
    pub num_tris: usize,
    /// Index of the block's first triangle within the batch.
    pub first_triangle: usize,
    /// Id of the base (first) triangle.
    pub base_id: u32,
    /// Raw bits of the base vertex.
    pub base_vertex: [u32; 3],
    /// Bits per triangle-id delta.
    pub id_prec: u8,
    /// Bits kept per quantized coordinate.
    pub prec: u8,
    /// Low bits dropped by the quantizer.
    pub shift: u8,
    diff_bits: [u32; 3],
    id_diff_bits: u32,
    positions: Vec<[u32; 3]>,
    closed: bool,
}

impl CompressionBlock {
    fn open(first_triangle: usize, base: &Triangle, prec: u8) -> Self {
        Self {
            num_tris: 0,
            first_triangle,
            base_id: base.id,
            base_vertex: vertex_bits(base.v0),
            id_prec: 1,
            prec,
            shift: 0,
            diff_bits: [0; 3],
            id_diff_bits: 0,
            positions: Vec::new(),
            closed: false,
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Union of the per-axis differing-bit masks.
    #[must_use]
    pub fn diff_bits(&self) -> u32 {
        self.diff_bits[0] | self.diff_bits[1] | self.diff_bits[2]
    }

    /// Raw positions that would need a list entry, given `vertices`.
    fn new_positions(&self, vertices: &[Vertex], forced: usize) -> Vec<[u32; 3]> {
        let mut fresh: Vec<[u32; 3]> = Vec::new();
        for (i, vertex) in vertices.iter().enumerate() {
            let bits = vertex_bits(*vertex);
            let known = bits == self.base_vertex
                || self.positions.contains(&bits)
                || fresh.contains(&bits);
            if i < forced || !known {
                fresh.push(bits);
            }
        }
        fresh
    }

    /// Quantize one raw coordinate with this block's shift and precision.
    #[must_use]
    pub fn quantize(&self, bits: u32) -> u32 {
        quantize(bits, self.shift, self.prec)
    }
}

/// Keep `prec` bits of `bits` starting at `shift`.
#[must_use]
pub fn quantize(bits: u32, shift: u8, prec: u8) -> u32 {
    ((u64::from(bits) >> shift) & ((1u64 << prec) - 1)) as u32
}

/// Rebuild raw bits from a quantized value and the block base.
#[must_use]
pub fn dequantize(base: u32, quantized: u32, shift: u8, prec: u8) -> u32 {
    let kept = u32::from(shift) + u32::from(prec);
    let high = if kept >= 32 {
        0
    } else {
        (base >> kept) << kept
    };
    high | (quantized << shift)
}

/// Bits used by the per-triangle visibility descriptors of a block.
#[must_use]
pub const fn visibility_descriptor_bits(num_tris: usize) -> usize {
    if num_tris == 0 {
        return 0;
    }
    num_tris * VM_DESCRIPTOR_BITS + (num_tris - 1) * VM_OFFSET_ENTRY_BITS
}

/// A leaf holding triangles.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleBatch {
    triangles: Vec<Triangle>,
    end_triangles: Vec<Triangle>,
    visibility: Vec<VisibilityBlock>,
    blocks: Vec<CompressionBlock>,
    precision: Option<u8>,
    options: BatchOptions,
}

impl TriangleBatch {
    #[must_use]
    pub fn new(options: BatchOptions) -> Self {
        Self {
            triangles: Vec::new(),
            end_triangles: Vec::new(),
            visibility: Vec::new(),
            blocks: Vec::new(),
            precision: None,
            options,
        }
    }

    #[must_use]
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    #[must_use]
    pub fn end_triangles(&self) -> &[Triangle] {
        &self.end_triangles
    }

    #[must_use]
    pub fn visibility_blocks(&self) -> &[VisibilityBlock] {
        &self.visibility
    }

    #[must_use]
    pub fn blocks(&self) -> &[CompressionBlock] {
        &self.blocks
    }

    #[must_use]
    pub const fn options(&self) -> BatchOptions {
        self.options
    }

    /// Precision fixed by the first insertion, if any.
    #[must_use]
    pub const fn precision(&self) -> Option<u8> {
        self.precision
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.precision.is_some_and(|p| p > 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Triangles a batch with `options` always holds at `precision`, for any
    /// vertex positions and triangle ids.
    ///
    /// Assumes no vertex is shared and every id delta needs 32 bits. A block
    /// only closes when the next triangle does not fit, so every full block
    /// holds at least this many triangles.
    #[must_use]
    pub fn guaranteed_capacity(options: BatchOptions, precision: u8) -> usize {
        if precision == 0 {
            return MAX_UNCOMPRESSED_TRIANGLES;
        }
        let batch = Self::new(options);
        let vertices = batch.vertices_per_triangle();
        // Triangle 0 shares the base vertex.
        let first = vertices - 1;
        let per_block = (1..=MAX_BLOCK_TRIANGLES)
            .take_while(|&num_tris| {
                first + (num_tris - 1) * vertices <= MAX_POSITION_ENTRIES
                    && batch.block_cost(num_tris, 32, usize::from(precision)) <= CACHE_LINE_BITS
            })
            .last()
            .unwrap_or(0);
        per_block * MAX_BATCH_LINES
    }

    const fn vertices_per_triangle(&self) -> usize {
        if self.options.motion_blur { 6 } else { 3 }
    }

    /// Add a triangle, opening and closing compression blocks as needed.
    ///
    /// `precision == 0` stores the triangle uncompressed. `end` carries the
    /// end-of-interval positions and is required exactly when the batch is
    /// motion blurred.
    pub fn add_triangle(
        &mut self,
        triangle: Triangle,
        end: Option<Triangle>,
        precision: u8,
    ) -> EncodeResult<()> {
        if precision > MAX_PRECISION {
            return Err(EncodeError::InvalidPrecision(precision));
        }
        if let Some(fixed) = self.precision {
            if (fixed == 0) != (precision == 0) {
                return Err(EncodeError::MixedCompression);
            }
            if fixed != precision {
                return Err(EncodeError::PrecisionMismatch {
                    expected: fixed,
                    actual: precision,
                });
            }
        }
        if end.is_some() != self.options.motion_blur {
            return Err(EncodeError::EncodingMismatch {
                field: "end triangle",
                expected: u64::from(self.options.motion_blur),
                actual: u64::from(end.is_some()),
            });
        }

        if precision == 0 {
            self.add_uncompressed(triangle)?;
        } else {
            self.add_compressed(triangle, end, precision)?;
        }

        self.precision = Some(precision);
        Ok(())
    }

    fn add_uncompressed(&mut self, triangle: Triangle) -> EncodeResult<()> {
        if self.options.motion_blur {
            return Err(EncodeError::UnsupportedFeatureForTarget {
                feature: "motion blur without compression",
                target: "any",
            });
        }
        if self.options.visibility_masks {
            return Err(EncodeError::UnsupportedFeatureForTarget {
                feature: "visibility masks without compression",
                target: "any",
            });
        }
        if self.triangles.len() >= MAX_UNCOMPRESSED_TRIANGLES {
            return Err(EncodeError::BatchFull {
                capacity: MAX_BATCH_LINES,
            });
        }
        self.triangles.push(triangle);
        Ok(())
    }

    fn add_compressed(
        &mut self,
        triangle: Triangle,
        end: Option<Triangle>,
        precision: u8,
    ) -> EncodeResult<()> {
        let index = self.triangles.len();

        if self.blocks.last().is_some_and(|b| !b.closed) {
            if self.try_commit(&triangle, end.as_ref()) {
                self.push_triangle(triangle, end);
                return Ok(());
            }
            self.finalize_block();
        }

        if self.blocks.len() >= MAX_BATCH_LINES {
            return Err(EncodeError::BatchFull {
                capacity: MAX_BATCH_LINES,
            });
        }

        self.blocks
            .push(CompressionBlock::open(index, &triangle, precision));
        if !self.try_commit(&triangle, end.as_ref()) {
            self.blocks.pop();
            return Err(EncodeError::BatchFull {
                capacity: MAX_BATCH_LINES,
            });
        }
        self.push_triangle(triangle, end);
        Ok(())
    }

    fn push_triangle(&mut self, triangle: Triangle, end: Option<Triangle>) {
        self.triangles.push(triangle);
        if let Some(end) = end {
            self.end_triangles.push(end);
        }
    }

    /// Predicted packed size of the open block holding `num_tris` triangles.
    fn block_cost(&self, num_tris: usize, id_prec: usize, prec: usize) -> usize {
        let vertices = self.vertices_per_triangle();
        let explicit = if self.options.motion_blur {
            num_tris
        } else {
            num_tris - 1
        };
        let visibility = self.options.visibility_masks;

        96 + TRIANGLE_FLAG_BITS
            + if visibility {
                VM_INFO_SIZE + VM_OFFSET_SIZE
            } else {
                0
            }
            + 32
            + 32
            + (num_tris * vertices - 1) * 3 * prec
            + (num_tris - 1) * id_prec
            + explicit * (vertices * VERTEX_ID_BITS + TRIANGLE_FLAG_BITS)
            + if visibility {
                visibility_descriptor_bits(num_tris)
            } else {
                0
            }
    }

    /// Add the triangle to the open block if it fits the block's budget.
    fn try_commit(&mut self, triangle: &Triangle, end: Option<&Triangle>) -> bool {
        let Some(block) = self.blocks.last() else {
            return false;
        };

        let num_tris = block.num_tris + 1;
        let id_bits = block.id_diff_bits | (block.base_id ^ triangle.id);
        let id_prec = bit_width(u64::from(id_bits)).max(1) as usize;

        let mut vertices: Vec<Vertex> = triangle.vertices().to_vec();
        if let Some(end) = end {
            vertices.extend(end.vertices());
        }
        // Triangle 0 without motion blur keeps v1 and v2 as entries 1 and 2.
        let fresh = if block.num_tris == 0 && !self.options.motion_blur {
            block.new_positions(&vertices[1..], 2)
        } else {
            block.new_positions(&vertices, 0)
        };

        let cost = self.block_cost(num_tris, id_prec, usize::from(block.prec));
        if num_tris > MAX_BLOCK_TRIANGLES
            || cost > CACHE_LINE_BITS
            || block.positions.len() + fresh.len() > MAX_POSITION_ENTRIES
        {
            return false;
        }

        let Some(block) = self.blocks.last_mut() else {
            return false;
        };
        for vertex in &vertices {
            let bits = vertex_bits(*vertex);
            for axis in 0..3 {
                block.diff_bits[axis] |= block.base_vertex[axis] ^ bits[axis];
            }
        }
        block.id_diff_bits = id_bits;
        block.id_prec = id_prec as u8;
        block.num_tris = num_tris;
        block.positions.extend(fresh);
        true
    }

    /// Close the open compression block, fixing its shift.
    ///
    /// The shift drops every low bit below the highest differing bit that
    /// the precision cannot keep; `prec` itself never changes.
    pub fn finalize_block(&mut self) {
        if let Some(block) = self.blocks.last_mut().filter(|b| !b.closed) {
            let width = bit_width(u64::from(block.diff_bits()));
            block.shift = width.saturating_sub(u32::from(block.prec)) as u8;
            block.closed = true;
            trace!(
                num_tris = block.num_tris,
                positions = block.positions.len(),
                shift = block.shift,
                "closed compression block"
            );
        }
    }

    /// Attach the visibility block of the next triangle.
    pub fn push_visibility_block(&mut self, block: VisibilityBlock) -> EncodeResult<()> {
        if !self.options.visibility_masks {
            return Err(EncodeError::UnsupportedFeatureForTarget {
                feature: "visibility block on a batch without visibility masks",
                target: "any",
            });
        }
        if self.visibility.len() >= self.triangles.len() {
            return Err(EncodeError::EncodingMismatch {
                field: "visibility blocks",
                expected: self.triangles.len() as u64,
                actual: self.visibility.len() as u64 + 1,
            });
        }
        self.visibility.push(block);
        Ok(())
    }

    /// Cache lines occupied by the batch.
    #[must_use]
    pub fn num_lines(&self) -> usize {
        if self.is_compressed() {
            self.blocks.len()
        } else {
            self.triangles.len().div_ceil(TRIANGLES_PER_LINE)
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.num_lines() * CACHE_LINE_SIZE
    }

    /// Bytes of visibility blocks stored ahead of the batch.
    #[must_use]
    pub fn visibility_size(&self) -> usize {
        self.visibility.len() * CACHE_LINE_SIZE
    }

    /// Bounds of the start-of-interval triangles.
    #[must_use]
    pub fn bounds(&self) -> BoundingBox {
        self.triangles
            .iter()
            .fold(BoundingBox::EMPTY, |b, t| b.union(&t.bounds()))
    }

    /// Bounds of the end-of-interval triangles (start bounds without blur).
    #[must_use]
    pub fn end_bounds(&self) -> BoundingBox {
        if !self.options.motion_blur {
            return self.bounds();
        }
        self.end_triangles
            .iter()
            .fold(BoundingBox::EMPTY, |b, t| b.union(&t.bounds()))
    }

    /// Encode every line of the batch into `out`.
    ///
    /// `address` is where the first line lands, `visibility_address` where
    /// the batch's first visibility block lands.
    pub fn encode(&self, address: u64, visibility_address: u64, out: &mut [u8]) -> EncodeResult<()> {
        if out.len() != self.size_bytes() {
            return Err(EncodeError::EncodingMismatch {
                field: "triangle batch size",
                expected: self.size_bytes() as u64,
                actual: out.len() as u64,
            });
        }
        if self.options.visibility_masks && self.visibility.len() != self.triangles.len() {
            return Err(EncodeError::EncodingMismatch {
                field: "visibility blocks",
                expected: self.triangles.len() as u64,
                actual: self.visibility.len() as u64,
            });
        }

        for (line, chunk) in out.chunks_exact_mut(CACHE_LINE_SIZE).enumerate() {
            let packer = if self.is_compressed() {
                let block = &self.blocks[line];
                if !block.closed {
                    return Err(EncodeError::UnfinishedBatch);
                }
                let record = address + (line * CACHE_LINE_SIZE) as u64;
                self.encode_block(block, record, visibility_address)?
            } else {
                self.encode_raw_line(line)?
            };
            packer.write_le_bytes(chunk)?;
        }
        Ok(())
    }

    /// Copy the visibility blocks into `out`.
    pub fn write_visibility(&self, out: &mut [u8]) -> EncodeResult<()> {
        if out.len() != self.visibility_size() {
            return Err(EncodeError::EncodingMismatch {
                field: "visibility size",
                expected: self.visibility_size() as u64,
                actual: out.len() as u64,
            });
        }
        for (block, chunk) in self.visibility.iter().zip(out.chunks_exact_mut(CACHE_LINE_SIZE)) {
            chunk.copy_from_slice(block.as_bytes());
        }
        Ok(())
    }

    fn encode_raw_line(&self, line: usize) -> EncodeResult<LinePacker> {
        let mut packer = LinePacker::new();
        let first = line * TRIANGLES_PER_LINE;
        let last = (first + TRIANGLES_PER_LINE).min(self.triangles.len());

        for (slot, triangle) in self.triangles[first..last].iter().enumerate() {
            let base = slot * RAW_TRIANGLE_BITS;
            packer.set_bits(base, 32, u64::from(triangle.id))?;
            for (v, vertex) in triangle.vertices().iter().enumerate() {
                for (axis, bits) in vertex_bits(*vertex).iter().enumerate() {
                    packer.set_bits(base + 32 + (v * 3 + axis) * 32, 32, u64::from(*bits))?;
                }
            }
        }

        if line == 0 {
            packer.set_bits(
                RAW_HEADER_BIT,
                RAW_COUNT_SIZE,
                (self.triangles.len() - 1) as u64,
            )?;
            for i in 0..self.triangles.len() {
                packer.set_bit(RAW_NO_CULL_BIT + i, self.options.flags.no_cull)?;
            }
        }
        packer.set_bits(MODE_BIT, MODE_SIZE, EncodingMode::Uncompressed as u64)?;
        Ok(packer)
    }

    fn encode_block(
        &self,
        block: &CompressionBlock,
        record_address: u64,
        visibility_address: u64,
    ) -> EncodeResult<LinePacker> {
        let mut packer = LinePacker::new();
        let motion_blur = self.options.motion_blur;
        let visibility = self.options.visibility_masks;
        let prec = usize::from(block.prec);
        let id_prec = usize::from(block.id_prec);
        let n = block.num_tris;
        let triangles = &self.triangles[block.first_triangle..block.first_triangle + n];

        for (axis, bits) in block.base_vertex.iter().enumerate() {
            packer.set_bits(axis * 32, 32, u64::from(*bits))?;
        }

        // Deduplicate quantized positions and assign vertex ids.
        let quantize_vertex = |v: Vertex| vertex_bits(v).map(|bits| block.quantize(bits));
        let base = block.base_vertex.map(|bits| block.quantize(bits));
        let mut entries: Vec<[u32; 3]> = Vec::new();
        let lookup = |q: [u32; 3], entries: &mut Vec<[u32; 3]>| -> u64 {
            if q == base {
                return 0;
            }
            if let Some(i) = entries.iter().position(|e| *e == q) {
                return i as u64 + 1;
            }
            entries.push(q);
            entries.len() as u64
        };

        let explicit = if motion_blur { 0..n } else { 1..n };
        if !motion_blur {
            entries.push(quantize_vertex(triangles[0].v1));
            entries.push(quantize_vertex(triangles[0].v2));
        }
        let mut vertex_ids: Vec<Vec<u64>> = Vec::with_capacity(explicit.len());
        for i in explicit.clone() {
            let mut vertices = triangles[i].vertices().to_vec();
            if motion_blur {
                vertices.extend(self.end_triangles[block.first_triangle + i].vertices());
            }
            vertex_ids.push(
                vertices
                    .into_iter()
                    .map(|v| lookup(quantize_vertex(v), &mut entries))
                    .collect(),
            );
        }
        if entries.len() > MAX_POSITION_ENTRIES {
            return Err(EncodeError::EncodingMismatch {
                field: "position entries",
                expected: MAX_POSITION_ENTRIES as u64,
                actual: entries.len() as u64,
            });
        }

        let entry_bits = 3 * prec;
        for (i, entry) in entries.iter().enumerate() {
            for (axis, q) in entry.iter().enumerate() {
                packer.set_bits(POSITIONS_BIT + i * entry_bits + axis * prec, prec, u64::from(*q))?;
            }
        }
        let positions_end = POSITIONS_BIT + entries.len() * entry_bits;

        // Header and base id.
        for axis in 0..3 {
            packer.set_bits(HEADER_BIT + axis * PREC_SIZE, PREC_SIZE, prec as u64)?;
        }
        packer.set_bits(ID_PREC_BIT, 5, (id_prec - 1) as u64)?;
        packer.set_bits(NUM_TRIS_BIT, 4, (n - 1) as u64)?;
        packer.set_bits(SHIFT_BIT, 5, u64::from(block.shift))?;
        packer.set_bits(
            MODE_BIT,
            MODE_SIZE,
            EncodingMode::compressed(motion_blur, visibility) as u64,
        )?;
        packer.set_bits(BASE_ID_BIT, 32, u64::from(block.base_id))?;

        let mut top = BASE_ID_BIT;
        if visibility {
            let first_block = visibility_address + (block.first_triangle * CACHE_LINE_SIZE) as u64;
            let offset = first_block as i64 - record_address as i64;
            packer.set_signed(VM_OFFSET_BIT, VM_OFFSET_SIZE, offset)?;
            packer.set_bits(VM_INFO_BIT, VM_INFO_SIZE, u64::from(VISIBILITY_LEVEL))?;
            top = VM_INFO_BIT;
        }
        packer.set_bits(top - TRIANGLE_FLAG_BITS, TRIANGLE_FLAG_BITS, self.options.flags.bits())?;

        // Downward regions, each with a precomputed start and end.
        let vertex_id_end = top - TRIANGLE_FLAG_BITS;
        let vertex_entry = self.vertices_per_triangle() * VERTEX_ID_BITS + TRIANGLE_FLAG_BITS;
        let vertex_id_start = vertex_id_end - explicit.len() * vertex_entry;
        let triangle_id_end = vertex_id_start;
        let triangle_id_start = triangle_id_end - (n - 1) * id_prec;
        let descriptor_end = triangle_id_start;
        let descriptor_start = if visibility {
            descriptor_end - visibility_descriptor_bits(n)
        } else {
            descriptor_end
        };
        if positions_end > descriptor_start {
            return Err(EncodeError::EncodingMismatch {
                field: "compressed block budget",
                expected: descriptor_start as u64,
                actual: positions_end as u64,
            });
        }

        let mut cursor = vertex_id_start;
        for ids in &vertex_ids {
            packer.set_bits(cursor, TRIANGLE_FLAG_BITS, self.options.flags.bits())?;
            cursor += TRIANGLE_FLAG_BITS;
            for id in ids {
                packer.set_bits(cursor, VERTEX_ID_BITS, *id)?;
                cursor += VERTEX_ID_BITS;
            }
        }
        check_region_end("vertex id array", cursor, vertex_id_end)?;

        cursor = triangle_id_start;
        for triangle in &triangles[1..] {
            packer.set_bits(cursor, id_prec, u64::from(triangle.id ^ block.base_id))?;
            cursor += id_prec;
        }
        check_region_end("triangle id array", cursor, triangle_id_end)?;

        if visibility {
            cursor = descriptor_start;
            for i in 0..n {
                // Level, 2-state type (0), pointer relative to the VM base (0).
                packer.set_bits(cursor, 4, u64::from(VISIBILITY_LEVEL))?;
                packer.set_bits(cursor + 4, 2, 0)?;
                cursor += VM_DESCRIPTOR_BITS;
                if i > 0 {
                    packer.set_bits(cursor, VM_OFFSET_ENTRY_BITS, i as u64)?;
                    cursor += VM_OFFSET_ENTRY_BITS;
                }
            }
            check_region_end("visibility descriptors", cursor, descriptor_end)?;
        }

        Ok(packer)
    }
}

fn check_region_end(field: &'static str, actual: usize, expected: usize) -> EncodeResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(EncodeError::EncodingMismatch {
            field,
            expected: expected as u64,
            actual: actual as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn tri(id: u32, offset: f32) -> Triangle {
        Triangle::new(
            id,
            Vec3::new(offset, 0.0, 0.0),
            Vec3::new(offset + 0.5, 0.25, 0.0),
            Vec3::new(offset, 0.5, 0.125),
        )
    }

    #[test]
    fn uncompressed_batch_limits() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        for i in 0..MAX_UNCOMPRESSED_TRIANGLES {
            batch.add_triangle(tri(i as u32, i as f32), None, 0).unwrap();
        }
        assert_eq!(batch.num_lines(), 7);
        assert_eq!(
            batch.add_triangle(tri(99, 0.0), None, 0),
            Err(EncodeError::BatchFull { capacity: 7 })
        );
        assert_eq!(batch.len(), MAX_UNCOMPRESSED_TRIANGLES);
    }

    #[test]
    fn rejects_mixed_compression() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        batch.add_triangle(tri(0, 0.0), None, 0).unwrap();
        assert_eq!(
            batch.add_triangle(tri(1, 1.0), None, 12),
            Err(EncodeError::MixedCompression)
        );

        let mut batch = TriangleBatch::new(BatchOptions::default());
        batch.add_triangle(tri(0, 0.0), None, 12).unwrap();
        assert_eq!(
            batch.add_triangle(tri(1, 1.0), None, 0),
            Err(EncodeError::MixedCompression)
        );
        assert_eq!(
            batch.add_triangle(tri(1, 1.0), None, 13),
            Err(EncodeError::PrecisionMismatch {
                expected: 12,
                actual: 13
            })
        );
    }

    #[test]
    fn motion_blur_needs_compression() {
        let options = BatchOptions {
            motion_blur: true,
            ..BatchOptions::default()
        };
        let mut batch = TriangleBatch::new(options);
        assert!(matches!(
            batch.add_triangle(tri(0, 0.0), Some(tri(0, 0.1)), 0),
            Err(EncodeError::UnsupportedFeatureForTarget { .. })
        ));
        assert!(matches!(
            batch.add_triangle(tri(0, 0.0), None, 8),
            Err(EncodeError::EncodingMismatch { .. })
        ));
        batch.add_triangle(tri(0, 0.0), Some(tri(0, 0.1)), 8).unwrap();
    }

    #[test]
    fn visibility_needs_compression() {
        let options = BatchOptions {
            visibility_masks: true,
            ..BatchOptions::default()
        };
        let mut batch = TriangleBatch::new(options);
        assert!(matches!(
            batch.add_triangle(tri(0, 0.0), None, 0),
            Err(EncodeError::UnsupportedFeatureForTarget { .. })
        ));
    }

    #[test]
    fn shared_vertices_fill_one_block() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        // A strip: every triangle adds one new vertex.
        let points: Vec<Vec3> = (0..8)
            .map(|i| Vec3::new(i as f32 * 0.125, (i % 2) as f32 * 0.25, 0.5))
            .collect();
        for i in 0..6 {
            let t = Triangle::new(100 + i as u32, points[i], points[i + 1], points[i + 2]);
            batch.add_triangle(t, None, 8).unwrap();
        }
        batch.finalize_block();

        assert_eq!(batch.blocks().len(), 1);
        let block = &batch.blocks()[0];
        assert_eq!(block.num_tris, 6);
        assert_eq!(block.base_id, 100);
        // 100 ^ 105 = 0b1101
        assert_eq!(block.id_prec, 4);
        assert!(block.is_closed());
    }

    #[test]
    fn block_closes_at_sixteen_triangles() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 0.0);
        for i in 0..20 {
            batch.add_triangle(Triangle::new(i, a, b, c), None, 4).unwrap();
        }
        batch.finalize_block();
        assert_eq!(batch.blocks().len(), 2);
        assert_eq!(batch.blocks()[0].num_tris, MAX_BLOCK_TRIANGLES);
        assert_eq!(batch.blocks()[1].num_tris, 4);
        assert_eq!(batch.blocks()[1].first_triangle, 16);
    }

    #[test]
    fn unique_positions_bound_blocks() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        // Independent triangles: 2 entries for the first, 3 for each next.
        for i in 0..10 {
            batch.add_triangle(tri(i, i as f32 * 2.0), None, 8).unwrap();
        }
        batch.finalize_block();
        for block in batch.blocks() {
            assert!(block.positions.len() <= MAX_POSITION_ENTRIES);
        }
        assert_eq!(batch.blocks()[0].num_tris, 5);
    }

    #[test]
    fn shift_drops_unused_low_bits() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        batch.add_triangle(tri(0, 0.5), None, 8).unwrap();
        batch.finalize_block();
        let block = &batch.blocks()[0];
        let width = bit_width(u64::from(block.diff_bits()));
        assert_eq!(u32::from(block.shift), width.saturating_sub(8));
        assert_eq!(block.prec, 8);
    }

    #[test]
    fn quantize_round_trip_keeps_high_bits() {
        let base = 1.0f32.to_bits();
        let value = 1.5f32.to_bits();
        let shift = 14;
        let q = quantize(value, shift, 10);
        assert_eq!(f32::from_bits(dequantize(base, q, shift, 10)), 1.5);
    }

    #[test]
    fn encode_requires_finalized_blocks() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        batch.add_triangle(tri(0, 0.0), None, 8).unwrap();
        let mut out = vec![0; batch.size_bytes()];
        assert_eq!(batch.encode(0, 0, &mut out), Err(EncodeError::UnfinishedBatch));
        batch.finalize_block();
        batch.encode(0, 0, &mut out).unwrap();
        assert_eq!(out[127] >> 5, EncodingMode::Compressed as u8);
    }

    #[test]
    fn raw_line_layout() {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        for i in 0..4 {
            batch.add_triangle(tri(7 + i, i as f32), None, 0).unwrap();
        }
        let mut out = vec![0; batch.size_bytes()];
        batch.encode(0, 0, &mut out).unwrap();
        assert_eq!(out.len(), 256);
        assert_eq!(&out[..4], &7u32.to_le_bytes());
        assert_eq!(&out[40..44], &8u32.to_le_bytes());
        assert_eq!(&out[128..132], &10u32.to_le_bytes());
        // Triangle count minus one in line 0's header.
        assert_eq!(out[120] & 0x1F, 3);
    }

    #[test]
    fn compressed_blocks_respect_budget_with_everything_on() {
        let options = BatchOptions {
            motion_blur: true,
            visibility_masks: true,
            flags: TriangleFlags::default(),
        };
        let mut batch = TriangleBatch::new(options);
        for i in 0..12u32 {
            let t = tri(i * 37, i as f32 * 0.75);
            let mut end = t;
            end.v0.x += 0.01;
            batch.add_triangle(t, Some(end), 20).unwrap();
            batch
                .push_visibility_block(VisibilityBlock::opaque())
                .unwrap();
        }
        batch.finalize_block();

        for block in batch.blocks() {
            assert!(block.num_tris <= MAX_BLOCK_TRIANGLES);
            let cost = batch.block_cost(block.num_tris, usize::from(block.id_prec), 20);
            assert!(cost <= CACHE_LINE_BITS);
        }
        let mut out = vec![0; batch.size_bytes()];
        batch.encode(4096, 0, &mut out).unwrap();
    }

    #[test]
    fn guaranteed_capacity_follows_options() {
        let plain = BatchOptions::default();
        let blurred = BatchOptions {
            motion_blur: true,
            ..BatchOptions::default()
        };
        assert_eq!(TriangleBatch::guaranteed_capacity(plain, 0), 21);
        assert_eq!(TriangleBatch::guaranteed_capacity(plain, 16), 35);
        assert_eq!(TriangleBatch::guaranteed_capacity(plain, 31), 21);
        assert_eq!(TriangleBatch::guaranteed_capacity(blurred, 16), 14);
    }

    #[test]
    fn unshared_triangles_fill_guaranteed_capacity() {
        let capacity = TriangleBatch::guaranteed_capacity(BatchOptions::default(), 16);
        let mut batch = TriangleBatch::new(BatchOptions::default());
        for i in 0..capacity {
            batch.add_triangle(tri(i as u32, i as f32), None, 16).unwrap();
        }
        assert_eq!(batch.num_lines(), MAX_BATCH_LINES);
        assert_eq!(
            batch.add_triangle(tri(99, 99.0), None, 16),
            Err(EncodeError::BatchFull { capacity: 7 })
        );
    }
}
