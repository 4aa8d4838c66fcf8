//! Encode bounding-volume hierarchies into fixed 128-byte records.
//!
//! A tree is built from complets (internal nodes holding up to 11 quantized
//! child boxes) whose leaves are triangle batches or displaced micromeshes.
//! Every record is exactly one cache line; the serializer lays the tree out
//! in one contiguous buffer and patches every pointer on the way.
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **Bit-exact**: Every field has a fixed bit offset within its line
//! - **Fail loudly**: Any field that does not fit is an [`EncodeError`], never
//!   a silent truncation
//!
//! # Key functions
//!
//! - [`BitPacker::set_bits`]: Place a field at an arbitrary bit offset
//! - [`quantize_child`]: Quantize a child box against its parent
//! - [`TriangleBatch::add_triangle`]: Grow a batch, opening compression blocks
//! - [`Complet::encode_record`]: Build one 128-byte node record
//! - [`serialize_tree`]: Lay out and patch a whole tree
//! - [`decode_complet`]: Read a record back for inspection

mod error;

pub mod arena;
pub mod bits;
pub mod complet;
pub mod decode;
pub mod geometry;
pub mod half;
pub mod micromesh;
pub mod tree;
pub mod triangles;
pub mod visibility;

pub use arena::{Arena, BatchId, CompletId, Id, MicromeshId};
pub use bits::{BitPacker, LinePacker};
pub use complet::{
    Child, ChildBounds, Complet, Feature, Format, LeafKind, RecordPointers, ShearData,
    ShearSelect, Target,
};
pub use decode::{
    CompletRecord, decode_complet, decode_compressed_block, decode_micromesh, decode_uncompressed,
};
pub use error::{EncodeError, EncodeResult};
pub use geometry::{BoundingBox, ChildSlot, Triangle, Vertex, quantize_child};
pub use micromesh::DisplacedMicromesh;
pub use tree::{Bvh, BvhStorage, ParentLink, serialize_tree, verify_serialized_size};
pub use triangles::{BatchOptions, EncodingMode, TriangleBatch, TriangleFlags};
pub use visibility::VisibilityBlock;

/// Size of one record in bytes.
pub const CACHE_LINE_SIZE: usize = 128;

/// Size of one record in bits.
pub const CACHE_LINE_BITS: usize = CACHE_LINE_SIZE * 8;
