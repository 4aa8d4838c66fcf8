//! Whole-tree storage and the pointer-patching serializer.
//!
//! The tree is written depth-first, pre-order. For each complet the
//! serializer lays out, in order:
//!
//! 1. the visibility blocks of its leaves,
//! 2. its leaves, contiguously (the leaf pointer targets the first),
//! 3. one reserved record per child complet (the child pointer targets the
//!    first),
//!
//! then writes its own record into the slot its parent reserved for it and
//! recurses into the children. Every child learns its parent's address and
//! its slot index in the parent through [`ParentLink`].

use tracing::trace;

use crate::CACHE_LINE_SIZE;
use crate::arena::{Arena, CompletId};
use crate::complet::{Child, ChildBounds, Complet, RecordPointers};
use crate::error::{EncodeError, EncodeResult};
use crate::micromesh::DisplacedMicromesh;
use crate::triangles::TriangleBatch;

/// Entity storage of one BVH.
#[derive(Debug, Clone)]
pub struct BvhStorage {
    pub complets: Arena<Complet>,
    pub batches: Arena<TriangleBatch>,
    pub micromeshes: Arena<DisplacedMicromesh>,
}

impl BvhStorage {
    /// Reserve room for exactly the given number of entities.
    #[must_use]
    pub fn with_capacity(complets: usize, batches: usize, micromeshes: usize) -> Self {
        Self {
            complets: Arena::with_capacity("complet", complets),
            batches: Arena::with_capacity("triangle batch", batches),
            micromeshes: Arena::with_capacity("micromesh", micromeshes),
        }
    }

    /// Encoded size of a leaf child, excluding its visibility blocks.
    pub fn leaf_size(&self, child: Child) -> EncodeResult<usize> {
        match child {
            Child::TriangleBatch(id) => Ok(self.batches.get(id)?.size_bytes()),
            Child::Micromesh(id) => Ok(self.micromeshes.get(id)?.size_bytes()),
            Child::Complet(_) => Ok(0),
        }
    }

    /// Bytes of visibility blocks a leaf child stores ahead of the leaves.
    pub fn leaf_visibility_size(&self, child: Child) -> EncodeResult<usize> {
        match child {
            Child::TriangleBatch(id) => Ok(self.batches.get(id)?.visibility_size()),
            Child::Micromesh(id) => Ok(self.micromeshes.get(id)?.visibility_size()),
            Child::Complet(_) => Ok(0),
        }
    }

    /// Start and end bounds of a child plus its slot payload byte.
    pub fn child_bounds(&self, child: Child) -> EncodeResult<ChildBounds> {
        match child {
            Child::Complet(id) => {
                let bounds = self.complets.get(id)?.bounds;
                Ok(ChildBounds {
                    start: bounds,
                    end: bounds,
                    data: 0,
                })
            }
            Child::TriangleBatch(id) => {
                let batch = self.batches.get(id)?;
                Ok(ChildBounds {
                    start: batch.bounds(),
                    end: batch.end_bounds(),
                    data: batch.num_lines().saturating_sub(1) as u8,
                })
            }
            Child::Micromesh(id) => {
                let bounds = self.micromeshes.get(id)?.bounds();
                Ok(ChildBounds {
                    start: bounds,
                    end: bounds,
                    data: 0,
                })
            }
        }
    }

    /// Bytes the subtree rooted at `id` serializes to.
    pub fn total_size(&self, id: CompletId) -> EncodeResult<u64> {
        let complet = self.complets.get(id)?;
        let mut size = CACHE_LINE_SIZE as u64;
        for child in complet.children() {
            size += match *child {
                Child::Complet(child) => self.total_size(child)?,
                leaf => (self.leaf_size(leaf)? + self.leaf_visibility_size(leaf)?) as u64,
            };
        }
        Ok(size)
    }
}

/// Where a complet's parent record lives and which slot points back at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentLink {
    pub address: u64,
    pub leaf_index: u8,
}

/// A complete BVH: storage plus its root.
#[derive(Debug, Clone)]
pub struct Bvh {
    pub root: CompletId,
    pub storage: BvhStorage,
}

impl Bvh {
    #[must_use]
    pub const fn new(root: CompletId, storage: BvhStorage) -> Self {
        Self { root, storage }
    }

    pub fn total_size(&self) -> EncodeResult<u64> {
        self.storage.total_size(self.root)
    }

    /// Serialize the whole tree as if loaded at `base_address`.
    pub fn serialize(&self, base_address: u64) -> EncodeResult<Vec<u8>> {
        let expected = self.total_size()?;
        let mut buffer = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));
        let written = serialize_tree(&self.storage, self.root, base_address, &mut buffer)?;
        verify_serialized_size(expected, written, &buffer)?;
        Ok(buffer)
    }
}

/// Check a [`serialize_tree`] result against the predicted tree size.
pub fn verify_serialized_size(expected: u64, written: usize, buffer: &[u8]) -> EncodeResult<()> {
    let actual = written.max(buffer.len()) as u64;
    if written != buffer.len() || actual != expected {
        return Err(EncodeError::SerializationSizeMismatch { expected, actual });
    }
    Ok(())
}

/// Serialize the tree rooted at `root` into `buffer`, which is cleared first.
///
/// Returns the number of bytes written.
pub fn serialize_tree(
    storage: &BvhStorage,
    root: CompletId,
    base_address: u64,
    buffer: &mut Vec<u8>,
) -> EncodeResult<usize> {
    buffer.clear();
    buffer.resize(CACHE_LINE_SIZE, 0);
    let mut cursor = CACHE_LINE_SIZE;
    serialize_complet(
        storage,
        root,
        0,
        None,
        base_address,
        buffer,
        &mut cursor,
    )?;
    Ok(cursor)
}

fn reserve(buffer: &mut Vec<u8>, cursor: &mut usize, size: usize) -> usize {
    let start = *cursor;
    *cursor += size;
    if buffer.len() < *cursor {
        buffer.resize(*cursor, 0);
    }
    start
}

fn serialize_complet(
    storage: &BvhStorage,
    id: CompletId,
    record_offset: usize,
    parent: Option<ParentLink>,
    base: u64,
    buffer: &mut Vec<u8>,
    cursor: &mut usize,
) -> EncodeResult<()> {
    let complet = storage.complets.get(id)?;
    let leaves: Vec<Child> = complet.leaves().copied().collect();
    let children: Vec<CompletId> = complet.child_complets().collect();

    let mut visibility_offsets = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        let size = storage.leaf_visibility_size(*leaf)?;
        let start = reserve(buffer, cursor, size);
        match *leaf {
            Child::TriangleBatch(batch) => {
                storage.batches.get(batch)?.write_visibility(&mut buffer[start..start + size])?;
            }
            Child::Micromesh(mesh) => {
                storage.micromeshes.get(mesh)?.write_visibility(&mut buffer[start..start + size])?;
            }
            Child::Complet(_) => {}
        }
        visibility_offsets.push(start);
    }

    let leaf_start = *cursor;
    for (leaf, visibility) in leaves.iter().zip(&visibility_offsets) {
        let size = storage.leaf_size(*leaf)?;
        let start = reserve(buffer, cursor, size);
        let address = base + start as u64;
        let visibility_address = base + *visibility as u64;
        let out = &mut buffer[start..start + size];
        match *leaf {
            Child::TriangleBatch(batch) => {
                storage.batches.get(batch)?.encode(address, visibility_address, out)?;
            }
            Child::Micromesh(mesh) => {
                storage.micromeshes.get(mesh)?.encode(address, visibility_address, out)?;
            }
            Child::Complet(_) => {}
        }
    }

    let child_start = reserve(buffer, cursor, CACHE_LINE_SIZE * children.len());

    let slot_bounds = leaves
        .iter()
        .copied()
        .chain(children.iter().copied().map(Child::Complet))
        .map(|child| storage.child_bounds(child))
        .collect::<EncodeResult<Vec<_>>>()?;

    let pointers = RecordPointers {
        leaf: (!leaves.is_empty()).then_some(base + leaf_start as u64),
        first_child: (!children.is_empty()).then_some(base + child_start as u64),
        parent: parent.map(|link| link.address),
        parent_leaf_index: parent.map_or(0, |link| link.leaf_index),
    };
    let record_address = base + record_offset as u64;
    let record = complet.encode_record(&slot_bounds, &pointers, record_address)?;
    record.write_le_bytes(&mut buffer[record_offset..record_offset + CACHE_LINE_SIZE])?;

    trace!(
        complet = ?id,
        address = record_address,
        leaves = leaves.len(),
        children = children.len(),
        "wrote complet record"
    );

    let slots_per_child = complet.format.slots_per_child();
    for (i, child) in children.iter().enumerate() {
        let link = ParentLink {
            address: record_address,
            leaf_index: ((leaves.len() + i) * slots_per_child) as u8,
        };
        serialize_complet(
            storage,
            *child,
            child_start + i * CACHE_LINE_SIZE,
            Some(link),
            base,
            buffer,
            cursor,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complet::{Format, LeafKind, Target};
    use crate::geometry::{BoundingBox, Triangle};
    use crate::triangles::BatchOptions;
    use glam::Vec3;

    fn batch(first_id: u32, precision: u8) -> TriangleBatch {
        let mut batch = TriangleBatch::new(BatchOptions::default());
        for i in 0..4 {
            let offset = i as f32 * 0.1;
            batch
                .add_triangle(
                    Triangle::new(
                        first_id + i,
                        Vec3::new(offset, 0.0, 0.0),
                        Vec3::new(offset + 0.1, 0.0, 0.0),
                        Vec3::new(offset, 0.1, 0.0),
                    ),
                    None,
                    precision,
                )
                .unwrap();
        }
        batch.finalize_block();
        batch
    }

    fn two_level_tree() -> Bvh {
        let bounds = BoundingBox::from_array([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let mut storage = BvhStorage::with_capacity(2, 2, 0);
        let a = storage.batches.push(batch(0, 0)).unwrap();
        let b = storage.batches.push(batch(4, 0)).unwrap();

        let mut child =
            Complet::new(Target::Gen3, Format::Standard, LeafKind::TriangleBatch, bounds, false)
                .unwrap();
        child.add_child_triangle_batch(b).unwrap();

        let mut root =
            Complet::new(Target::Gen3, Format::Standard, LeafKind::TriangleBatch, bounds, true)
                .unwrap();
        let child = storage.complets.push(child).unwrap();
        root.add_child_triangle_batch(a).unwrap();
        root.add_child_complet(child).unwrap();
        let root = storage.complets.push(root).unwrap();
        Bvh::new(root, storage)
    }

    #[test]
    fn size_matches_prediction() {
        let bvh = two_level_tree();
        // Two records, two uncompressed batches of two lines each.
        assert_eq!(bvh.total_size().unwrap(), 2 * 128 + 2 * 256);
        let bytes = bvh.serialize(0).unwrap();
        assert_eq!(bytes.len(), 768);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let bvh = two_level_tree();
        let Some(Child::Complet(child)) = bvh
            .storage
            .complets
            .get(bvh.root)
            .unwrap()
            .children()
            .last()
            .copied()
        else {
            panic!("root has no child complet");
        };

        // Predict only the subtree but write the whole tree.
        let expected = bvh.storage.total_size(child).unwrap();
        assert_eq!(expected, 128 + 256);
        let mut buffer = Vec::new();
        let written = serialize_tree(&bvh.storage, bvh.root, 0, &mut buffer).unwrap();
        assert_eq!(written, 768);
        assert_eq!(
            verify_serialized_size(expected, written, &buffer),
            Err(EncodeError::SerializationSizeMismatch {
                expected: 384,
                actual: 768,
            })
        );
        verify_serialized_size(768, written, &buffer).unwrap();
    }

    #[test]
    fn pointers_are_patched() {
        let bvh = two_level_tree();
        let base = 0x1_0000;
        let bytes = bvh.serialize(base).unwrap();

        let root = crate::bits::LinePacker::from_le_bytes(&bytes[..128]).unwrap();
        // Root: record at 0, its batch at 128, reserved child record at 384.
        assert_eq!(root.get_bits(128, 32).unwrap(), base + 128);
        assert_eq!(root.get_bits(224, 32).unwrap(), base + 384);
        // Slot 0 is the batch (data = lines - 1), slot 1 the complet.
        assert_eq!(bytes[32 + 7], 1);
        assert_eq!(bytes[40 + 7], 0);
        assert_eq!(bytes[48], 0xFF);

        let child = crate::bits::LinePacker::from_le_bytes(&bytes[384..512]).unwrap();
        assert_eq!(child.get_bits(192, 32).unwrap(), base);
        assert_eq!(child.get_bits(977, 4).unwrap(), 1);
        assert_eq!(child.get_bits(128, 32).unwrap(), base + 512);
        assert_eq!(child.get_bits(224, 32).unwrap(), 0);
    }

    #[test]
    fn unknown_child_fails() {
        let mut bvh = two_level_tree();
        bvh.storage.batches = Arena::with_capacity("triangle batch", 0);
        assert!(matches!(
            bvh.serialize(0),
            Err(EncodeError::UnknownEntity { .. })
        ));
    }
}
