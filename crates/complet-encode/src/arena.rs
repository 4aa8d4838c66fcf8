//! Fixed-capacity storage with stable typed indices.
//!
//! Complets refer to their children by id rather than by reference. The
//! arenas are sized once, before the first id is handed out, and refuse to
//! grow past that size.

use std::marker::PhantomData;

use crate::complet::Complet;
use crate::error::{EncodeError, EncodeResult};
use crate::micromesh::DisplacedMicromesh;
use crate::triangles::TriangleBatch;

/// Stable index into an [`Arena`].
pub struct Id<T> {
    index: u32,
    marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

pub type CompletId = Id<Complet>;
pub type BatchId = Id<TriangleBatch>;
pub type MicromeshId = Id<DisplacedMicromesh>;

/// Append-only storage that never reallocates past its reserved capacity.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    name: &'static str,
    items: Vec<T>,
    capacity: usize,
}

impl<T> Arena<T> {
    #[must_use]
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> EncodeResult<Id<T>> {
        if self.items.len() >= self.capacity {
            return Err(EncodeError::ArenaExhausted {
                arena: self.name,
                capacity: self.capacity,
            });
        }
        let index = self.items.len() as u32;
        self.items.push(item);
        Ok(Id {
            index,
            marker: PhantomData,
        })
    }

    pub fn get(&self, id: Id<T>) -> EncodeResult<&T> {
        self.items.get(id.index()).ok_or(EncodeError::UnknownEntity {
            arena: self.name,
            index: id.index(),
        })
    }

    pub fn get_mut(&mut self, id: Id<T>) -> EncodeResult<&mut T> {
        let name = self.name;
        self.items.get_mut(id.index()).ok_or(EncodeError::UnknownEntity {
            arena: name,
            index: id.index(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_grow() {
        let mut arena: Arena<u8> = Arena::with_capacity("bytes", 2);
        let a = arena.push(1).unwrap();
        let b = arena.push(2).unwrap();
        assert_eq!(
            arena.push(3),
            Err(EncodeError::ArenaExhausted {
                arena: "bytes",
                capacity: 2
            })
        );
        assert_eq!(*arena.get(a).unwrap(), 1);
        *arena.get_mut(b).unwrap() = 5;
        assert_eq!(arena.iter().copied().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn unknown_ids_fail() {
        let mut big: Arena<u8> = Arena::with_capacity("big", 4);
        big.push(0).unwrap();
        let far = big.push(0).unwrap();
        let small: Arena<u8> = Arena::with_capacity("small", 1);
        assert!(matches!(
            small.get(far),
            Err(EncodeError::UnknownEntity { index: 1, .. })
        ));
    }
}
