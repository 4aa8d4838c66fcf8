//! Deterministic random BVH generation.
//!
//! Builds complet trees with random topology and content from a seed, for
//! exercising the encoder and serializer. The same [`BuildParams`] always
//! produce the same tree and the same serialized bytes.
//!
//! # Key functions
//!
//! - [`build_random_bvh`]: Count, reserve, build and cross-check a tree
//! - [`count_random_bvh`]: Run only the count phase
//! - [`build_random_bvh_with_streams`]: Build from caller-supplied streams

mod error;

pub mod builder;
pub mod params;
pub mod rng;

pub use builder::{BvhCounts, build_random_bvh, build_random_bvh_with_streams, count_random_bvh};
pub use error::{GenError, GenResult};
pub use params::BuildParams;
pub use rng::{RandomStream, SeededStream, Streams};
