//! Seeded random streams.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

const PRIMARY_SALT: u64 = 0x9E37_79B9_7F4A_7C15;
const END_SALT: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// A deterministic source of random values.
pub trait RandomStream {
    fn next_u32(&mut self) -> u32;

    /// Uniform float in `[lo, hi]`.
    fn next_f32(&mut self, lo: f32, hi: f32) -> f32;
}

/// [`RandomStream`] backed by a seeded [`StdRng`].
#[derive(Debug, Clone)]
pub struct SeededStream {
    rng: StdRng,
}

impl SeededStream {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomStream for SeededStream {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_f32(&mut self, lo: f32, hi: f32) -> f32 {
        let unit: f32 = self.rng.random();
        // Rounding can land one ulp outside the range.
        (lo + (hi - lo) * unit).max(lo).min(hi)
    }
}

/// The three independent streams of one generation phase.
#[derive(Debug, Clone)]
pub struct Streams<R = SeededStream> {
    /// Topology, shear, visibility and micromesh content.
    pub general: R,
    /// Start-of-interval triangle positions.
    pub primary: R,
    /// End-of-interval triangle positions.
    pub end: R,
}

impl Streams {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            general: SeededStream::new(seed),
            primary: SeededStream::new(seed ^ PRIMARY_SALT),
            end: SeededStream::new(seed ^ END_SALT),
        }
    }
}

impl<R: RandomStream> Streams<R> {
    /// Draw the next value of every stream, labelled.
    pub fn next_values(&mut self) -> [(&'static str, u32); 3] {
        [
            ("general", self.general.next_u32()),
            ("primary", self.primary.next_u32()),
            ("end", self.end.next_u32()),
        ]
    }
}
