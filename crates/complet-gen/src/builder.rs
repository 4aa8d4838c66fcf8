//! Two-phase random BVH construction.
//!
//! Generation runs twice over the same seed. The count phase only tallies
//! entities so every arena can be reserved at its final size; the build
//! phase then creates them. Both phases are driven by one [`Walker`], which
//! performs every random draw itself and hands plain values to a
//! [`PhaseSink`]. The phases therefore consume identical draw sequences, and
//! the end-of-phase stream comparison in [`build_random_bvh`] checks it.

use glam::Vec3;
use tracing::{debug, info};

use complet_encode::{
    BoundingBox, Bvh, BvhStorage, Complet, CompletId, DisplacedMicromesh, Format, LeafKind,
    ShearData, ShearSelect, Triangle, TriangleBatch, VisibilityBlock,
};

use crate::error::{GenError, GenResult};
use crate::params::BuildParams;
use crate::rng::{RandomStream, SeededStream, Streams};

/// Maximum relative offset of a split plane from the box midpoint.
const SPLIT_JITTER: f32 = 1.0 / 16.0;

/// Number of entities in a generated tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BvhCounts {
    pub complets: usize,
    pub batches: usize,
    pub micromeshes: usize,
    /// Batch triangles plus micromesh base triangles.
    pub triangles: usize,
}

/// A complet the walker decided to create.
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec {
    pub bounds: BoundingBox,
    pub shear: Option<ShearData>,
}

/// Content of one triangle batch leaf.
#[derive(Debug, Clone, Default)]
pub struct TriangleLeaf {
    pub triangles: Vec<Triangle>,
    /// End-of-interval triangles, empty without motion blur.
    pub end_triangles: Vec<Triangle>,
    /// One block per triangle, empty without visibility masks.
    pub visibility: Vec<VisibilityBlock>,
}

/// Receives the walker's decisions.
pub trait PhaseSink {
    /// Handle to a created complet.
    type Node: Copy;

    fn complet(&mut self, parent: Option<Self::Node>, spec: &NodeSpec) -> GenResult<Self::Node>;

    fn triangle_batch(&mut self, parent: Self::Node, leaf: TriangleLeaf) -> GenResult<()>;

    fn micromesh(&mut self, parent: Self::Node, mesh: DisplacedMicromesh) -> GenResult<()>;
}

/// Count phase: tallies entities, creates nothing.
#[derive(Debug, Default)]
pub struct CountSink {
    pub counts: BvhCounts,
}

impl PhaseSink for CountSink {
    type Node = ();

    fn complet(&mut self, _parent: Option<()>, _spec: &NodeSpec) -> GenResult<()> {
        self.counts.complets += 1;
        Ok(())
    }

    fn triangle_batch(&mut self, _parent: (), leaf: TriangleLeaf) -> GenResult<()> {
        self.counts.batches += 1;
        self.counts.triangles += leaf.triangles.len();
        Ok(())
    }

    fn micromesh(&mut self, _parent: (), _mesh: DisplacedMicromesh) -> GenResult<()> {
        self.counts.micromeshes += 1;
        self.counts.triangles += 1;
        Ok(())
    }
}

/// Build phase: creates entities in pre-sized arenas.
#[derive(Debug)]
pub struct BuildSink<'a> {
    params: &'a BuildParams,
    storage: BvhStorage,
    root: Option<CompletId>,
}

impl<'a> BuildSink<'a> {
    #[must_use]
    pub fn new(params: &'a BuildParams, counts: &BvhCounts) -> Self {
        Self {
            params,
            storage: BvhStorage::with_capacity(counts.complets, counts.batches, counts.micromeshes),
            root: None,
        }
    }

    /// Entities actually created so far.
    #[must_use]
    pub fn counts(&self) -> BvhCounts {
        let batch_triangles: usize = self.storage.batches.iter().map(TriangleBatch::len).sum();
        BvhCounts {
            complets: self.storage.complets.len(),
            batches: self.storage.batches.len(),
            micromeshes: self.storage.micromeshes.len(),
            triangles: batch_triangles + self.storage.micromeshes.len(),
        }
    }

    pub fn finish(self) -> GenResult<Bvh> {
        let root = self
            .root
            .ok_or_else(|| GenError::InvalidParams("no root complet was built".into()))?;
        Ok(Bvh::new(root, self.storage))
    }
}

impl PhaseSink for BuildSink<'_> {
    type Node = CompletId;

    fn complet(&mut self, parent: Option<CompletId>, spec: &NodeSpec) -> GenResult<CompletId> {
        let params = self.params;
        let format = if params.motion_blur {
            Format::MotionBlur
        } else {
            Format::Standard
        };
        let leaf_kind = if params.use_micromesh {
            LeafKind::Micromesh
        } else {
            LeafKind::TriangleBatch
        };

        let mut complet = Complet::new(
            params.target,
            format,
            leaf_kind,
            spec.bounds,
            parent.is_none(),
        )?
        .with_relative_pointers(params.relative_leaf_pointers, params.relative_complet_pointers);
        if let Some(shear) = spec.shear {
            complet = complet.with_shear(shear)?;
        }

        let id = self.storage.complets.push(complet)?;
        match parent {
            Some(parent) => self.storage.complets.get_mut(parent)?.add_child_complet(id)?,
            None => self.root = Some(id),
        }
        Ok(id)
    }

    fn triangle_batch(&mut self, parent: CompletId, leaf: TriangleLeaf) -> GenResult<()> {
        let mut batch = TriangleBatch::new(self.params.batch_options());

        let mut visibility = leaf.visibility.into_iter();
        for (i, triangle) in leaf.triangles.iter().enumerate() {
            let end = leaf.end_triangles.get(i).copied();
            batch.add_triangle(*triangle, end, self.params.precision)?;
            if let Some(block) = visibility.next() {
                batch.push_visibility_block(block)?;
            }
        }
        batch.finalize_block();

        let id = self.storage.batches.push(batch)?;
        self.storage
            .complets
            .get_mut(parent)?
            .add_child_triangle_batch(id)?;
        Ok(())
    }

    fn micromesh(&mut self, parent: CompletId, mesh: DisplacedMicromesh) -> GenResult<()> {
        let id = self.storage.micromeshes.push(mesh)?;
        self.storage.complets.get_mut(parent)?.add_child_micromesh(id)?;
        Ok(())
    }
}

/// The shared decision structure of both phases.
pub struct Walker<'a, S, R = SeededStream> {
    params: &'a BuildParams,
    streams: Streams<R>,
    sink: S,
    next_triangle_id: u32,
}

impl<'a, S: PhaseSink, R: RandomStream> Walker<'a, S, R> {
    #[must_use]
    pub fn new(params: &'a BuildParams, streams: Streams<R>, sink: S) -> Self {
        Self {
            params,
            streams,
            sink,
            next_triangle_id: 0,
        }
    }

    /// Generate the whole tree from the root box.
    pub fn run(&mut self) -> GenResult<S::Node> {
        self.complet(None, self.params.root_box, self.params.depth)
    }

    /// Hand back the streams, positioned after the last draw, and the sink.
    pub fn finish(self) -> (Streams<R>, S) {
        (self.streams, self.sink)
    }

    fn complet(
        &mut self,
        parent: Option<S::Node>,
        bounds: BoundingBox,
        depth: u32,
    ) -> GenResult<S::Node> {
        let shear = if self.params.shear {
            Some(self.shear()?)
        } else {
            None
        };
        let node = self.sink.complet(parent, &NodeSpec { bounds, shear })?;

        for child in self.split(bounds) {
            let recurse = depth > 0
                && self.streams.general.next_f32(0.0, 1.0) < self.params.prob_split;
            if recurse {
                self.complet(Some(node), child, depth - 1)?;
            } else if self.params.use_micromesh {
                let mesh = self.micromesh(&child)?;
                self.sink.micromesh(node, mesh)?;
            } else {
                let leaf = self.triangle_leaf(&child)?;
                self.sink.triangle_batch(node, leaf)?;
            }
        }
        Ok(node)
    }

    fn shear(&mut self) -> GenResult<ShearData> {
        let general = &mut self.streams.general;
        let select = ShearSelect::ALL[(general.next_u32() % 3) as usize];
        let coeff0 = (general.next_u32() % 16) as u8;
        let coeff1 = (general.next_u32() % 16) as u8;
        let offset = (general.next_u32() % 8) as u8;
        Ok(ShearData::new(select, coeff0, coeff1, offset)?)
    }

    /// Cut `bounds` into `width` boxes by repeatedly halving the box with the
    /// longest edge along that edge, with the cut jittered off the midpoint.
    fn split(&mut self, bounds: BoundingBox) -> Vec<BoundingBox> {
        let mut boxes = Vec::with_capacity(self.params.width);
        boxes.push(bounds);

        for _ in 1..self.params.width {
            let mut index = 0;
            for (i, candidate) in boxes.iter().enumerate() {
                if candidate.extent().max_element() > boxes[index].extent().max_element() {
                    index = i;
                }
            }

            let target = boxes[index];
            let axis = target.longest_axis();
            let length = target.extent()[axis];
            let jitter = self.streams.general.next_f32(-SPLIT_JITTER, SPLIT_JITTER);
            let cut = (target.min[axis] + length * (0.5 + jitter))
                .max(target.min[axis])
                .min(target.max[axis]);

            let mut left = target;
            left.max[axis] = cut;
            let mut right = target;
            right.min[axis] = cut;
            boxes[index] = left;
            boxes.insert(index + 1, right);
        }
        boxes
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_triangle_id;
        self.next_triangle_id = self.next_triangle_id.wrapping_add(1);
        id
    }

    fn triangle_leaf(&mut self, bounds: &BoundingBox) -> GenResult<TriangleLeaf> {
        let count = self.params.triangle_count;
        let motion_blur = self.params.motion_blur;
        let mut leaf = TriangleLeaf {
            triangles: Vec::with_capacity(count),
            end_triangles: Vec::with_capacity(if motion_blur { count } else { 0 }),
            visibility: Vec::new(),
        };

        // Start and end positions of the previous triangle's vertices.
        let mut previous: Option<([Vec3; 3], [Vec3; 3])> = None;
        for i in 0..count {
            let (start, end) = match previous {
                Some((start, end)) if i % self.params.group_size != 0 => {
                    let (fresh, fresh_end) = self.vertex(bounds);
                    ([start[2], start[1], fresh], [end[2], end[1], fresh_end])
                }
                _ => {
                    let (a, a_end) = self.vertex(bounds);
                    let (b, b_end) = self.vertex(bounds);
                    let (c, c_end) = self.vertex(bounds);
                    ([a, b, c], [a_end, b_end, c_end])
                }
            };

            let id = self.next_id();
            leaf.triangles.push(Triangle::new(id, start[0], start[1], start[2]));
            if motion_blur {
                leaf.end_triangles.push(Triangle::new(id, end[0], end[1], end[2]));
            }
            if self.params.visibility_masks() {
                leaf.visibility.push(self.visibility_block()?);
            }
            previous = Some((start, end));
        }
        Ok(leaf)
    }

    /// A new vertex and, under motion blur, its displaced end position.
    fn vertex(&mut self, bounds: &BoundingBox) -> (Vec3, Vec3) {
        let start = point_in(&mut self.streams.primary, bounds);
        if !self.params.motion_blur {
            return (start, start);
        }
        let reach = bounds.extent() / 8.0;
        let end = &mut self.streams.end;
        let offset = Vec3::new(
            end.next_f32(-reach.x, reach.x),
            end.next_f32(-reach.y, reach.y),
            end.next_f32(-reach.z, reach.z),
        );
        (start, bounds.clamp(start + offset))
    }

    fn visibility_block(&mut self) -> GenResult<VisibilityBlock> {
        let mut block = VisibilityBlock::transparent();
        for i in 0..VisibilityBlock::FLAGS {
            let opaque = self.streams.general.next_f32(0.0, 1.0) < self.params.visibility_opacity;
            block.set(i, opaque)?;
        }
        Ok(block)
    }

    fn micromesh(&mut self, bounds: &BoundingBox) -> GenResult<DisplacedMicromesh> {
        // Keep the base triangle a quarter extent away from every face so the
        // displaced vertices stay inside the box.
        let margin = bounds.extent() / 4.0;
        let inner = BoundingBox::new(bounds.min + margin, bounds.max - margin);

        let v0 = point_in(&mut self.streams.primary, &inner);
        let v1 = point_in(&mut self.streams.primary, &inner);
        let v2 = point_in(&mut self.streams.primary, &inner);
        let base = Triangle::new(self.next_id(), v0, v1, v2);

        let unit = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let directions = [
            point_in(&mut self.streams.general, &unit),
            point_in(&mut self.streams.general, &unit),
            point_in(&mut self.streams.general, &unit),
        ];
        let scale = self
            .streams
            .general
            .next_f32(0.0, margin.min_element() * 0.5);

        let mut mesh = DisplacedMicromesh::new(base, directions, scale);
        for chunk in mesh.displacement.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.streams.general.next_u32().to_le_bytes());
        }
        if self.params.visibility_masks() {
            mesh.visibility = Some(self.visibility_block()?);
        }
        Ok(mesh)
    }
}

fn point_in(stream: &mut impl RandomStream, bounds: &BoundingBox) -> Vec3 {
    let x = stream.next_f32(bounds.min.x, bounds.max.x);
    let y = stream.next_f32(bounds.min.y, bounds.max.y);
    let z = stream.next_f32(bounds.min.z, bounds.max.z);
    Vec3::new(x, y, z)
}

/// Run only the count phase.
pub fn count_random_bvh(params: &BuildParams) -> GenResult<BvhCounts> {
    params.validate()?;
    let mut walker = Walker::new(params, Streams::from_seed(params.seed), CountSink::default());
    walker.run()?;
    let (_, sink) = walker.finish();
    Ok(sink.counts)
}

/// Generate a random BVH.
///
/// Runs the count phase, reserves storage, runs the build phase and then
/// checks that both phases left every random stream in the same state and
/// produced the same entity counts.
pub fn build_random_bvh(params: &BuildParams) -> GenResult<(Bvh, BvhCounts)> {
    let streams = Streams::from_seed(params.seed);
    build_random_bvh_with_streams(params, streams.clone(), streams)
}

/// [`build_random_bvh`] with caller-supplied streams for each phase.
///
/// Both arguments must start in the same state; `params.seed` is ignored.
pub fn build_random_bvh_with_streams<R: RandomStream>(
    params: &BuildParams,
    count_streams: Streams<R>,
    build_streams: Streams<R>,
) -> GenResult<(Bvh, BvhCounts)> {
    params.validate()?;

    let mut walker = Walker::new(params, count_streams, CountSink::default());
    walker.run()?;
    let (mut count_streams, count_sink) = walker.finish();
    let counted = count_sink.counts;
    info!(
        seed = params.seed,
        complets = counted.complets,
        batches = counted.batches,
        micromeshes = counted.micromeshes,
        triangles = counted.triangles,
        "count phase finished"
    );

    let mut walker = Walker::new(params, build_streams, BuildSink::new(params, &counted));
    walker.run()?;
    let (mut build_streams, build_sink) = walker.finish();

    for ((stream, count_phase), (_, build_phase)) in count_streams
        .next_values()
        .into_iter()
        .zip(build_streams.next_values())
    {
        debug!(stream, count_phase, build_phase, "compared stream state");
        if count_phase != build_phase {
            return Err(GenError::RngDivergence {
                stream,
                count_phase,
                build_phase,
            });
        }
    }

    let built = build_sink.counts();
    for (entity, counted, built) in [
        ("complets", counted.complets, built.complets),
        ("triangle batches", counted.batches, built.batches),
        ("micromeshes", counted.micromeshes, built.micromeshes),
        ("triangles", counted.triangles, built.triangles),
    ] {
        if counted != built {
            return Err(GenError::PhaseCountMismatch {
                entity,
                counted,
                built,
            });
        }
    }

    info!(
        complets = built.complets,
        batches = built.batches,
        micromeshes = built.micromeshes,
        "build phase finished"
    );
    Ok((build_sink.finish()?, built))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_yields_width_boxes_covering_parent() {
        let params = BuildParams {
            width: 5,
            ..BuildParams::default()
        };
        let mut walker = Walker::new(&params, Streams::from_seed(3), CountSink::default());
        let bounds = BoundingBox::from_array([0.0, 0.0, 0.0, 4.0, 1.0, 1.0]);
        let boxes = walker.split(bounds);

        assert_eq!(boxes.len(), 5);
        let union = boxes
            .iter()
            .fold(BoundingBox::EMPTY, |acc, b| acc.union(b));
        assert_eq!(union, bounds);
        for b in &boxes {
            assert!(bounds.contains(b));
            assert!(b.is_valid());
        }
    }

    #[test]
    fn first_split_is_near_the_midpoint_of_the_longest_edge() {
        let params = BuildParams {
            width: 2,
            ..BuildParams::default()
        };
        let mut walker = Walker::new(&params, Streams::from_seed(9), CountSink::default());
        let boxes = walker.split(BoundingBox::from_array([0.0, 0.0, 0.0, 1.0, 8.0, 1.0]));
        let cut = boxes[0].max.y;
        assert_eq!(boxes[1].min.y, cut);
        assert!((3.5..=4.5).contains(&cut));
        assert_eq!(boxes[0].max.x, 1.0);
    }

    #[test]
    fn groups_share_edges() {
        let params = BuildParams {
            triangle_count: 5,
            group_size: 3,
            ..BuildParams::default()
        };
        let mut walker = Walker::new(&params, Streams::from_seed(1), CountSink::default());
        let leaf = walker
            .triangle_leaf(&BoundingBox::from_array([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]))
            .unwrap();

        let t = &leaf.triangles;
        assert_eq!(t.len(), 5);
        assert_eq!((t[1].v0, t[1].v1), (t[0].v2, t[0].v1));
        assert_eq!((t[2].v0, t[2].v1), (t[1].v2, t[1].v1));
        assert_ne!(t[3].v0, t[2].v2);
        assert_eq!((t[4].v0, t[4].v1), (t[3].v2, t[3].v1));
        assert_eq!(
            t.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(leaf.end_triangles.is_empty());
        assert!(leaf.visibility.is_empty());
    }

    #[test]
    fn end_positions_stay_in_box() {
        let params = BuildParams {
            motion_blur: true,
            triangle_count: 6,
            group_size: 2,
            ..BuildParams::default()
        };
        let bounds = BoundingBox::from_array([-1.0, 2.0, 0.0, 0.0, 3.0, 0.5]);
        let mut walker = Walker::new(&params, Streams::from_seed(5), CountSink::default());
        let leaf = walker.triangle_leaf(&bounds).unwrap();

        assert_eq!(leaf.end_triangles.len(), 6);
        for (start, end) in leaf.triangles.iter().zip(&leaf.end_triangles) {
            assert_eq!(start.id, end.id);
            assert!(bounds.contains(&start.bounds()));
            assert!(bounds.contains(&end.bounds()));
        }
        // Shared start vertices share their end vertex too.
        assert_eq!(leaf.end_triangles[1].v0, leaf.end_triangles[0].v2);
    }

    #[test]
    fn micromesh_stays_in_box() {
        let params = BuildParams {
            use_micromesh: true,
            ..BuildParams::default()
        };
        let bounds = BoundingBox::from_array([0.0, 0.0, 0.0, 2.0, 1.0, 0.5]);
        let mut walker = Walker::new(&params, Streams::from_seed(11), CountSink::default());
        for _ in 0..32 {
            let mesh = walker.micromesh(&bounds).unwrap();
            assert!(bounds.contains(&mesh.bounds()));
            assert!(mesh.visibility.is_none());
        }
    }

    #[test]
    fn count_and_build_agree() {
        let params = BuildParams {
            seed: 1234,
            ..BuildParams::default()
        };
        let counted = count_random_bvh(&params).unwrap();
        let (bvh, built) = build_random_bvh(&params).unwrap();
        assert_eq!(counted, built);
        assert_eq!(bvh.storage.complets.len(), counted.complets);
        assert_eq!(bvh.storage.complets.capacity(), counted.complets);
    }

    /// Discards one underlying draw before its first value when `lag` is set.
    struct Lagging {
        inner: SeededStream,
        lag: bool,
    }

    impl Lagging {
        fn catch_up(&mut self) {
            if std::mem::take(&mut self.lag) {
                self.inner.next_u32();
            }
        }
    }

    impl RandomStream for Lagging {
        fn next_u32(&mut self) -> u32 {
            self.catch_up();
            self.inner.next_u32()
        }

        fn next_f32(&mut self, lo: f32, hi: f32) -> f32 {
            self.catch_up();
            self.inner.next_f32(lo, hi)
        }
    }

    fn lagging_streams(seed: u64, lag: bool) -> Streams<Lagging> {
        let Streams {
            general,
            primary,
            end,
        } = Streams::from_seed(seed);
        Streams {
            general: Lagging { inner: general, lag },
            primary: Lagging {
                inner: primary,
                lag: false,
            },
            end: Lagging {
                inner: end,
                lag: false,
            },
        }
    }

    #[test]
    fn diverging_build_stream_is_reported() {
        // No recursion, so the topology does not depend on the draws.
        let params = BuildParams {
            depth: 0,
            width: 3,
            ..BuildParams::default()
        };
        let result = build_random_bvh_with_streams(
            &params,
            lagging_streams(21, false),
            lagging_streams(21, true),
        );
        let Err(GenError::RngDivergence {
            stream,
            count_phase,
            build_phase,
        }) = result
        else {
            panic!("expected a stream divergence, got {result:?}");
        };
        assert_eq!(stream, "general");
        assert_ne!(count_phase, build_phase);
    }

    #[test]
    fn matching_custom_streams_build() {
        let params = BuildParams {
            depth: 0,
            width: 3,
            ..BuildParams::default()
        };
        let (_, counts) = build_random_bvh_with_streams(
            &params,
            lagging_streams(21, true),
            lagging_streams(21, true),
        )
        .unwrap();
        assert_eq!(counts.batches, 3);
    }
}
