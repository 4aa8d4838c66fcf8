//! Build parameters.

use complet_encode::triangles::MAX_PRECISION;
use complet_encode::{BatchOptions, BoundingBox, Feature, Target, TriangleBatch};

use crate::error::{GenError, GenResult};

/// Everything that shapes a generated BVH. Same params, same bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParams {
    pub seed: u64,
    pub root_box: BoundingBox,
    /// Children per complet.
    pub width: usize,
    /// Levels of complets below the root.
    pub depth: u32,
    /// Probability that a child box becomes a complet rather than a leaf.
    pub prob_split: f32,
    /// Triangles per batch.
    pub triangle_count: usize,
    /// Triangles sharing edges in one strip.
    pub group_size: usize,
    /// Compression precision; 0 stores triangles uncompressed.
    pub precision: u8,
    pub motion_blur: bool,
    pub shear: bool,
    /// Chance of each visibility bit being opaque; 0 disables masks.
    pub visibility_opacity: f32,
    pub use_micromesh: bool,
    pub target: Target,
    pub relative_leaf_pointers: bool,
    pub relative_complet_pointers: bool,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            seed: 0,
            root_box: BoundingBox::from_array([-1.0, -1.0, -1.0, 1.0, 1.0, 1.0]),
            width: 4,
            depth: 2,
            prob_split: 0.5,
            triangle_count: 8,
            group_size: 4,
            precision: 16,
            motion_blur: false,
            shear: false,
            visibility_opacity: 0.0,
            use_micromesh: false,
            target: Target::Gen3,
            relative_leaf_pointers: false,
            relative_complet_pointers: false,
        }
    }
}

impl BuildParams {
    /// Whether leaves carry visibility masks.
    #[must_use]
    pub fn visibility_masks(&self) -> bool {
        self.visibility_opacity > 0.0
    }

    /// Options shared by every generated triangle batch.
    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            motion_blur: self.motion_blur,
            visibility_masks: self.visibility_masks(),
            ..BatchOptions::default()
        }
    }

    pub fn validate(&self) -> GenResult<()> {
        let invalid = |msg: String| Err(GenError::InvalidParams(msg));

        if !self.root_box.is_valid() || !self.root_box.extent().is_finite() {
            return invalid(format!("root box {:?} is empty or not finite", self.root_box));
        }
        if self.width == 0 {
            return invalid("width must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.prob_split) {
            return invalid(format!("prob_split {} is outside [0, 1]", self.prob_split));
        }
        if !(0.0..=1.0).contains(&self.visibility_opacity) {
            return invalid(format!(
                "visibility_opacity {} is outside [0, 1]",
                self.visibility_opacity
            ));
        }
        if self.group_size == 0 {
            return invalid("group_size must be at least 1".into());
        }
        if self.precision > MAX_PRECISION {
            return invalid(format!("precision {} exceeds {MAX_PRECISION}", self.precision));
        }
        if !self.use_micromesh {
            let max = TriangleBatch::guaranteed_capacity(self.batch_options(), self.precision);
            if !(1..=max).contains(&self.triangle_count) {
                return invalid(format!(
                    "triangle_count {} is outside 1..={max}",
                    self.triangle_count
                ));
            }
        }

        for (enabled, feature) in [
            (self.motion_blur, Feature::MotionBlur),
            (self.use_micromesh, Feature::Micromesh),
            (self.visibility_masks(), Feature::VisibilityMasks),
            (self.shear, Feature::Shear),
        ] {
            if enabled {
                self.target.require(feature)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complet_encode::EncodeError;

    #[test]
    fn defaults_are_valid() {
        BuildParams::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_ranges() {
        for params in [
            BuildParams {
                width: 0,
                ..BuildParams::default()
            },
            BuildParams {
                prob_split: 1.5,
                ..BuildParams::default()
            },
            BuildParams {
                precision: 32,
                ..BuildParams::default()
            },
            BuildParams {
                precision: 0,
                triangle_count: 22,
                ..BuildParams::default()
            },
            BuildParams {
                root_box: BoundingBox::EMPTY,
                ..BuildParams::default()
            },
        ] {
            assert!(matches!(params.validate(), Err(GenError::InvalidParams(_))));
        }
    }

    #[test]
    fn triangle_count_fits_worst_case_batch() {
        let params = BuildParams {
            triangle_count: 40,
            group_size: 1,
            precision: 16,
            ..BuildParams::default()
        };
        assert!(matches!(params.validate(), Err(GenError::InvalidParams(_))));

        let params = BuildParams {
            triangle_count: 35,
            ..params
        };
        params.validate().unwrap();

        let params = BuildParams {
            motion_blur: true,
            ..params
        };
        assert!(matches!(params.validate(), Err(GenError::InvalidParams(_))));
    }

    #[test]
    fn features_follow_target() {
        let params = BuildParams {
            target: Target::Gen1,
            motion_blur: true,
            ..BuildParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(GenError::Encode(EncodeError::UnsupportedFeatureForTarget { .. }))
        ));

        let params = BuildParams {
            target: Target::Gen2,
            visibility_opacity: 0.5,
            ..BuildParams::default()
        };
        assert!(params.validate().is_err());
    }
}
