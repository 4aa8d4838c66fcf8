//! BVH tree nodes and their 128-byte records.
//!
//! # Format
//!
//! | Bytes     | Field                                                    |
//! |-----------|----------------------------------------------------------|
//! | 0         | mode: leaf kind (2), rel leaf (1), rel complet (1), format (4) |
//! | 1-3       | per-axis scale exponents                                 |
//! | 4-15      | quantization origin (min x, y, z as f32)                 |
//! | 16-23     | leaf pointer (absolute 49-bit, relative i32, or sheared 44-bit) |
//! | 24-27     | parent pointer low / relative offset                     |
//! | 28-31     | first child pointer low / relative offset                |
//! | 32-119    | 11 child slots                                           |
//! | 120-127   | parent high (17), parent leaf index (4), child high (17) |

use glam::Vec3;

use crate::arena::{BatchId, CompletId, MicromeshId};
use crate::bits::LinePacker;
use crate::error::{EncodeError, EncodeResult};
use crate::geometry::{BoundingBox, ChildSlot, quantize_child, scale_exponents};

pub(crate) const MODE_BIT: usize = 0;
pub(crate) const EXPONENTS_BIT: usize = 8;
pub(crate) const ORIGIN_BIT: usize = 32;
pub(crate) const LEAF_POINTER_BIT: usize = 128;
pub(crate) const PARENT_BIT: usize = 192;
pub(crate) const CHILD_BIT: usize = 224;
pub(crate) const SLOTS_BIT: usize = 256;
pub(crate) const PARENT_HIGH_BIT: usize = 960;
pub(crate) const PARENT_LEAF_INDEX_BIT: usize = 977;
pub(crate) const CHILD_HIGH_BIT: usize = 981;

pub(crate) const POINTER_BITS: usize = 49;
pub(crate) const POINTER_HIGH_BITS: usize = POINTER_BITS - 32;
pub(crate) const SHEARED_POINTER_BITS: usize = 44;
pub(crate) const SHEAR_ENABLE_BIT: usize = LEAF_POINTER_BIT + SHEARED_POINTER_BITS;
pub(crate) const SHEAR_SELECT_BIT: usize = SHEAR_ENABLE_BIT + 1;
pub(crate) const SHEAR_COEFF0_BIT: usize = SHEAR_SELECT_BIT + 2;
pub(crate) const SHEAR_COEFF1_BIT: usize = SHEAR_COEFF0_BIT + 4;

/// Child slots in one record.
pub const MAX_SLOTS: usize = 11;

/// Compute target generation, the capability axis of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Target {
    Gen1,
    Gen2,
    #[default]
    Gen3,
}

/// Optional encoder features gated by target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    MotionBlur,
    Micromesh,
    VisibilityMasks,
    Shear,
}

impl Feature {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MotionBlur => "motion blur",
            Self::Micromesh => "displaced micromesh",
            Self::VisibilityMasks => "visibility masks",
            Self::Shear => "sheared complets",
        }
    }
}

impl Target {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gen1 => "gen1",
            Self::Gen2 => "gen2",
            Self::Gen3 => "gen3",
        }
    }

    /// Maximum children of a complet in `format` on this target.
    #[must_use]
    pub const fn max_children(self, format: Format) -> usize {
        match (format, self) {
            (Format::MotionBlur, _) => 5,
            (Format::Standard, Self::Gen3) => 11,
            (Format::Standard, _) => 10,
        }
    }

    #[must_use]
    pub const fn supports(self, feature: Feature) -> bool {
        match feature {
            Feature::MotionBlur => matches!(self, Self::Gen2 | Self::Gen3),
            Feature::Micromesh | Feature::VisibilityMasks | Feature::Shear => {
                matches!(self, Self::Gen3)
            }
        }
    }

    pub fn require(self, feature: Feature) -> EncodeResult<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(EncodeError::UnsupportedFeatureForTarget {
                feature: feature.name(),
                target: self.name(),
            })
        }
    }
}

/// Child arrangement of a complet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Standard,
    /// Every child takes two slots: start and end of the time interval.
    MotionBlur,
}

impl Format {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::MotionBlur => 1,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Standard),
            1 => Some(Self::MotionBlur),
            _ => None,
        }
    }

    #[must_use]
    pub const fn slots_per_child(self) -> usize {
        match self {
            Self::Standard => 1,
            Self::MotionBlur => 2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::MotionBlur => "motion blur",
        }
    }
}

/// Kind of leaf a complet holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafKind {
    #[default]
    None,
    TriangleBatch,
    Micromesh,
}

impl LeafKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::TriangleBatch => 1,
            Self::Micromesh => 2,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::TriangleBatch),
            2 => Some(Self::Micromesh),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "no",
            Self::TriangleBatch => "triangle batch",
            Self::Micromesh => "micromesh",
        }
    }
}

/// Axis pair a shear acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShearSelect {
    #[default]
    XY,
    XZ,
    YZ,
}

impl ShearSelect {
    pub const ALL: [Self; 3] = [Self::XY, Self::XZ, Self::YZ];

    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::XY),
            1 => Some(Self::XZ),
            2 => Some(Self::YZ),
            _ => None,
        }
    }
}

/// The 16 slopes a shear coefficient can select.
pub const SHEAR_SLOPES: [f32; 16] = [
    -2.0, -1.0, -0.75, -0.5, -0.375, -0.25, -0.125, -0.0625, 0.0625, 0.125, 0.25, 0.375, 0.5,
    0.75, 1.0, 2.0,
];

/// Shear applied to a complet's child partition planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShearData {
    pub enabled: bool,
    pub select: ShearSelect,
    /// Index into [`SHEAR_SLOPES`].
    pub coeff0: u8,
    /// Index into [`SHEAR_SLOPES`].
    pub coeff1: u8,
    /// 3-bit exponent offset, stored in the origin LSBs of micromesh nodes.
    pub exponent_offset: u8,
}

impl ShearData {
    pub fn new(select: ShearSelect, coeff0: u8, coeff1: u8, exponent_offset: u8) -> EncodeResult<Self> {
        for (field, value, bits) in [
            ("shear coefficient", coeff0, 4),
            ("shear coefficient", coeff1, 4),
            ("shear exponent offset", exponent_offset, 3),
        ] {
            if value >> bits != 0 {
                return Err(EncodeError::OutOfRange {
                    field,
                    start: 0,
                    size: crate::bits::bit_width(u64::from(value)) as usize,
                    capacity: bits,
                });
            }
        }
        Ok(Self {
            enabled: true,
            select,
            coeff0,
            coeff1,
            exponent_offset,
        })
    }

    /// Slopes selected by the two coefficients.
    #[must_use]
    pub fn slopes(&self) -> (f32, f32) {
        (
            SHEAR_SLOPES[usize::from(self.coeff0 & 0xF)],
            SHEAR_SLOPES[usize::from(self.coeff1 & 0xF)],
        )
    }
}

/// A child entry: another complet or a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Child {
    Complet(CompletId),
    TriangleBatch(BatchId),
    Micromesh(MicromeshId),
}

impl Child {
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        !matches!(self, Self::Complet(_))
    }
}

/// Bounds and slot payload of one child, ready for quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildBounds {
    pub start: BoundingBox,
    pub end: BoundingBox,
    pub data: u8,
}

/// Resolved addresses needed to write a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordPointers {
    pub leaf: Option<u64>,
    pub first_child: Option<u64>,
    pub parent: Option<u64>,
    pub parent_leaf_index: u8,
}

/// A BVH tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Complet {
    pub target: Target,
    pub format: Format,
    pub leaf_kind: LeafKind,
    pub bounds: BoundingBox,
    pub is_root: bool,
    pub shear: ShearData,
    pub relative_leaf_pointers: bool,
    pub relative_complet_pointers: bool,
    children: Vec<Child>,
}

impl Complet {
    pub fn new(
        target: Target,
        format: Format,
        leaf_kind: LeafKind,
        bounds: BoundingBox,
        is_root: bool,
    ) -> EncodeResult<Self> {
        if format == Format::MotionBlur {
            target.require(Feature::MotionBlur)?;
        }
        if leaf_kind == LeafKind::Micromesh {
            target.require(Feature::Micromesh)?;
        }
        Ok(Self {
            target,
            format,
            leaf_kind,
            bounds,
            is_root,
            shear: ShearData::default(),
            relative_leaf_pointers: false,
            relative_complet_pointers: false,
            children: Vec::with_capacity(target.max_children(format)),
        })
    }

    pub fn with_shear(mut self, shear: ShearData) -> EncodeResult<Self> {
        if shear.enabled {
            self.target.require(Feature::Shear)?;
        }
        self.shear = shear;
        Ok(self)
    }

    #[must_use]
    pub const fn with_relative_pointers(mut self, leaf: bool, complet: bool) -> Self {
        self.relative_leaf_pointers = leaf;
        self.relative_complet_pointers = complet;
        self
    }

    #[must_use]
    pub const fn max_children(&self) -> usize {
        self.target.max_children(self.format)
    }

    pub fn check_capacity(&self) -> EncodeResult<()> {
        if self.children.len() + 1 > self.max_children() {
            return Err(EncodeError::TooManyChildren {
                max: self.max_children(),
                format: self.format.name(),
            });
        }
        Ok(())
    }

    fn check_leaf_kind(&self, kind: LeafKind) -> EncodeResult<()> {
        if self.leaf_kind != kind {
            return Err(EncodeError::MixedLeafKinds {
                expected: self.leaf_kind.name(),
                actual: kind.name(),
            });
        }
        Ok(())
    }

    pub fn add_child_complet(&mut self, id: CompletId) -> EncodeResult<()> {
        self.check_capacity()?;
        self.children.push(Child::Complet(id));
        Ok(())
    }

    pub fn add_child_triangle_batch(&mut self, id: BatchId) -> EncodeResult<()> {
        self.check_capacity()?;
        self.check_leaf_kind(LeafKind::TriangleBatch)?;
        self.children.push(Child::TriangleBatch(id));
        Ok(())
    }

    pub fn add_child_micromesh(&mut self, id: MicromeshId) -> EncodeResult<()> {
        self.check_capacity()?;
        self.check_leaf_kind(LeafKind::Micromesh)?;
        self.children.push(Child::Micromesh(id));
        Ok(())
    }

    /// Children in insertion order.
    #[must_use]
    pub fn children(&self) -> &[Child] {
        &self.children
    }

    /// Leaf children, in insertion order.
    pub fn leaves(&self) -> impl Iterator<Item = &Child> {
        self.children.iter().filter(|c| c.is_leaf())
    }

    /// Child complets, in insertion order.
    pub fn child_complets(&self) -> impl Iterator<Item = CompletId> + '_ {
        self.children.iter().filter_map(|c| match c {
            Child::Complet(id) => Some(*id),
            _ => None,
        })
    }

    /// Quantization origin as stored in the record.
    ///
    /// Micromesh nodes give up the LSB of each min float, so the origin is
    /// rounded toward negative infinity onto an even bit pattern first.
    #[must_use]
    pub fn origin(&self) -> Vec3 {
        if self.leaf_kind != LeafKind::Micromesh {
            return self.bounds.min;
        }
        Vec3::new(
            round_down_even(self.bounds.min.x),
            round_down_even(self.bounds.min.y),
            round_down_even(self.bounds.min.z),
        )
    }

    /// Box that child slots are quantized against.
    #[must_use]
    pub fn quantization_box(&self) -> BoundingBox {
        BoundingBox::new(self.origin(), self.bounds.max)
    }

    /// Mode byte of the record.
    #[must_use]
    pub fn mode(&self) -> u8 {
        let relative_leaf = self.relative_leaf_pointers && !self.shear.enabled;
        self.leaf_kind.code()
            | (u8::from(relative_leaf) << 2)
            | (u8::from(self.relative_complet_pointers) << 3)
            | (self.format.code() << 4)
    }

    /// Build the record for this node.
    ///
    /// `children` are in slot order: leaves first, then child complets.
    pub fn encode_record(
        &self,
        children: &[ChildBounds],
        pointers: &RecordPointers,
        record_address: u64,
    ) -> EncodeResult<LinePacker> {
        let slots_needed = children.len() * self.format.slots_per_child();
        if children.len() > self.max_children() || slots_needed > MAX_SLOTS {
            return Err(EncodeError::TooManyChildren {
                max: self.max_children(),
                format: self.format.name(),
            });
        }

        let mut packer = LinePacker::new();
        let quantization = self.quantization_box();
        let exponents = scale_exponents(&quantization);

        packer.set_bits(MODE_BIT, 8, u64::from(self.mode()))?;
        for (axis, exponent) in exponents.iter().enumerate() {
            packer.set_bits(EXPONENTS_BIT + axis * 8, 8, u64::from(*exponent))?;
        }

        let origin = self.origin();
        for axis in 0..3 {
            let mut bits = origin[axis].to_bits();
            if self.leaf_kind == LeafKind::Micromesh {
                bits |= u32::from((self.shear.exponent_offset >> axis) & 1);
            }
            packer.set_bits(ORIGIN_BIT + axis * 32, 32, u64::from(bits))?;
        }

        self.write_leaf_pointer(&mut packer, pointers.leaf, record_address)?;
        self.write_complet_pointers(&mut packer, pointers, record_address)?;

        let mut slot = 0;
        for child in children {
            let boxes = match self.format {
                Format::Standard => vec![child.start.union(&child.end)],
                Format::MotionBlur => vec![child.start, child.end],
            };
            for bounds in boxes {
                quantize_child(&quantization, &bounds)
                    .with_data(child.data)
                    .write(&mut packer, SLOTS_BIT + slot * 64)?;
                slot += 1;
            }
        }
        for unused in slot..MAX_SLOTS {
            ChildSlot::INVALID.write(&mut packer, SLOTS_BIT + unused * 64)?;
        }

        Ok(packer)
    }

    fn write_leaf_pointer(
        &self,
        packer: &mut LinePacker,
        leaf: Option<u64>,
        record_address: u64,
    ) -> EncodeResult<()> {
        if self.shear.enabled {
            let address = leaf.unwrap_or(0);
            check_pointer("sheared leaf pointer", address, SHEARED_POINTER_BITS)?;
            packer.set_bits(LEAF_POINTER_BIT, SHEARED_POINTER_BITS, address)?;
            packer.set_bit(SHEAR_ENABLE_BIT, true)?;
            packer.set_bits(SHEAR_SELECT_BIT, 2, u64::from(self.shear.select.code()))?;
            packer.set_bits(SHEAR_COEFF0_BIT, 4, u64::from(self.shear.coeff0))?;
            packer.set_bits(SHEAR_COEFF1_BIT, 4, u64::from(self.shear.coeff1))?;
        } else if self.relative_leaf_pointers {
            let offset = leaf.map_or(0, |address| address as i64 - record_address as i64);
            packer.set_signed(LEAF_POINTER_BIT, 32, offset)?;
        } else {
            let address = leaf.unwrap_or(0);
            check_pointer("leaf pointer", address, POINTER_BITS)?;
            packer.set_bits(LEAF_POINTER_BIT, POINTER_BITS, address)?;
        }
        Ok(())
    }

    fn write_complet_pointers(
        &self,
        packer: &mut LinePacker,
        pointers: &RecordPointers,
        record_address: u64,
    ) -> EncodeResult<()> {
        packer.set_bits(PARENT_LEAF_INDEX_BIT, 4, u64::from(pointers.parent_leaf_index))?;

        if self.relative_complet_pointers {
            let relative = |address: Option<u64>| {
                address.map_or(0, |address| address as i64 - record_address as i64)
            };
            packer.set_signed(PARENT_BIT, 32, relative(pointers.parent))?;
            packer.set_signed(CHILD_BIT, 32, relative(pointers.first_child))?;
            return Ok(());
        }

        for (address, low_bit, high_bit, field) in [
            (pointers.parent, PARENT_BIT, PARENT_HIGH_BIT, "parent pointer"),
            (pointers.first_child, CHILD_BIT, CHILD_HIGH_BIT, "child pointer"),
        ] {
            let address = address.unwrap_or(0);
            check_pointer(field, address, POINTER_BITS)?;
            packer.set_bits(low_bit, 32, address)?;
            packer.set_bits(high_bit, POINTER_HIGH_BITS, address >> 32)?;
        }
        Ok(())
    }
}

/// Largest float `<= value` whose bit pattern has a clear LSB.
#[must_use]
pub fn round_down_even(value: f32) -> f32 {
    let bits = value.to_bits();
    if bits & 1 == 0 {
        return value;
    }
    if value.is_sign_negative() {
        // One more ulp of magnitude, which also clears the LSB.
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits & !1)
    }
}

fn check_pointer(field: &'static str, address: u64, bits: usize) -> EncodeResult<()> {
    if address >> bits == 0 {
        Ok(())
    } else {
        Err(EncodeError::OutOfRange {
            field,
            start: 0,
            size: crate::bits::bit_width(address) as usize,
            capacity: bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::triangles::{BatchOptions, TriangleBatch};

    fn unit_box() -> BoundingBox {
        BoundingBox::from_array([-1.0, -1.0, -1.0, 1.0, 1.0, 1.0])
    }

    #[test]
    fn capacity_depends_on_format_and_target() {
        assert_eq!(Target::Gen3.max_children(Format::Standard), 11);
        assert_eq!(Target::Gen2.max_children(Format::Standard), 10);
        assert_eq!(Target::Gen3.max_children(Format::MotionBlur), 5);
    }

    #[test]
    fn rejects_one_child_too_many() {
        let mut arena = Arena::with_capacity("batches", 12);
        let mut node =
            Complet::new(Target::Gen2, Format::Standard, LeafKind::TriangleBatch, unit_box(), true)
                .unwrap();
        for _ in 0..10 {
            let id = arena.push(TriangleBatch::new(BatchOptions::default())).unwrap();
            node.add_child_triangle_batch(id).unwrap();
        }
        let extra = arena.push(TriangleBatch::new(BatchOptions::default())).unwrap();
        assert_eq!(
            node.add_child_triangle_batch(extra),
            Err(EncodeError::TooManyChildren {
                max: 10,
                format: "standard"
            })
        );
        assert_eq!(node.children().len(), 10);
    }

    #[test]
    fn rejects_wrong_leaf_kind() {
        let mut arena = Arena::with_capacity("batches", 1);
        let id = arena.push(TriangleBatch::new(BatchOptions::default())).unwrap();
        let mut node =
            Complet::new(Target::Gen3, Format::Standard, LeafKind::Micromesh, unit_box(), false)
                .unwrap();
        assert!(matches!(
            node.add_child_triangle_batch(id),
            Err(EncodeError::MixedLeafKinds { .. })
        ));
        assert!(node.children().is_empty());
    }

    #[test]
    fn target_gates_features() {
        assert!(matches!(
            Complet::new(Target::Gen1, Format::MotionBlur, LeafKind::None, unit_box(), true),
            Err(EncodeError::UnsupportedFeatureForTarget { .. })
        ));
        let node =
            Complet::new(Target::Gen2, Format::Standard, LeafKind::None, unit_box(), true).unwrap();
        let shear = ShearData::new(ShearSelect::XZ, 3, 12, 5).unwrap();
        assert!(node.with_shear(shear).is_err());
    }

    #[test]
    fn shear_fields_are_range_checked() {
        assert!(ShearData::new(ShearSelect::XY, 16, 0, 0).is_err());
        assert!(ShearData::new(ShearSelect::XY, 0, 0, 8).is_err());
        let shear = ShearData::new(ShearSelect::YZ, 0, 15, 7).unwrap();
        assert_eq!(shear.slopes(), (-2.0, 2.0));
    }

    #[test]
    fn round_down_even_is_conservative() {
        for value in [1.0f32, -1.0, 0.1, -0.1, 3.3, -3.3, 1.0e-3, -7.77] {
            let rounded = round_down_even(value);
            assert!(rounded <= value);
            assert_eq!(rounded.to_bits() & 1, 0);
        }
    }

    #[test]
    fn empty_record_layout() {
        let node =
            Complet::new(Target::Gen3, Format::Standard, LeafKind::None, unit_box(), true).unwrap();
        let bytes = node
            .encode_record(&[], &RecordPointers::default(), 0)
            .unwrap()
            .to_le_bytes();
        assert_eq!(bytes[0], 0);
        // Edge length 2.0 on every axis.
        assert_eq!(&bytes[1..4], &[128, 128, 128]);
        assert_eq!(&bytes[4..8], &(-1.0f32).to_le_bytes());
        for slot in 0..MAX_SLOTS {
            let start = 32 + slot * 8;
            assert_eq!(&bytes[start..start + 8], &ChildSlot::INVALID.to_bytes());
        }
    }

    #[test]
    fn motion_blur_children_take_two_slots() {
        let node = Complet::new(
            Target::Gen3,
            Format::MotionBlur,
            LeafKind::TriangleBatch,
            unit_box(),
            true,
        )
        .unwrap();
        let start = BoundingBox::from_array([-1.0, -1.0, -1.0, 0.0, 0.0, 0.0]);
        let end = BoundingBox::from_array([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let bytes = node
            .encode_record(
                &[ChildBounds {
                    start,
                    end,
                    data: 2,
                }],
                &RecordPointers::default(),
                0,
            )
            .unwrap()
            .to_le_bytes();
        assert_eq!(bytes[0] >> 4, 1);
        assert_eq!(&bytes[32..40], &[0, 0, 0, 127, 127, 127, 0xFF, 2]);
        assert_eq!(&bytes[40..48], &[128, 128, 128, 255, 255, 255, 0xFF, 2]);
        assert_eq!(&bytes[48..56], &ChildSlot::INVALID.to_bytes());
    }
    #[test]
    fn sheared_leaf_pointer_fields() {
        let shear = ShearData::new(ShearSelect::YZ, 5, 9, 0).unwrap();
        let node = Complet::new(Target::Gen3, Format::Standard, LeafKind::None, unit_box(), true)
            .unwrap()
            .with_shear(shear)
            .unwrap()
            .with_relative_pointers(true, false);
        // Shear takes the leaf pointer word, so the relative flag is dropped.
        assert_eq!(node.mode() & 0b100, 0);

        let pointers = RecordPointers {
            leaf: Some(0x1234_5680),
            ..RecordPointers::default()
        };
        let packer = node.encode_record(&[], &pointers, 0).unwrap();
        assert_eq!(packer.get_bits(LEAF_POINTER_BIT, 44).unwrap(), 0x1234_5680);
        assert!(packer.get_bit(SHEAR_ENABLE_BIT).unwrap());
        assert_eq!(packer.get_bits(SHEAR_SELECT_BIT, 2).unwrap(), 2);
        assert_eq!(packer.get_bits(SHEAR_COEFF0_BIT, 4).unwrap(), 5);
        assert_eq!(packer.get_bits(SHEAR_COEFF1_BIT, 4).unwrap(), 9);
    }

    #[test]
    fn micromesh_origin_carries_exponent_offset() {
        let bounds = BoundingBox::from_array([0.1, -0.1, 1.0, 2.0, 2.0, 2.0]);
        let shear = ShearData::new(ShearSelect::XY, 0, 0, 0b101).unwrap();
        let node = Complet::new(Target::Gen3, Format::Standard, LeafKind::Micromesh, bounds, true)
            .unwrap()
            .with_shear(shear)
            .unwrap();
        let packer = node
            .encode_record(&[], &RecordPointers::default(), 0)
            .unwrap();

        let origin = node.origin();
        for axis in 0..3 {
            let stored = packer.get_bits(ORIGIN_BIT + axis * 32, 32).unwrap() as u32;
            assert_eq!(stored & !1, origin[axis].to_bits());
            assert_eq!(stored & 1, u32::from((0b101u8 >> axis) & 1));
            assert!(origin[axis] <= bounds.min[axis]);
        }
    }

    #[test]
    fn relative_and_absolute_pointers() {
        let node = Complet::new(Target::Gen3, Format::Standard, LeafKind::None, unit_box(), false)
            .unwrap()
            .with_relative_pointers(true, true);
        let pointers = RecordPointers {
            leaf: Some(0x200),
            first_child: Some(0x400),
            parent: Some(0x80),
            parent_leaf_index: 7,
        };
        let packer = node.encode_record(&[], &pointers, 0x300).unwrap();
        assert_eq!(node.mode(), 0b1100);
        assert_eq!(packer.get_signed(LEAF_POINTER_BIT, 32).unwrap(), -0x100);
        assert_eq!(packer.get_signed(PARENT_BIT, 32).unwrap(), -0x280);
        assert_eq!(packer.get_signed(CHILD_BIT, 32).unwrap(), 0x100);
        assert_eq!(packer.get_bits(PARENT_LEAF_INDEX_BIT, 4).unwrap(), 7);

        let absolute =
            Complet::new(Target::Gen3, Format::Standard, LeafKind::None, unit_box(), false).unwrap();
        let far = RecordPointers {
            parent: Some(0x1_2345_6789),
            ..pointers
        };
        let packer = absolute.encode_record(&[], &far, 0x300).unwrap();
        assert_eq!(packer.get_bits(PARENT_BIT, 32).unwrap(), 0x2345_6789);
        assert_eq!(packer.get_bits(PARENT_HIGH_BIT, 17).unwrap(), 1);

        let too_far = RecordPointers {
            leaf: Some(1 << 49),
            ..pointers
        };
        assert!(matches!(
            absolute.encode_record(&[], &too_far, 0),
            Err(EncodeError::OutOfRange { .. })
        ));
    }
}
