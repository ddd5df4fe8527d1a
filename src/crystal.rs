//! Crystal data model (spec §3 "Crystal").

use crate::cell::UnitCell;
use crate::error::CrystalFlag;
use crate::reflection::ReflectionList;

/// One indexed lattice found in an image. Borrows nothing from its
/// parent image; beam parameters used during prediction are passed in
/// explicitly rather than held by reference, since crystals outlive
/// the per-worker image buffer once they reach the scaling stage.
#[derive(Clone, Debug)]
pub struct Crystal {
    pub cell: UnitCell,
    pub reflections: ReflectionList,
    /// Reciprocal-space profile radius, m^-1.
    pub profile_radius: f64,
    pub mosaicity: f64,
    /// Per-crystal scale factor.
    pub scale: f64,
    /// Debye-Waller B factor.
    pub b_factor: f64,
    pub detector_shift: (f64, f64),
    pub flags: Vec<CrystalFlag>,
    /// Serial of the image this crystal was indexed from.
    pub image_serial: u64,
}

impl Crystal {
    pub fn new(cell: UnitCell, image_serial: u64) -> Self {
        Self {
            cell,
            reflections: ReflectionList::new(),
            profile_radius: 1e6,
            mosaicity: 0.0,
            scale: 1.0,
            b_factor: 0.0,
            detector_shift: (0.0, 0.0),
            flags: Vec::new(),
            image_serial,
        }
    }

    pub fn flag(&mut self, f: CrystalFlag) {
        if !self.flags.contains(&f) {
            self.flags.push(f);
        }
    }

    pub fn has_flag(&self, f: CrystalFlag) -> bool {
        self.flags.contains(&f)
    }

    /// Deep copy, used by post-refinement's per-evaluation clone
    /// (spec §4.12: "clones the crystal").
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn new_crystal_has_no_flags() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let crystal = Crystal::new(cell, 7);
        assert!(crystal.flags.is_empty());
        assert_eq!(crystal.image_serial, 7);
    }

    #[test]
    fn flag_is_idempotent() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let mut crystal = Crystal::new(cell, 0);
        crystal.flag(CrystalFlag::FewRefl);
        crystal.flag(CrystalFlag::FewRefl);
        assert_eq!(crystal.flags.len(), 1);
    }

    #[test]
    fn deep_copy_is_independent() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let mut crystal = Crystal::new(cell, 0);
        let mut copy = crystal.deep_copy();
        copy.scale = 2.0;
        crystal.scale = 3.0;
        assert_eq!(copy.scale, 2.0);
        assert_eq!(crystal.scale, 3.0);
    }
}
