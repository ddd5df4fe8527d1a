//! Unit cell: multi-representation storage with on-demand conversion
//! (spec §3 "Unit cell", §4.2).
//!
//! Only one representation is ever stored; the others are derived on
//! demand. Spec §9 is explicit that this is the deliberate opposite of
//! the teacher's `map.rs::UnitCell`, which caches all three forms
//! (`a,b,c,alpha,beta,gamma` *and* `ortho` *and* `ortho_inv`) and hopes
//! they stay consistent — the bug-prone approach spec §9 calls out by
//! name.

use lin_alg::f64::Vec3;

use crate::error::{PipelineError, Result};
use crate::rational::{IntMatrix, RationalMatrix};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LatticeType {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Rhombohedral,
    Hexagonal,
    Cubic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Centering {
    P,
    A,
    B,
    C,
    I,
    F,
    R,
    H,
}

impl Centering {
    pub fn letter(&self) -> char {
        match self {
            Self::P => 'P',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::I => 'I',
            Self::F => 'F',
            Self::R => 'R',
            Self::H => 'H',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniqueAxis {
    A,
    B,
    C,
    /// `*`: irrelevant for this lattice type (cubic, rhombohedral, ...).
    Star,
    /// `?`: not yet determined.
    Unknown,
}

/// Result of checking a `(lattice_type, centering, unique_axis)`
/// triple for consistency (spec §4.2 invariants).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellValidation {
    Ok,
    Warn(String),
    Fatal(String),
}

impl CellValidation {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[derive(Clone, Copy, Debug)]
enum StoredRepr {
    /// `a, b, c` in metres; `alpha, beta, gamma` in radians.
    Crystallographic {
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    },
    DirectCartesian { a: Vec3, b: Vec3, c: Vec3 },
    ReciprocalCartesian { astar: Vec3, bstar: Vec3, cstar: Vec3 },
}

#[derive(Clone, Copy, Debug)]
pub struct UnitCell {
    repr: Option<StoredRepr>,
    lattice_type: LatticeType,
    centering: Centering,
    unique_axis: UniqueAxis,
}

impl UnitCell {
    fn bare(repr: Option<StoredRepr>) -> Self {
        Self {
            repr,
            lattice_type: LatticeType::Triclinic,
            centering: Centering::P,
            unique_axis: UniqueAxis::Unknown,
        }
    }

    /// A cell with no parameters set yet (spec §4.2: getters on this
    /// must error until one of the `new_from_*` constructors runs).
    pub fn uninitialized() -> Self {
        Self::bare(None)
    }

    pub fn new_from_parameters(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self::bare(Some(StoredRepr::Crystallographic {
            a,
            b,
            c,
            alpha,
            beta,
            gamma,
        }))
    }

    pub fn new_from_direct_axes(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self::bare(Some(StoredRepr::DirectCartesian { a, b, c }))
    }

    pub fn new_from_reciprocal_axes(astar: Vec3, bstar: Vec3, cstar: Vec3) -> Self {
        Self::bare(Some(StoredRepr::ReciprocalCartesian {
            astar,
            bstar,
            cstar,
        }))
    }

    pub fn has_parameters(&self) -> bool {
        self.repr.is_some()
    }

    fn require(&self) -> Result<StoredRepr> {
        self.repr.ok_or(PipelineError::BadCell { image_serial: None })
    }

    /// The direct-axis Cartesian triple, converting from whichever
    /// representation is stored. Convention (spec §4.2): `a` parallel
    /// to x-hat, `b` in the xy-plane, `c` completed right-handed —
    /// the same convention the teacher's `map.rs::UnitCell::new` uses.
    pub fn direct_cartesian(&self) -> Result<(Vec3, Vec3, Vec3)> {
        match self.require()? {
            StoredRepr::DirectCartesian { a, b, c } => Ok((a, b, c)),
            StoredRepr::Crystallographic {
                a,
                b,
                c,
                alpha,
                beta,
                gamma,
            } => Ok(crystallographic_to_cartesian(a, b, c, alpha, beta, gamma)),
            StoredRepr::ReciprocalCartesian {
                astar,
                bstar,
                cstar,
            } => Ok(reciprocal_to_direct(astar, bstar, cstar)),
        }
    }

    pub fn reciprocal_cartesian(&self) -> Result<(Vec3, Vec3, Vec3)> {
        match self.require()? {
            StoredRepr::ReciprocalCartesian {
                astar,
                bstar,
                cstar,
            } => Ok((astar, bstar, cstar)),
            _ => {
                let (a, b, c) = self.direct_cartesian()?;
                Ok(direct_to_reciprocal(a, b, c))
            }
        }
    }

    /// `(a, b, c, alpha, beta, gamma)`, lengths in metres, angles in
    /// radians.
    pub fn parameters(&self) -> Result<(f64, f64, f64, f64, f64, f64)> {
        match self.require()? {
            StoredRepr::Crystallographic {
                a,
                b,
                c,
                alpha,
                beta,
                gamma,
            } => Ok((a, b, c, alpha, beta, gamma)),
            _ => {
                let (va, vb, vc) = self.direct_cartesian()?;
                Ok(cartesian_to_parameters(va, vb, vc))
            }
        }
    }

    pub fn lattice_type(&self) -> LatticeType {
        self.lattice_type
    }

    pub fn set_lattice_type(&mut self, t: LatticeType) {
        self.lattice_type = t;
    }

    pub fn centering(&self) -> Centering {
        self.centering
    }

    pub fn set_centering(&mut self, c: Centering) {
        self.centering = c;
    }

    pub fn unique_axis(&self) -> UniqueAxis {
        self.unique_axis
    }

    pub fn set_unique_axis(&mut self, u: UniqueAxis) {
        self.unique_axis = u;
    }

    /// Cell volume in cubic metres, from the reciprocal triple
    /// product (`original_source/cell-utils.c:cell_get_volume`).
    pub fn volume(&self) -> Result<f64> {
        let (astar, bstar, cstar) = self.reciprocal_cartesian()?;
        let rec_volume = astar.cross(bstar).dot(cstar);
        if rec_volume.abs() < 1e-300 {
            return Ok(f64::INFINITY);
        }
        Ok(1.0 / rec_volume)
    }

    /// `(a* x b*) . c* > 0` (spec §4.3.4). The direct-space test must
    /// agree; `right_handed_direct` checks that invariant.
    pub fn is_right_handed(&self) -> Result<bool> {
        let (astar, bstar, cstar) = self.reciprocal_cartesian()?;
        Ok(astar.cross(bstar).dot(cstar) > 0.0)
    }

    pub fn is_right_handed_direct(&self) -> Result<bool> {
        let (a, b, c) = self.direct_cartesian()?;
        Ok(a.cross(b).dot(c) > 0.0)
    }

    /// Apply an integer basis change to the direct axes: `new = M *
    /// old` (spec §4.2). Per spec §9's first open question, this does
    /// *not* re-derive `lattice_type`/`unique_axis`/`centering` — the
    /// caller must.
    pub fn transform(&self, m: &IntMatrix) -> Result<UnitCell> {
        self.transform_rational(&m.to_rational())
    }

    pub fn transform_inverse(&self, m: &IntMatrix) -> Result<UnitCell> {
        let inv = m.to_rational().inverse()?;
        self.transform_rational(&inv)
    }

    pub fn transform_rational(&self, m: &RationalMatrix) -> Result<UnitCell> {
        let (a, b, c) = self.direct_cartesian()?;
        let mf = m.to_f64();
        let (na, nb, nc) = apply_basis_change(mf, a, b, c);
        let mut out = UnitCell::new_from_direct_axes(na, nb, nc);
        // Centering/lattice/unique-axis are deliberately left as the
        // bare defaults; `cell_utils::centering_transformation`
        // callers overwrite them explicitly.
        out.lattice_type = self.lattice_type;
        out.centering = self.centering;
        out.unique_axis = self.unique_axis;
        Ok(out)
    }

    /// Validate `(lattice_type, centering, unique_axis)` (spec §4.2).
    pub fn validate_centering(&self) -> CellValidation {
        use Centering::*;
        use LatticeType::*;

        let allowed: &[Centering] = match self.lattice_type {
            Triclinic => &[P],
            Monoclinic => &[P, A, B, C],
            Orthorhombic => &[P, A, B, C, I, F],
            Tetragonal => &[P, I],
            Rhombohedral => &[R],
            Hexagonal => &[P, H],
            Cubic => &[P, I, F],
        };
        if !allowed.contains(&self.centering) {
            return CellValidation::Fatal(format!(
                "centering {:?} is not valid for lattice type {:?}",
                self.centering, self.lattice_type
            ));
        }

        if self.lattice_type == Monoclinic {
            let clash = match (self.centering, self.unique_axis) {
                (A, UniqueAxis::A) => true,
                (B, UniqueAxis::B) => true,
                (C, UniqueAxis::C) => true,
                _ => false,
            };
            if clash {
                return CellValidation::Fatal(
                    "monoclinic unique axis may not coincide with the centering letter"
                        .to_string(),
                );
            }
        }

        if matches!(self.centering, A | B | C)
            && !matches!(self.lattice_type, Monoclinic | Orthorhombic)
        {
            return CellValidation::Warn(format!(
                "{:?} centering is unusual outside monoclinic/orthorhombic",
                self.centering
            ));
        }

        CellValidation::Ok
    }
}

fn apply_basis_change(m: [[f64; 3]; 3], a: Vec3, b: Vec3, c: Vec3) -> (Vec3, Vec3, Vec3) {
    let row = |r: usize| a * m[r][0] + b * m[r][1] + c * m[r][2];
    (row(0), row(1), row(2))
}

fn crystallographic_to_cartesian(
    a: f64,
    b: f64,
    c: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
) -> (Vec3, Vec3, Vec3) {
    let v_a = Vec3::new(a, 0.0, 0.0);
    let v_b = Vec3::new(b * gamma.cos(), b * gamma.sin(), 0.0);

    let cx = c * beta.cos();
    let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
    let cz_sq = 1.0 - beta.cos().powi(2) - (cy / c).powi(2);
    let cz = c * cz_sq.max(0.0).sqrt();
    let v_c = Vec3::new(cx, cy, cz);

    (v_a, v_b, v_c)
}

fn cartesian_to_parameters(a: Vec3, b: Vec3, c: Vec3) -> (f64, f64, f64, f64, f64, f64) {
    let al = a.magnitude();
    let bl = b.magnitude();
    let cl = c.magnitude();
    let alpha = (b.dot(c) / (bl * cl)).clamp(-1.0, 1.0).acos();
    let beta = (a.dot(c) / (al * cl)).clamp(-1.0, 1.0).acos();
    let gamma = (a.dot(b) / (al * bl)).clamp(-1.0, 1.0).acos();
    (al, bl, cl, alpha, beta, gamma)
}

/// `a* = (b x c)/V`, and cyclic permutations, `V = a . (b x c)`.
fn direct_to_reciprocal(a: Vec3, b: Vec3, c: Vec3) -> (Vec3, Vec3, Vec3) {
    let v = a.dot(b.cross(c));
    (b.cross(c) * (1.0 / v), c.cross(a) * (1.0 / v), a.cross(b) * (1.0 / v))
}

fn reciprocal_to_direct(astar: Vec3, bstar: Vec3, cstar: Vec3) -> (Vec3, Vec3, Vec3) {
    // The reciprocal-of-the-reciprocal is the direct lattice again.
    let vstar = astar.dot(bstar.cross(cstar));
    (
        bstar.cross(cstar) * (1.0 / vstar),
        cstar.cross(astar) * (1.0 / vstar),
        astar.cross(bstar) * (1.0 / vstar),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn cubic_round_trip_cartesian() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let (a, b, c) = cell.direct_cartesian().unwrap();
        let back = UnitCell::new_from_direct_axes(a, b, c);
        let (pa, pb, pc, al, be, ga) = back.parameters().unwrap();
        assert!(approx(pa, 5e-10, 1e-12));
        assert!(approx(pb, 5e-10, 1e-12));
        assert!(approx(pc, 5e-10, 1e-12));
        assert!(approx(al, FRAC_PI_2, 1e-12));
        assert!(approx(be, FRAC_PI_2, 1e-12));
        assert!(approx(ga, FRAC_PI_2, 1e-12));
    }

    #[test]
    fn triclinic_round_trip_cartesian() {
        let cell = UnitCell::new_from_parameters(
            5e-10,
            6e-10,
            7e-10,
            80f64.to_radians(),
            95f64.to_radians(),
            100f64.to_radians(),
        );
        let (a, b, c) = cell.direct_cartesian().unwrap();
        let back = UnitCell::new_from_direct_axes(a, b, c);
        let (pa, pb, pc, al, be, ga) = back.parameters().unwrap();
        assert!(approx(pa, 5e-10, 1e-12));
        assert!(approx(pb, 6e-10, 1e-12));
        assert!(approx(pc, 7e-10, 1e-12));
        assert!(approx(al, 80f64.to_radians(), 1e-9));
        assert!(approx(be, 95f64.to_radians(), 1e-9));
        assert!(approx(ga, 100f64.to_radians(), 1e-9));
    }

    #[test]
    fn reciprocal_round_trip() {
        let cell = UnitCell::new_from_parameters(5e-10, 6e-10, 7e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let (astar, bstar, cstar) = cell.reciprocal_cartesian().unwrap();
        let rec_cell = UnitCell::new_from_reciprocal_axes(astar, bstar, cstar);
        let (a, b, c) = rec_cell.direct_cartesian().unwrap();
        let (oa, ob, oc) = cell.direct_cartesian().unwrap();
        assert!(approx((a - oa).magnitude(), 0.0, 1e-18));
        assert!(approx((b - ob).magnitude(), 0.0, 1e-18));
        assert!(approx((c - oc).magnitude(), 0.0, 1e-18));
    }

    #[test]
    fn right_handedness_agrees() {
        let cell = UnitCell::new_from_parameters(
            5e-10,
            6e-10,
            7e-10,
            85f64.to_radians(),
            95f64.to_radians(),
            100f64.to_radians(),
        );
        assert_eq!(
            cell.is_right_handed().unwrap(),
            cell.is_right_handed_direct().unwrap()
        );
        assert!(cell.is_right_handed().unwrap());
    }

    #[test]
    fn uninitialized_cell_errors() {
        let cell = UnitCell::uninitialized();
        assert!(!cell.has_parameters());
        assert!(cell.parameters().is_err());
    }

    #[test]
    fn monoclinic_unique_axis_clash_is_fatal() {
        let mut cell = UnitCell::new_from_parameters(
            5e-10,
            6e-10,
            7e-10,
            FRAC_PI_2,
            95f64.to_radians(),
            FRAC_PI_2,
        );
        cell.set_lattice_type(LatticeType::Monoclinic);
        cell.set_centering(Centering::C);
        cell.set_unique_axis(UniqueAxis::C);
        assert!(cell.validate_centering().is_fatal());
    }

    #[test]
    fn tetragonal_f_centering_is_fatal() {
        let mut cell = UnitCell::new_from_parameters(5e-10, 5e-10, 7e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        cell.set_lattice_type(LatticeType::Tetragonal);
        cell.set_centering(Centering::F);
        assert!(cell.validate_centering().is_fatal());
    }
}
