//! Cell utilities: centering transforms, forbidden reflections,
//! resolution, matching, comparison (spec §4.3).

use lin_alg::f64::Vec3;

use crate::cell::{Centering, LatticeType, UniqueAxis, UnitCell};
use crate::error::{PipelineError, Result};
use crate::rational::{IntMatrix, RationalMatrix};
use crate::reflection::MillerIndex;

/// `|x - y| <= pct/100 * x` (spec §4.3.6).
pub fn within_tolerance(x: f64, y: f64, pct: f64) -> bool {
    (x - y).abs() <= (pct / 100.0) * x.abs()
}

/// Length/angle tolerances for `match_cell` (spec §4.3.5).
#[derive(Clone, Copy, Debug)]
pub struct MatchTolerances {
    /// Per-axis fractional length tolerance, percent.
    pub length_pct: [f64; 3],
    /// Angular tolerance, radians.
    pub angle_rad: f64,
}

/// The table in International Tables Table 5.1.3.1, transcribed
/// directly from `original_source/libcrystfel/src/cell-utils.c`'s
/// `centering_transformation`. `C` takes the primitive cell to the
/// centered one; `C^-1` does the inverse.
pub struct CenteringTransform {
    pub c: IntMatrix,
    pub c_inv: RationalMatrix,
    pub primitive_lattice_type: LatticeType,
    pub primitive_centering: Centering,
    pub primitive_unique_axis: UniqueAxis,
}

pub fn centering_transformation(cell: &UnitCell) -> Result<CenteringTransform> {
    use Centering::*;
    use LatticeType::*;

    let lt = cell.lattice_type();
    let ua = cell.unique_axis();
    let cen = cell.centering();

    let identity = CenteringTransform {
        c: IntMatrix::identity(),
        c_inv: RationalMatrix::identity(),
        primitive_lattice_type: lt,
        primitive_centering: cen,
        primitive_unique_axis: ua,
    };

    let centered_or_triclinic = |lt: LatticeType| {
        if lt == Cubic {
            (Rhombohedral, R, UniqueAxis::Star)
        } else {
            (Triclinic, P, UniqueAxis::Star)
        }
    };

    Ok(match cen {
        P | R => identity,
        I => {
            let (plt, pcen, pua) = centered_or_triclinic(lt);
            CenteringTransform {
                c: IntMatrix::new([[0, 1, 1], [1, 0, 1], [1, 1, 0]]),
                c_inv: RationalMatrix::from_pairs([
                    [(-1, 2), (1, 2), (1, 2)],
                    [(1, 2), (-1, 2), (1, 2)],
                    [(1, 2), (1, 2), (-1, 2)],
                ]),
                primitive_lattice_type: plt,
                primitive_centering: pcen,
                primitive_unique_axis: pua,
            }
        }
        F => {
            let (plt, pcen, pua) = centered_or_triclinic(lt);
            CenteringTransform {
                c: IntMatrix::new([[-1, 1, 1], [1, -1, 1], [1, 1, -1]]),
                c_inv: RationalMatrix::from_pairs([
                    [(0, 1), (1, 2), (1, 2)],
                    [(1, 2), (0, 1), (1, 2)],
                    [(1, 2), (1, 2), (0, 1)],
                ]),
                primitive_lattice_type: plt,
                primitive_centering: pcen,
                primitive_unique_axis: pua,
            }
        }
        H if lt == Hexagonal && ua == UniqueAxis::C => CenteringTransform {
            c: IntMatrix::new([[1, 0, 1], [-1, 1, 1], [0, -1, 1]]),
            c_inv: RationalMatrix::from_pairs([
                [(2, 3), (-1, 3), (-1, 3)],
                [(1, 3), (1, 3), (-2, 3)],
                [(1, 3), (1, 3), (1, 3)],
            ]),
            primitive_lattice_type: Rhombohedral,
            primitive_centering: R,
            primitive_unique_axis: UniqueAxis::Star,
        },
        H => {
            return Err(PipelineError::ParseError {
                kind: "cell",
                path: None,
                reason: "H centering requires a hexagonal cell with unique axis c".into(),
            });
        }
        A => {
            let (plt, pua) = if lt == Orthorhombic {
                (Monoclinic, UniqueAxis::A)
            } else {
                (Triclinic, UniqueAxis::Star)
            };
            CenteringTransform {
                c: IntMatrix::new([[1, 0, 0], [0, 1, 1], [0, -1, 1]]),
                c_inv: RationalMatrix::from_pairs([
                    [(1, 1), (0, 1), (0, 1)],
                    [(0, 1), (1, 2), (-1, 2)],
                    [(0, 1), (1, 2), (1, 2)],
                ]),
                primitive_lattice_type: plt,
                primitive_centering: P,
                primitive_unique_axis: pua,
            }
        }
        B => {
            let (plt, pua) = if lt == Orthorhombic {
                (Monoclinic, UniqueAxis::B)
            } else {
                (Triclinic, UniqueAxis::Star)
            };
            CenteringTransform {
                c: IntMatrix::new([[1, 0, 1], [0, 1, 0], [-1, 0, 1]]),
                c_inv: RationalMatrix::from_pairs([
                    [(1, 2), (0, 1), (-1, 2)],
                    [(0, 1), (1, 1), (0, 1)],
                    [(1, 2), (0, 1), (1, 2)],
                ]),
                primitive_lattice_type: plt,
                primitive_centering: P,
                primitive_unique_axis: pua,
            }
        }
        C => {
            let (plt, pua) = if lt == Orthorhombic {
                (Monoclinic, UniqueAxis::C)
            } else {
                (Triclinic, UniqueAxis::Star)
            };
            CenteringTransform {
                c: IntMatrix::new([[1, 1, 0], [-1, 1, 0], [0, 0, 1]]),
                c_inv: RationalMatrix::from_pairs([
                    [(1, 2), (-1, 2), (0, 1)],
                    [(1, 2), (1, 2), (0, 1)],
                    [(0, 1), (0, 1), (1, 1)],
                ]),
                primitive_lattice_type: plt,
                primitive_centering: P,
                primitive_unique_axis: pua,
            }
        }
    })
}

/// Turn any cell into a primitive one (spec §4.3.1). Returns the
/// primitive cell plus `(C, C^-1)` so the caller can restore the
/// original setting.
pub fn uncenter_cell(cell: &UnitCell) -> Result<(UnitCell, IntMatrix, RationalMatrix)> {
    let t = centering_transformation(cell)?;
    let mut out = cell.transform_rational(&t.c_inv)?;
    out.set_lattice_type(t.primitive_lattice_type);
    out.set_centering(t.primitive_centering);
    out.set_unique_axis(t.primitive_unique_axis);
    Ok((out, t.c, t.c_inv))
}

/// Re-apply a centering transform produced by [`uncenter_cell`],
/// restoring the original lattice type/centering/unique axis.
pub fn recenter_cell(
    primitive: &UnitCell,
    c: &IntMatrix,
    lattice_type: LatticeType,
    centering: Centering,
    unique_axis: UniqueAxis,
) -> Result<UnitCell> {
    let mut out = primitive.transform(c)?;
    out.set_lattice_type(lattice_type);
    out.set_centering(centering);
    out.set_unique_axis(unique_axis);
    Ok(out)
}

/// True if `(h,k,l)` is forbidden by centering symmetry alone (spec
/// §4.3.2), matching
/// `original_source/libcrystfel/src/cell-utils.c:forbidden_reflection`.
pub fn is_forbidden(idx: MillerIndex, centering: Centering) -> bool {
    let (h, k, l) = (idx.h, idx.k, idx.l);
    let odd = |n: i32| n.rem_euclid(2) != 0;
    match centering {
        Centering::P | Centering::R => false,
        Centering::A => odd(k + l),
        Centering::B => odd(h + l),
        Centering::C => odd(h + k),
        Centering::I => odd(h + k + l),
        Centering::F => odd(h + k) || odd(h + l) || odd(k + l),
        Centering::H => (-h + k + l).rem_euclid(3) != 0,
    }
}

/// `sin(theta)/lambda = 1/(2d)` (spec §4.3.3), matching
/// `original_source/libcrystfel/src/cell-utils.c:resolution`.
pub fn resolution(cell: &UnitCell, idx: MillerIndex) -> Result<f64> {
    let (a, b, c, alpha, beta, gamma) = cell.parameters()?;
    let (h, k, l) = (idx.h as f64, idx.k as f64, idx.l as f64);

    let (ca, cb, cg) = (alpha.cos(), beta.cos(), gamma.cos());
    let (sa, sb, sg) = (alpha.sin(), beta.sin(), gamma.sin());

    let v_sq = a * a * b * b * c * c * (1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg);

    if v_sq.abs() < 1e-300 {
        return Ok(f64::INFINITY);
    }

    let s11 = b * b * c * c * sa * sa;
    let s22 = a * a * c * c * sb * sb;
    let s33 = a * a * b * b * sg * sg;
    let s12 = a * b * c * c * (ca * cb - cg);
    let s23 = a * a * b * c * (cb * cg - ca);
    let s13 = a * b * b * c * (cg * ca - cb);

    let brackets =
        s11 * h * h + s22 * k * k + s33 * l * l + 2.0 * s12 * h * k + 2.0 * s23 * k * l + 2.0 * s13 * h * l;
    let one_over_d_sq = brackets / v_sq;
    if one_over_d_sq < 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(one_over_d_sq.sqrt() / 2.0)
}

fn angle_between(a: Vec3, b: Vec3) -> f64 {
    (a.dot(b) / (a.magnitude() * b.magnitude())).clamp(-1.0, 1.0).acos()
}

/// Candidate linear combination of the input reciprocal axes, tracked
/// for `match_cell`.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    vec: Vec3,
    coeffs: (f64, f64, f64),
    fom: f64,
}

/// Enumerate candidate coefficients: `{0, +-1}` by default, or with
/// `reduce`, also `+-1/2, +-1/3, +-1/4` and `+-2, +-3, +-4` (spec
/// §4.3.5).
fn candidate_coeffs(reduce: bool) -> Vec<f64> {
    if !reduce {
        vec![-1.0, 0.0, 1.0]
    } else {
        let mut v = vec![0.0];
        for n in 1..=4i32 {
            v.push(n as f64);
            v.push(-(n as f64));
            v.push(1.0 / n as f64);
            v.push(-1.0 / n as f64);
        }
        v
    }
}

/// Find candidates whose length matches `target_len` within
/// `tol_pct`, for one template axis.
fn find_axis_candidates(
    astar: Vec3,
    bstar: Vec3,
    cstar: Vec3,
    target_len: f64,
    tol_pct: f64,
    reduce: bool,
) -> Vec<Candidate> {
    let coeffs = candidate_coeffs(reduce);
    let mut out = Vec::new();
    for &n1 in &coeffs {
        for &n2 in &coeffs {
            for &n3 in &coeffs {
                if n1 == 0.0 && n2 == 0.0 && n3 == 0.0 {
                    continue;
                }
                let v = astar * n1 + bstar * n2 + cstar * n3;
                let len = v.magnitude();
                if within_tolerance(target_len, len, tol_pct) {
                    out.push(Candidate {
                        vec: v,
                        coeffs: (n1, n2, n3),
                        fom: (target_len - len).abs(),
                    });
                }
            }
        }
    }
    out
}

fn same_candidate(a: &Candidate, b: &Candidate) -> bool {
    a.coeffs == b.coeffs
}

/// Figure-of-merit weight on length error relative to angle error
/// (spec §4.3.5, `w = 1e-8`).
const FOM_LENGTH_WEIGHT: f64 = 1e-8;

/// Match `cell`'s reciprocal axes against `template`'s, allowing
/// reindexing (spec §4.3.5). Both cells are uncentered first; the
/// template's centering is restored on the result.
pub fn match_cell(
    cell: &UnitCell,
    template: &UnitCell,
    tols: MatchTolerances,
    reduce: bool,
) -> Result<Option<UnitCell>> {
    let (template_prim, c, _ci) = uncenter_cell(template)?;
    let (cell_prim, _, _) = uncenter_cell(cell)?;

    let (ta, tb, tc) = template_prim.reciprocal_cartesian()?;
    let t_lengths = [ta.magnitude(), tb.magnitude(), tc.magnitude()];
    let t_angles = [angle_between(tb, tc), angle_between(ta, tc), angle_between(ta, tb)];

    let (ia, ib, ic) = cell_prim.reciprocal_cartesian()?;

    let cands: [Vec<Candidate>; 3] = [
        find_axis_candidates(ia, ib, ic, t_lengths[0], tols.length_pct[0], reduce),
        find_axis_candidates(ia, ib, ic, t_lengths[1], tols.length_pct[1], reduce),
        find_axis_candidates(ia, ib, ic, t_lengths[2], tols.length_pct[2], reduce),
    ];

    let mut best: Option<(f64, Vec3, Vec3, Vec3)> = None;

    for ci_ in &cands[0] {
        for cj in &cands[1] {
            if same_candidate(ci_, cj) {
                continue;
            }
            let ang01 = angle_between(ci_.vec, cj.vec);
            if (ang01 - t_angles[2]).abs() > tols.angle_rad {
                continue;
            }
            let fom1 = (ang01 - t_angles[2]).abs();

            for ck in &cands[2] {
                if same_candidate(cj, ck) || same_candidate(ci_, ck) {
                    continue;
                }
                let ang02 = angle_between(ci_.vec, ck.vec);
                if (ang02 - t_angles[1]).abs() > tols.angle_rad {
                    continue;
                }
                let fom2 = fom1 + (ang02 - t_angles[1]).abs();

                let ang12 = angle_between(cj.vec, ck.vec);
                if (ang12 - t_angles[0]).abs() > tols.angle_rad {
                    continue;
                }

                if ci_.vec.cross(cj.vec).dot(ck.vec) <= 0.0 {
                    continue; // reject left-handed triples
                }

                let fom3 = fom2
                    + (ang12 - t_angles[0]).abs()
                    + FOM_LENGTH_WEIGHT * (ci_.fom + cj.fom + ck.fom);

                if best.as_ref().map(|(f, ..)| fom3 < *f).unwrap_or(true) {
                    best = Some((fom3, ci_.vec, cj.vec, ck.vec));
                }
            }
        }
    }

    let Some((_, va, vb, vc)) = best else {
        return Ok(None);
    };

    let matched_primitive = UnitCell::new_from_reciprocal_axes(va, vb, vc);
    let restored = recenter_cell(
        &matched_primitive,
        &c,
        template.lattice_type(),
        template.centering(),
        template.unique_axis(),
    )?;
    Ok(Some(restored))
}

/// Fast check that two cells already believed to be in the same
/// setting actually agree, without searching reindexing matrices
/// (grounded in `original_source/cell-utils.c:compare_cell_parameters`,
/// supplementing `match_cell`/`compare_reindexed_cell_parameters`).
pub fn compare_cell_parameters(a: &UnitCell, b: &UnitCell, length_tol_pct: f64, angle_tol_rad: f64) -> Result<bool> {
    let (aa, ab, ac, aal, abe, aga) = a.parameters()?;
    let (ba, bb, bc, bal, bbe, bga) = b.parameters()?;
    Ok(within_tolerance(aa, ba, length_tol_pct)
        && within_tolerance(ab, bb, length_tol_pct)
        && within_tolerance(ac, bc, length_tol_pct)
        && (aal - bal).abs() <= angle_tol_rad
        && (abe - bbe).abs() <= angle_tol_rad
        && (aga - bga).abs() <= angle_tol_rad)
}

/// G6 (Niggli) reduced-cell vector used as the reindexing distance
/// metric in `compare_reindexed_cell_parameters` (SPEC_FULL §B).
fn g6_vector(cell: &UnitCell) -> Result<[f64; 6]> {
    let (a, b, c) = cell.direct_cartesian()?;
    Ok([
        a.dot(a),
        b.dot(b),
        c.dot(c),
        2.0 * b.dot(c),
        2.0 * a.dot(c),
        2.0 * a.dot(b),
    ])
}

fn g6_distance(a: &[f64; 6], b: &[f64; 6]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Brute-force enumerate unimodular reindexing matrices with small
/// integer entries, and pick the one minimizing G6 distance to
/// `reference` subject to the given tolerances (spec §4.3.5). Both
/// cells are uncentered first.
pub fn compare_reindexed_cell_parameters(
    cell: &UnitCell,
    reference: &UnitCell,
    length_tol_pct: f64,
    angle_tol_rad: f64,
) -> Result<Option<UnitCell>> {
    let (cell_prim, _, _) = uncenter_cell(cell)?;
    let (ref_prim, _, _) = uncenter_cell(reference)?;
    let ref_g6 = g6_vector(&ref_prim)?;

    let mut best: Option<(f64, UnitCell)> = None;

    for m00 in -1..=1i64 {
        for m01 in -1..=1i64 {
            for m02 in -1..=1i64 {
                for m10 in -1..=1i64 {
                    for m11 in -1..=1i64 {
                        for m12 in -1..=1i64 {
                            for m20 in -1..=1i64 {
                                for m21 in -1..=1i64 {
                                    for m22 in -1..=1i64 {
                                        let m = IntMatrix::new([
                                            [m00, m01, m02],
                                            [m10, m11, m12],
                                            [m20, m21, m22],
                                        ]);
                                        if m.determinant() != 1 {
                                            continue;
                                        }
                                        let Ok(transformed) = cell_prim.transform(&m) else {
                                            continue;
                                        };
                                        let Ok((a, b, c, al, be, ga)) = transformed.parameters() else {
                                            continue;
                                        };
                                        let (ra, rb, rc, ral, rbe, rga) = match ref_prim.parameters() {
                                            Ok(p) => p,
                                            Err(_) => continue,
                                        };
                                        if !within_tolerance(ra, a, length_tol_pct)
                                            || !within_tolerance(rb, b, length_tol_pct)
                                            || !within_tolerance(rc, c, length_tol_pct)
                                            || (ral - al).abs() > angle_tol_rad
                                            || (rbe - be).abs() > angle_tol_rad
                                            || (rga - ga).abs() > angle_tol_rad
                                        {
                                            continue;
                                        }
                                        let Ok(g6) = g6_vector(&transformed) else {
                                            continue;
                                        };
                                        let dist = g6_distance(&g6, &ref_g6);
                                        if best.as_ref().map(|(d, _)| dist < *d).unwrap_or(true) {
                                            best = Some((dist, transformed));
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(best.map(|(_, c)| c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn deg(d: f64) -> f64 {
        d.to_radians()
    }

    #[test]
    fn cubic_f_forbidden_pattern() {
        assert!(is_forbidden(MillerIndex::new(1, 0, 0), Centering::F));
        assert!(!is_forbidden(MillerIndex::new(2, 0, 0), Centering::F));
        assert!(!is_forbidden(MillerIndex::new(1, 1, 1), Centering::F));
        assert!(is_forbidden(MillerIndex::new(2, 1, 0), Centering::F));
    }

    #[test]
    fn hexagonal_h_forbidden_pattern() {
        assert!(is_forbidden(MillerIndex::new(1, 0, 0), Centering::H));
        assert!(!is_forbidden(MillerIndex::new(1, 1, 0), Centering::H));
        assert!(!is_forbidden(MillerIndex::new(3, 0, 0), Centering::H));
    }

    #[test]
    fn forbidden_matches_primitive_non_integral_index() {
        // Primitive coordinates of (h,k,l) under centering `cen` are
        // C_inv * (h,k,l); forbidden iff those coordinates are
        // non-integral. Checked here for I-centering over a small range.
        let t = RationalMatrix::from_pairs([
            [(-1, 2), (1, 2), (1, 2)],
            [(1, 2), (-1, 2), (1, 2)],
            [(1, 2), (1, 2), (-1, 2)],
        ]);
        for h in -5..=5 {
            for k in -5..=5 {
                for l in -5..=5 {
                    let idx = MillerIndex::new(h, k, l);
                    let v = [
                        crate::rational::Rational::from_int(h as i64),
                        crate::rational::Rational::from_int(k as i64),
                        crate::rational::Rational::from_int(l as i64),
                    ];
                    let prim = [
                        t.get(0, 0) * v[0] + t.get(0, 1) * v[1] + t.get(0, 2) * v[2],
                        t.get(1, 0) * v[0] + t.get(1, 1) * v[1] + t.get(1, 2) * v[2],
                        t.get(2, 0) * v[0] + t.get(2, 1) * v[1] + t.get(2, 2) * v[2],
                    ];
                    let non_integral = prim.iter().any(|r| r.as_int().is_none());
                    assert_eq!(is_forbidden(idx, Centering::I), non_integral);
                }
            }
        }
    }

    #[test]
    fn orthorhombic_resolution() {
        let cell = UnitCell::new_from_parameters(10e-10, 20e-10, 30e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let r = resolution(&cell, MillerIndex::new(1, 0, 0)).unwrap();
        assert!((r - 1.0 / (2.0 * 10e-10)).abs() / r < 1e-9);
    }

    #[test]
    fn uncenter_round_trip_cubic_f() {
        let mut cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        cell.set_lattice_type(LatticeType::Cubic);
        cell.set_centering(Centering::F);

        let (prim, c, _ci) = uncenter_cell(&cell).unwrap();
        assert_eq!(prim.lattice_type(), LatticeType::Rhombohedral);
        assert_eq!(prim.centering(), Centering::R);

        let restored = recenter_cell(
            &prim,
            &c,
            LatticeType::Cubic,
            Centering::F,
            UniqueAxis::Star,
        )
        .unwrap();
        let (a, b, cc, al, be, ga) = restored.parameters().unwrap();
        assert!((a - 5e-10).abs() < 1e-16);
        assert!((b - 5e-10).abs() < 1e-16);
        assert!((cc - 5e-10).abs() < 1e-16);
        assert!((al - FRAC_PI_2).abs() < 1e-9);
        assert!((be - FRAC_PI_2).abs() < 1e-9);
        assert!((ga - FRAC_PI_2).abs() < 1e-9);

        let primitive_volume = prim.volume().unwrap();
        let original_volume = cell.volume().unwrap();
        assert!((primitive_volume - original_volume / 4.0).abs() / original_volume < 1e-6);
    }

    #[test]
    fn match_cell_with_axis_permutation() {
        let template = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let (a, b, c) = template.direct_cartesian().unwrap();
        // permute (a,b,c) -> (c,a,b)
        let permuted = UnitCell::new_from_direct_axes(c, a, b);

        let tols = MatchTolerances {
            length_pct: [1.0, 1.0, 1.0],
            angle_rad: deg(1.0),
        };
        let matched = match_cell(&permuted, &template, tols, false).unwrap();
        assert!(matched.is_some());
    }
}
