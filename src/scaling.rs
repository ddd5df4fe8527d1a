//! Per-crystal (G, B) scaling against a merged reference (spec §4.11).

use std::collections::HashMap;

use crate::crystal::Crystal;
use crate::error::{CrystalFlag, PipelineError, Result};
use crate::reflection::MillerIndex;

/// Merged reference intensity for one `(h,k,l)`, plus how many
/// observations contributed (spec §4.11 "redundancy of the merged
/// reference >= 2").
#[derive(Clone, Copy, Debug)]
pub struct ReferenceEntry {
    pub i_full: f64,
    pub redundancy: u32,
}

pub type MergedReference = HashMap<MillerIndex, ReferenceEntry>;

/// `s = |q|/2`, the resolution-dependent term in the scaling model.
fn s_of(cell: &crate::cell::UnitCell, idx: MillerIndex) -> Result<f64> {
    let (astar, bstar, cstar) = cell.reciprocal_cartesian()?;
    let q = astar * idx.h as f64 + bstar * idx.k as f64 + cstar * idx.l as f64;
    Ok(q.magnitude() / 2.0)
}

/// A reflection's contribution to the scaling normal equations, after
/// the strength filters of spec §4.11.
struct ScalingPoint {
    s2: f64,
    /// `log(I_partial / (p * I_full / L))`, the log-residual at `G=1,B=0`.
    log_ratio: f64,
    weight: f64,
}

fn strength_filtered_points(crystal: &Crystal, reference: &MergedReference) -> Result<Vec<ScalingPoint>> {
    let mut points = Vec::new();
    for refl in crystal.reflections.iter() {
        if refl.flags.free_set || refl.flags.bad_integration {
            continue;
        }
        if refl.intensity <= 3.0 * refl.sigma {
            continue;
        }
        if refl.partiality <= 0.0 {
            continue;
        }
        let Some(entry) = reference.get(&refl.symmetric_index) else {
            continue;
        };
        if entry.i_full <= 0.0 || entry.redundancy < 2 {
            continue;
        }
        let lorentz = if refl.lorentz.abs() > 1e-300 { refl.lorentz } else { 1.0 };
        let predicted = refl.partiality * entry.i_full / lorentz;
        if predicted <= 0.0 || refl.intensity <= 0.0 {
            continue;
        }
        let s = s_of(&crystal.cell, refl.index)?;
        points.push(ScalingPoint {
            s2: s * s,
            log_ratio: (refl.intensity / predicted).ln(),
            weight: 1.0,
        });
    }
    Ok(points)
}

/// Solve a symmetric 2x2 linear system via its explicit inverse,
/// falling back to the Moore-Penrose pseudo-inverse (the 2x2
/// eigendecomposition, since an SVD of a symmetric matrix reduces to
/// one) when the matrix is rank-deficient, matching spec §4.11's
/// requirement that `solve_svd` "must support rank-deficient matrices
/// without crashing".
pub fn solve_svd_2x2(m: [[f64; 2]; 2], v: [f64; 2]) -> [f64; 2] {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    const SINGULAR_EPS: f64 = 1e-14;

    if det.abs() > SINGULAR_EPS * (m[0][0].abs() + m[1][1].abs() + 1.0) {
        let inv = [
            [m[1][1] / det, -m[0][1] / det],
            [-m[1][0] / det, m[0][0] / det],
        ];
        return [inv[0][0] * v[0] + inv[0][1] * v[1], inv[1][0] * v[0] + inv[1][1] * v[1]];
    }

    // Symmetric rank-deficient fallback: eigendecompose and invert only
    // the non-negligible eigenvalue(s).
    let trace = m[0][0] + m[1][1];
    let disc = ((m[0][0] - m[1][1]).powi(2) + 4.0 * m[0][1] * m[1][0]).max(0.0).sqrt();
    let lambda = [(trace + disc) / 2.0, (trace - disc) / 2.0];

    let eigvecs: [[f64; 2]; 2] = if m[0][1].abs() > SINGULAR_EPS {
        [
            [m[0][1], lambda[0] - m[0][0]],
            [m[0][1], lambda[1] - m[0][0]],
        ]
    } else {
        [[1.0, 0.0], [0.0, 1.0]]
    };

    let mut out = [0.0; 2];
    for i in 0..2 {
        let mag = (eigvecs[i][0].powi(2) + eigvecs[i][1].powi(2)).sqrt();
        if mag < SINGULAR_EPS || lambda[i].abs() < SINGULAR_EPS {
            continue;
        }
        let e = [eigvecs[i][0] / mag, eigvecs[i][1] / mag];
        let proj = (e[0] * v[0] + e[1] * v[1]) / lambda[i];
        out[0] += proj * e[0];
        out[1] += proj * e[1];
    }
    out
}

/// Fit `(G, B)` for one crystal against `reference` by iterative
/// log-linear normal equations (spec §4.11). Mutates `crystal.scale`
/// and `crystal.b_factor`; flags the crystal on failure instead of
/// returning an error, since scaling failures are non-fatal per
/// spec §7.
pub fn scale_crystal(crystal: &mut Crystal, reference: &MergedReference) -> Result<()> {
    const MAX_ITERATIONS: usize = 10;
    const MIN_REFLECTIONS: usize = 3;
    const RESIDUAL_IMPROVEMENT_FLOOR: f64 = 0.01;

    let points = strength_filtered_points(crystal, reference)?;
    if points.len() < MIN_REFLECTIONS {
        crystal.flag(CrystalFlag::FewRefl);
        return Err(PipelineError::TooFewReflections {
            have: points.len(),
            need: MIN_REFLECTIONS,
        });
    }

    let mut delta_g_total = 0.0;
    let mut b = crystal.b_factor;
    let mut prev_residual = f64::INFINITY;

    for _ in 0..MAX_ITERATIONS {
        // Model: log_ratio + delta_g_total + b*s2 ~= 0 (residual form);
        // solve for (d_dg, d_b) minimizing sum of squared residuals.
        let mut m = [[0.0; 2]; 2];
        let mut v = [0.0; 2];
        let mut residual = 0.0;
        for p in &points {
            let r = p.log_ratio + delta_g_total + b * p.s2;
            residual += p.weight * r * r;
            m[0][0] += p.weight;
            m[0][1] += p.weight * p.s2;
            m[1][0] += p.weight * p.s2;
            m[1][1] += p.weight * p.s2 * p.s2;
            v[0] -= p.weight * r;
            v[1] -= p.weight * r * p.s2;
        }

        let step = solve_svd_2x2(m, v);
        if !step[0].is_finite() || !step[1].is_finite() {
            crystal.flag(CrystalFlag::SolveFail);
            return Err(PipelineError::SolveFailed {
                reason: "scaling normal-equations solve produced a non-finite step".into(),
            });
        }

        delta_g_total += step[0];
        b += step[1];

        if prev_residual.is_finite() && prev_residual > 0.0 {
            let improvement = (prev_residual - residual) / prev_residual;
            if improvement.abs() < RESIDUAL_IMPROVEMENT_FLOOR {
                prev_residual = residual;
                break;
            }
        }
        prev_residual = residual;
    }

    let g = (-delta_g_total).exp();
    if !g.is_finite() || g <= 0.0 || !b.is_finite() {
        crystal.flag(CrystalFlag::ScaleBad);
        return Err(PipelineError::ScalingDiverged { b });
    }

    const B_PLAUSIBLE_RANGE: f64 = 500.0;
    if b.abs() > B_PLAUSIBLE_RANGE {
        crystal.flag(CrystalFlag::BigB);
    }

    crystal.scale = g;
    crystal.b_factor = b;
    Ok(())
}

/// Bootstrap a crystal's scale against a reference list by weighted
/// least squares, weight equal to partiality (spec §4.11 "direct
/// scaling"): `I_full ~= G * I_partial / p`.
pub fn direct_scale(crystal: &Crystal, reference: &MergedReference) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for refl in crystal.reflections.iter() {
        if refl.partiality <= 0.0 || refl.flags.free_set {
            continue;
        }
        let Some(entry) = reference.get(&refl.symmetric_index) else {
            continue;
        };
        if entry.i_full <= 0.0 {
            continue;
        }
        let i_partial_norm = refl.intensity / refl.partiality;
        let weight = refl.partiality;
        num += weight * i_partial_norm * entry.i_full;
        den += weight * entry.i_full * entry.i_full;
    }
    if den.abs() < 1e-300 {
        1.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::UnitCell;
    use crate::reflection::Reflection;
    use std::f64::consts::FRAC_PI_2;

    fn test_crystal() -> Crystal {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        Crystal::new(cell, 1)
    }

    #[test]
    fn solve_svd_2x2_matches_direct_inverse_on_well_conditioned_input() {
        let m = [[2.0, 0.0], [0.0, 3.0]];
        let v = [4.0, 9.0];
        let x = solve_svd_2x2(m, v);
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn solve_svd_2x2_does_not_panic_on_singular_input() {
        let m = [[1.0, 1.0], [1.0, 1.0]];
        let v = [2.0, 2.0];
        let x = solve_svd_2x2(m, v);
        assert!(x[0].is_finite() && x[1].is_finite());
    }

    #[test]
    fn scale_crystal_errs_with_too_few_reflections() {
        let mut crystal = test_crystal();
        let reference = MergedReference::new();
        let err = scale_crystal(&mut crystal, &reference).unwrap_err();
        assert!(matches!(err, PipelineError::TooFewReflections { .. }));
        assert!(crystal.has_flag(CrystalFlag::FewRefl));
    }

    #[test]
    fn scale_crystal_recovers_known_scale_factor() {
        let mut crystal = test_crystal();
        let mut reference = MergedReference::new();
        let true_g = 2.0;

        for (i, hkl) in [(1, 0, 0), (0, 1, 0), (0, 0, 1), (1, 1, 0), (1, 0, 1)].into_iter().enumerate() {
            let idx = MillerIndex::new(hkl.0, hkl.1, hkl.2);
            let i_full = 1000.0 + i as f64 * 100.0;
            reference.insert(idx, ReferenceEntry { i_full, redundancy: 4 });
            let mut refl = Reflection::new(idx);
            refl.symmetric_index = idx;
            refl.partiality = 0.8;
            refl.lorentz = 1.0;
            refl.sigma = 5.0;
            refl.intensity = true_g * 0.8 * i_full;
            crystal.reflections.insert(refl);
        }

        scale_crystal(&mut crystal, &reference).unwrap();
        assert!((crystal.scale - true_g).abs() / true_g < 0.05);
    }

    #[test]
    fn direct_scale_recovers_known_scale_factor() {
        let mut crystal = test_crystal();
        let mut reference = MergedReference::new();
        let true_g = 3.0;
        for (i, hkl) in [(1, 0, 0), (0, 1, 0), (0, 0, 1)].into_iter().enumerate() {
            let idx = MillerIndex::new(hkl.0, hkl.1, hkl.2);
            let i_full = 500.0 + i as f64 * 50.0;
            reference.insert(idx, ReferenceEntry { i_full, redundancy: 2 });
            let mut refl = Reflection::new(idx);
            refl.symmetric_index = idx;
            refl.partiality = 0.6;
            refl.intensity = true_g * 0.6 * i_full;
            crystal.reflections.insert(refl);
        }
        let g = direct_scale(&crystal, &reference);
        assert!((g - true_g).abs() / true_g < 1e-6);
    }
}
