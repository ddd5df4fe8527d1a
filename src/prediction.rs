//! Ewald-sphere prediction, partiality models, polarization correction
//! (spec §4.8).

use lin_alg::f64::Vec3;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::cell::UnitCell;
use crate::cell_utils::is_forbidden;
use crate::error::Result;
use crate::geometry::Spectrum;
use crate::reflection::{MillerIndex, Reflection, ReflectionList, MAX_MILLER_INDEX};

/// Minimum partiality kept after prediction (spec §4.8.1).
pub fn min_partiality() -> f64 {
    (-0.5 * 1.7 * 1.7f64).exp()
}

/// `k_half = -|q|^2 / (2 q_z)` (spec §4.8.1), `NaN` when the lattice
/// point is on the wrong side of the Ewald sphere (`q_z >= 0`),
/// matching `original_source/geometry.c:safe_khalf`.
pub fn safe_khalf(q: Vec3) -> f64 {
    if q.z > 0.0 {
        return f64::NAN;
    }
    -(q.x * q.x + q.y * q.y + q.z * q.z) / (2.0 * q.z)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialityModel {
    Unity,
    XSphere,
    Offset,
    Random,
}

/// Number of quadrature points used by the `XSPHERE` overlap integral
/// (spec §4.8.2: "50-point equal-spacing quadrature").
const XSPHERE_QUADRATURE_POINTS: usize = 50;

fn fold_seed(h: i32, k: i32, l: i32, image_serial: u64) -> u64 {
    let mut x = image_serial;
    for v in [h, k, l] {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(v as i64 as u64);
        x ^= x >> 29;
    }
    x
}

/// Deterministic pseudo-random partiality for testing (spec §4.8.2
/// `RANDOM`). Not bit-reproducible with the GSL Mersenne-Twister
/// reseed sequence the source uses.
fn random_partiality(idx: MillerIndex, image_serial: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(fold_seed(idx.h, idx.k, idx.l, image_serial));
    rng.gen_range(0.0..=1.0)
}

/// Excitation error `t`: the projection of `q` onto the beam axis
/// offset from the Ewald sphere, `kcen - k_half`.
fn excitation_error(q: Vec3, kcen: f64) -> f64 {
    let khalf = safe_khalf(q);
    if khalf.is_nan() {
        kcen + q.z.abs()
    } else {
        kcen - khalf
    }
}

/// `XSPHERE` overlap integral: ratio of the rlp-profile/Ewald-shell
/// overlap at the true spectrum to the overlap at the nominal
/// wavelength (spec §4.8.2).
fn xsphere_partiality(q: Vec3, profile_radius: f64, spectrum: &Spectrum, nominal_k: f64) -> f64 {
    let overlap_at = |kcen: f64| -> f64 {
        let t = excitation_error(q, kcen);
        let sigma2 = profile_radius * profile_radius;
        let exponent = -0.5 * t * t / sigma2;
        if exponent > -700.0 { exponent.exp() } else { 0.0 }
    };

    // Quadrature over the spectrum's support, weighted by E(k).
    let spread = spectrum
        .terms
        .iter()
        .map(|g| g.sigma)
        .fold(0.0, f64::max)
        .max(nominal_k * 1e-6);
    let lo = nominal_k - 5.0 * spread;
    let hi = nominal_k + 5.0 * spread;
    let step = (hi - lo) / XSPHERE_QUADRATURE_POINTS as f64;

    let mut numerator = 0.0;
    for i in 0..XSPHERE_QUADRATURE_POINTS {
        let k = lo + (i as f64 + 0.5) * step;
        numerator += spectrum.density(k) * overlap_at(k) * step;
    }

    let denominator = overlap_at(nominal_k) * spectrum.density(nominal_k).max(1e-300) * step;
    if denominator.abs() < 1e-300 {
        0.0
    } else {
        (numerator / denominator).min(1.0).max(0.0)
    }
}

/// Spectrum-weighted mean predicted `k` plus the "revert the Lorentz
/// factor" multiplier `sqrt((R^2 + M2_k/sum_w_k) / R^2)` (spec §4.8.1;
/// `original_source/libcrystfel/src/geometry.c:check_reflection`). Each
/// spectrum term contributes its own Ewald-sphere-intersection `k`,
/// weighted by that term's overlap with the reflection profile; `M2_k`
/// is the area-weighted variance of the terms' central wavenumbers
/// plus their own widths, `sum_w_k` the total spectrum area.
fn spectrum_weighted_k_pred(q: Vec3, profile_radius: f64, spectrum: &Spectrum, nominal_k: f64) -> (f64, f64) {
    let overlap_at = |kcen: f64| -> f64 {
        let t = excitation_error(q, kcen);
        let sigma2 = profile_radius * profile_radius;
        let exponent = -0.5 * t * t / sigma2;
        if exponent > -700.0 { exponent.exp() } else { 0.0 }
    };
    let khalf = safe_khalf(q);

    let mut sum_w = 0.0;
    let mut sum_wk = 0.0;
    for g in &spectrum.terms {
        let kpred_term = if khalf.is_finite() { khalf } else { g.kcen };
        let w = g.area * overlap_at(g.kcen);
        sum_w += w;
        sum_wk += w * kpred_term;
    }
    let k_pred = if sum_w.abs() > 1e-300 { sum_wk / sum_w } else { nominal_k };

    let sum_w_k: f64 = spectrum.terms.iter().map(|g| g.area).sum();
    let revert = if sum_w_k.abs() > 1e-300 {
        let mean_k = spectrum.terms.iter().map(|g| g.area * g.kcen).sum::<f64>() / sum_w_k;
        let m2_k: f64 = spectrum
            .terms
            .iter()
            .map(|g| g.area * ((g.kcen - mean_k).powi(2) + g.sigma * g.sigma))
            .sum();
        let r2 = profile_radius * profile_radius;
        ((r2 + m2_k / sum_w_k) / r2).sqrt()
    } else {
        1.0
    };

    (k_pred, revert)
}

/// One predicted-but-not-yet-integrated reflection (spec §4.8.1,
/// before a detector position has been resolved).
pub struct PredictedReflection {
    pub index: MillerIndex,
    pub q: Vec3,
    pub k_pred: f64,
    pub k_half: f64,
    pub excitation_error: f64,
    pub partiality: f64,
}

/// Predict reflections for a cell already rotated into the image
/// frame, up to `q_max` (spec §4.8.1). `nominal_k = 1/wavelength`.
pub fn predict(
    cell: &UnitCell,
    spectrum: &Spectrum,
    nominal_k: f64,
    profile_radius: f64,
    q_max: f64,
    model: PartialityModel,
    image_serial: u64,
) -> Result<ReflectionList> {
    let (astar, bstar, cstar) = cell.reciprocal_cartesian()?;

    let h_max = ((q_max / astar.magnitude()).ceil() as i32).clamp(0, MAX_MILLER_INDEX);
    let k_max = ((q_max / bstar.magnitude()).ceil() as i32).clamp(0, MAX_MILLER_INDEX);
    let l_max = ((q_max / cstar.magnitude()).ceil() as i32).clamp(0, MAX_MILLER_INDEX);

    let mut out = ReflectionList::new();
    let threshold = min_partiality();
    let centering = cell.centering();

    for h in -h_max..=h_max {
        for k in -k_max..=k_max {
            for l in -l_max..=l_max {
                let idx = MillerIndex::new(h, k, l);
                if idx.is_origin() || is_forbidden(idx, centering) {
                    continue;
                }
                let q = astar * h as f64 + bstar * k as f64 + cstar * l as f64;
                if q.magnitude() > q_max {
                    continue;
                }

                let (k_pred, lorentz_revert) = spectrum_weighted_k_pred(q, profile_radius, spectrum, nominal_k);

                let partiality = match model {
                    PartialityModel::Unity => 1.0,
                    PartialityModel::XSphere => xsphere_partiality(q, profile_radius, spectrum, nominal_k) * lorentz_revert,
                    PartialityModel::Offset => {
                        let t = excitation_error(q, nominal_k);
                        (-(t * t) / (profile_radius * profile_radius)).exp() * lorentz_revert
                    }
                    PartialityModel::Random => random_partiality(idx, image_serial),
                };

                if partiality < threshold {
                    continue;
                }

                let khalf = safe_khalf(q);
                let mut refl = Reflection::new(idx);
                refl.partiality = partiality;
                refl.k_pred = k_pred;
                refl.k_half = khalf;
                refl.excitation_error = excitation_error(q, nominal_k);
                refl.lorentz = 1.0;
                out.insert(refl);
            }
        }
    }

    Ok(out)
}

/// Divide intensity and ESD by the polarization factor (spec §4.8.3).
/// `phi0` is the polarization axis angle; `degree` is `P in [0,1]`.
pub fn apply_polarization_correction(refl: &mut Reflection, q: Vec3, k_pred: f64, degree: f64, phi0: f64) {
    let two_theta = 2.0 * (q.magnitude() / (2.0 * k_pred)).clamp(-1.0, 1.0).asin();
    let phi = q.y.atan2(q.x) - phi0;
    let sin2_2theta = two_theta.sin().powi(2);
    let factor = degree * (1.0 - phi.cos().powi(2) * sin2_2theta)
        + (1.0 - degree) * (1.0 - phi.sin().powi(2) * sin2_2theta);
    if factor.abs() > 1e-12 {
        refl.intensity /= factor;
        refl.sigma /= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SpectrumGaussian;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn safe_khalf_is_nan_on_wrong_side() {
        assert!(safe_khalf(Vec3::new(0.0, 0.0, 1.0)).is_nan());
    }

    #[test]
    fn safe_khalf_matches_formula() {
        let q = Vec3::new(1.0, 0.0, -2.0);
        let expect = -(1.0f64 * 1.0 + 0.0 + 4.0) / (2.0 * -2.0);
        assert!((safe_khalf(q) - expect).abs() < 1e-12);
    }

    #[test]
    fn random_partiality_is_deterministic() {
        let idx = MillerIndex::new(1, 2, 3);
        assert_eq!(random_partiality(idx, 42), random_partiality(idx, 42));
    }

    #[test]
    fn random_partiality_varies_by_serial() {
        let idx = MillerIndex::new(1, 2, 3);
        assert_ne!(random_partiality(idx, 1), random_partiality(idx, 2));
    }

    #[test]
    fn predict_skips_the_origin() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let spectrum = Spectrum::single(1e10, 1e6);
        let list = predict(&cell, &spectrum, 1e10, 2e6, 5e9, PartialityModel::Unity, 1).unwrap();
        assert!(!list.contains(&MillerIndex::new(0, 0, 0)));
    }

    #[test]
    fn unity_model_keeps_everything_within_q_max() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let spectrum = Spectrum::single(1e10, 1e6);
        let list = predict(&cell, &spectrum, 1e10, 2e6, 5e9, PartialityModel::Unity, 1).unwrap();
        assert!(list.iter().all(|r| (r.partiality - 1.0).abs() < 1e-12));
    }

    #[test]
    fn face_centered_cell_never_predicts_forbidden_reflections() {
        let mut cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        cell.set_centering(crate::cell::Centering::F);
        let spectrum = Spectrum::single(1e10, 1e6);
        let list = predict(&cell, &spectrum, 1e10, 2e6, 5e9, PartialityModel::Unity, 1).unwrap();
        assert!(!list.contains(&MillerIndex::new(1, 0, 0)));
        assert!(list.iter().all(|r| !is_forbidden(r.index, crate::cell::Centering::F)));
        assert!(!list.is_empty());
    }

    #[test]
    fn k_pred_is_the_spectrum_weighted_mean_not_nominal_k() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let spectrum = Spectrum {
            terms: vec![
                SpectrumGaussian { kcen: 0.95e10, sigma: 1e6, area: 1.0 },
                SpectrumGaussian { kcen: 1.05e10, sigma: 1e6, area: 1.0 },
            ],
        };
        let list = predict(&cell, &spectrum, 1e10, 2e6, 5e9, PartialityModel::XSphere, 1).unwrap();
        assert!(list.iter().any(|r| (r.k_pred - 1e10).abs() > 1.0));
    }
}
