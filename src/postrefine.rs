//! Nelder-Mead post-refinement over orientation, profile radius and
//! wavelength (spec §4.12).

use crate::crystal::Crystal;
use crate::error::{CrystalFlag, PipelineError, Result};
use crate::geometry::Spectrum;
use crate::prediction::{predict, PartialityModel};
use crate::rational::IntMatrix;
use crate::scaling::{scale_crystal, MergedReference};

/// Characteristic step sizes for the four free parameters, in the
/// order `(ang_x, ang_y, R, lambda)` (spec §4.12).
pub fn characteristic_steps() -> [f64; 4] {
    [0.05f64.to_radians(), 0.05f64.to_radians(), 5.0e5, 1.0e-3 * 1e-10]
}

/// Convergence tolerance on simplex size (spec §4.12,
/// `gsl_multimin_test_size` equivalent).
const CONVERGENCE_SIZE: f64 = 0.005;
const MAX_ITERATIONS: usize = 1000;
const MAX_ANGULAR_SHIFT_RAD: f64 = 5.0f64.to_radians();

fn rotate_x(v: lin_alg::f64::Vec3, angle: f64) -> lin_alg::f64::Vec3 {
    let (s, c) = angle.sin_cos();
    lin_alg::f64::Vec3::new(v.x, v.y * c - v.z * s, v.y * s + v.z * c)
}

fn rotate_y(v: lin_alg::f64::Vec3, angle: f64) -> lin_alg::f64::Vec3 {
    let (s, c) = angle.sin_cos();
    lin_alg::f64::Vec3::new(v.x * c + v.z * s, v.y, -v.x * s + v.z * c)
}

/// Apply `(ang_x, ang_y)` rotations to a crystal's cell, in place on a
/// fresh deep copy (spec §4.12: "rotates the cell around lab x then
/// y").
fn rotated_cell(crystal: &Crystal, ang_x: f64, ang_y: f64) -> Result<crate::cell::UnitCell> {
    let (a, b, c) = crystal.cell.direct_cartesian()?;
    let rot = |v: lin_alg::f64::Vec3| rotate_y(rotate_x(v, ang_x), ang_y);
    let mut cell = crate::cell::UnitCell::new_from_direct_axes(rot(a), rot(b), rot(c));
    cell.set_lattice_type(crystal.cell.lattice_type());
    cell.set_centering(crystal.cell.centering());
    cell.set_unique_axis(crystal.cell.unique_axis());
    Ok(cell)
}

/// One residual evaluation: clone, rotate, re-predict, re-scale, score
/// (spec §4.12). `q_max` and `nominal_k_base` come from the crystal's
/// parent image at the time refinement started.
fn residual(
    crystal: &Crystal,
    spectrum: &Spectrum,
    nominal_k_base: f64,
    q_max: f64,
    reference: &MergedReference,
    params: [f64; 4],
) -> f64 {
    let [ang_x, ang_y, delta_r, delta_lambda] = params;

    let new_r = crystal.profile_radius + delta_r;
    let new_lambda = 1.0 / nominal_k_base + delta_lambda;
    if new_r <= 0.0 || new_r > 1e9 || new_lambda <= 0.0 {
        return f64::NAN;
    }
    let nominal_k = 1.0 / new_lambda;

    let Ok(cell) = rotated_cell(crystal, ang_x, ang_y) else {
        return f64::NAN;
    };

    let mut trial = crystal.deep_copy();
    trial.cell = cell;
    trial.profile_radius = new_r;

    let Ok(predicted) = predict(&trial.cell, spectrum, nominal_k, new_r, q_max, PartialityModel::XSphere, crystal.image_serial) else {
        return f64::NAN;
    };
    trial.reflections = predicted;

    if scale_crystal(&mut trial, reference).is_err() {
        return f64::NAN;
    }

    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for refl in trial.reflections.iter() {
        if refl.flags.free_set || refl.flags.bad_integration || refl.partiality <= 0.0 || refl.intensity <= 0.0 {
            continue;
        }
        let Some(entry) = reference.get(&refl.symmetric_index) else {
            continue;
        };
        if entry.i_full <= 0.0 || entry.redundancy < 2 {
            continue;
        }
        let s = {
            let Ok((astar, bstar, cstar)) = trial.cell.reciprocal_cartesian() else {
                continue;
            };
            let q = astar * refl.index.h as f64 + bstar * refl.index.k as f64 + cstar * refl.index.l as f64;
            q.magnitude() / 2.0
        };
        let lorentz = if refl.lorentz.abs() > 1e-300 { refl.lorentz } else { 1.0 };
        let model = trial.scale.ln() - trial.b_factor * s * s + refl.partiality.ln() - lorentz.ln() + entry.i_full.ln();
        let observed = refl.intensity.ln();
        let r = observed - model;
        sum_sq += r * r;
        n += 1;
    }

    if n == 0 { f64::NAN } else { sum_sq }
}

/// Result of a post-refinement attempt.
pub struct RefinementOutcome {
    pub cell: crate::cell::UnitCell,
    pub profile_radius: f64,
    pub wavelength: f64,
    pub residual_before: f64,
    pub residual_after: f64,
}

/// A simplex vertex: normalized coordinates (units of
/// [`characteristic_steps`]) plus its cached residual.
#[derive(Clone, Copy, Debug)]
struct Vertex {
    coords: [f64; 4],
    value: f64,
}

fn denormalize(coords: [f64; 4], steps: [f64; 4]) -> [f64; 4] {
    [
        coords[0] * steps[0],
        coords[1] * steps[1],
        coords[2] * steps[2],
        coords[3] * steps[3],
    ]
}

fn simplex_size(vertices: &[Vertex; 5]) -> f64 {
    let centroid = centroid_excluding(vertices, usize::MAX);
    vertices
        .iter()
        .map(|v| {
            v.coords
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .sum::<f64>()
        / vertices.len() as f64
}

fn centroid_excluding(vertices: &[Vertex; 5], exclude: usize) -> [f64; 4] {
    let mut sum = [0.0; 4];
    let mut n = 0;
    for (i, v) in vertices.iter().enumerate() {
        if i == exclude {
            continue;
        }
        for k in 0..4 {
            sum[k] += v.coords[k];
        }
        n += 1;
    }
    for s in &mut sum {
        *s /= n as f64;
    }
    sum
}

/// Nelder-Mead minimization of [`residual`] over the four free
/// parameters, normalized by `characteristic_steps` (spec §4.12).
fn nelder_mead(mut eval: impl FnMut([f64; 4]) -> f64) -> ([f64; 4], f64) {
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let mut vertices: [Vertex; 5] = std::array::from_fn(|i| {
        let mut coords = [0.0; 4];
        if i > 0 {
            coords[i - 1] = 1.0;
        }
        let value = eval(coords);
        Vertex { coords, value }
    });

    for _ in 0..MAX_ITERATIONS {
        vertices.sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal));

        if simplex_size(&vertices) < CONVERGENCE_SIZE {
            break;
        }

        let worst = vertices[4];
        let centroid = centroid_excluding(&vertices, 4);

        let reflect = |scale: f64| -> [f64; 4] {
            std::array::from_fn(|k| centroid[k] + scale * (centroid[k] - worst.coords[k]))
        };

        let xr = reflect(ALPHA);
        let fr = eval(xr);

        if fr < vertices[0].value {
            let xe = reflect(GAMMA);
            let fe = eval(xe);
            vertices[4] = if fe < fr { Vertex { coords: xe, value: fe } } else { Vertex { coords: xr, value: fr } };
        } else if fr < vertices[3].value {
            vertices[4] = Vertex { coords: xr, value: fr };
        } else {
            let xc: [f64; 4] = std::array::from_fn(|k| centroid[k] + RHO * (worst.coords[k] - centroid[k]));
            let fc = eval(xc);
            if fc < worst.value {
                vertices[4] = Vertex { coords: xc, value: fc };
            } else {
                let best = vertices[0];
                for v in vertices.iter_mut().skip(1) {
                    let shrunk: [f64; 4] = std::array::from_fn(|k| best.coords[k] + SIGMA * (v.coords[k] - best.coords[k]));
                    let fs = eval(shrunk);
                    *v = Vertex { coords: shrunk, value: fs };
                }
            }
        }
    }

    vertices.sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal));
    (vertices[0].coords, vertices[0].value)
}

/// Run post-refinement for one crystal against `reference`, optionally
/// trying each reindexing ambiguity operator first (spec §4.12).
pub fn refine_crystal(
    crystal: &mut Crystal,
    spectrum: &Spectrum,
    wavelength: f64,
    q_max: f64,
    reference: &MergedReference,
    reindex_ambiguities: &[IntMatrix],
) -> Result<RefinementOutcome> {
    let steps = characteristic_steps();
    let nominal_k_base = 1.0 / wavelength;

    let candidates: Vec<Option<IntMatrix>> = if reindex_ambiguities.is_empty() {
        vec![None]
    } else {
        std::iter::once(None).chain(reindex_ambiguities.iter().copied().map(Some)).collect()
    };

    let residual_before = residual(crystal, spectrum, nominal_k_base, q_max, reference, [0.0; 4]);

    let mut best: Option<(Option<IntMatrix>, [f64; 4], f64)> = None;
    for candidate in candidates {
        let trial_crystal = match &candidate {
            None => crystal.clone(),
            Some(m) => {
                let mut c = crystal.clone();
                match c.cell.transform(m) {
                    Ok(cell) => c.cell = cell,
                    Err(_) => continue,
                }
                c
            }
        };

        let (params, value) = nelder_mead(|normalized| {
            let denorm = denormalize(normalized, steps);
            residual(&trial_crystal, spectrum, nominal_k_base, q_max, reference, denorm)
        });

        if best.as_ref().map(|(_, _, v)| value < *v).unwrap_or(true) {
            best = Some((candidate, params, value));
        }
    }

    let Some((candidate, best_normalized, residual_after)) = best else {
        crystal.flag(CrystalFlag::SolveFail);
        return Err(PipelineError::SolveFailed {
            reason: "post-refinement found no usable reindexing candidate".into(),
        });
    };

    if !residual_after.is_finite() || residual_after > residual_before {
        crystal.flag(CrystalFlag::DeltaCcHalf);
        return Err(PipelineError::DeltaCcHalfNegative {
            before: residual_before,
            after: residual_after,
        });
    }

    let denorm = denormalize(best_normalized, steps);
    let [ang_x, ang_y, delta_r, delta_lambda] = denorm;

    if (ang_x.powi(2) + ang_y.powi(2)).sqrt() > MAX_ANGULAR_SHIFT_RAD {
        crystal.flag(CrystalFlag::DeltaCcHalf);
        return Err(PipelineError::SolveFailed {
            reason: "post-refinement angular shift exceeded the 5 degree sanity bound".into(),
        });
    }

    if let Some(m) = &candidate {
        crystal.cell = crystal.cell.transform(m)?;
    }
    let new_cell = rotated_cell(crystal, ang_x, ang_y)?;
    let new_r = crystal.profile_radius + delta_r;
    let new_lambda = 1.0 / nominal_k_base + delta_lambda;

    crystal.cell = new_cell;
    crystal.profile_radius = new_r;

    Ok(RefinementOutcome {
        cell: crystal.cell,
        profile_radius: new_r,
        wavelength: new_lambda,
        residual_before,
        residual_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nelder_mead_minimizes_a_quadratic_bowl() {
        let (coords, value) = nelder_mead(|p| p.iter().map(|x| x * x).sum());
        assert!(value < 1e-3);
        for c in coords {
            assert!(c.abs() < 0.2);
        }
    }

    #[test]
    fn simplex_size_shrinks_toward_convergence() {
        let vertices: [Vertex; 5] = std::array::from_fn(|i| Vertex {
            coords: if i == 0 { [0.0; 4] } else { std::array::from_fn(|k| if k == i - 1 { 1e-4 } else { 0.0 }) },
            value: 0.0,
        });
        assert!(simplex_size(&vertices) < CONVERGENCE_SIZE);
    }
}
