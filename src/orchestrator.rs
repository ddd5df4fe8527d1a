//! Per-image pipeline orchestration (spec §4.10) with wall-clock time
//! accounting grounded in `time-accounts.c`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cell::UnitCell;
use crate::crystal::Crystal;
use crate::error::{PipelineError, Result};
use crate::geometry::{Detector, Image};
use crate::indexing::{run_with_policy, IndexingEngine, IndexingRequest};
use crate::peaksearch::{self, PeakSearchMethod};
use crate::postrefine::refine_crystal;
use crate::prediction::{self, PartialityModel};
use crate::scaling::MergedReference;
use crate::stream::{write_chunk, ImageRecord};

/// Named pipeline stages, one per wall-clock bucket (spec §B, grounded
/// on `time-accounts.c`'s `enum timeaccount`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    WaitFile,
    Filter,
    ResRange,
    PeakSearch,
    Indexing,
    PredParams,
    Integration,
    StreamWrite,
    Nothing,
}

/// Accumulated wall-clock time per [`Stage`], plus the currently-open
/// stage (spec §B "time accounting").
pub struct TimeAccount {
    totals: HashMap<Stage, Duration>,
    current: Option<(Stage, Instant)>,
}

impl TimeAccount {
    pub fn new() -> Self {
        Self {
            totals: HashMap::new(),
            current: None,
        }
    }

    /// Close out the current stage (if any) and open `stage`.
    pub fn switch_to(&mut self, stage: Stage) {
        self.close_current();
        self.current = Some((stage, Instant::now()));
    }

    fn close_current(&mut self) {
        if let Some((stage, started)) = self.current.take() {
            *self.totals.entry(stage).or_insert(Duration::ZERO) += started.elapsed();
        }
    }

    pub fn finish(&mut self) {
        self.close_current();
    }

    pub fn total(&self, stage: Stage) -> Duration {
        self.totals.get(&stage).copied().unwrap_or(Duration::ZERO)
    }

    pub fn report(&self) -> Vec<(Stage, Duration)> {
        let mut v: Vec<_> = self.totals.iter().map(|(s, d)| (*s, *d)).collect();
        v.sort_by_key(|(_, d)| std::cmp::Reverse(*d));
        v
    }
}

impl Default for TimeAccount {
    fn default() -> Self {
        Self::new()
    }
}

/// Tunables for one orchestrator run (spec §4.10).
pub struct OrchestratorConfig {
    pub min_peaks_for_hit: usize,
    pub resolution_limit_min: Option<f64>,
    pub resolution_limit_max: Option<f64>,
    pub default_divergence: f64,
    pub default_bandwidth: f64,
    pub peak_search: PeakSearchMethod,
    pub half_pixel_shift: bool,
    pub partiality_model: PartialityModel,
    pub q_max: f64,
    pub integration_radii: crate::integration::IntegrationRadii,
    pub exclude_saturated: bool,
    pub do_post_refinement: bool,
}

/// Outcome of processing one image through the full pipeline.
pub struct ProcessedImage {
    pub serial: u64,
    pub is_hit: bool,
    pub n_peaks: usize,
    pub crystals: Vec<Crystal>,
}

/// Zero out pixels outside the configured detector-distance range
/// before peak search (spec §4.10 step 2). The cutoffs are expressed
/// directly in lab-frame distance from the direct beam rather than
/// reciprocal-space resolution, since that is all a flat cutoff on raw
/// pixel data can use before a cell is known.
fn mark_bad_pixels_by_resolution(image: &mut Image, detector: &Detector, min_distance: Option<f64>, max_distance: Option<f64>) {
    if min_distance.is_none() && max_distance.is_none() {
        return;
    }
    for (panel_index, panel) in detector.panels.iter().enumerate() {
        let Some(data) = image.panel_data.get_mut(panel_index) else {
            continue;
        };
        for ss in 0..panel.height {
            for fs in 0..panel.width {
                let lab = panel.pixel_to_lab(fs as f64, ss as f64);
                let d = lab.magnitude();
                let within_min = min_distance.map(|r| d >= r).unwrap_or(true);
                let within_max = max_distance.map(|r| d <= r).unwrap_or(true);
                if !(within_min && within_max) {
                    data[ss * panel.width + fs] = 0.0;
                }
            }
        }
    }
}

/// Drive one image through the 8-step pipeline of spec §4.10:
/// wait (caller's responsibility) → filter/bad-pixel marking → peak
/// search → hit check → divergence/bandwidth defaults → indexing,
/// refinement, prediction, integration → stream emission.
#[allow(clippy::too_many_arguments)]
pub fn process_image<E: IndexingEngine>(
    mut image: Image,
    detector: &Detector,
    engine: &E,
    prior_cell: Option<&UnitCell>,
    reference: Option<&MergedReference>,
    config: &OrchestratorConfig,
    time: &mut TimeAccount,
) -> Result<ProcessedImage> {
    time.switch_to(Stage::Filter);
    mark_bad_pixels_by_resolution(&mut image, detector, config.resolution_limit_min, config.resolution_limit_max);

    time.switch_to(Stage::PeakSearch);
    let peaks = peaksearch::search(&image, detector, &config.peak_search, config.half_pixel_shift);
    image.peaks = peaks;
    let n_peaks = image.peaks.len();
    let is_hit = n_peaks >= config.min_peaks_for_hit;

    if !is_hit {
        time.switch_to(Stage::Nothing);
        return Ok(ProcessedImage {
            serial: image.serial,
            is_hit,
            n_peaks,
            crystals: Vec::new(),
        });
    }

    if image.divergence <= 0.0 {
        image.divergence = config.default_divergence;
    }
    if image.bandwidth <= 0.0 {
        image.bandwidth = config.default_bandwidth;
    }

    time.switch_to(Stage::Indexing);
    let request = IndexingRequest {
        engine_id: "default".to_string(),
        prior_cell: prior_cell.cloned(),
        prior_lattice: prior_cell.map(|c| c.lattice_type()),
        tolerances: crate::indexing::IndexingTolerances::default(),
        flags: crate::indexing::IndexingFlags {
            retry: true,
            multi: true,
            ..crate::indexing::IndexingFlags::default()
        },
    };
    let weaken = |img: &Image| {
        let mut next = img.clone();
        if let Some((weakest_idx, _)) = next
            .peaks
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.intensity.partial_cmp(&b.1.intensity).unwrap_or(std::cmp::Ordering::Equal))
        {
            next.peaks.remove(weakest_idx);
        }
        next
    };
    let strip_explained = |img: &Image, crystals: &[Crystal]| {
        let mut next = img.clone();
        next.peaks.retain(|p| {
            !crystals.iter().any(|c| {
                c.reflections
                    .iter()
                    .any(|r| r.panel_index == Some(p.panel_index) && r.detector_pos.map(|(fs, ss)| (fs - p.fs).abs() < 2.0 && (ss - p.ss).abs() < 2.0).unwrap_or(false))
            })
        });
        next
    };
    let mut crystals = match run_with_policy(engine, &request, detector, &image, weaken, strip_explained) {
        Ok(crystals) => crystals,
        Err(PipelineError::NoIndex { .. }) => {
            warn!(serial = image.serial, "no indexing solution found");
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    time.switch_to(Stage::PredParams);
    for crystal in &mut crystals {
        let predicted = prediction::predict(
            &crystal.cell,
            &image.spectrum,
            1.0 / image.wavelength,
            crystal.profile_radius,
            config.q_max,
            config.partiality_model,
            image.serial,
        )?;
        crystal.reflections = predicted;
    }

    time.switch_to(Stage::Integration);
    for crystal in &mut crystals {
        let indices: Vec<_> = crystal.reflections.iter().map(|r| r.index).collect();
        for idx in indices {
            let Some(refl) = crystal.reflections.get(&idx) else {
                continue;
            };
            let (Some((fs, ss)), Some(panel_index)) = (refl.detector_pos, refl.panel_index) else {
                continue;
            };
            let Some(result) = crate::integration::integrate_reflection(&image, detector, panel_index, fs, ss, config.integration_radii, config.exclude_saturated) else {
                continue;
            };
            if let Some(refl) = crystal.reflections.get_mut(&idx) {
                crate::integration::apply_result(refl, result);
            }
        }
    }

    if config.do_post_refinement {
        if let Some(reference) = reference {
            for crystal in &mut crystals {
                match refine_crystal(crystal, &image.spectrum, image.wavelength, config.q_max, reference, &[]) {
                    Ok(outcome) => {
                        info!(
                            serial = image.serial,
                            before = outcome.residual_before,
                            after = outcome.residual_after,
                            "post-refinement improved residual"
                        );
                    }
                    Err(e) => {
                        warn!(serial = image.serial, error = %e, "post-refinement skipped");
                    }
                }
            }
        }
    }

    time.switch_to(Stage::Nothing);
    Ok(ProcessedImage {
        serial: image.serial,
        is_hit,
        n_peaks,
        crystals,
    })
}

/// Append one processed image's record to a stream writer (spec §4.10
/// step 8).
pub fn emit_stream_record<W: std::io::Write>(out: &mut W, processed: &ProcessedImage, indexed_by: &str) -> Result<()> {
    let record = ImageRecord {
        serial: processed.serial,
        is_hit: processed.is_hit,
        indexed_by,
        n_peaks: processed.n_peaks,
        crystals: &processed.crystals,
    };
    write_chunk(out, &record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn time_account_attributes_elapsed_time_to_the_open_stage() {
        let mut ta = TimeAccount::new();
        ta.switch_to(Stage::PeakSearch);
        sleep(Duration::from_millis(5));
        ta.switch_to(Stage::Indexing);
        sleep(Duration::from_millis(5));
        ta.finish();

        assert!(ta.total(Stage::PeakSearch) >= Duration::from_millis(4));
        assert!(ta.total(Stage::Indexing) >= Duration::from_millis(4));
        assert_eq!(ta.total(Stage::Filter), Duration::ZERO);
    }

    #[test]
    fn report_is_sorted_by_descending_duration() {
        let mut ta = TimeAccount::new();
        ta.switch_to(Stage::PeakSearch);
        sleep(Duration::from_millis(2));
        ta.switch_to(Stage::Indexing);
        sleep(Duration::from_millis(8));
        ta.finish();

        let report = ta.report();
        assert_eq!(report[0].0, Stage::Indexing);
    }
}
