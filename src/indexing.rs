//! Pluggable indexing engine interface (spec §4.7).

use crate::cell::{LatticeType, UnitCell};
use crate::crystal::Crystal;
use crate::geometry::{Detector, Image};

/// Behaviour modifiers an indexing run can be given (spec §4.7).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexingFlags {
    pub check_cell_combinations: bool,
    pub check_cell_axes: bool,
    pub check_peaks: bool,
    pub use_lattice_type: bool,
    pub use_cell_parameters: bool,
    /// Drop the weakest peaks and re-try on failure.
    pub retry: bool,
    /// After a success, strip explained peaks and try again.
    pub multi: bool,
}

/// Per-run tolerances an engine should respect when a prior cell is
/// supplied.
#[derive(Clone, Copy, Debug)]
pub struct IndexingTolerances {
    pub length_pct: f64,
    pub angle_deg: f64,
}

impl Default for IndexingTolerances {
    fn default() -> Self {
        Self {
            length_pct: 5.0,
            angle_deg: 1.5,
        }
    }
}

/// Everything an engine's `prepare` call receives (spec §4.7).
#[derive(Clone, Debug)]
pub struct IndexingRequest {
    pub engine_id: String,
    pub prior_cell: Option<UnitCell>,
    pub prior_lattice: Option<LatticeType>,
    pub tolerances: IndexingTolerances,
    pub flags: IndexingFlags,
}

/// Opaque per-engine preparation state. Engines are external
/// collaborators (spec §1 Out of scope); this crate only defines the
/// capability boundary they are driven through.
pub trait IndexingEngine {
    /// Engine-private handle returned by a successful `prepare`.
    type Private;

    fn prepare(&self, request: &IndexingRequest, detector: &Detector) -> crate::error::Result<Self::Private>;

    /// Attempt exactly one indexing pass; the orchestrator drives
    /// retry/multi logic (spec §4.7: "engines are only expected to
    /// implement a single attempt").
    fn run(&self, priv_state: &mut Self::Private, image: &Image) -> crate::error::Result<Vec<Crystal>>;

    fn cleanup(&self, priv_state: Self::Private);

    /// `Some(engine_id)` if this engine can handle the given cell
    /// (e.g. a lattice-type-specific engine), `None` otherwise.
    fn probe(&self, cell: Option<&UnitCell>) -> Option<String>;
}

/// Drives the retry/multi policy of spec §4.7 around a single
/// [`IndexingEngine`] attempt. `weaken` drops the weakest peaks from a
/// copy of the image for the `RETRY` path; `strip_explained` removes
/// peaks already accounted for by `found` for the `MULTI` path.
pub fn run_with_policy<E: IndexingEngine>(
    engine: &E,
    request: &IndexingRequest,
    detector: &Detector,
    image: &Image,
    mut weaken: impl FnMut(&Image) -> Image,
    mut strip_explained: impl FnMut(&Image, &[Crystal]) -> Image,
) -> crate::error::Result<Vec<Crystal>> {
    let mut found = Vec::new();
    let mut working = image.clone();

    loop {
        let mut priv_state = engine.prepare(request, detector)?;
        let attempt = engine.run(&mut priv_state, &working);
        engine.cleanup(priv_state);

        match attempt {
            Ok(crystals) if !crystals.is_empty() => {
                found.extend(crystals.clone());
                if request.flags.multi {
                    working = strip_explained(&working, &crystals);
                    continue;
                }
                break;
            }
            _ if request.flags.retry && !found.is_empty() => break,
            _ if request.flags.retry => {
                let weakened = weaken(&working);
                if weakened.peaks.len() == working.peaks.len() {
                    break; // nothing left to drop
                }
                working = weakened;
                continue;
            }
            _ => break,
        }
    }

    if found.is_empty() {
        return Err(crate::error::PipelineError::NoIndex {
            image_serial: Some(image.serial),
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    struct StubEngine {
        cell: UnitCell,
    }

    impl IndexingEngine for StubEngine {
        type Private = ();

        fn prepare(&self, _request: &IndexingRequest, _detector: &Detector) -> crate::error::Result<()> {
            Ok(())
        }

        fn run(&self, _priv_state: &mut (), image: &Image) -> crate::error::Result<Vec<Crystal>> {
            if image.peaks.len() >= 4 {
                Ok(vec![Crystal::new(self.cell, image.serial)])
            } else {
                Ok(vec![])
            }
        }

        fn cleanup(&self, _priv_state: ()) {}

        fn probe(&self, _cell: Option<&UnitCell>) -> Option<String> {
            Some("stub".to_string())
        }
    }

    fn empty_image(serial: u64, n_peaks: usize) -> Image {
        let det = Detector::new(vec![]);
        let mut img = Image::new(serial, &det, 1e-10, crate::geometry::Spectrum::default());
        for i in 0..n_peaks {
            img.peaks.push(crate::geometry::Peak {
                fs: i as f64,
                ss: 0.0,
                panel_index: 0,
                intensity: 100.0,
                background: 0.0,
            });
        }
        img
    }

    #[test]
    fn succeeds_immediately_with_enough_peaks() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let engine = StubEngine { cell };
        let request = IndexingRequest {
            engine_id: "stub".into(),
            prior_cell: None,
            prior_lattice: None,
            tolerances: IndexingTolerances::default(),
            flags: IndexingFlags::default(),
        };
        let det = Detector::new(vec![]);
        let image = empty_image(1, 5);
        let result = run_with_policy(&engine, &request, &det, &image, |img| img.clone(), |img, _| img.clone());
        assert_eq!(result.unwrap().len(), 1);
    }

    #[test]
    fn fails_with_no_index_error_when_too_few_peaks() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let engine = StubEngine { cell };
        let request = IndexingRequest {
            engine_id: "stub".into(),
            prior_cell: None,
            prior_lattice: None,
            tolerances: IndexingTolerances::default(),
            flags: IndexingFlags::default(),
        };
        let det = Detector::new(vec![]);
        let image = empty_image(2, 1);
        let result = run_with_policy(&engine, &request, &det, &image, |img| img.clone(), |img, _| img.clone());
        assert!(matches!(result, Err(crate::error::PipelineError::NoIndex { image_serial: Some(2) })));
    }
}
