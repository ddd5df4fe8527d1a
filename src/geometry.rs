//! Image & detector geometry: panel array, pixel-to-lab-frame mapping
//! (spec §3 "Image / Detector", §4.5).

use lin_alg::f64::Vec3;

use crate::rational::IntMatrix;

/// One physical detector tile.
#[derive(Clone, Debug)]
pub struct Panel {
    pub name: String,
    pub width: usize,
    pub height: usize,
    /// Pixel pitch in metres (assumed square pixels).
    pub pixel_size: f64,
    /// Lab-frame position of the (0,0) pixel corner, metres.
    pub origin: Vec3,
    /// Lab-frame direction of increasing `fs`, unit vector.
    pub fs_axis: Vec3,
    /// Lab-frame direction of increasing `ss`, unit vector.
    pub ss_axis: Vec3,
    /// Camera length along the beam axis, metres.
    pub clen: f64,
    /// `true` where a pixel is flagged bad (masked, dead, shadowed).
    pub bad_pixel_mask: Vec<bool>,
    pub saturation_value: f32,
}

impl Panel {
    pub fn new(
        name: impl Into<String>,
        width: usize,
        height: usize,
        pixel_size: f64,
        origin: Vec3,
        fs_axis: Vec3,
        ss_axis: Vec3,
        clen: f64,
    ) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            pixel_size,
            origin,
            fs_axis,
            ss_axis,
            clen,
            bad_pixel_mask: vec![false; width * height],
            saturation_value: f32::MAX,
        }
    }

    pub fn in_bounds(&self, fs: f64, ss: f64) -> bool {
        fs >= 0.0 && fs < self.width as f64 && ss >= 0.0 && ss < self.height as f64
    }

    pub fn is_bad(&self, fs: usize, ss: usize) -> bool {
        self.bad_pixel_mask
            .get(ss * self.width + fs)
            .copied()
            .unwrap_or(true)
    }

    pub fn set_bad(&mut self, fs: usize, ss: usize, bad: bool) {
        if let Some(slot) = self.bad_pixel_mask.get_mut(ss * self.width + fs) {
            *slot = bad;
        }
    }

    /// Lab-frame position of pixel `(fs, ss)`, pixel centre.
    pub fn pixel_to_lab(&self, fs: f64, ss: f64) -> Vec3 {
        self.origin + self.fs_axis * (fs * self.pixel_size) + self.ss_axis * (ss * self.pixel_size)
    }

    /// Unit vector normal to the panel plane, `fs_axis x ss_axis`
    /// normalized; used to solve for a ray-panel intersection.
    fn normal(&self) -> Vec3 {
        let n = self.fs_axis.cross(self.ss_axis);
        n * (1.0 / n.magnitude())
    }

    /// Given a scattered-direction vector (not necessarily unit), find
    /// the `(fs, ss)` pixel coordinates where it crosses this panel's
    /// plane, if any, by solving the 3x3 linear system
    /// `origin + fs*fs_axis + ss*ss_axis = t*dir` for `(t, fs, ss)`
    /// (spec §4.5).
    pub fn intersect(&self, dir: Vec3) -> Option<(f64, f64)> {
        let n = self.normal();
        let denom = n.dot(dir);
        if denom.abs() < 1e-30 {
            return None;
        }
        let t = n.dot(self.origin) / denom;
        if t <= 0.0 {
            return None;
        }
        let hit = dir * t;
        let rel = hit - self.origin;
        // project rel onto the (fs_axis, ss_axis) basis; they need not
        // be orthonormal in general, so solve the 2x2 normal system.
        let a11 = self.fs_axis.dot(self.fs_axis);
        let a12 = self.fs_axis.dot(self.ss_axis);
        let a22 = self.ss_axis.dot(self.ss_axis);
        let b1 = rel.dot(self.fs_axis);
        let b2 = rel.dot(self.ss_axis);
        let det = a11 * a22 - a12 * a12;
        if det.abs() < 1e-30 {
            return None;
        }
        let fs_len = (b1 * a22 - b2 * a12) / det;
        let ss_len = (a11 * b2 - a12 * b1) / det;
        Some((fs_len / self.pixel_size, ss_len / self.pixel_size))
    }
}

/// An ordered sequence of panels (spec §3 "Image / Detector").
#[derive(Clone, Debug, Default)]
pub struct Detector {
    pub panels: Vec<Panel>,
}

impl Detector {
    pub fn new(panels: Vec<Panel>) -> Self {
        Self { panels }
    }

    pub fn panel(&self, idx: usize) -> Option<&Panel> {
        self.panels.get(idx)
    }

    /// Find which panel a lab-frame scattered-direction vector `dir`
    /// hits, trying panels in order and stopping at the first in-bounds
    /// solution (spec §4.5: "iterate panels until a hit is found").
    pub fn locate(&self, dir: Vec3) -> Option<(usize, f64, f64)> {
        for (idx, panel) in self.panels.iter().enumerate() {
            if let Some((fs, ss)) = panel.intersect(dir) {
                if panel.in_bounds(fs, ss) {
                    return Some((idx, fs, ss));
                }
            }
        }
        None
    }

    /// Predicted detector position for a reciprocal vector `q` at
    /// wavenumber `k`: the scattered direction is `k*beam_dir + q`,
    /// where `beam_dir` is the unit incident-beam direction (spec
    /// §4.5). Conventionally the beam travels along `+z`.
    pub fn predict_position(&self, q: Vec3, k: f64, beam_dir: Vec3) -> Option<(usize, f64, f64)> {
        let dir = beam_dir * k + q;
        self.locate(dir)
    }
}

/// A single Gaussian term of the beam spectrum, over wavenumber
/// (spec §3 "Image / Detector").
#[derive(Clone, Copy, Debug)]
pub struct SpectrumGaussian {
    /// Central wavenumber, m^-1.
    pub kcen: f64,
    /// Standard deviation, m^-1.
    pub sigma: f64,
    /// Relative weight (need not be pre-normalized).
    pub area: f64,
}

/// Finite sum-of-Gaussians beam spectrum over wavenumber.
#[derive(Clone, Debug, Default)]
pub struct Spectrum {
    pub terms: Vec<SpectrumGaussian>,
}

impl Spectrum {
    pub fn single(kcen: f64, sigma: f64) -> Self {
        Self {
            terms: vec![SpectrumGaussian {
                kcen,
                sigma,
                area: 1.0,
            }],
        }
    }

    /// `E(k)`, the spectral density at wavenumber `k` (spec §4.8.2).
    pub fn density(&self, k: f64) -> f64 {
        self.terms
            .iter()
            .map(|g| {
                let z = (k - g.kcen) / g.sigma;
                g.area * (-0.5 * z * z).exp() / (g.sigma * (2.0 * std::f64::consts::PI).sqrt())
            })
            .sum()
    }

    pub fn total_area(&self) -> f64 {
        self.terms.iter().map(|g| g.area).sum()
    }
}

/// A peak found on the detector before indexing (spec §4.6).
#[derive(Clone, Copy, Debug)]
pub struct Peak {
    pub fs: f64,
    pub ss: f64,
    pub panel_index: usize,
    pub intensity: f64,
    pub background: f64,
}

/// One raw diffraction frame (spec §3 "Image / Detector").
#[derive(Clone, Debug)]
pub struct Image {
    pub serial: u64,
    /// One floating-point pixel buffer per panel, row-major `ss*width+fs`.
    pub panel_data: Vec<Vec<f32>>,
    pub wavelength: f64,
    pub spectrum: Spectrum,
    pub peaks: Vec<Peak>,
    pub divergence: f64,
    pub bandwidth: f64,
    /// Basis-change matrix applied for a multi-lattice re-index pass,
    /// if any (spec §4.7 `MULTI`).
    pub reindex_used: Option<IntMatrix>,
}

impl Image {
    pub fn new(serial: u64, detector: &Detector, wavelength: f64, spectrum: Spectrum) -> Self {
        let panel_data = detector
            .panels
            .iter()
            .map(|p| vec![0.0f32; p.width * p.height])
            .collect();
        Self {
            serial,
            panel_data,
            wavelength,
            spectrum,
            peaks: Vec::new(),
            divergence: 0.0,
            bandwidth: 0.0,
            reindex_used: None,
        }
    }

    pub fn pixel(&self, panel_index: usize, fs: usize, ss: usize, panel: &Panel) -> Option<f32> {
        self.panel_data
            .get(panel_index)?
            .get(ss * panel.width + fs)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_panel() -> Panel {
        Panel::new(
            "p0",
            100,
            100,
            75e-6,
            Vec3::new(-100.0 * 75e-6 / 2.0, -100.0 * 75e-6 / 2.0, 0.1),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            0.1,
        )
    }

    #[test]
    fn straight_through_beam_hits_panel_centre() {
        let panel = flat_panel();
        let dir = Vec3::new(0.0, 0.0, 1.0);
        let (fs, ss) = panel.intersect(dir).unwrap();
        assert!((fs - 50.0).abs() < 1e-6);
        assert!((ss - 50.0).abs() < 1e-6);
        assert!(panel.in_bounds(fs, ss));
    }

    #[test]
    fn backward_direction_misses() {
        let panel = flat_panel();
        assert!(panel.intersect(Vec3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn detector_locate_finds_first_in_bounds_panel() {
        let det = Detector::new(vec![flat_panel()]);
        let hit = det.locate(Vec3::new(0.0, 0.0, 1.0));
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().0, 0);
    }

    #[test]
    fn spectrum_density_peaks_at_centre() {
        let spec = Spectrum::single(1e10, 1e7);
        assert!(spec.density(1e10) > spec.density(1e10 + 5e7));
    }

    #[test]
    fn pixel_to_lab_matches_intersect_round_trip() {
        let panel = flat_panel();
        let lab = panel.pixel_to_lab(30.0, 40.0);
        let dir = lab;
        let (fs, ss) = panel.intersect(dir).unwrap();
        assert!((fs - 30.0).abs() < 1e-6);
        assert!((ss - 40.0).abs() < 1e-6);
    }
}
