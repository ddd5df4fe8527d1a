//! Ring-sum integration contract (spec §4.9).

use crate::geometry::{Detector, Image};
use crate::reflection::Reflection;

/// Inner/middle/outer integration radii, in pixels.
#[derive(Clone, Copy, Debug)]
pub struct IntegrationRadii {
    pub inner: f64,
    pub middle: f64,
    pub outer: f64,
}

impl IntegrationRadii {
    pub fn inner_pixel_count(&self) -> f64 {
        std::f64::consts::PI * self.inner * self.inner
    }

    fn annulus_pixel_count(&self) -> f64 {
        std::f64::consts::PI * (self.outer * self.outer - self.middle * self.middle)
    }
}

/// Result of integrating one reflection's predicted disc.
#[derive(Clone, Copy, Debug)]
pub struct IntegrationResult {
    pub intensity: f64,
    pub sigma: f64,
    pub background: f64,
    pub peak_sum: f64,
    pub saturated: bool,
}

/// Sum raw (unfiltered) pixels inside `radius` of `(fs, ss)` on one
/// panel, returning `(sum, n_pixels, saturated)`.
fn sum_disc(
    image: &Image,
    panel_index: usize,
    panel: &crate::geometry::Panel,
    fs: f64,
    ss: f64,
    radius: f64,
) -> (f64, usize, bool) {
    let mut sum = 0.0;
    let mut n = 0usize;
    let mut saturated = false;
    let r_int = radius.ceil() as i64;
    let (fs0, ss0) = (fs.round() as i64, ss.round() as i64);
    for dy in -r_int..=r_int {
        for dx in -r_int..=r_int {
            if ((dx * dx + dy * dy) as f64) > radius * radius {
                continue;
            }
            let (px, py) = (fs0 + dx, ss0 + dy);
            if px < 0 || py < 0 || px as usize >= panel.width || py as usize >= panel.height {
                continue;
            }
            let (pxu, pyu) = (px as usize, py as usize);
            if panel.is_bad(pxu, pyu) {
                continue;
            }
            let Some(v) = image.pixel(panel_index, pxu, pyu, panel) else {
                continue;
            };
            if v >= panel.saturation_value {
                saturated = true;
            }
            sum += v as f64;
            n += 1;
        }
    }
    (sum, n, saturated)
}

/// Ring-sum integration: peak disc minus a background estimated from
/// the middle/outer annulus (spec §4.9). `exclude_saturated` drops the
/// reflection's contribution (returns `None`) rather than reporting a
/// biased intensity.
pub fn integrate_reflection(
    image: &Image,
    detector: &Detector,
    panel_index: usize,
    fs: f64,
    ss: f64,
    radii: IntegrationRadii,
    exclude_saturated: bool,
) -> Option<IntegrationResult> {
    let panel = detector.panel(panel_index)?;

    let (peak_raw, peak_n, peak_saturated) = sum_disc(image, panel_index, panel, fs, ss, radii.inner);
    let (outer_raw, outer_n, _) = sum_disc(image, panel_index, panel, fs, ss, radii.outer);
    let (middle_raw, middle_n, _) = sum_disc(image, panel_index, panel, fs, ss, radii.middle);

    if exclude_saturated && peak_saturated {
        return None;
    }

    let annulus_sum = outer_raw - middle_raw;
    let annulus_n = (outer_n.saturating_sub(middle_n)) as f64;
    if annulus_n < 1.0 {
        return None;
    }
    let background_per_pixel = annulus_sum / annulus_n;

    let peak_sum = peak_raw;
    let background = background_per_pixel * peak_n as f64;
    let intensity = peak_sum - background;

    // Poisson variance of the raw counts plus the background estimate
    // propagated through the subtraction (spec §4.9).
    let var_peak = peak_raw.max(0.0);
    let var_bg_estimate = annulus_sum.max(0.0) * (peak_n as f64 / annulus_n).powi(2);
    let sigma = (var_peak + var_bg_estimate).max(0.0).sqrt();

    Some(IntegrationResult {
        intensity,
        sigma,
        background,
        peak_sum,
        saturated: peak_saturated,
    })
}

/// Apply an [`IntegrationResult`] to a [`Reflection`]'s bookkeeping
/// fields.
pub fn apply_result(refl: &mut Reflection, result: IntegrationResult) {
    refl.intensity = result.intensity;
    refl.sigma = result.sigma;
    refl.background = result.background;
    refl.peak_sum = result.peak_sum;
    refl.flags.saturated = result.saturated;
    refl.flags.bad_integration = result.sigma <= 0.0 || !result.intensity.is_finite();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Panel, Spectrum};
    use lin_alg::f64::Vec3;

    fn detector_with_flat_panel() -> Detector {
        let panel = Panel::new(
            "p0",
            50,
            50,
            75e-6,
            Vec3::new(0.0, 0.0, 0.1),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            0.1,
        );
        Detector::new(vec![panel])
    }

    #[test]
    fn flat_background_yields_near_zero_intensity() {
        let detector = detector_with_flat_panel();
        let mut image = Image::new(0, &detector, 1e-10, Spectrum::default());
        for v in image.panel_data[0].iter_mut() {
            *v = 10.0;
        }
        let radii = IntegrationRadii {
            inner: 2.0,
            middle: 4.0,
            outer: 6.0,
        };
        let result = integrate_reflection(&image, &detector, 0, 25.0, 25.0, radii, false).unwrap();
        assert!(result.intensity.abs() < 1e-6);
    }

    #[test]
    fn bright_peak_over_flat_background_is_positive() {
        let detector = detector_with_flat_panel();
        let mut image = Image::new(0, &detector, 1e-10, Spectrum::default());
        for v in image.panel_data[0].iter_mut() {
            *v = 10.0;
        }
        let panel = &detector.panels[0];
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                let (px, py) = (25 + dx, 25 + dy);
                image.panel_data[0][py as usize * panel.width + px as usize] += 500.0;
            }
        }
        let radii = IntegrationRadii {
            inner: 2.0,
            middle: 4.0,
            outer: 6.0,
        };
        let result = integrate_reflection(&image, &detector, 0, 25.0, 25.0, radii, false).unwrap();
        assert!(result.intensity > 1000.0);
    }

    #[test]
    fn saturated_peak_excluded_when_requested() {
        let detector = detector_with_flat_panel();
        let mut image = Image::new(0, &detector, 1e-10, Spectrum::default());
        let mut panel = detector.panels[0].clone();
        panel.saturation_value = 100.0;
        let mut det2 = detector.clone();
        det2.panels[0] = panel;
        image.panel_data[0][25 * 50 + 25] = 200.0;
        let radii = IntegrationRadii {
            inner: 2.0,
            middle: 4.0,
            outer: 6.0,
        };
        let result = integrate_reflection(&image, &det2, 0, 25.0, 25.0, radii, true);
        assert!(result.is_none());
    }
}
