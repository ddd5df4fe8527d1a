//! Pluggable peak-search back-ends (spec §4.6).

use crate::geometry::{Detector, Image, Peak};

/// Gradient-based detector parameters (Zaefferer-style).
#[derive(Clone, Copy, Debug)]
pub struct GradientParams {
    pub value_threshold: f32,
    pub gradient_threshold: f32,
    pub min_snr: f32,
    /// Half-width of the centre-of-mass refinement window, pixels.
    pub com_radius: i64,
}

/// Connected-component detector parameters (PeakFinder8/9-style).
#[derive(Clone, Copy, Debug)]
pub struct ConnectedComponentParams {
    pub inner_radius: f64,
    pub middle_radius: f64,
    pub outer_radius: f64,
    pub min_pixel_count: usize,
    pub max_pixel_count: usize,
    pub min_snr: f32,
}

/// Selectable peak-search back-end (spec §4.6).
pub enum PeakSearchMethod {
    Gradient(GradientParams),
    ConnectedComponent(ConnectedComponentParams),
    /// Pre-computed peaks attached to the image elsewhere (HDF5/CXI
    /// peak tables); `revalidate` re-checks SNR before accepting them.
    External { revalidate: bool },
}

/// Optional 0.5-pixel correction for providers that report pixel
/// indices rather than corner-based coordinates (spec §4.6).
fn apply_half_pixel_shift(peaks: &mut [Peak], shift: bool) {
    if !shift {
        return;
    }
    for p in peaks.iter_mut() {
        p.fs += 0.5;
        p.ss += 0.5;
    }
}

fn local_background(data: &[f32], width: usize, height: usize, fs: usize, ss: usize, inner: f64, outer: f64) -> f32 {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    let r_out = outer.ceil() as i64;
    for dy in -r_out..=r_out {
        for dx in -r_out..=r_out {
            let d2 = (dx * dx + dy * dy) as f64;
            if d2 <= inner * inner || d2 > outer * outer {
                continue;
            }
            let (px, py) = (fs as i64 + dx, ss as i64 + dy);
            if px < 0 || py < 0 || px as usize >= width || py as usize >= height {
                continue;
            }
            sum += data[py as usize * width + px as usize] as f64;
            n += 1;
        }
    }
    if n == 0 { 0.0 } else { (sum / n as f64) as f32 }
}

fn gradient_magnitude_sq(data: &[f32], width: usize, height: usize, fs: usize, ss: usize) -> f32 {
    if fs == 0 || ss == 0 || fs + 1 >= width || ss + 1 >= height {
        return 0.0;
    }
    let gx = data[ss * width + fs + 1] - data[ss * width + fs - 1];
    let gy = data[(ss + 1) * width + fs] - data[(ss - 1) * width + fs];
    gx * gx + gy * gy
}

/// Gradient-based search: threshold on value and squared gradient,
/// then centre-of-mass refinement and an SNR re-check (spec §4.6).
fn search_gradient(data: &[f32], width: usize, height: usize, panel_index: usize, params: GradientParams) -> Vec<Peak> {
    let mut peaks = Vec::new();
    for ss in 1..height.saturating_sub(1) {
        for fs in 1..width.saturating_sub(1) {
            let v = data[ss * width + fs];
            if v < params.value_threshold {
                continue;
            }
            if gradient_magnitude_sq(data, width, height, fs, ss) < params.gradient_threshold.powi(2) {
                continue;
            }

            let r = params.com_radius.max(1);
            let mut sum_v = 0.0f64;
            let mut sum_fs = 0.0f64;
            let mut sum_ss = 0.0f64;
            for dy in -r..=r {
                for dx in -r..=r {
                    let (px, py) = (fs as i64 + dx, ss as i64 + dy);
                    if px < 0 || py < 0 || px as usize >= width || py as usize >= height {
                        continue;
                    }
                    let pv = data[py as usize * width + px as usize].max(0.0) as f64;
                    sum_v += pv;
                    sum_fs += pv * px as f64;
                    sum_ss += pv * py as f64;
                }
            }
            if sum_v <= 0.0 {
                continue;
            }
            let (com_fs, com_ss) = (sum_fs / sum_v, sum_ss / sum_v);

            let background = local_background(data, width, height, fs, ss, 2.0, 5.0) as f64;
            let signal = v as f64 - background;
            let noise = background.sqrt().max(1.0);
            if (signal / noise) < params.min_snr as f64 {
                continue;
            }

            peaks.push(Peak {
                fs: com_fs,
                ss: com_ss,
                panel_index,
                intensity: signal,
                background,
            });
        }
    }
    peaks
}

/// Connected-component search: local background subtraction then
/// region-growing, filtered by pixel-count and SNR bounds (spec §4.6).
fn search_connected_component(
    data: &[f32],
    width: usize,
    height: usize,
    panel_index: usize,
    params: ConnectedComponentParams,
) -> Vec<Peak> {
    let mut visited = vec![false; width * height];
    let mut peaks = Vec::new();

    for start_ss in 0..height {
        for start_fs in 0..width {
            let idx0 = start_ss * width + start_fs;
            if visited[idx0] {
                continue;
            }
            let background = local_background(data, width, height, start_fs, start_ss, params.inner_radius, params.outer_radius) as f64;
            let noise = background.sqrt().max(1.0);
            if ((data[idx0] as f64 - background) / noise) < params.min_snr as f64 {
                visited[idx0] = true;
                continue;
            }

            // flood-fill the connected region above background+noise
            let mut stack = vec![(start_fs, start_ss)];
            let mut region = Vec::new();
            visited[idx0] = true;
            while let Some((fs, ss)) = stack.pop() {
                region.push((fs, ss));
                for (dfs, dss) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
                    let (nfs, nss) = (fs as i64 + dfs, ss as i64 + dss);
                    if nfs < 0 || nss < 0 || nfs as usize >= width || nss as usize >= height {
                        continue;
                    }
                    let (nfs, nss) = (nfs as usize, nss as usize);
                    let nidx = nss * width + nfs;
                    if visited[nidx] {
                        continue;
                    }
                    if (data[nidx] as f64 - background) / noise >= params.min_snr as f64 {
                        visited[nidx] = true;
                        stack.push((nfs, nss));
                    }
                }
            }

            if region.len() < params.min_pixel_count || region.len() > params.max_pixel_count {
                continue;
            }

            let mut sum_v = 0.0f64;
            let mut sum_fs = 0.0f64;
            let mut sum_ss = 0.0f64;
            for &(fs, ss) in &region {
                let v = (data[ss * width + fs] as f64 - background).max(0.0);
                sum_v += v;
                sum_fs += v * fs as f64;
                sum_ss += v * ss as f64;
            }
            if sum_v <= 0.0 {
                continue;
            }
            peaks.push(Peak {
                fs: sum_fs / sum_v,
                ss: sum_ss / sum_v,
                panel_index,
                intensity: sum_v,
                background,
            });
        }
    }
    peaks
}

/// Run the selected back-end over every panel of `image` (spec §4.6).
pub fn search(image: &Image, detector: &Detector, method: &PeakSearchMethod, half_pixel_shift: bool) -> Vec<Peak> {
    let mut peaks = match method {
        PeakSearchMethod::Gradient(params) => {
            let mut out = Vec::new();
            for (panel_index, panel) in detector.panels.iter().enumerate() {
                let Some(data) = image.panel_data.get(panel_index) else {
                    continue;
                };
                out.extend(search_gradient(data, panel.width, panel.height, panel_index, *params));
            }
            out
        }
        PeakSearchMethod::ConnectedComponent(params) => {
            let mut out = Vec::new();
            for (panel_index, panel) in detector.panels.iter().enumerate() {
                let Some(data) = image.panel_data.get(panel_index) else {
                    continue;
                };
                out.extend(search_connected_component(data, panel.width, panel.height, panel_index, *params));
            }
            out
        }
        PeakSearchMethod::External { revalidate } => {
            let mut out = image.peaks.clone();
            if *revalidate {
                out.retain(|p| {
                    let Some(panel) = detector.panel(p.panel_index) else {
                        return false;
                    };
                    let Some(data) = image.panel_data.get(p.panel_index) else {
                        return false;
                    };
                    let (fs, ss) = (p.fs.round() as usize, p.ss.round() as usize);
                    if fs >= panel.width || ss >= panel.height {
                        return false;
                    }
                    let background = local_background(data, panel.width, panel.height, fs, ss, 2.0, 5.0) as f64;
                    (p.intensity - background) > 0.0
                });
            }
            out
        }
    };
    apply_half_pixel_shift(&mut peaks, half_pixel_shift);
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Panel, Spectrum};
    use lin_alg::f64::Vec3;

    fn detector_and_image_with_one_spot() -> (Detector, Image) {
        let panel = Panel::new("p0", 30, 30, 75e-6, Vec3::new(0.0, 0.0, 0.1), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0), 0.1);
        let det = Detector::new(vec![panel]);
        let mut img = Image::new(0, &det, 1e-10, Spectrum::default());
        for v in img.panel_data[0].iter_mut() {
            *v = 1.0;
        }
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let (x, y) = (15 + dx, 15 + dy);
                img.panel_data[0][y as usize * 30 + x as usize] = 200.0;
            }
        }
        (det, img)
    }

    #[test]
    fn gradient_search_finds_the_spot() {
        let (det, img) = detector_and_image_with_one_spot();
        let params = GradientParams {
            value_threshold: 50.0,
            gradient_threshold: 10.0,
            min_snr: 2.0,
            com_radius: 2,
        };
        let peaks = search(&img, &det, &PeakSearchMethod::Gradient(params), false);
        assert!(!peaks.is_empty());
        let p = &peaks[0];
        assert!((p.fs - 15.0).abs() < 1.5);
        assert!((p.ss - 15.0).abs() < 1.5);
    }

    #[test]
    fn connected_component_search_respects_pixel_count_bounds() {
        let (det, img) = detector_and_image_with_one_spot();
        let params = ConnectedComponentParams {
            inner_radius: 2.0,
            middle_radius: 3.0,
            outer_radius: 6.0,
            min_pixel_count: 100,
            max_pixel_count: 1000,
            min_snr: 2.0,
        };
        // The 3x3 spot (9 pixels) is smaller than min_pixel_count=100.
        let peaks = search(&img, &det, &PeakSearchMethod::ConnectedComponent(params), false);
        assert!(peaks.is_empty());
    }

    #[test]
    fn external_peaks_pass_through_without_revalidation() {
        let (det, mut img) = detector_and_image_with_one_spot();
        img.peaks.push(Peak {
            fs: 15.0,
            ss: 15.0,
            panel_index: 0,
            intensity: 200.0,
            background: 1.0,
        });
        let peaks = search(&img, &det, &PeakSearchMethod::External { revalidate: false }, false);
        assert_eq!(peaks.len(), 1);
    }

    #[test]
    fn half_pixel_shift_applies_when_requested() {
        let (det, mut img) = detector_and_image_with_one_spot();
        img.peaks.push(Peak {
            fs: 15.0,
            ss: 15.0,
            panel_index: 0,
            intensity: 200.0,
            background: 1.0,
        });
        let peaks = search(&img, &det, &PeakSearchMethod::External { revalidate: false }, true);
        assert!((peaks[0].fs - 15.5).abs() < 1e-9);
    }
}
