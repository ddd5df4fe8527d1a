//! INI-style detector geometry file parsing (spec §6 "Geometry file").
//!
//! Parsed once per worker at start-up; manual line tokenizing in the
//! same style as the teacher's `mmcif.rs`/`sdf.rs` readers, rather than
//! an INI-parsing crate.

use std::collections::HashMap;
use std::path::Path;

use lin_alg::f64::Vec3;

use crate::error::{PipelineError, Result};
use crate::geometry::{Detector, Panel};

#[derive(Default)]
struct PanelFields {
    width: Option<usize>,
    height: Option<usize>,
    pixel_size: Option<f64>,
    origin: [Option<f64>; 3],
    fs_axis: Option<[f64; 3]>,
    ss_axis: Option<[f64; 3]>,
    clen: Option<f64>,
}

fn parse_error(reason: impl Into<String>) -> PipelineError {
    PipelineError::ParseError {
        kind: "geometry",
        path: None,
        reason: reason.into(),
    }
}

fn parse_axis(value: &str) -> Result<[f64; 3]> {
    // CrystFEL-style axis strings look like "1.0x +0.2y" or "x", listing
    // non-zero components only; accept that compact form here.
    let mut axis = [0.0; 3];
    for token in value.split_whitespace() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (coeff_str, letter) = token.split_at(token.len() - 1);
        let coeff: f64 = if coeff_str.is_empty() || coeff_str == "+" {
            1.0
        } else if coeff_str == "-" {
            -1.0
        } else {
            coeff_str.parse().map_err(|_| parse_error(format!("bad axis component {token:?}")))?
        };
        match letter {
            "x" => axis[0] += coeff,
            "y" => axis[1] += coeff,
            "z" => axis[2] += coeff,
            other => return Err(parse_error(format!("unknown axis letter {other:?}"))),
        }
    }
    Ok(axis)
}

/// Parse a geometry file's text into a [`Detector`].
pub fn parse_geom_str(text: &str) -> Result<Detector> {
    let mut panels: HashMap<String, PanelFields> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            let name = line.trim_start_matches('[').trim_end_matches(']').trim().to_string();
            if !panels.contains_key(&name) {
                order.push(name.clone());
                panels.insert(name.clone(), PanelFields::default());
            }
            current = Some(name);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue; // tolerate stray lines rather than failing the whole file
        };
        let (key, value) = (key.trim(), value.trim());

        let Some(panel_name) = &current else {
            continue; // global directives (e.g. photon_energy) are out of scope here
        };
        let fields = panels.get_mut(panel_name).expect("panel inserted above");

        match key {
            "min_fs" | "max_fs" | "min_ss" | "max_ss" => {
                // width/height derived from max_fs/max_ss + 1 below.
                let v: usize = value.parse().map_err(|_| parse_error(format!("bad integer in {key} = {value}")))?;
                match key {
                    "max_fs" => fields.width = Some(v + 1),
                    "max_ss" => fields.height = Some(v + 1),
                    _ => {}
                }
            }
            "res" => {
                let per_metre: f64 = value.parse().map_err(|_| parse_error("bad res value"))?;
                if per_metre <= 0.0 {
                    return Err(parse_error("res must be positive"));
                }
                fields.pixel_size = Some(1.0 / per_metre);
            }
            "corner_x" => fields.origin[0] = Some(value.parse().map_err(|_| parse_error("bad corner_x"))?),
            "corner_y" => fields.origin[1] = Some(value.parse().map_err(|_| parse_error("bad corner_y"))?),
            "clen" => fields.clen = Some(value.parse().map_err(|_| parse_error("bad clen"))?),
            "fs" => fields.fs_axis = Some(parse_axis(value)?),
            "ss" => fields.ss_axis = Some(parse_axis(value)?),
            _ => {} // ignore directives this pipeline doesn't model (coffset, adu_per_photon, ...)
        }
    }

    let mut built = Vec::with_capacity(order.len());
    for name in order {
        let f = panels.remove(&name).expect("name came from order");
        let width = f.width.ok_or_else(|| parse_error(format!("panel {name} missing max_fs")))?;
        let height = f.height.ok_or_else(|| parse_error(format!("panel {name} missing max_ss")))?;
        let pixel_size = f.pixel_size.unwrap_or(75e-6);
        let clen = f.clen.unwrap_or(0.1);
        let ox = f.origin[0].unwrap_or(0.0) * pixel_size;
        let oy = f.origin[1].unwrap_or(0.0) * pixel_size;
        let fs_axis = f.fs_axis.unwrap_or([1.0, 0.0, 0.0]);
        let ss_axis = f.ss_axis.unwrap_or([0.0, 1.0, 0.0]);

        built.push(Panel::new(
            name,
            width,
            height,
            pixel_size,
            Vec3::new(ox, oy, clen),
            Vec3::new(fs_axis[0], fs_axis[1], fs_axis[2]),
            Vec3::new(ss_axis[0], ss_axis[1], ss_axis[2]),
            clen,
        ));
    }

    Ok(Detector::new(built))
}

pub fn parse_geom_file(path: &Path) -> Result<Detector> {
    let text = std::fs::read_to_string(path).map_err(|source| PipelineError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    parse_geom_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; a comment line
[panel0]
min_fs = 0
max_fs = 511
min_ss = 0
max_ss = 1023
res = 13333.3
corner_x = -256.0
corner_y = -512.0
clen = 0.1
fs = x
ss = y
";

    #[test]
    fn parses_single_panel() {
        let det = parse_geom_str(SAMPLE).unwrap();
        assert_eq!(det.panels.len(), 1);
        let p = &det.panels[0];
        assert_eq!(p.width, 512);
        assert_eq!(p.height, 1024);
        assert!((p.clen - 0.1).abs() < 1e-12);
    }

    #[test]
    fn parses_compound_axis_strings() {
        assert_eq!(parse_axis("-1.0x +0.5y").unwrap(), [-1.0, 0.5, 0.0]);
        assert_eq!(parse_axis("x").unwrap(), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn missing_max_fs_errors() {
        let text = "[p0]\nmax_ss = 10\n";
        assert!(parse_geom_str(text).is_err());
    }
}
