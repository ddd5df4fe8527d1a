//! Line-oriented stream format: writer and reader (spec §6 "Stream
//! format").

use std::fmt::Write as _;
use std::io::{BufRead, Write};

use crate::cell::{Centering, LatticeType, UnitCell, UniqueAxis};
use crate::cell_utils::resolution;
use crate::crystal::Crystal;
use crate::error::{PipelineError, Result};
use crate::reflection::MillerIndex;

const CHUNK_BEGIN: &str = "----- Begin chunk -----";
const CHUNK_END: &str = "----- End chunk -----";
const CRYSTAL_BEGIN: &str = "--- Begin crystal";
const CRYSTAL_END: &str = "--- End crystal";
const REFLECTIONS_HEADER: &str = "  h   k   l          I    sigma(I)       peak background    fs    ss  panel";

fn parse_error(reason: impl Into<String>) -> PipelineError {
    PipelineError::ParseError {
        kind: "stream",
        path: None,
        reason: reason.into(),
    }
}

/// Write the file-level header (spec §6: "command line, geometry, and
/// reference cell").
pub fn write_header<W: Write>(out: &mut W, command_line: &str, geometry_path: &str, reference_cell: Option<&UnitCell>) -> Result<()> {
    writeln!(out, "CrystFEL-style stream version 2.3").map_err(io_err)?;
    writeln!(out, "Command line: {command_line}").map_err(io_err)?;
    writeln!(out, "Geometry file: {geometry_path}").map_err(io_err)?;
    if let Some(cell) = reference_cell {
        let (a, b, c, al, be, ga) = cell.parameters()?;
        writeln!(
            out,
            "Reference cell: {:.6} {:.6} {:.6} {:.4} {:.4} {:.4} {} {}",
            a * 1e10,
            b * 1e10,
            c * 1e10,
            al.to_degrees(),
            be.to_degrees(),
            ga.to_degrees(),
            cell.centering().letter(),
            lattice_type_name(cell.lattice_type()),
        )
        .map_err(io_err)?;
    }
    Ok(())
}

fn io_err(source: std::io::Error) -> PipelineError {
    PipelineError::IoError {
        path: "<stream>".into(),
        source,
    }
}

fn lattice_type_name(lt: LatticeType) -> &'static str {
    match lt {
        LatticeType::Triclinic => "triclinic",
        LatticeType::Monoclinic => "monoclinic",
        LatticeType::Orthorhombic => "orthorhombic",
        LatticeType::Tetragonal => "tetragonal",
        LatticeType::Rhombohedral => "rhombohedral",
        LatticeType::Hexagonal => "hexagonal",
        LatticeType::Cubic => "cubic",
    }
}

fn lattice_type_from_name(s: &str) -> Result<LatticeType> {
    Ok(match s {
        "triclinic" => LatticeType::Triclinic,
        "monoclinic" => LatticeType::Monoclinic,
        "orthorhombic" => LatticeType::Orthorhombic,
        "tetragonal" => LatticeType::Tetragonal,
        "rhombohedral" => LatticeType::Rhombohedral,
        "hexagonal" => LatticeType::Hexagonal,
        "cubic" => LatticeType::Cubic,
        other => return Err(parse_error(format!("unknown lattice type {other:?}"))),
    })
}

fn centering_from_letter(c: char) -> Result<Centering> {
    Ok(match c.to_ascii_uppercase() {
        'P' => Centering::P,
        'A' => Centering::A,
        'B' => Centering::B,
        'C' => Centering::C,
        'I' => Centering::I,
        'F' => Centering::F,
        'R' => Centering::R,
        'H' => Centering::H,
        other => return Err(parse_error(format!("unknown centering {other:?}"))),
    })
}

/// One fully-processed image's output record (spec §4.10 step 8).
pub struct ImageRecord<'a> {
    pub serial: u64,
    pub is_hit: bool,
    pub indexed_by: &'a str,
    pub n_peaks: usize,
    pub crystals: &'a [Crystal],
}

/// Write one image's chunk (spec §6: headers, peaks, crystal blocks).
pub fn write_chunk<W: Write>(out: &mut W, record: &ImageRecord) -> Result<()> {
    writeln!(out, "{CHUNK_BEGIN}").map_err(io_err)?;
    writeln!(out, "Image serial number: {}", record.serial).map_err(io_err)?;
    writeln!(out, "hit = {}", if record.is_hit { 1 } else { 0 }).map_err(io_err)?;
    writeln!(out, "indexed_by = {}", record.indexed_by).map_err(io_err)?;
    writeln!(out, "num_peaks = {}", record.n_peaks).map_err(io_err)?;

    for crystal in record.crystals {
        write_crystal(out, crystal)?;
    }

    writeln!(out, "{CHUNK_END}").map_err(io_err)?;
    Ok(())
}

fn write_crystal<W: Write>(out: &mut W, crystal: &Crystal) -> Result<()> {
    let (a, b, c, al, be, ga) = crystal.cell.parameters()?;
    writeln!(out, "{CRYSTAL_BEGIN}").map_err(io_err)?;
    writeln!(
        out,
        "Cell parameters {:.6} {:.6} {:.6} nm, {:.6} {:.6} {:.6} deg",
        a * 1e9,
        b * 1e9,
        c * 1e9,
        al.to_degrees(),
        be.to_degrees(),
        ga.to_degrees(),
    )
    .map_err(io_err)?;
    writeln!(out, "lattice_type = {}", lattice_type_name(crystal.cell.lattice_type())).map_err(io_err)?;
    writeln!(out, "centering = {}", crystal.cell.centering().letter()).map_err(io_err)?;
    writeln!(out, "profile_radius = {:.6} nm^-1", crystal.profile_radius * 1e-9).map_err(io_err)?;
    writeln!(out, "diffraction_resolution_limit = see reflections below").map_err(io_err)?;
    if !crystal.flags.is_empty() {
        let flags = crystal.flags.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",");
        writeln!(out, "flags = {flags}").map_err(io_err)?;
    }

    writeln!(out, "{REFLECTIONS_HEADER}").map_err(io_err)?;
    for refl in crystal.reflections.sorted_by_resolution(|idx| resolution(&crystal.cell, *idx).unwrap_or(f64::INFINITY)) {
        let mut line = String::new();
        let _ = write!(
            line,
            "{:4} {:4} {:4} {:10.2} {:10.2} {:10.2} {:10.2} {:5.1} {:5.1} {:4}",
            refl.index.h,
            refl.index.k,
            refl.index.l,
            refl.intensity,
            refl.sigma,
            refl.peak_sum,
            refl.background,
            refl.detector_pos.map(|p| p.0).unwrap_or(-1.0),
            refl.detector_pos.map(|p| p.1).unwrap_or(-1.0),
            refl.panel_index.map(|p| p as i64).unwrap_or(-1),
        );
        writeln!(out, "{line}").map_err(io_err)?;
    }

    writeln!(out, "{CRYSTAL_END}").map_err(io_err)?;
    Ok(())
}

/// A reflection row read back from the stream (merging/scaling input).
#[derive(Clone, Copy, Debug)]
pub struct StreamReflection {
    pub index: MillerIndex,
    pub intensity: f64,
    pub sigma: f64,
}

/// A crystal block read back from the stream, cell plus reflections.
pub struct StreamCrystal {
    pub cell: UnitCell,
    pub reflections: Vec<StreamReflection>,
}

/// Read all crystal blocks across all chunks in a stream (spec §6;
/// used by the scaling/post-refinement stage to read merged data).
pub fn read_crystals<R: BufRead>(input: R) -> Result<Vec<StreamCrystal>> {
    let mut out = Vec::new();
    let mut lines = input.lines();

    let mut pending_cell: Option<(f64, f64, f64, f64, f64, f64)> = None;
    let mut pending_lattice = LatticeType::Triclinic;
    let mut pending_centering = Centering::P;
    let mut reflections = Vec::new();
    let mut in_reflections = false;
    let mut in_crystal = false;

    while let Some(line) = lines.next() {
        let line = line.map_err(|source| PipelineError::IoError {
            path: "<stream>".into(),
            source,
        })?;
        let trimmed = line.trim();

        if trimmed.starts_with(CRYSTAL_BEGIN) {
            in_crystal = true;
            reflections.clear();
            pending_cell = None;
            in_reflections = false;
            continue;
        }
        if trimmed.starts_with(CRYSTAL_END) {
            if let Some((a, b, c, al, be, ga)) = pending_cell.take() {
                let mut cell = UnitCell::new_from_parameters(a, b, c, al, be, ga);
                cell.set_lattice_type(pending_lattice);
                cell.set_centering(pending_centering);
                cell.set_unique_axis(UniqueAxis::Unknown);
                out.push(StreamCrystal {
                    cell,
                    reflections: reflections.clone(),
                });
            }
            in_crystal = false;
            in_reflections = false;
            continue;
        }
        if !in_crystal {
            continue;
        }

        if trimmed.starts_with("Cell parameters") {
            pending_cell = parse_cell_parameters_line(trimmed)?;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("lattice_type = ") {
            pending_lattice = lattice_type_from_name(rest.trim())?;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("centering = ") {
            let ch = rest.trim().chars().next().ok_or_else(|| parse_error("empty centering"))?;
            pending_centering = centering_from_letter(ch)?;
            continue;
        }
        if trimmed.trim_start().starts_with("h") && trimmed.contains("sigma(I)") {
            in_reflections = true;
            continue;
        }
        if in_reflections {
            if let Some(refl) = parse_reflection_line(trimmed) {
                reflections.push(refl);
            }
        }
    }

    Ok(out)
}

fn parse_cell_parameters_line(line: &str) -> Result<Option<(f64, f64, f64, f64, f64, f64)>> {
    let nums: Vec<f64> = line
        .split_whitespace()
        .filter_map(|tok| tok.trim_end_matches(',').parse::<f64>().ok())
        .collect();
    if nums.len() < 6 {
        return Ok(None);
    }
    Ok(Some((
        nums[0] * 1e-9,
        nums[1] * 1e-9,
        nums[2] * 1e-9,
        nums[3].to_radians(),
        nums[4].to_radians(),
        nums[5].to_radians(),
    )))
}

fn parse_reflection_line(line: &str) -> Option<StreamReflection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let h: i32 = fields[0].parse().ok()?;
    let k: i32 = fields[1].parse().ok()?;
    let l: i32 = fields[2].parse().ok()?;
    let intensity: f64 = fields[3].parse().ok()?;
    let sigma: f64 = fields[4].parse().ok()?;
    Some(StreamReflection {
        index: MillerIndex::new(h, k, l),
        intensity,
        sigma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crystal::Crystal;
    use crate::reflection::Reflection;
    use std::f64::consts::FRAC_PI_2;
    use std::io::Cursor;

    #[test]
    fn round_trips_one_crystal_with_reflections() {
        let cell = UnitCell::new_from_parameters(5e-10, 5e-10, 5e-10, FRAC_PI_2, FRAC_PI_2, FRAC_PI_2);
        let mut crystal = Crystal::new(cell, 7);
        let mut refl = Reflection::new(MillerIndex::new(1, 2, 3));
        refl.intensity = 123.4;
        refl.sigma = 5.6;
        crystal.reflections.insert(refl);

        let record = ImageRecord {
            serial: 7,
            is_hit: true,
            indexed_by: "stub",
            n_peaks: 12,
            crystals: std::slice::from_ref(&crystal),
        };

        let mut buf = Vec::new();
        write_chunk(&mut buf, &record).unwrap();

        let parsed = read_crystals(Cursor::new(buf)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].reflections.len(), 1);
        assert_eq!(parsed[0].reflections[0].index, MillerIndex::new(1, 2, 3));
        assert!((parsed[0].reflections[0].intensity - 123.4).abs() < 1e-6);

        let (a, b, c, _, _, _) = parsed[0].cell.parameters().unwrap();
        assert!((a - 5e-10).abs() < 1e-14);
        assert!((b - 5e-10).abs() < 1e-14);
        assert!((c - 5e-10).abs() < 1e-14);
    }

    #[test]
    fn empty_stream_yields_no_crystals() {
        let parsed = read_crystals(Cursor::new(Vec::new())).unwrap();
        assert!(parsed.is_empty());
    }
}
