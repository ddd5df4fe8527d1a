//! Cell file parsing: CrystFEL v1.0 blocks and PDB `CRYST1` lines
//! (spec §6 "Cell file").

use std::path::Path;

use crate::cell::{Centering, LatticeType, UnitCell, UniqueAxis};
use crate::error::{PipelineError, Result};

fn parse_error(reason: impl Into<String>) -> PipelineError {
    PipelineError::ParseError {
        kind: "cell",
        path: None,
        reason: reason.into(),
    }
}

fn lattice_type_from_str(s: &str) -> Result<LatticeType> {
    Ok(match s {
        "triclinic" => LatticeType::Triclinic,
        "monoclinic" => LatticeType::Monoclinic,
        "orthorhombic" => LatticeType::Orthorhombic,
        "tetragonal" => LatticeType::Tetragonal,
        "rhombohedral" => LatticeType::Rhombohedral,
        "hexagonal" => LatticeType::Hexagonal,
        "cubic" => LatticeType::Cubic,
        other => return Err(parse_error(format!("unknown lattice_type {other:?}"))),
    })
}

fn centering_from_char(c: char) -> Result<Centering> {
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

fn unique_axis_from_char(c: char) -> UniqueAxis {
    match c {
        'a' => UniqueAxis::A,
        'b' => UniqueAxis::B,
        'c' => UniqueAxis::C,
        '*' => UniqueAxis::Star,
        _ => UniqueAxis::Unknown,
    }
}

/// `value unit` pair, e.g. `"4.50 A"` or `"1.5708 rad"`. Accepted
/// length units: `A` (angstrom), `nm`. Accepted angle units: `deg`.
fn parse_length(value: &str) -> Result<f64> {
    let mut parts = value.split_whitespace();
    let n: f64 = parts
        .next()
        .ok_or_else(|| parse_error("missing length value"))?
        .parse()
        .map_err(|_| parse_error(format!("bad length {value:?}")))?;
    let unit = parts.next().unwrap_or("A");
    Ok(match unit {
        "A" | "angstrom" => n * 1e-10,
        "nm" => n * 1e-9,
        "m" => n,
        other => return Err(parse_error(format!("unknown length unit {other:?}"))),
    })
}

fn parse_angle(value: &str) -> Result<f64> {
    let mut parts = value.split_whitespace();
    let n: f64 = parts
        .next()
        .ok_or_else(|| parse_error("missing angle value"))?
        .parse()
        .map_err(|_| parse_error(format!("bad angle {value:?}")))?;
    let unit = parts.next().unwrap_or("deg");
    Ok(match unit {
        "deg" => n.to_radians(),
        "rad" => n,
        other => return Err(parse_error(format!("unknown angle unit {other:?}"))),
    })
}

/// Parse a CrystFEL v1.0 cell block, e.g.:
/// ```text
/// CrystFEL unit cell file version 1.0
///
/// lattice_type = monoclinic
/// centering = C
/// unique_axis = b
/// a = 10.0 A
/// b = 20.0 A
/// c = 30.0 A
/// al = 90.0 deg
/// be = 100.0 deg
/// ga = 90.0 deg
/// ```
pub fn parse_crystfel_cell(text: &str) -> Result<UnitCell> {
    let mut lattice_type = None;
    let mut centering = None;
    let mut unique_axis = UniqueAxis::Unknown;
    let mut a = None;
    let mut b = None;
    let mut c = None;
    let mut al = None;
    let mut be = None;
    let mut ga = None;

    for raw_line in text.lines() {
        let line = raw_line.split(';').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with("CrystFEL") {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "lattice_type" => lattice_type = Some(lattice_type_from_str(value)?),
            "centering" => {
                let ch = value.chars().next().ok_or_else(|| parse_error("empty centering"))?;
                centering = Some(centering_from_char(ch)?);
            }
            "unique_axis" => {
                let ch = value.chars().next().ok_or_else(|| parse_error("empty unique_axis"))?;
                unique_axis = unique_axis_from_char(ch);
            }
            "a" => a = Some(parse_length(value)?),
            "b" => b = Some(parse_length(value)?),
            "c" => c = Some(parse_length(value)?),
            "al" => al = Some(parse_angle(value)?),
            "be" => be = Some(parse_angle(value)?),
            "ga" => ga = Some(parse_angle(value)?),
            _ => {}
        }
    }

    let (a, b, c) = (
        a.ok_or_else(|| parse_error("missing a"))?,
        b.ok_or_else(|| parse_error("missing b"))?,
        c.ok_or_else(|| parse_error("missing c"))?,
    );
    let (al, be, ga) = (
        al.ok_or_else(|| parse_error("missing al"))?,
        be.ok_or_else(|| parse_error("missing be"))?,
        ga.ok_or_else(|| parse_error("missing ga"))?,
    );

    let mut cell = UnitCell::new_from_parameters(a, b, c, al, be, ga);
    cell.set_lattice_type(lattice_type.ok_or_else(|| parse_error("missing lattice_type"))?);
    cell.set_centering(centering.ok_or_else(|| parse_error("missing centering"))?);
    cell.set_unique_axis(unique_axis);
    Ok(cell)
}

/// Parse a PDB `CRYST1` record:
/// `CRYST1   10.000   20.000   30.000  90.00 100.00  90.00 C 1 2 1`
/// (fixed-column format; lengths in angstrom, angles in degrees).
pub fn parse_cryst1_line(line: &str) -> Result<UnitCell> {
    if line.len() < 54 || !line.starts_with("CRYST1") {
        return Err(parse_error("not a CRYST1 line"));
    }
    let field = |range: std::ops::Range<usize>| -> Result<f64> {
        line.get(range.clone())
            .ok_or_else(|| parse_error("CRYST1 line too short"))?
            .trim()
            .parse()
            .map_err(|_| parse_error(format!("bad CRYST1 field at columns {range:?}")))
    };

    let a = field(6..15)? * 1e-10;
    let b = field(15..24)? * 1e-10;
    let c = field(24..33)? * 1e-10;
    let alpha = field(33..40)?.to_radians();
    let beta = field(40..47)?.to_radians();
    let gamma = field(47..54)?.to_radians();

    let mut cell = UnitCell::new_from_parameters(a, b, c, alpha, beta, gamma);
    // PDB space-group symbols don't map cleanly onto lattice_type; the
    // caller is expected to classify further if it needs centering.
    cell.set_lattice_type(LatticeType::Triclinic);
    cell.set_centering(Centering::P);
    cell.set_unique_axis(UniqueAxis::Unknown);
    Ok(cell)
}

pub fn parse_cell_file(path: &Path) -> Result<UnitCell> {
    let text = std::fs::read_to_string(path).map_err(|source| PipelineError::IoError {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(line) = text.lines().find(|l| l.starts_with("CRYST1")) {
        return parse_cryst1_line(line);
    }
    parse_crystfel_cell(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
CrystFEL unit cell file version 1.0

lattice_type = monoclinic
centering = C
unique_axis = b
a = 10.0 A
b = 20.0 A
c = 30.0 A
al = 90.0 deg
be = 100.0 deg
ga = 90.0 deg
";

    #[test]
    fn parses_crystfel_block() {
        let cell = parse_crystfel_cell(SAMPLE).unwrap();
        let (a, b, c, al, be, ga) = cell.parameters().unwrap();
        assert!((a - 10e-10).abs() < 1e-16);
        assert!((b - 20e-10).abs() < 1e-16);
        assert!((c - 30e-10).abs() < 1e-16);
        assert!((al - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!((be - 100f64.to_radians()).abs() < 1e-9);
        assert!((ga - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert_eq!(cell.lattice_type(), LatticeType::Monoclinic);
        assert_eq!(cell.centering(), Centering::C);
    }

    #[test]
    fn parses_cryst1_line() {
        let line = "CRYST1   10.000   20.000   30.000  90.00 100.00  90.00 C 1 2 1";
        let cell = parse_cryst1_line(line).unwrap();
        let (a, b, c, _, be, _) = cell.parameters().unwrap();
        assert!((a - 10e-10).abs() < 1e-13);
        assert!((b - 20e-10).abs() < 1e-13);
        assert!((c - 30e-10).abs() < 1e-13);
        assert!((be - 100f64.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn missing_field_errors() {
        let text = "lattice_type = cubic\ncentering = P\na = 5.0 A\n";
        assert!(parse_crystfel_cell(text).is_err());
    }
}
