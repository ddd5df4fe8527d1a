//! Error taxonomy for the pipeline (spec §7).
//!
//! Per-image and per-crystal errors are never fatal to the run: the
//! orchestrator and scaling/post-refinement loops catch these, record
//! them (on a stream record or a crystal's flag set), and move on.
//! Only setup-time failures (geometry/cell file parsing, an unwritable
//! output stream) should be allowed to propagate out of the top-level
//! entry points.

use std::path::PathBuf;

use thiserror::Error;

use crate::reflection::MillerIndex;

/// A crystal-level bookkeeping flag set when refinement or scaling
/// gives up on a crystal but keeps it in the output with defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrystalFlag {
    /// Too few reflections survived the strength filters for scaling
    /// or post-refinement.
    FewRefl,
    /// The normal-equations solve failed during scaling.
    SolveFail,
    /// Post-refinement made CC½ worse; the refined solution was
    /// reverted.
    DeltaCcHalf,
    /// The fitted Debye-Waller factor `B` left the plausible range.
    BigB,
    /// Scaling otherwise diverged (e.g. `G` non-finite).
    ScaleBad,
}

impl std::fmt::Display for CrystalFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FewRefl => "FEWREFL",
            Self::SolveFail => "SOLVEFAIL",
            Self::DeltaCcHalf => "DELTACCHALF",
            Self::BigB => "BIGB",
            Self::ScaleBad => "SCALEBAD",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unphysical cell parameters{}", context_suffix(.image_serial))]
    BadCell { image_serial: Option<u64> },

    #[error("indexing failed after all retries{}", context_suffix(.image_serial))]
    NoIndex { image_serial: Option<u64> },

    #[error("integration could not compute a reliable intensity for {0:?}")]
    BadIntegration(MillerIndex),

    #[error("too few reflections for scaling/refinement (have {have}, need {need})")]
    TooFewReflections { have: usize, need: usize },

    #[error("numerical solve failed in scaling: {reason}")]
    SolveFailed { reason: String },

    #[error("post-refinement made CC1/2 worse (before {before:.4}, after {after:.4})")]
    DeltaCcHalfNegative { before: f64, after: f64 },

    #[error("scaling diverged: B = {b:.3} out of plausible range")]
    ScalingDiverged { b: f64 },

    #[error("I/O error reading {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {kind} file {path:?}: {reason}")]
    ParseError {
        kind: &'static str,
        path: Option<PathBuf>,
        reason: String,
    },

    #[error("singular matrix")]
    Singular,
}

fn context_suffix(serial: &Option<u64>) -> String {
    match serial {
        Some(s) => format!(" (image {s})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
