//! A serial-crystallography diffraction-data-processing pipeline:
//! per-image peak search and indexing, Ewald-sphere prediction and
//! integration, then cross-image scaling and post-refinement (spec
//! §1-§5).
//!
//! Modules are layered bottom-up: exact-rational matrix algebra
//! ([`rational`]) and the unit cell ([`cell`], [`cell_utils`])
//! underpin detector geometry ([`geometry`]) and the per-crystal data
//! model ([`crystal`], [`reflection`]); [`peaksearch`], [`indexing`],
//! [`prediction`], [`integration`] form the per-image pipeline that
//! [`orchestrator`] drives end to end; [`scaling`] and [`postrefine`]
//! operate across images once a run has accumulated crystals.
//! [`geom_file`], [`cell_file`] and [`stream`] are this pipeline's
//! external text-format interfaces; [`worker_pool`] is the concurrency
//! substrate the orchestrator runs workers on.

pub mod cell;
pub mod cell_file;
pub mod cell_utils;
pub mod crystal;
pub mod error;
pub mod geom_file;
pub mod geometry;
pub mod indexing;
pub mod integration;
pub mod orchestrator;
pub mod peaksearch;
pub mod postrefine;
pub mod prediction;
pub mod rational;
pub mod reflection;
pub mod scaling;
pub mod stream;
pub mod worker_pool;

pub use error::{CrystalFlag, PipelineError, Result};
