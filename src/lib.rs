//! **crowd** — simultaneous ("crowded-field") PSF photometry.
//!
//! Given an exposure, a PSF model and a list of source positions, the crate
//! assembles one sparse least-squares system covering every source at once
//! and solves it for per-source fluxes (and, optionally, centroid offsets).
//!
//! 1. **Bookkeeping** (`tracker`): dense row ids for touched pixels, dense
//!    column ids for per-source parameters.
//! 2. **Collaborators** (`image`, `psf`, `catalog`): exposure planes, PSF
//!    stamps, source records with field handles.
//! 3. **Assembly** (`matrix`): PSF evaluation, mask rejection, finite
//!    difference centroid terms, triplet buffer, data vector.
//! 4. **Solve** (`solve`): conjugate gradient on the normal equations via
//!    `argmin`, catalog write-back.
//! 5. **Model images** (`model`): render / subtract fitted sources;
//!    `centroid` re-measures each source with its neighbours removed.
//! 6. **Diagnostics** (`diagnostics`): injectable event sink backed by
//!    `tracing`.

pub mod types;
pub mod tracker;
pub mod image;
pub mod psf;
pub mod catalog;
pub mod diagnostics;
pub mod matrix;
pub mod solve;
pub mod model;
pub mod centroid;

pub use catalog::{CatalogKeys, FluxKey, PointKey, Schema, SourceCatalog, SourceRecord};
pub use diagnostics::{Diagnostic, DiagnosticSink, RecordingSink, TracingSink};
pub use image::{Box2I, Exposure, MaskPlaneDict};
pub use matrix::CrowdedFieldMatrix;
pub use psf::{GaussianPsf, Psf, PsfStamp};
pub use tracker::ParameterTracker;
pub use types::*;
