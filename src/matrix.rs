//! Design-matrix assembly for simultaneous PSF photometry.
//!
//! Every source contributes one column per fitted parameter.  Every pixel
//! of its PSF stamp that lies on the exposure and is not rejected by the
//! mask contributes one coefficient to the row of that pixel.  Rows and
//! columns are minted by the [`ParameterTracker`] on first sight.
//!
//! With centroid fitting, two extra columns per source hold forward
//! differences of the PSF under a one-pixel nudge in x and in y, scaled
//! by the source's flux estimate.  The nudged stamp is assumed to be
//! displaced purely along the nudge axis.

use crate::catalog::{CatalogKeys, SourceCatalog};
use crate::diagnostics::{Diagnostic, DiagnosticSink, TRACING_SINK};
use crate::image::Exposure;
use crate::psf::{Psf, PsfStamp};
use crate::tracker::ParameterTracker;
use crate::types::{
    CrowdError, FitOptions, MatrixState, ParameterSlot, SolveResult, Triplet, CENTROID_NUDGE,
};
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Centroid derivative helper
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

/// PSF realised one pixel further along `axis`, and where its samples
/// line up with the un-nudged stamp.
struct NudgedStamp {
    axis: Axis,
    column: usize,
    stamp: PsfStamp,
    /// Origin shift along `axis` relative to the un-nudged stamp.
    shift: i32,
}

impl NudgedStamp {
    fn new(axis: Axis, column: usize, base: &PsfStamp, stamp: PsfStamp) -> Self {
        let shift = match axis {
            Axis::X => stamp.origin.0 - base.origin.0,
            Axis::Y => stamp.origin.1 - base.origin.1,
        };
        Self { axis, column, stamp, shift }
    }

    /// Nudged PSF at the same parent pixel as base-local `(ix, iy)`, or
    /// `None` if the shifted index leaves the base stamp's bounds.
    fn sample(&self, base: &PsfStamp, ix: usize, iy: usize) -> Option<f64> {
        let (index, extent) = match self.axis {
            Axis::X => (ix as i64 - self.shift as i64, base.width()),
            Axis::Y => (iy as i64 - self.shift as i64, base.height()),
        };
        if index < 0 || index >= extent as i64 {
            return None;
        }
        match self.axis {
            Axis::X => self.stamp.get_local(index as usize, iy),
            Axis::Y => self.stamp.get_local(ix, index as usize),
        }
    }
}

/// CSR matrix of `shape` from triplets.  Entries sharing (row, col) are
/// summed, not overwritten.
pub fn assemble_sparse(shape: (usize, usize), entries: &[Triplet]) -> CsMat<f64> {
    let mut tri = TriMat::with_capacity(shape, entries.len());
    for t in entries {
        tri.add_triplet(t.row, t.col, t.value);
    }
    tri.to_csr()
}

// ─────────────────────────────────────────────────────────────
//  Matrix engine
// ─────────────────────────────────────────────────────────────

pub(crate) struct CatalogBinding<'a> {
    pub(crate) catalog: &'a mut SourceCatalog,
    pub(crate) keys: CatalogKeys,
}

/// Sparse least-squares problem for one exposure.
///
/// Lifecycle: `Empty → Assembling → Assembled → Solved`.  Sources may be
/// added only before the data vector is built; the constructors that take
/// positions or a catalog build it immediately.
pub struct CrowdedFieldMatrix<'a> {
    pub(crate) exposure: &'a Exposure,
    pub(crate) psf: &'a dyn Psf,
    pub(crate) catalog: Option<CatalogBinding<'a>>,
    pub(crate) options: FitOptions,
    pub(crate) rejection_mask: u32,
    pub(crate) tracker: ParameterTracker,
    pub(crate) entries: Vec<Triplet>,
    /// Derivative scale of each source, indexed by source id.
    pub(crate) flux_estimates: Vec<f64>,
    pub(crate) data_vector: Option<Vec<f64>>,
    pub(crate) state: MatrixState,
    pub(crate) last_result: Option<SolveResult>,
    pub(crate) sink: &'a dyn DiagnosticSink,
}

impl<'a> CrowdedFieldMatrix<'a> {
    /// Empty engine for incremental `add_source` use.
    pub fn new(exposure: &'a Exposure, psf: &'a dyn Psf, options: FitOptions) -> Result<Self, CrowdError> {
        options.validate()?;
        let rejection_mask = exposure.plane_bit_mask(options.rejection_planes.as_slice())?;
        Ok(Self {
            exposure,
            psf,
            catalog: None,
            tracker: ParameterTracker::new(options.mode.n_parameters()),
            options,
            rejection_mask,
            entries: Vec::new(),
            flux_estimates: Vec::new(),
            data_vector: None,
            state: MatrixState::Empty,
            last_result: None,
            sink: &TRACING_SINK,
        })
    }

    /// Assemble one source per `(x[i], y[i])` and build the data vector.
    pub fn from_positions(
        exposure: &'a Exposure,
        psf: &'a dyn Psf,
        x: &[f64],
        y: &[f64],
        options: FitOptions,
    ) -> Result<Self, CrowdError> {
        if x.len() != y.len() {
            return Err(CrowdError::LengthMismatch { x: x.len(), y: y.len() });
        }
        let mut matrix = Self::new(exposure, psf, options)?;
        matrix.add_sources(x, y)?;
        matrix.build_data_vector();
        Ok(matrix)
    }

    /// Assemble one source per catalog record and build the data vector.
    ///
    /// The catalog stays borrowed: [`solve`](Self::solve) writes fitted
    /// fluxes (and corrected centroids) back into the fields named by `keys`.
    pub fn from_catalog(
        exposure: &'a Exposure,
        psf: &'a dyn Psf,
        catalog: Option<&'a mut SourceCatalog>,
        keys: CatalogKeys,
        options: FitOptions,
    ) -> Result<Self, CrowdError> {
        let catalog = catalog.ok_or(CrowdError::MissingCatalog)?;
        catalog.check_keys(&keys)?;
        let mut matrix = Self::new(exposure, psf, options)?;

        let default_flux = matrix.options.default_flux_estimate;
        let inputs: Vec<(f64, f64, f64)> = catalog
            .iter()
            .map(|rec| {
                let (x, y) = rec.centroid();
                let flux = keys
                    .flux_estimate
                    .map(|k| rec.get(k))
                    .filter(|f| f.is_finite())
                    .unwrap_or(default_flux);
                (x, y, flux)
            })
            .collect();

        for (x, y, flux) in inputs {
            matrix.add_source_with_flux(x, y, flux)?;
        }
        matrix.catalog = Some(CatalogBinding { catalog, keys });
        matrix.build_data_vector();
        Ok(matrix)
    }

    /// Route diagnostics to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: &'a dyn DiagnosticSink) -> Self {
        self.sink = sink;
        self
    }

    // ── Incremental assembly ─────────────────────────────────

    /// Add a source at `(x, y)`; returns its source id.
    pub fn add_source(&mut self, x: f64, y: f64) -> Result<usize, CrowdError> {
        let flux = self.options.default_flux_estimate;
        self.add_source_with_flux(x, y, flux)
    }

    /// Add a source whose centroid derivatives are scaled by `flux_estimate`.
    ///
    /// The estimate only conditions the derivative columns; fitted offsets
    /// are reported in pixels whatever its value.
    pub fn add_source_with_flux(&mut self, x: f64, y: f64, flux_estimate: f64) -> Result<usize, CrowdError> {
        self.ensure_open()?;
        let source_id = self.tracker.source_count();
        self.assemble_source(source_id, x, y, flux_estimate)?;
        self.flux_estimates.push(flux_estimate);
        self.state = MatrixState::Assembling;
        Ok(source_id)
    }

    /// Add `x.len()` sources.  Nothing is added if the lengths differ.
    pub fn add_sources(&mut self, x: &[f64], y: &[f64]) -> Result<(), CrowdError> {
        if x.len() != y.len() {
            return Err(CrowdError::LengthMismatch { x: x.len(), y: y.len() });
        }
        self.ensure_open()?;
        for (&xi, &yi) in x.iter().zip(y) {
            self.add_source(xi, yi)?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), CrowdError> {
        match self.state {
            MatrixState::Empty | MatrixState::Assembling => Ok(()),
            MatrixState::Assembled | MatrixState::Solved => Err(CrowdError::Frozen),
        }
    }

    /// Emit the triplets of one source.
    ///
    /// Centroid columns hold `flux_estimate · (nudged − base) / NUDGE`, both
    /// samples taken at the same parent pixel.  This is the reverse of the
    /// `base − nudged` orientation; with it the fitted offset is added to the
    /// input centroid rather than subtracted.
    fn assemble_source(&mut self, source_id: usize, x: f64, y: f64, flux_estimate: f64) -> Result<(), CrowdError> {
        self.tracker.add_source(source_id);

        let stamp = self.psf.compute_image(x, y);
        let footprint = stamp.bbox().clip(&self.exposure.bbox());
        let flux_col = self.tracker.parameter_column(source_id, ParameterSlot::Flux)?;

        let nudged = if self.options.mode.fits_centroid() {
            let dx_col = self.tracker.parameter_column(source_id, ParameterSlot::Dx)?;
            let dy_col = self.tracker.parameter_column(source_id, ParameterSlot::Dy)?;
            vec![
                NudgedStamp::new(Axis::X, dx_col, &stamp, self.psf.compute_image(x + CENTROID_NUDGE, y)),
                NudgedStamp::new(Axis::Y, dy_col, &stamp, self.psf.compute_image(x, y + CENTROID_NUDGE)),
            ]
        } else {
            Vec::new()
        };

        let mut pixels = 0;
        let mut rejected = 0;
        let mut derivative_terms = 0;

        for (px, py) in footprint.pixels() {
            let mask = self.exposure.get_mask(px, py).unwrap_or(0);
            if mask & self.rejection_mask != 0 {
                rejected += 1;
                continue;
            }

            let ix = (px - stamp.origin.0) as usize;
            let iy = (py - stamp.origin.1) as usize;
            let value = stamp.array[[iy, ix]];
            let row = self.tracker.mint_or_lookup_pixel_row(px, py);
            self.entries.push(Triplet::new(row, flux_col, value));
            pixels += 1;

            // d(model)/d(position) ≈ flux · (PSF nudged − PSF) / nudge
            for term in &nudged {
                if let Some(nudged_value) = term.sample(&stamp, ix, iy) {
                    let derivative = flux_estimate * (nudged_value - value) / CENTROID_NUDGE;
                    self.entries.push(Triplet::new(row, term.column, derivative));
                    derivative_terms += 1;
                }
            }
        }

        self.sink.record(&Diagnostic::SourceAssembled {
            source: source_id,
            pixels,
            rejected,
            derivative_terms,
        });
        Ok(())
    }

    // ── Data vector ──────────────────────────────────────────

    /// Observed intensity of every tracked pixel, indexed by row.
    ///
    /// Built once, from the tracker's pixel list, and freezes the inputs.
    pub fn build_data_vector(&mut self) -> &[f64] {
        if self.data_vector.is_none() {
            let exposure = self.exposure;
            let data = self
                .tracker
                .pixels()
                .iter()
                .map(|&(x, y)| exposure.get_image(x, y).unwrap_or(0.0))
                .collect();
            self.data_vector = Some(data);
        }
        if self.state < MatrixState::Assembled {
            self.state = MatrixState::Assembled;
        }
        self.data_vector.as_deref().unwrap_or_default()
    }

    // ── Accessors ────────────────────────────────────────────

    /// Design matrix (rows × columns); duplicate entries are summed.
    pub fn design_matrix(&self) -> CsMat<f64> {
        assemble_sparse((self.tracker.row_count(), self.tracker.column_count()), &self.entries)
    }

    /// Raw triplets in insertion order.
    pub fn matrix_entries(&self) -> &[Triplet] {
        &self.entries
    }

    pub fn data_vector(&self) -> Option<&[f64]> {
        self.data_vector.as_deref()
    }

    pub fn pixel_mapping(&self) -> Vec<((i32, i32), usize)> {
        self.tracker.pixel_mapping()
    }

    pub fn parameter_mapping(&self) -> Vec<((usize, ParameterSlot), usize)> {
        self.tracker.parameter_mapping()
    }

    pub fn tracker(&self) -> &ParameterTracker {
        &self.tracker
    }

    pub fn row_count(&self) -> usize {
        self.tracker.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.tracker.column_count()
    }

    pub fn source_count(&self) -> usize {
        self.tracker.source_count()
    }

    pub fn state(&self) -> MatrixState {
        self.state
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    pub fn rejection_mask(&self) -> u32 {
        self.rejection_mask
    }

    pub fn last_result(&self) -> Option<&SolveResult> {
        self.last_result.as_ref()
    }

    /// Iterations used by the most recent solve.
    pub fn iterations(&self) -> Option<usize> {
        self.last_result.as_ref().map(|r| r.iterations)
    }

    pub fn catalog(&self) -> Option<&SourceCatalog> {
        self.catalog.as_ref().map(|b| &*b.catalog)
    }
}
