use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Input-contract violations are reported before anything is mutated.
/// Numerical non-convergence is *not* an error: it is reported through
/// [`SolveStatus::NotConverged`] alongside the best-effort result.
#[derive(Debug, Clone, PartialEq)]
pub enum CrowdError {
    /// Position arrays of different lengths.
    LengthMismatch { x: usize, y: usize },
    /// A catalog was required but none was supplied.
    MissingCatalog,
    /// A parameter column was requested for a source/slot that was never
    /// registered.  Unreachable through the public assembly API.
    ParameterNotRegistered { source: usize, slot: usize },
    /// Sources cannot be added once the data vector has been built.
    Frozen,
    /// A mask plane name is not present in the exposure's plane dictionary.
    UnknownMaskPlane(String),
    /// Fit options failed validation.
    InvalidOption(String),
    /// Argmin solver returned an error.
    Solver(String),
    /// Shape mismatch in input data.
    Shape(String),
}

impl fmt::Display for CrowdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { x, y } =>
                write!(f, "x and y must be the same length (got {x} and {y})"),
            Self::MissingCatalog => write!(f, "source catalog is missing"),
            Self::ParameterNotRegistered { source, slot } =>
                write!(f, "request for source parameter that does not exist: source {source}, slot {slot}"),
            Self::Frozen =>
                write!(f, "matrix inputs are frozen; no sources may be added after the data vector is built"),
            Self::UnknownMaskPlane(name) => write!(f, "unknown mask plane: {name}"),
            Self::InvalidOption(msg) => write!(f, "invalid fit option: {msg}"),
            Self::Solver(msg) => write!(f, "solver error: {msg}"),
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
        }
    }
}

impl std::error::Error for CrowdError {}

impl From<argmin::core::Error> for CrowdError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Position nudge (pixels) used for the forward-difference centroid terms.
pub const CENTROID_NUDGE: f64 = 1.0;

/// Mask planes whose bits exclude a pixel from the fit.
pub const DEFAULT_REJECTION_PLANES: [&str; 4] = ["SAT", "BAD", "EDGE", "CR"];

// ─────────────────────────────────────────────────────────────
//  Parameter slots
// ─────────────────────────────────────────────────────────────

/// Per-source unknown.  `Flux` is always present; `Dx` / `Dy` only when
/// centroids are fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterSlot {
    Flux,
    Dx,
    Dy,
}

impl ParameterSlot {
    pub const ALL: [ParameterSlot; 3] = [Self::Flux, Self::Dx, Self::Dy];

    pub fn index(self) -> usize {
        match self {
            Self::Flux => 0,
            Self::Dx => 1,
            Self::Dy => 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Fit options
// ─────────────────────────────────────────────────────────────

/// Which unknowns are solved for per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitMode {
    /// One column per source.
    #[default]
    Flux,
    /// Three columns per source: flux, dx, dy.
    FluxAndCentroid,
}

impl FitMode {
    pub fn n_parameters(self) -> usize {
        match self {
            Self::Flux => 1,
            Self::FluxAndCentroid => 3,
        }
    }

    pub fn fits_centroid(self) -> bool {
        matches!(self, Self::FluxAndCentroid)
    }
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub mode: FitMode,
    /// Relative tolerance on the normal-equation residual: the solve stops
    /// once ‖Aᵀ(Ax − b)‖ ≤ tolerance · ‖Aᵀb‖.
    pub tolerance: f64,
    /// Iteration cap.  Consuming all of it counts as non-convergence.
    pub max_iterations: usize,
    /// Mask planes that reject a pixel.
    pub rejection_planes: Vec<String>,
    /// Flux used to scale centroid derivatives when no estimate is given.
    pub default_flux_estimate: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            mode: FitMode::Flux,
            tolerance: 1e-6,
            max_iterations: 500,
            rejection_planes: DEFAULT_REJECTION_PLANES.iter().map(|s| s.to_string()).collect(),
            default_flux_estimate: 1.0,
        }
    }
}

impl FitOptions {
    pub fn with_mode(mut self, mode: FitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_rejection_planes(mut self, planes: &[&str]) -> Self {
        self.rejection_planes = planes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_default_flux_estimate(mut self, flux: f64) -> Self {
        self.default_flux_estimate = flux;
        self
    }

    /// Reject option sets the solver cannot honour.
    pub fn validate(&self) -> Result<(), CrowdError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(CrowdError::InvalidOption(format!(
                "tolerance must be positive and finite, got {}", self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(CrowdError::InvalidOption("max_iterations must be at least 1".into()));
        }
        if !self.default_flux_estimate.is_finite() {
            return Err(CrowdError::InvalidOption("default_flux_estimate must be finite".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Sparse entries
// ─────────────────────────────────────────────────────────────

/// One design-matrix coefficient.  Entries sharing (row, col) are summed
/// when the matrix is materialised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

impl Triplet {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Self { row, col, value }
    }
}

// ─────────────────────────────────────────────────────────────
//  Engine state
// ─────────────────────────────────────────────────────────────

/// Lifecycle of a [`crate::CrowdedFieldMatrix`]; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixState {
    Empty,
    Assembling,
    Assembled,
    Solved,
}

// ─────────────────────────────────────────────────────────────
//  Solve result
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    /// The iteration cap was exhausted.  The parameters are still the
    /// solver's last iterate.
    NotConverged,
}

/// Fitted parameters of one source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceFit {
    pub flux: f64,
    /// Offset in pixels to add to the input x centroid (centroid mode only).
    /// NaN when the fitted flux is zero.
    pub dx: Option<f64>,
    /// Offset in pixels to add to the input y centroid (centroid mode only).
    pub dy: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SolveResult {
    /// Dense solution, indexed by parameter column.  Centroid columns are
    /// in flux-estimate units; [`SourceFit`] converts them to pixels.
    pub parameters: Vec<f64>,
    pub status: SolveStatus,
    pub iterations: usize,
    /// Final normal-equation residual norm ‖Aᵀ(Ax − b)‖.
    pub residual_norm: f64,
    /// Per-source view of `parameters`, in source order.
    pub sources: Vec<SourceFit>,
}

impl SolveResult {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    pub fn fluxes(&self) -> Vec<f64> {
        self.sources.iter().map(|s| s.flux).collect()
    }
}
