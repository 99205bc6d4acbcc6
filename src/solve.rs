//! Sparse least-squares solve via `argmin`'s conjugate gradient.
//!
//! Minimises ‖Ax − b‖² by running CG on the normal equations
//! AᵀA x = Aᵀb.  The operator never forms AᵀA; each application is one
//! sparse product with A followed by one with Aᵀ.
//!
//! argmin's CG reports the *squared* normal-equation residual norm as its
//! cost, so `target_cost = (tolerance · ‖Aᵀb‖)²` stops once
//! ‖Aᵀ(Ax − b)‖ ≤ tolerance · ‖Aᵀb‖, independent of the image's flux scale.

use crate::diagnostics::Diagnostic;
use crate::matrix::CrowdedFieldMatrix;
use crate::types::{CrowdError, FitOptions, MatrixState, ParameterSlot, SolveResult, SolveStatus, SourceFit};
use argmin::core::{Executor, IterState, Operator, State};
use argmin::solver::conjugategradient::ConjugateGradient;
use sprs::CsMat;

type CgState = IterState<Vec<f64>, (), (), (), Vec<f64>, f64>;

// ─────────────────────────────────────────────────────────────
//  argmin operator
// ─────────────────────────────────────────────────────────────

/// x ↦ Aᵀ A x
struct NormalEquations<'m> {
    a: &'m CsMat<f64>,
}

impl Operator for NormalEquations<'_> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let ax = mat_vec(self.a, x);
        Ok(mat_t_vec(self.a, &ax))
    }
}

// ─────────────────────────────────────────────────────────────
//  Generic solve
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LeastSquaresSolution {
    pub x: Vec<f64>,
    pub status: SolveStatus,
    pub iterations: usize,
    /// ‖Aᵀ(Ax − b)‖ at the returned `x`.
    pub residual_norm: f64,
}

/// Least-squares solution of `a · x ≈ b`.
///
/// An empty system, or one whose right-hand side is orthogonal to every
/// column, returns the zero vector after 0 iterations.  Exhausting
/// `options.max_iterations` yields [`SolveStatus::NotConverged`] with the
/// last iterate.
pub fn solve_least_squares(
    a: &CsMat<f64>,
    b: &[f64],
    options: &FitOptions,
) -> Result<LeastSquaresSolution, CrowdError> {
    options.validate()?;
    if b.len() != a.rows() {
        return Err(CrowdError::Shape(format!(
            "data vector has {} entries but the matrix has {} rows", b.len(), a.rows()
        )));
    }
    let a = if a.is_csr() { a.clone() } else { a.to_csr() };
    let n = a.cols();

    let rhs = mat_t_vec(&a, b);
    let rhs_norm = norm(&rhs);
    if n == 0 || rhs_norm == 0.0 {
        return Ok(LeastSquaresSolution {
            x: vec![0.0; n],
            status: SolveStatus::Converged,
            iterations: 0,
            residual_norm: 0.0,
        });
    }

    // Cost is ‖r‖², so square the threshold.
    let target = (options.tolerance * rhs_norm).powi(2);
    let solver: ConjugateGradient<Vec<f64>, f64> = ConjugateGradient::new(rhs.clone());
    let executor: Executor<_, _, CgState> = Executor::new(NormalEquations { a: &a }, solver);
    let result = executor
        .configure(|state| {
            state
                .param(vec![0.0; n])
                .max_iters(options.max_iterations as u64)
                .target_cost(target)
        })
        .run()?;

    let state = result.state();
    let iterations = state.get_iter() as usize;
    let x = state
        .get_param()
        .cloned()
        .ok_or_else(|| CrowdError::Solver("conjugate gradient returned no parameters".into()))?;

    let normal = mat_t_vec(&a, &mat_vec(&a, &x));
    let residual_norm = norm(&normal.iter().zip(&rhs).map(|(l, r)| l - r).collect::<Vec<_>>());

    let status = if iterations >= options.max_iterations || !residual_norm.is_finite() {
        SolveStatus::NotConverged
    } else {
        SolveStatus::Converged
    };

    Ok(LeastSquaresSolution { x, status, iterations, residual_norm })
}

// ─────────────────────────────────────────────────────────────
//  Engine solve + catalog write-back
// ─────────────────────────────────────────────────────────────

impl<'a> CrowdedFieldMatrix<'a> {
    /// Solve the assembled system.
    ///
    /// Builds the data vector first if that has not happened yet.  A second
    /// call re-solves the same matrix.  Non-convergence is reported in
    /// [`SolveResult::status`], not as an error; the catalog, if any, is
    /// written either way.
    pub fn solve(&mut self) -> Result<SolveResult, CrowdError> {
        self.build_data_vector();
        let a = self.design_matrix();
        self.sink.record(&Diagnostic::MatrixShape {
            rows: a.rows(),
            columns: a.cols(),
            entries: self.entries.len(),
        });

        let data = self.data_vector.as_deref().unwrap_or_default();
        let solution = solve_least_squares(&a, data, &self.options)?;
        self.sink.record(&Diagnostic::SolveFinished {
            iterations: solution.iterations,
            residual: solution.residual_norm,
            converged: solution.status == SolveStatus::Converged,
        });

        let sources = self.source_fits(&solution.x)?;
        self.write_back(&sources);

        let result = SolveResult {
            parameters: solution.x,
            status: solution.status,
            iterations: solution.iterations,
            residual_norm: solution.residual_norm,
            sources,
        };
        self.state = MatrixState::Solved;
        self.last_result = Some(result.clone());
        Ok(result)
    }

    fn source_fits(&self, x: &[f64]) -> Result<Vec<SourceFit>, CrowdError> {
        let fits_centroid = self.options.mode.fits_centroid();
        (0..self.tracker.source_count())
            .map(|source| {
                let flux = x[self.tracker.parameter_column(source, ParameterSlot::Flux)?];
                let (dx, dy) = if fits_centroid {
                    // Derivative columns were scaled by the flux estimate; the
                    // fitted flux converts them back to pixels.
                    let estimate = self.flux_estimates.get(source).copied().unwrap_or(f64::NAN);
                    let to_pixels = |p: f64| {
                        if flux != 0.0 && flux.is_finite() {
                            p * estimate / flux
                        } else {
                            f64::NAN
                        }
                    };
                    (
                        Some(to_pixels(x[self.tracker.parameter_column(source, ParameterSlot::Dx)?])),
                        Some(to_pixels(x[self.tracker.parameter_column(source, ParameterSlot::Dy)?])),
                    )
                } else {
                    (None, None)
                };
                Ok(SourceFit { flux, dx, dy })
            })
            .collect()
    }

    fn write_back(&mut self, sources: &[SourceFit]) {
        let Some(binding) = self.catalog.as_mut() else {
            return;
        };
        let keys = binding.keys;
        for (rec, fit) in binding.catalog.iter_mut().zip(sources) {
            rec.set(keys.flux, fit.flux);
            if let (Some(key), Some(dx), Some(dy)) = (keys.centroid_out, fit.dx, fit.dy) {
                let (x, y) = rec.centroid();
                rec.set_point(key, (x + dx, y + dy));
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Sparse × dense helpers
// ─────────────────────────────────────────────────────────────

/// out = A x   (A in CSR)
fn mat_vec(a: &CsMat<f64>, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.rows()];
    for (row, vec) in a.outer_iterator().enumerate() {
        out[row] = vec.iter().map(|(col, &val)| val * x[col]).sum();
    }
    out
}

/// out = Aᵀ y   (A in CSR)
fn mat_t_vec(a: &CsMat<f64>, y: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.cols()];
    for (row, vec) in a.outer_iterator().enumerate() {
        let yr = y[row];
        for (col, &val) in vec.iter() {
            out[col] += val * yr;
        }
    }
    out
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}
