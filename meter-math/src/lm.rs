//! Levenberg-Marquardt optimizer for small nonlinear least-squares problems.
//!
//! Problems expose residuals and (optionally) an analytic Jacobian; when no
//! Jacobian is supplied a forward-difference one is used. The damping scheme
//! is the Marquardt variant, scaling the diagonal of `JᵀJ` by `1 + λ`.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("problem has {params} parameters but only {residuals} residuals")]
    Underdetermined { params: usize, residuals: usize },

    #[error("residuals are not finite at the starting point")]
    NonFiniteStart,

    #[error("normal equations are singular")]
    Singular,

    #[error("no improvement found after {0} iterations")]
    NoProgress(usize),
}

/// A nonlinear least-squares problem: minimize `Σ r_i(p)²`.
pub trait LeastSquaresProblem {
    /// Number of free parameters.
    fn num_params(&self) -> usize;

    /// Residual vector `r(p)` (data minus model).
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the model, `∂model_i / ∂p_j`, one row per residual.
    ///
    /// The default is a forward-difference approximation.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        numeric_jacobian(self, params)
    }

    /// Clamp or otherwise repair parameters after an update.
    fn constrain(&self, _params: &mut DVector<f64>) {}
}

/// Forward-difference Jacobian of the model (negated residual derivative).
pub fn numeric_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    params: &DVector<f64>,
) -> DMatrix<f64> {
    let base = problem.residuals(params);
    let mut jac = DMatrix::zeros(base.len(), params.len());
    let mut stepped = params.clone();
    for j in 0..params.len() {
        let step = 1e-6 * params[j].abs().max(1e-3);
        stepped[j] = params[j] + step;
        let shifted = problem.residuals(&stepped);
        stepped[j] = params[j];
        // residual = data - model, so ∂model = -(∂residual)
        let column = (&base - shifted) / step;
        jac.set_column(j, &column);
    }
    jac
}

/// Solve `a · x = b` by Cholesky, falling back to LU when `a` is not
/// numerically positive definite. `None` if neither gives a finite solution.
fn solve_normal_equations(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let finite = |x: &DVector<f64>| x.iter().all(|v| v.is_finite());
    if let Some(x) = a.clone().cholesky().map(|c| c.solve(b)) {
        if finite(&x) {
            return Some(x);
        }
    }
    a.lu().solve(b).filter(finite)
}

/// Outcome of a successful optimization.
#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    /// Final sum of squared residuals
    pub chi2: f64,
    pub iterations: usize,
    /// True when the step size fell below the tolerance
    pub converged: bool,
}

/// Solver settings.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// Stop once the largest parameter change is below this
    pub step_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            step_tolerance: 1e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Minimize the problem starting from `initial`.
    ///
    /// Running out of iterations is not an error; the best parameters seen
    /// are returned with `converged == false`.
    pub fn minimize<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        initial: DVector<f64>,
    ) -> Result<LmReport, LmError> {
        debug_assert_eq!(initial.len(), problem.num_params());
        let mut params = initial;
        problem.constrain(&mut params);

        let mut residuals = problem.residuals(&params);
        if residuals.len() < params.len() {
            return Err(LmError::Underdetermined {
                params: params.len(),
                residuals: residuals.len(),
            });
        }
        let mut chi2 = residuals.norm_squared();
        if !chi2.is_finite() {
            return Err(LmError::NonFiniteStart);
        }

        let mut lambda = self.initial_lambda;
        let mut iterations = 0;
        let mut converged = false;
        let mut ever_solved = false;

        'outer: while iterations < self.max_iterations {
            iterations += 1;
            let jac = problem.jacobian(&params);
            let jtj = jac.transpose() * &jac;
            let jtr = jac.transpose() * &residuals;

            loop {
                let mut damped = jtj.clone();
                for i in 0..damped.nrows() {
                    let d = damped[(i, i)];
                    damped[(i, i)] = d + lambda * d.max(1e-12);
                }

                let Some(delta) = solve_normal_equations(damped, &jtr) else {
                    lambda *= self.lambda_up;
                    if lambda > 1e12 {
                        if ever_solved {
                            break 'outer;
                        }
                        return Err(LmError::Singular);
                    }
                    continue;
                };
                ever_solved = true;

                let mut candidate = &params + &delta;
                problem.constrain(&mut candidate);
                let candidate_residuals = problem.residuals(&candidate);
                let candidate_chi2 = candidate_residuals.norm_squared();

                if candidate_chi2.is_finite() && candidate_chi2 <= chi2 {
                    let step = (&candidate - &params).amax();
                    params = candidate;
                    residuals = candidate_residuals;
                    chi2 = candidate_chi2;
                    lambda = (lambda * self.lambda_down).max(1e-12);
                    if step < self.step_tolerance {
                        converged = true;
                        break 'outer;
                    }
                    break;
                }

                lambda *= self.lambda_up;
                if lambda > 1e12 {
                    // Already at a minimum to machine precision
                    converged = true;
                    break 'outer;
                }
            }
        }

        if !ever_solved {
            return Err(LmError::NoProgress(iterations));
        }
        if !converged {
            log::debug!("LM stopped after {iterations} iterations, chi2 {chi2:.4e}");
        }

        Ok(LmReport {
            params,
            chi2,
            iterations,
            converged,
        })
    }
}
