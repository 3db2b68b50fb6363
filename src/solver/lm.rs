//! Levenberg–Marquardt nonlinear least squares.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{CalError, CalResult};

/// Attempts per iteration to find a damping factor that lowers the cost.
const MAX_DAMPING_RETRIES: usize = 10;
const MIN_LAMBDA: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Stop once an accepted step lowers the cost by less than this fraction.
    pub relative_tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            relative_tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

impl LmConfig {
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }
}

/// Best iterate found, whether or not the run converged.
#[derive(Debug, Clone, PartialEq)]
pub struct LmOutcome {
    pub params: Vec<f64>,
    /// Half the sum of squared residuals at `params`.
    pub cost: f64,
    pub initial_cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn cost_of(residuals: &[f64]) -> f64 {
    0.5 * residuals.iter().map(|r| r * r).sum::<f64>()
}

fn jacobian<F>(residuals: &mut F, params: &[f64], base: &[f64]) -> CalResult<DMatrix<f64>>
where
    F: FnMut(&[f64]) -> CalResult<Vec<f64>>,
{
    let mut jac = DMatrix::zeros(base.len(), params.len());
    let mut nudged = params.to_vec();
    for j in 0..params.len() {
        let h = f64::EPSILON.sqrt() * params[j].abs().max(1e-2);
        nudged[j] = params[j] + h;
        let shifted = residuals(&nudged)?;
        nudged[j] = params[j];
        if shifted.len() != base.len() {
            return Err(CalError::Configuration(format!(
                "residual count changed from {} to {}",
                base.len(),
                shifted.len()
            )));
        }
        for (i, (s, b)) in shifted.iter().zip(base.iter()).enumerate() {
            let d = (s - b) / h;
            jac[(i, j)] = if d.is_finite() { d } else { 0.0 };
        }
    }
    Ok(jac)
}

fn solve_damped(jtj: &DMatrix<f64>, gradient: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let max_diag = jtj.diagonal().iter().cloned().fold(0.0, f64::max);
    let floor = (1e-12 * max_diag).max(1e-300);
    let mut system = jtj.clone();
    for i in 0..system.nrows() {
        system[(i, i)] += lambda * jtj[(i, i)].max(floor);
    }
    let rhs = -gradient;
    match system.clone().cholesky() {
        Some(chol) => Some(chol.solve(&rhs)),
        None => system.lu().solve(&rhs),
    }
}

/// Minimise `½·Σ r(p)²` starting from `initial`.
///
/// The Jacobian is estimated with forward differences. A candidate whose residuals
/// are not finite is treated as a rejected step. Running out of iterations is not
/// an error: the best parameters seen are returned with `converged == false`.
pub fn levenberg_marquardt<F>(mut residuals: F, initial: &[f64], config: &LmConfig) -> CalResult<LmOutcome>
where
    F: FnMut(&[f64]) -> CalResult<Vec<f64>>,
{
    let mut params = initial.to_vec();
    let mut current = residuals(&params)?;
    let mut cost = cost_of(&current);
    if !cost.is_finite() {
        return Err(CalError::InvalidSignal(
            "residuals at the starting parameters are not finite".to_string(),
        ));
    }
    let initial_cost = cost;
    if params.is_empty() || current.is_empty() {
        return Ok(LmOutcome {
            params,
            cost,
            initial_cost,
            iterations: 0,
            converged: true,
        });
    }

    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < config.max_iterations {
        iterations += 1;
        let jac = jacobian(&mut residuals, &params, &current)?;
        let r = DVector::from_column_slice(&current);
        let jtj = jac.transpose() * &jac;
        let gradient = jac.transpose() * r;

        let mut accepted = false;
        for _ in 0..MAX_DAMPING_RETRIES {
            let Some(delta) = solve_damped(&jtj, &gradient, lambda) else {
                lambda = (lambda * 10.0).min(MAX_LAMBDA);
                continue;
            };
            let candidate: Vec<f64> = params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
            let trial = residuals(&candidate)?;
            let trial_cost = cost_of(&trial);

            if trial_cost.is_finite() && trial_cost < cost {
                let decrease = (cost - trial_cost) / cost;
                params = candidate;
                current = trial;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(MIN_LAMBDA);
                accepted = true;
                if decrease < config.relative_tolerance || cost < 1e-30 {
                    converged = true;
                }
                break;
            }
            lambda = (lambda * 10.0).min(MAX_LAMBDA);
        }

        debug!(
            "LM iteration {}: cost {:.6e}, lambda {:.1e}, accepted {}",
            iterations, cost, lambda, accepted
        );

        // No damping produced a lower cost: we are at a (local) minimum
        if !accepted {
            converged = true;
        }
        if converged {
            break;
        }
    }

    Ok(LmOutcome {
        params,
        cost,
        initial_cost,
        iterations,
        converged,
    })
}
