// Nonlinear least squares
// Levenberg-Marquardt curve fitting, used for the cut-Gaussian amplitude model

use crate::metrics::linalg::Matrix;
use crate::metrics::value::MetricFailure;

/// A parametric curve `y = f(x; p)` with an analytic gradient
pub trait CurveModel {
    fn n_params(&self) -> usize;

    fn eval(&self, x: f64, params: &[f64]) -> f64;

    /// Partial derivatives of `f(x; p)` with respect to every parameter
    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]);
}

/// Gaussian `A exp(-(x - μ)² / 2s²)` that is zero below a fixed cut `c`.
/// Parameters are `[A, μ, s]`.
#[derive(Debug, Clone, Copy)]
pub struct CutGaussian {
    pub cut: f64,
}

impl CurveModel for CutGaussian {
    fn n_params(&self) -> usize {
        3
    }

    fn eval(&self, x: f64, p: &[f64]) -> f64 {
        if x < self.cut {
            return 0.0;
        }
        let z = (x - p[1]) / p[2];
        p[0] * (-0.5 * z * z).exp()
    }

    fn gradient(&self, x: f64, p: &[f64], out: &mut [f64]) {
        if x < self.cut {
            out.iter_mut().for_each(|g| *g = 0.0);
            return;
        }
        let (a, mu, s) = (p[0], p[1], p[2]);
        let d = x - mu;
        let e = (-0.5 * d * d / (s * s)).exp();
        out[0] = e;
        out[1] = a * e * d / (s * s);
        out[2] = a * e * d * d / (s * s * s);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative reduction of the residual sum of squares treated as converged
    pub ftol: f64,
    /// Relative parameter step treated as converged
    pub xtol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub params: Vec<f64>,
    /// Residual sum of squares at the solution
    pub cost: f64,
    pub iterations: usize,
}

fn sum_of_squares<M: CurveModel>(model: &M, x: &[f64], y: &[f64], params: &[f64]) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| {
            let r = yi - model.eval(xi, params);
            r * r
        })
        .sum()
}

/// Fit `model` to the points `(x, y)` starting from `initial`.
/// Non-convergence, a non-finite cost or a singular normal matrix is a numerical fit failure.
pub fn levenberg_marquardt<M: CurveModel>(
    model: &M,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    options: FitOptions,
) -> Result<FitResult, MetricFailure> {
    let n = model.n_params();
    if initial.len() != n {
        return Err(MetricFailure::fit(format!(
            "expected {} initial parameters, got {}",
            n,
            initial.len()
        )));
    }
    if x.len() != y.len() || x.len() < n {
        return Err(MetricFailure::insufficient("fit points", n, x.len().min(y.len())));
    }

    let mut params = initial.to_vec();
    let mut cost = sum_of_squares(model, x, y, &params);
    if !cost.is_finite() {
        return Err(MetricFailure::fit("non-finite cost at the initial guess"));
    }

    let mut lambda = 1e-3;
    let mut grad = vec![0.0; n];

    for iteration in 1..=options.max_iterations {
        // Normal equations JᵀJ δ = Jᵀr
        let mut jtj = Matrix::zeros(n);
        let mut jtr = vec![0.0; n];
        for (&xi, &yi) in x.iter().zip(y.iter()) {
            model.gradient(xi, &params, &mut grad);
            let r = yi - model.eval(xi, &params);
            for a in 0..n {
                jtr[a] += grad[a] * r;
                for b in a..n {
                    let v = jtj.get(a, b) + grad[a] * grad[b];
                    jtj.set(a, b, v);
                }
            }
        }
        for a in 0..n {
            for b in 0..a {
                jtj.set(a, b, jtj.get(b, a));
            }
        }
        if (0..n).any(|a| !(jtj.get(a, a) > 0.0)) {
            return Err(MetricFailure::fit("a parameter has no effect on the model"));
        }

        // Raise the damping until a step lowers the cost
        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj.clone();
            for a in 0..n {
                let d = jtj.get(a, a);
                damped.set(a, a, d + lambda * d.max(1e-12));
            }

            let step = match damped.cholesky().and_then(|c| c.solve(&jtr)) {
                Ok(step) => step,
                Err(_) => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let candidate: Vec<f64> = params.iter().zip(step.iter()).map(|(p, s)| p + s).collect();
            let new_cost = sum_of_squares(model, x, y, &candidate);

            if new_cost.is_finite() && new_cost <= cost {
                let step_norm = step.iter().map(|s| s * s).sum::<f64>().sqrt();
                let param_norm = params.iter().map(|p| p * p).sum::<f64>().sqrt();
                let reduction = cost - new_cost;

                params = candidate;
                let converged = reduction <= options.ftol * cost.max(f64::MIN_POSITIVE)
                    || step_norm <= options.xtol * (param_norm + options.xtol);
                cost = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                improved = true;

                if converged {
                    return Ok(FitResult {
                        params,
                        cost,
                        iterations: iteration,
                    });
                }
                break;
            }
            lambda *= 10.0;
        }

        if !improved {
            // No damping gives a downhill step: already at a minimum
            if cost.is_finite() && jtr.iter().all(|g| g.abs() <= 1e-8 * (1.0 + cost)) {
                return Ok(FitResult {
                    params,
                    cost,
                    iterations: iteration,
                });
            }
            return Err(MetricFailure::fit("Levenberg-Marquardt step could not reduce the cost"));
        }
    }

    Err(MetricFailure::fit(format!(
        "Levenberg-Marquardt did not converge in {} iterations",
        options.max_iterations
    )))
}
