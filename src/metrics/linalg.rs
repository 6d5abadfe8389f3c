// Dense linear algebra for the feature-space distance metrics
// Row-major square matrices, sample covariance, Cholesky factorisation

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinalgError {
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("need at least {required} observations, got {available}")]
    TooFewObservations { required: usize, available: usize },
}

/// Square matrix stored row-major: element (i, j) lives at `i * dim + j`
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    dim: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(dim: usize) -> Self {
        Matrix {
            dim,
            data: vec![0.0; dim * dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.dim + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.dim + j] = value;
    }

    pub fn add_diagonal(&mut self, lambda: f64) {
        for i in 0..self.dim {
            self.data[i * self.dim + i] += lambda;
        }
    }

    /// Cholesky-Banachiewicz factorisation `A = L Lᵀ`.
    /// Fails when the matrix is not symmetric positive definite.
    pub fn cholesky(&self) -> Result<Cholesky, LinalgError> {
        let n = self.dim;
        let mut l = Matrix::zeros(n);

        // Relative pivot floor so near-singular covariances fail instead of exploding
        let scale = (0..n).map(|i| self.get(i, i).abs()).fold(0.0, f64::max);
        let floor = scale * 1e-12;

        for j in 0..n {
            for i in j..n {
                let mut sum = self.get(i, j);
                for k in 0..j {
                    sum -= l.get(i, k) * l.get(j, k);
                }

                if i == j {
                    if !(sum > floor) {
                        return Err(LinalgError::NotPositiveDefinite);
                    }
                    l.set(i, j, sum.sqrt());
                } else {
                    l.set(i, j, sum / l.get(j, j));
                }
            }
        }

        Ok(Cholesky { l })
    }
}

/// Lower-triangular Cholesky factor
#[derive(Debug, Clone)]
pub struct Cholesky {
    l: Matrix,
}

impl Cholesky {
    pub fn dim(&self) -> usize {
        self.l.dim
    }

    /// Solve `L y = b`
    pub fn forward_substitute(&self, b: &[f64]) -> Vec<f64> {
        let n = self.l.dim;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for j in 0..i {
                sum -= self.l.get(i, j) * y[j];
            }
            y[i] = sum / self.l.get(i, i);
        }
        y
    }

    /// Solve `Lᵀ x = y`
    pub fn backward_substitute(&self, y: &[f64]) -> Vec<f64> {
        let n = self.l.dim;
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for j in (i + 1)..n {
                sum -= self.l.get(j, i) * x[j];
            }
            x[i] = sum / self.l.get(i, i);
        }
        x
    }

    /// Solve `A x = b`
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, LinalgError> {
        if b.len() != self.dim() {
            return Err(LinalgError::DimensionMismatch {
                expected: self.dim(),
                actual: b.len(),
            });
        }
        let y = self.forward_substitute(b);
        Ok(self.backward_substitute(&y))
    }

    /// Squared Mahalanobis distance `(x - μ)ᵀ A⁻¹ (x - μ)`
    pub fn mahalanobis_sq(&self, x: &[f64], mean: &[f64]) -> f64 {
        let centered: Vec<f64> = x.iter().zip(mean.iter()).map(|(a, m)| a - m).collect();
        let y = self.forward_substitute(&centered);
        y.iter().map(|v| v * v).sum()
    }
}

/// Column means of a set of equal-length observations
pub fn column_means(observations: &[Vec<f64>], dim: usize) -> Vec<f64> {
    let mut means = vec![0.0; dim];
    if observations.is_empty() {
        return means;
    }
    for obs in observations {
        for (m, v) in means.iter_mut().zip(obs.iter()) {
            *m += v;
        }
    }
    let n = observations.len() as f64;
    means.iter_mut().for_each(|m| *m /= n);
    means
}

/// Sample covariance (`n - 1` normalisation) of row observations
pub fn covariance(observations: &[Vec<f64>], dim: usize) -> Result<(Vec<f64>, Matrix), LinalgError> {
    if observations.len() < 2 {
        return Err(LinalgError::TooFewObservations {
            required: 2,
            available: observations.len(),
        });
    }
    if let Some(bad) = observations.iter().find(|o| o.len() != dim) {
        return Err(LinalgError::DimensionMismatch {
            expected: dim,
            actual: bad.len(),
        });
    }

    let means = column_means(observations, dim);
    let mut cov = Matrix::zeros(dim);

    for obs in observations {
        for i in 0..dim {
            let di = obs[i] - means[i];
            for j in i..dim {
                let v = cov.get(i, j) + di * (obs[j] - means[j]);
                cov.set(i, j, v);
            }
        }
    }

    let denom = (observations.len() - 1) as f64;
    for i in 0..dim {
        for j in i..dim {
            let v = cov.get(i, j) / denom;
            cov.set(i, j, v);
            cov.set(j, i, v);
        }
    }

    Ok((means, cov))
}
