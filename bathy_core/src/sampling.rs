// bathy_core/src/sampling.rs

use crate::error::ConfigError;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// Eigenvalues above `-EIGEN_TOLERANCE` are treated as zero rather than negative.
const EIGEN_TOLERANCE: f64 = 1e-12;

/// Draws correlated vectors `x = μ + V·√Λ·z` with `z ~ N(0, I)`, where `V·Λ·Vᵀ`
/// is the symmetric eigendecomposition of the covariance.
///
/// Positive semi-definite input is fine, a zero eigenvalue just pins that
/// direction to the mean.
#[derive(Debug, Clone)]
pub struct GaussianSampler {
    mean: DVector<f64>,
    transform: DMatrix<f64>,
}

impl GaussianSampler {
    pub fn new(mean: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self, ConfigError> {
        let dim = mean.len();
        if covariance.nrows() != dim || covariance.ncols() != dim {
            return Err(ConfigError::WrongDimension {
                name: "covariance",
                expected: dim,
                actual: covariance.nrows(),
            });
        }
        if covariance.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NotPositiveDefinite("covariance"));
        }

        // Only the lower triangle is read, so symmetrize first.
        let symmetric = (covariance + covariance.transpose()) * 0.5;
        let eigen = symmetric.symmetric_eigen();
        let mut sqrt_values = DVector::zeros(dim);
        for (i, &lambda) in eigen.eigenvalues.iter().enumerate() {
            if lambda < -EIGEN_TOLERANCE {
                return Err(ConfigError::NotPositiveDefinite("covariance"));
            }
            sqrt_values[i] = lambda.max(0.0).sqrt();
        }
        let transform = &eigen.eigenvectors * DMatrix::from_diagonal(&sqrt_values);
        Ok(Self { mean, transform })
    }

    pub fn zero_mean(covariance: &DMatrix<f64>) -> Result<Self, ConfigError> {
        Self::new(DVector::zeros(covariance.nrows()), covariance)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| rng.sample::<f64, _>(StandardNormal));
        &self.mean + &self.transform * z
    }
}
