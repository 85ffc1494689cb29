// bathy_core/src/noise.rs

//! Noise descriptors shared by the filter and the graph.
//!
//! Two flavours exist. A [`DiagonalSpread`] describes how much randomness is
//! injected into particles and may contain zeros (that axis is then
//! deterministic). A [`GaussianNoiseModel`] weighs residuals in a least-squares
//! problem and therefore has to be strictly positive definite.

use crate::error::ConfigError;
use nalgebra::{DMatrix, DVector};

/// Per-axis variances used to perturb particles.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalSpread {
    variances: DVector<f64>,
}

impl DiagonalSpread {
    /// Validates `variances`. Zero is allowed, negative or non-finite is not.
    pub fn new(name: &'static str, variances: &[f64]) -> Result<Self, ConfigError> {
        for (index, &value) in variances.iter().enumerate() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidCovariance { name, index, value });
            }
        }
        Ok(Self {
            variances: DVector::from_column_slice(variances),
        })
    }

    pub fn dim(&self) -> usize {
        self.variances.len()
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&self.variances)
    }
}

/// A Gaussian noise model for least-squares residuals.
///
/// Stores `L⁻¹` where `Σ = L·Lᵀ`, so `‖L⁻¹·e‖²` is the Mahalanobis cost.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianNoiseModel {
    covariance: DMatrix<f64>,
    sqrt_information: DMatrix<f64>,
}

impl GaussianNoiseModel {
    pub fn from_covariance(
        name: &'static str,
        covariance: DMatrix<f64>,
    ) -> Result<Self, ConfigError> {
        if !covariance.is_square() || covariance.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NotPositiveDefinite(name));
        }
        let l = covariance
            .clone()
            .cholesky()
            .ok_or(ConfigError::NotPositiveDefinite(name))?
            .l();
        let sqrt_information = l
            .try_inverse()
            .ok_or(ConfigError::NotPositiveDefinite(name))?;
        Ok(Self {
            covariance,
            sqrt_information,
        })
    }

    /// Builds a diagonal model from standard deviations.
    pub fn from_sigmas(name: &'static str, sigmas: &[f64]) -> Result<Self, ConfigError> {
        for &value in sigmas {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { name, value });
            }
        }
        let variances = DVector::from_iterator(sigmas.len(), sigmas.iter().map(|s| s * s));
        Self::from_covariance(name, DMatrix::from_diagonal(&variances))
    }

    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn whiten(&self, error: &DVector<f64>) -> DVector<f64> {
        &self.sqrt_information * error
    }

    pub fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> DMatrix<f64> {
        &self.sqrt_information * jacobian
    }

    /// Squared Mahalanobis norm of `error`.
    pub fn mahalanobis(&self, error: &DVector<f64>) -> f64 {
        self.whiten(error).norm_squared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_spread_accepts_zero() {
        let spread = DiagonalSpread::new("process", &[0.0; 6]).unwrap();
        assert_eq!(spread.dim(), 6);
        assert_eq!(spread.covariance(), DMatrix::zeros(6, 6));
    }

    #[test]
    fn test_spread_rejects_negative_and_nan() {
        let err = DiagonalSpread::new("init", &[0.1, -0.2, 0.3]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidCovariance {
                name: "init",
                index: 1,
                value: -0.2
            }
        );
        assert!(DiagonalSpread::new("init", &[f64::NAN]).is_err());
    }

    #[test]
    fn test_noise_model_rejects_zero_sigma() {
        assert!(GaussianNoiseModel::from_sigmas("odom", &[0.1, 0.0, 0.1]).is_err());
    }

    #[test]
    fn test_noise_model_rejects_indefinite_matrix() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert_eq!(
            GaussianNoiseModel::from_covariance("bad", cov).unwrap_err(),
            ConfigError::NotPositiveDefinite("bad")
        );
    }

    #[test]
    fn test_whitening_matches_mahalanobis() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 2.0]);
        let model = GaussianNoiseModel::from_covariance("full", cov.clone()).unwrap();
        let e = DVector::from_vec(vec![0.5, -1.5]);
        let expected = (e.transpose() * cov.try_inverse().unwrap() * &e)[(0, 0)];
        assert_relative_eq!(model.mahalanobis(&e), expected, epsilon = 1e-12);
    }
}
