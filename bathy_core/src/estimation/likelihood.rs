// bathy_core/src/estimation/likelihood.rs

use crate::error::ConfigError;
use nalgebra::DVector;
use std::f64::consts::TAU;

/// Floor weight for a particle whose likelihood could not be evaluated.
pub const MIN_WEIGHT: f64 = 1e-200;

/// Result of scoring one particle against a ping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LikelihoodScore {
    pub log_density: f64,
    /// Beams that fell back to the missing-beam residual.
    pub missing_beams: usize,
}

/// Multivariate Gaussian over range residuals with covariance `σ²·I`.
///
/// Missing beams: the residual vector always has `beams` entries. Beam `i`
/// uses `measured[i] - expected[i]` when both exist and are finite, otherwise
/// `missing_residual`. Nothing is truncated, so every particle is scored over
/// the same number of beams.
#[derive(Debug, Clone)]
pub struct MeasurementLikelihood {
    beams: usize,
    inv_variance: f64,
    missing_residual: f64,
    log_normalizer: f64,
}

impl MeasurementLikelihood {
    pub fn new(beams: usize, sigma: f64, missing_residual: f64) -> Result<Self, ConfigError> {
        if beams == 0 {
            return Err(ConfigError::NoBeams);
        }
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "measurement_std",
                value: sigma,
            });
        }
        if !missing_residual.is_finite() || missing_residual < 0.0 {
            return Err(ConfigError::NotPositive {
                name: "missing_beam_residual",
                value: missing_residual,
            });
        }
        let n = beams as f64;
        Ok(Self {
            beams,
            inv_variance: 1.0 / (sigma * sigma),
            missing_residual,
            log_normalizer: -0.5 * n * TAU.ln() - n * sigma.ln(),
        })
    }

    pub fn beams(&self) -> usize {
        self.beams
    }

    /// Residuals after applying the missing-beam policy, plus how many beams were missing.
    pub fn residuals(&self, measured: &DVector<f64>, expected: &DVector<f64>) -> (DVector<f64>, usize) {
        let mut missing = 0;
        let residuals = DVector::from_fn(self.beams, |i, _| {
            match (measured.get(i), expected.get(i)) {
                (Some(m), Some(e)) if m.is_finite() && e.is_finite() => m - e,
                _ => {
                    missing += 1;
                    self.missing_residual
                }
            }
        });
        (residuals, missing)
    }

    pub fn score(&self, measured: &DVector<f64>, expected: &DVector<f64>) -> LikelihoodScore {
        let (residuals, missing_beams) = self.residuals(measured, expected);
        LikelihoodScore {
            log_density: self.log_normalizer - 0.5 * residuals.norm_squared() * self.inv_variance,
            missing_beams,
        }
    }

    /// Log-density at zero residual, the maximum of the density.
    pub fn max_log_density(&self) -> f64 {
        self.log_normalizer
    }
}
