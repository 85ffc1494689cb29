// bathy_sim/src/simulation/seabed.rs

use nalgebra::{Point3, Unit, Vector2, Vector3};
use rand::Rng;
use std::f64::consts::TAU;

use crate::simulation::config::SeabedConfig;

/// Ray marching step (m). Smaller than any mound, so no surface is stepped over.
const MARCH_STEP: f64 = 0.5;
const BISECTION_STEPS: usize = 30;

/// A Gaussian mound on the seabed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mound {
    pub center: Vector2<f64>,
    pub height: f64,
    pub radius: f64,
}

/// Height field `z = -depth + ripples + Σ mounds`.
#[derive(Debug, Clone)]
pub struct Seabed {
    depth: f64,
    ripple_amplitude: f64,
    ripple_wavenumber: f64,
    mounds: Vec<Mound>,
}

impl Seabed {
    /// Scatters the configured mounds over the survey area.
    pub fn generate<R: Rng + ?Sized>(config: &SeabedConfig, rng: &mut R) -> Self {
        let [x_min, x_max, y_min, y_max] = config.area;
        let mounds = (0..config.bump_count)
            .map(|_| Mound {
                center: Vector2::new(rng.gen_range(x_min..x_max), rng.gen_range(y_min..y_max)),
                height: config.bump_height * rng.gen_range(0.5..1.0),
                radius: config.bump_radius * rng.gen_range(0.7..1.3),
            })
            .collect();
        Self {
            depth: config.depth,
            ripple_amplitude: config.ripple_amplitude,
            ripple_wavenumber: if config.ripple_wavelength > 0.0 {
                TAU / config.ripple_wavelength
            } else {
                0.0
            },
            mounds,
        }
    }

    pub fn flat(depth: f64) -> Self {
        Self {
            depth,
            ripple_amplitude: 0.0,
            ripple_wavenumber: 0.0,
            mounds: Vec::new(),
        }
    }

    pub fn with_mounds(mut self, mounds: Vec<Mound>) -> Self {
        self.mounds = mounds;
        self
    }

    pub fn mounds(&self) -> &[Mound] {
        &self.mounds
    }

    pub fn height(&self, x: f64, y: f64) -> f64 {
        let ripples = self.ripple_amplitude
            * (self.ripple_wavenumber * x).sin()
            * (self.ripple_wavenumber * y).cos();
        let mounds: f64 = self
            .mounds
            .iter()
            .map(|m| {
                let d2 = (x - m.center.x).powi(2) + (y - m.center.y).powi(2);
                m.height * (-d2 / (2.0 * m.radius * m.radius)).exp()
            })
            .sum();
        -self.depth + ripples + mounds
    }

    /// No point of the seabed is higher than this.
    pub fn max_height(&self) -> f64 {
        let tallest = self.mounds.iter().map(|m| m.height).sum::<f64>();
        -self.depth + self.ripple_amplitude.abs() + tallest
    }

    /// Distance along `direction` to the first seabed crossing, if within `max_range`.
    pub fn cast_ray(
        &self,
        origin: &Point3<f64>,
        direction: &Unit<Vector3<f64>>,
        max_range: f64,
    ) -> Option<f64> {
        let clearance = |t: f64| {
            let p = origin + direction.as_ref() * t;
            p.z - self.height(p.x, p.y)
        };
        if clearance(0.0) <= 0.0 {
            return None;
        }

        // Nothing can be hit while the ray is still above the tallest point.
        let top = self.max_height();
        let mut t = if origin.z > top {
            if direction.z >= 0.0 {
                return None;
            }
            (origin.z - top) / -direction.z
        } else {
            0.0
        };

        let mut previous = t;
        while t <= max_range {
            if clearance(t) <= 0.0 {
                let (mut above, mut below) = (previous, t);
                for _ in 0..BISECTION_STEPS {
                    let mid = 0.5 * (above + below);
                    if clearance(mid) > 0.0 {
                        above = mid;
                    } else {
                        below = mid;
                    }
                }
                let range = 0.5 * (above + below);
                return (range <= max_range).then_some(range);
            }
            previous = t;
            t += MARCH_STEP;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn down_at(angle: f64) -> Unit<Vector3<f64>> {
        Unit::new_normalize(Vector3::new(0.0, angle.sin(), -angle.cos()))
    }

    #[test]
    fn test_flat_ranges() {
        let seabed = Seabed::flat(30.0);
        let origin = Point3::new(3.0, -4.0, -10.0);
        let range = seabed.cast_ray(&origin, &down_at(0.0), 100.0).unwrap();
        assert_abs_diff_eq!(range, 20.0, epsilon = 1e-6);
        let slant = seabed.cast_ray(&origin, &down_at(1.0), 100.0).unwrap();
        assert_abs_diff_eq!(slant, 20.0 / 1.0_f64.cos(), epsilon = 1e-6);
    }

    #[test]
    fn test_misses() {
        let seabed = Seabed::flat(30.0);
        let origin = Point3::new(0.0, 0.0, -10.0);
        let up = Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        assert!(seabed.cast_ray(&origin, &up, 100.0).is_none());
        assert!(seabed.cast_ray(&origin, &down_at(0.0), 15.0).is_none());
        // Below the seabed there is nothing to see.
        assert!(seabed.cast_ray(&Point3::new(0.0, 0.0, -31.0), &down_at(0.0), 100.0).is_none());
    }

    #[test]
    fn test_mound_shortens_range() {
        let seabed = Seabed::flat(30.0).with_mounds(vec![Mound {
            center: Vector2::new(0.0, 0.0),
            height: 4.0,
            radius: 5.0,
        }]);
        assert_abs_diff_eq!(seabed.height(0.0, 0.0), -26.0, epsilon = 1e-12);
        let range = seabed
            .cast_ray(&Point3::new(0.0, 0.0, -10.0), &down_at(0.0), 100.0)
            .unwrap();
        assert_abs_diff_eq!(range, 16.0, epsilon = 1e-6);
        assert!(seabed.max_height() >= -26.0);
    }

    #[test]
    fn test_generated_mounds_stay_in_area() {
        let config = SeabedConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let seabed = Seabed::generate(&config, &mut rng);
        assert_eq!(seabed.mounds().len(), config.bump_count);
        let [x_min, x_max, y_min, y_max] = config.area;
        assert!(seabed.mounds().iter().all(|m| {
            (x_min..x_max).contains(&m.center.x) && (y_min..y_max).contains(&m.center.y)
        }));
    }
}
