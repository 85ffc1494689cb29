// bathy_sim/src/simulation/sonar.rs

use anyhow::Context;
use bathy_core::estimation::RaySimulator;
use bathy_core::messages::{MbesReading, Point, PointCloud};
use nalgebra::{DVector, Isometry3, Point3, Unit, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::simulation::config::SonarConfig;
use crate::simulation::seabed::Seabed;
use crate::simulation::transforms::MBES_FRAME;

/// Multibeam geometry and noise.
#[derive(Debug, Clone)]
pub struct MultibeamSonar {
    beams: usize,
    aperture: f64,
    max_range: f64,
    range_noise: Normal<f64>,
    mount: Isometry3<f64>,
}

impl MultibeamSonar {
    pub fn new(config: &SonarConfig) -> anyhow::Result<Self> {
        Ok(Self {
            beams: config.beams,
            aperture: config.aperture_deg.to_radians(),
            max_range: config.max_range,
            range_noise: Normal::new(0.0, config.range_noise)
                .context("invalid sonar.range_noise")?,
            mount: config.mount.to_isometry(),
        })
    }

    pub fn beams(&self) -> usize {
        self.beams
    }

    pub fn max_range(&self) -> f64 {
        self.max_range
    }

    /// `T_base_mbes`.
    pub fn mount(&self) -> &Isometry3<f64> {
        &self.mount
    }

    /// Across-track angle of beam `j`, port to starboard.
    pub fn beam_angle(&self, j: usize) -> f64 {
        -0.5 * self.aperture + self.aperture * j as f64 / (self.beams - 1) as f64
    }

    /// Unit direction of beam `j` in the sensor frame.
    pub fn beam_direction(&self, j: usize) -> Unit<Vector3<f64>> {
        let a = self.beam_angle(j);
        Unit::new_normalize(Vector3::new(0.0, a.sin(), -a.cos()))
    }

    /// Beam index the `i`-th of `count` evenly spread ranges comes from.
    ///
    /// Mirrors `PointCloud::beam_ranges` on a full swath.
    pub fn selected_beam(&self, i: usize, count: usize) -> usize {
        if count <= 1 || self.beams < count {
            i
        } else {
            (i as f64 * (self.beams - 1) as f64 / (count - 1) as f64).round() as usize
        }
    }

    fn range_along(&self, seabed: &Seabed, sensor_pose: &Isometry3<f64>, j: usize) -> Option<f64> {
        let origin = Point3::from(sensor_pose.translation.vector);
        let direction = Unit::new_unchecked(sensor_pose.rotation * self.beam_direction(j).into_inner());
        seabed.cast_ray(&origin, &direction, self.max_range)
    }
}

/// The sonar looking at a known seabed: generates noisy pings and serves as
/// the filter's ray simulator.
#[derive(Debug, Clone)]
pub struct SeabedRaycaster {
    seabed: Seabed,
    sonar: MultibeamSonar,
}

impl SeabedRaycaster {
    pub fn new(seabed: Seabed, sonar: MultibeamSonar) -> Self {
        Self { seabed, sonar }
    }

    pub fn seabed(&self) -> &Seabed {
        &self.seabed
    }

    pub fn sonar(&self) -> &MultibeamSonar {
        &self.sonar
    }

    /// A swath from the vehicle at `vehicle_pose` (map frame), one point per
    /// beam. Beams that hit nothing are [`Point::missing`].
    pub fn capture<R: Rng + ?Sized>(
        &self,
        vehicle_pose: &Isometry3<f64>,
        timestamp: f64,
        rng: &mut R,
    ) -> MbesReading {
        let sensor_pose = vehicle_pose * self.sonar.mount;
        let points = (0..self.sonar.beams)
            .map(|j| match self.sonar.range_along(&self.seabed, &sensor_pose, j) {
                Some(range) => {
                    let noisy = range + self.sonar.range_noise.sample(rng);
                    let p = self.sonar.beam_direction(j).into_inner() * noisy;
                    Point::new(p.x, p.y, p.z)
                }
                None => Point::missing(),
            })
            .collect();
        MbesReading {
            timestamp,
            frame: MBES_FRAME,
            cloud: PointCloud {
                sensor_handle: MBES_FRAME,
                timestamp,
                points,
            },
            mount: self.sonar.mount,
        }
    }
}

impl RaySimulator for SeabedRaycaster {
    fn simulate_ranges(&self, sensor_pose: &Isometry3<f64>, beams: usize) -> DVector<f64> {
        DVector::from_fn(beams, |i, _| {
            let j = self.sonar.selected_beam(i, beams);
            if j >= self.sonar.beams {
                return f64::NAN;
            }
            self.sonar
                .range_along(&self.seabed, sensor_pose, j)
                .unwrap_or(f64::NAN)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::config::PoseConfig;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn noiseless(beams: usize) -> SonarConfig {
        SonarConfig {
            beams,
            range_noise: 0.0,
            mount: PoseConfig::default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_flat_swath_geometry() {
        let sonar = MultibeamSonar::new(&noiseless(11)).unwrap();
        let world = SeabedRaycaster::new(Seabed::flat(30.0), sonar);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let reading = world.capture(&Isometry3::translation(0.0, 0.0, -10.0), 2.0, &mut rng);
        assert_eq!(reading.cloud.len(), 11);
        for p in &reading.cloud.points {
            assert_abs_diff_eq!(p.position.z, -20.0, epsilon = 1e-6);
        }
        // Symmetric fan: first and last beams mirror each other.
        let first = reading.cloud.points[0].position;
        let last = reading.cloud.points[10].position;
        assert_abs_diff_eq!(first.y, -last.y, epsilon = 1e-6);
        assert!(first.y < 0.0);
    }

    #[test]
    fn test_simulated_ranges_match_selected_beams() {
        let sonar = MultibeamSonar::new(&noiseless(64)).unwrap();
        let world = SeabedRaycaster::new(Seabed::flat(40.0), sonar);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let pose = Isometry3::new(Vector3::new(5.0, 1.0, -10.0), Vector3::new(0.0, 0.0, 0.7));
        let reading = world.capture(&pose, 0.0, &mut rng);

        let measured = reading.cloud.beam_ranges(20);
        let expected = world.simulate_ranges(&(pose * reading.mount), 20);
        assert_abs_diff_eq!(measured, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_out_of_range_beams_are_missing() {
        let mut config = noiseless(9);
        config.max_range = 25.0;
        let world = SeabedRaycaster::new(Seabed::flat(30.0), MultibeamSonar::new(&config).unwrap());
        let ranges = world.simulate_ranges(&Isometry3::translation(0.0, 0.0, -10.0), 9);
        // 20 m straight down, the outer beams at 60° need 40 m.
        assert_abs_diff_eq!(ranges[4], 20.0, epsilon = 1e-6);
        assert!(ranges[0].is_nan());
        assert!(ranges[8].is_nan());
    }

    #[test]
    fn test_partial_swath_stays_aligned_with_beams() {
        let mut config = noiseless(9);
        config.max_range = 25.0;
        let world = SeabedRaycaster::new(Seabed::flat(30.0), MultibeamSonar::new(&config).unwrap());
        let pose = Isometry3::translation(0.0, 0.0, -10.0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let reading = world.capture(&pose, 0.0, &mut rng);

        assert_eq!(reading.cloud.len(), 9);
        assert!(!reading.cloud.points[0].is_valid());
        assert!(!reading.cloud.points[8].is_valid());

        let measured = reading.cloud.beam_ranges(9);
        let expected = world.simulate_ranges(&(pose * reading.mount), 9);
        for i in 0..9 {
            assert_eq!(measured[i].is_nan(), expected[i].is_nan(), "beam {}", i);
            if expected[i].is_finite() {
                assert_abs_diff_eq!(measured[i], expected[i], epsilon = 1e-6);
            }
        }
        assert_abs_diff_eq!(measured[4], 20.0, epsilon = 1e-6);
    }
}
