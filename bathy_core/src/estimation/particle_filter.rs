// bathy_core/src/estimation/particle_filter.rs

use crate::error::ConfigError;
use crate::estimation::likelihood::{MeasurementLikelihood, MIN_WEIGHT};
use crate::estimation::particle::Particle;
use crate::estimation::resampling::{LineageArena, ResamplingStrategy};
use crate::estimation::{FilterContext, FrameAnchors, RaySimulator, StateEstimator};
use crate::messages::{ModuleInput, OdometryInput, PoseEstimate};
use crate::noise::DiagonalSpread;
use crate::sampling::GaussianSampler;
use crate::types::{normalize_angle, normalize_angle_signed, Pose};
use log::{debug, info, warn};
use nalgebra::{DVector, Isometry3, Matrix6, Vector3, Vector6};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Length of the moving average applied to the effective sample size.
const N_EFF_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    pub particle_count: usize,
    /// Beams compared per ping.
    pub beams_num: usize,
    /// Standard deviation of a single range measurement (m).
    pub measurement_std: f64,
    /// Variances of the initial spread, `[x, y, z, roll, pitch, yaw]`.
    pub init_covariance: [f64; 6],
    /// Variances of the per-step process noise.
    pub motion_covariance: [f64; 6],
    /// Variances of the jitter added to survivors after resampling.
    pub resampling_noise_covariance: [f64; 6],
    /// Residual used for beams that are missing on either side (m).
    pub missing_beam_residual: f64,
    pub resampling: ResamplingStrategy,
    /// Fixed seed for reproducible runs, entropy otherwise.
    pub seed: Option<u64>,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        Self {
            particle_count: 10,
            beams_num: 20,
            measurement_std: 0.01,
            init_covariance: [0.0; 6],
            motion_covariance: [0.0; 6],
            resampling_noise_covariance: [0.1, 0.1, 0.0, 0.0, 0.0, 0.0],
            missing_beam_residual: 100.0,
            resampling: ResamplingStrategy::Systematic,
            seed: None,
        }
    }
}

/// Outcome of a call to [`ParticleFilter::resample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResampleOutcome {
    pub n_eff: f64,
    /// Moving average the decision is based on.
    pub smoothed_n_eff: f64,
    pub missed_measurements: usize,
    pub resampled: bool,
}

/// Rao-Blackwellized particle filter over the vehicle trajectory.
///
/// Particles live in the odometry frame. The map-frame sonar pose of each
/// particle is `T_map_odom · T_particle · T_base_mbes`.
pub struct ParticleFilter {
    config: ParticleFilterConfig,
    anchors: FrameAnchors,
    particles: Vec<Particle>,
    /// Noise-free particle integrated with the same odometry.
    dead_reckoning: Pose,
    likelihood: MeasurementLikelihood,
    process_noise: GaussianSampler,
    resampling_noise: GaussianSampler,
    lineage: LineageArena,
    n_eff_window: VecDeque<f64>,
    missed_measurements: usize,
    rng: ChaCha8Rng,
    timestamp: f64,
    step: u64,
}

impl ParticleFilter {
    pub fn new(config: ParticleFilterConfig, anchors: FrameAnchors) -> Result<Self, ConfigError> {
        if config.particle_count == 0 {
            return Err(ConfigError::NoParticles);
        }
        let likelihood = MeasurementLikelihood::new(
            config.beams_num,
            config.measurement_std,
            config.missing_beam_residual,
        )?;
        let init = DiagonalSpread::new("init_covariance", &config.init_covariance)?;
        let motion = DiagonalSpread::new("motion_covariance", &config.motion_covariance)?;
        let jitter = DiagonalSpread::new(
            "resampling_noise_covariance",
            &config.resampling_noise_covariance,
        )?;

        let init_sampler = GaussianSampler::zero_mean(&init.covariance())?;
        let process_noise = GaussianSampler::zero_mean(&motion.covariance())?;
        let resampling_noise = GaussianSampler::zero_mean(&jitter.covariance())?;

        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let n = config.particle_count;
        let mut lineage = LineageArena::new();
        let particles = (0..n)
            .map(|index| {
                let spread = init_sampler.sample(&mut rng);
                let pose = Pose::from_vector(&Vector6::from_column_slice(spread.as_slice()));
                let id = lineage.spawn(None, 0);
                Particle::new(id, index, pose, config.beams_num, 1.0 / n as f64)
            })
            .collect();

        info!(
            "Particle filter ready: {} particles, {} beams, {:?} resampling",
            n, config.beams_num, config.resampling
        );

        Ok(Self {
            n_eff_window: std::iter::repeat(n as f64).take(N_EFF_WINDOW).collect(),
            config,
            anchors,
            particles,
            dead_reckoning: Pose::default(),
            likelihood,
            process_noise,
            resampling_noise,
            lineage,
            missed_measurements: 0,
            rng,
            timestamp: 0.0,
            step: 0,
        })
    }

    // --- Per-ping operations ---

    /// Integrates the twist over `dt` for every particle, with process noise.
    /// A non-positive `dt` leaves the ensemble untouched.
    pub fn predict(&mut self, odometry: &OdometryInput, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let v = odometry.linear_velocity;
        let w = odometry.angular_velocity;

        for particle in &mut self.particles {
            let noise = self.process_noise.sample(&mut self.rng);
            integrate_twist(
                &mut particle.pose,
                &v,
                &w,
                dt,
                &Vector3::new(noise[0], noise[1], noise[2]),
                &Vector3::new(noise[3], noise[4], noise[5]),
            );
        }
        integrate_twist(
            &mut self.dead_reckoning,
            &v,
            &w,
            dt,
            &Vector3::zeros(),
            &Vector3::zeros(),
        );
        self.timestamp = odometry.timestamp;
        self.step += 1;
    }

    /// Appends every particle's current map-frame sonar pose to its history.
    pub fn update_pose_history(&mut self) {
        for particle in &mut self.particles {
            let sensor = self.anchors.sensor_pose(&particle.pose.to_isometry());
            particle.history.push(&sensor);
        }
    }

    /// Scores every particle against `measured` and normalizes the weights.
    ///
    /// A particle whose density is not finite, or for which the simulator
    /// returned no usable beam at all, counts as a missed measurement and is
    /// floored to `MIN_WEIGHT`.
    pub fn update_weights(&mut self, measured: &DVector<f64>, simulator: &dyn RaySimulator) {
        let beams = self.config.beams_num;
        let mut scores: Vec<Option<f64>> = Vec::with_capacity(self.particles.len());

        for particle in &mut self.particles {
            let sensor = self.anchors.sensor_pose(&particle.pose.to_isometry());
            let expected = simulator.simulate_ranges(&sensor, beams);
            let score = self.likelihood.score(measured, &expected);

            if score.log_density.is_finite() && score.missing_beams < beams {
                particle.log_weight = score.log_density;
                scores.push(Some(score.log_density));
            } else {
                debug!(
                    "particle {} missed the ping ({} of {} beams missing)",
                    particle.index, score.missing_beams, beams
                );
                particle.log_weight = MIN_WEIGHT.ln();
                scores.push(None);
            }
        }

        self.missed_measurements = scores.iter().filter(|s| s.is_none()).count();
        let max_log = scores
            .iter()
            .flatten()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        for (particle, score) in self.particles.iter_mut().zip(&scores) {
            particle.weight = match score {
                Some(log_density) => (log_density - max_log).exp(),
                None => MIN_WEIGHT,
            };
        }
        self.normalize_weights();
    }

    /// Resamples when the smoothed effective sample size drops below `N/2`
    /// and no more than `N/2` particles missed the last ping.
    pub fn resample(&mut self) -> ResampleOutcome {
        let n = self.particles.len() as f64;
        let n_eff = self.n_eff();
        self.n_eff_window.pop_front();
        self.n_eff_window.push_back(n_eff);
        let smoothed_n_eff = self.smoothed_n_eff();

        let resampled =
            smoothed_n_eff < n / 2.0 && (self.missed_measurements as f64) <= n / 2.0;
        if resampled {
            info!(
                "Resampling: N_eff {:.2} (smoothed {:.2}), {} missed",
                n_eff, smoothed_n_eff, self.missed_measurements
            );
            self.resample_now();
        }

        ResampleOutcome {
            n_eff,
            smoothed_n_eff,
            missed_measurements: self.missed_measurements,
            resampled,
        }
    }

    /// Draws a new ensemble regardless of the effective sample size.
    ///
    /// Every slot becomes a new particle whose parent is the particle it was
    /// copied from. Survivors are jittered with the resampling noise.
    pub fn resample_now(&mut self) {
        let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
        let indices = self.config.resampling.indices(&weights, &mut self.rng);
        let n = self.particles.len();

        let next: Vec<Particle> = indices
            .iter()
            .enumerate()
            .map(|(slot, &source)| {
                let parent = &self.particles[source];
                let mut child = parent.clone();
                child.id = self.lineage.spawn(Some(parent.id), self.step);
                child.parent = Some(parent.id);
                child.index = slot;
                child.weight = 1.0 / n as f64;
                child.log_weight = child.weight.ln();

                let jitter = self.resampling_noise.sample(&mut self.rng);
                let mut vector = child.pose.to_vector();
                vector += Vector6::from_column_slice(jitter.as_slice());
                child.pose = Pose::from_vector(&vector);
                child
            })
            .collect();
        self.particles = next;
    }

    // --- Ensemble statistics ---

    /// `1 / Σw²` over the normalized weights.
    pub fn n_eff(&self) -> f64 {
        let sum_sq: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_sq > 0.0 {
            1.0 / sum_sq
        } else {
            self.particles.len() as f64
        }
    }

    pub fn smoothed_n_eff(&self) -> f64 {
        self.n_eff_window.iter().sum::<f64>() / self.n_eff_window.len() as f64
    }

    pub fn max_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).fold(0.0, f64::max)
    }

    /// Weighted mean pose in the odometry frame. Angles use a circular mean.
    pub fn mean_pose(&self) -> Pose {
        let mut position = Vector3::zeros();
        let mut sin_sum = Vector3::<f64>::zeros();
        let mut cos_sum = Vector3::<f64>::zeros();
        for p in &self.particles {
            position += p.pose.position * p.weight;
            for i in 0..3 {
                sin_sum[i] += p.weight * p.pose.rpy[i].sin();
                cos_sum[i] += p.weight * p.pose.rpy[i].cos();
            }
        }
        let rpy = Vector3::from_fn(|i, _| normalize_angle(sin_sum[i].atan2(cos_sum[i])));
        Pose::new(position, rpy)
    }

    /// Mean vehicle pose in the map frame.
    pub fn mean_map_pose(&self) -> Isometry3<f64> {
        self.anchors.vehicle_pose(&self.mean_pose().to_isometry())
    }

    /// Weighted 6x6 covariance about the mean, angular deviations wrapped.
    pub fn covariance(&self) -> Matrix6<f64> {
        let mean = self.mean_pose();
        let mut covariance = Matrix6::zeros();
        for p in &self.particles {
            let d = p.pose.position - mean.position;
            let a = Vector3::from_fn(|i, _| normalize_angle_signed(p.pose.rpy[i] - mean.rpy[i]));
            let delta = Vector6::new(d.x, d.y, d.z, a.x, a.y, a.z);
            covariance += delta * delta.transpose() * p.weight;
        }
        covariance
    }

    // --- Accessors ---

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn lineage(&self) -> &LineageArena {
        &self.lineage
    }

    pub fn dead_reckoning_pose(&self) -> &Pose {
        &self.dead_reckoning
    }

    pub fn dead_reckoning_map_pose(&self) -> Isometry3<f64> {
        self.anchors.vehicle_pose(&self.dead_reckoning.to_isometry())
    }

    pub fn missed_measurements(&self) -> usize {
        self.missed_measurements
    }

    pub fn anchors(&self) -> &FrameAnchors {
        &self.anchors
    }

    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    // --- Private Helper Methods ---

    fn normalize_weights(&mut self) {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        let n = self.particles.len() as f64;
        if total > 0.0 && total.is_finite() {
            for p in &mut self.particles {
                p.weight /= total;
            }
        } else {
            warn!("All particle weights vanished, resetting to uniform");
            for p in &mut self.particles {
                p.weight = 1.0 / n;
            }
        }
    }
}

/// `rpy ← wrap(rpy + ω·dt + n_rot)`, then `p ← p + R(rpy)·(v·dt) + n_pos`.
fn integrate_twist(
    pose: &mut Pose,
    linear: &Vector3<f64>,
    angular: &Vector3<f64>,
    dt: f64,
    position_noise: &Vector3<f64>,
    rotation_noise: &Vector3<f64>,
) {
    pose.rpy += angular * dt + rotation_noise;
    pose.normalize_angles();
    let step = pose.rotation() * (linear * dt);
    pose.position += step + position_noise;
}

impl StateEstimator for ParticleFilter {
    fn process(&mut self, input: &ModuleInput, context: &FilterContext) {
        match input {
            ModuleInput::Odometry { odometry, dt } => {
                self.predict(odometry, *dt);
                self.update_pose_history();
            }
            ModuleInput::Ranges { measured } => match context.simulator {
                Some(simulator) => self.update_weights(measured, simulator),
                None => warn!("No ray simulator available, ping left unweighted"),
            },
        }
    }

    fn estimate(&self) -> PoseEstimate {
        PoseEstimate {
            timestamp: self.timestamp,
            pose: self.mean_map_pose(),
            covariance: self.covariance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::FRAC_PI_2;

    /// Flat seabed `depth` metres below z = 0, beams fanned across-track.
    struct FlatSeabed {
        depth: f64,
    }

    impl RaySimulator for FlatSeabed {
        fn simulate_ranges(&self, sensor_pose: &Isometry3<f64>, beams: usize) -> DVector<f64> {
            let height = self.depth + sensor_pose.translation.vector.z;
            DVector::from_fn(beams, |i, _| {
                let angle = -0.5 + i as f64 / (beams.max(2) - 1) as f64;
                height / angle.cos()
            })
        }
    }

    struct Blind;

    impl RaySimulator for Blind {
        fn simulate_ranges(&self, _: &Isometry3<f64>, beams: usize) -> DVector<f64> {
            DVector::from_element(beams, f64::NAN)
        }
    }

    fn zero_noise(count: usize) -> ParticleFilterConfig {
        ParticleFilterConfig {
            particle_count: count,
            beams_num: 5,
            measurement_std: 0.1,
            resampling_noise_covariance: [0.0; 6],
            seed: Some(42),
            ..Default::default()
        }
    }

    fn forward(v: f64) -> OdometryInput {
        OdometryInput {
            timestamp: 1.0,
            linear_velocity: Vector3::new(v, 0.0, 0.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_motion() {
        let config = ParticleFilterConfig {
            init_covariance: [1.0, 1.0, 0.5, 0.1, 0.1, 0.5],
            ..zero_noise(20)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        let before: Vec<Pose> = pf.particles().iter().map(|p| *p.pose()).collect();
        pf.predict(&OdometryInput::default(), 0.5);
        for (p, pose) in pf.particles().iter().zip(&before) {
            assert_eq!(p.pose(), pose);
        }
    }

    #[test]
    fn test_single_particle_forward_motion() {
        let mut pf = ParticleFilter::new(zero_noise(1), FrameAnchors::default()).unwrap();
        pf.predict(&forward(2.0), 1.5);
        let pose = pf.particles()[0].pose();
        assert_relative_eq!(pose.position, Vector3::new(3.0, 0.0, 0.0), epsilon = 1e-12);
        assert_eq!(pose.rpy, Vector3::zeros());
    }

    #[test]
    fn test_forward_motion_follows_heading() {
        let mut pf = ParticleFilter::new(zero_noise(1), FrameAnchors::default()).unwrap();
        let turn = OdometryInput {
            angular_velocity: Vector3::new(0.0, 0.0, FRAC_PI_2),
            ..Default::default()
        };
        pf.predict(&turn, 1.0);
        pf.predict(&forward(1.0), 2.0);
        let pose = pf.particles()[0].pose();
        assert_abs_diff_eq!(pose.position, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
        assert_abs_diff_eq!(pose.rpy.z, FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_non_positive_dt_is_noop() {
        let mut pf = ParticleFilter::new(zero_noise(1), FrameAnchors::default()).unwrap();
        pf.predict(&forward(1.0), 0.0);
        pf.predict(&forward(1.0), -1.0);
        assert_eq!(pf.particles()[0].pose().position, Vector3::zeros());
    }

    #[test]
    fn test_history_is_append_only() {
        let config = ParticleFilterConfig {
            motion_covariance: [0.01; 6],
            ..zero_noise(4)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        let seabed = FlatSeabed { depth: 20.0 };
        let measured = DVector::from_element(5, 20.0);

        let mut snapshots = Vec::new();
        for k in 1..=6 {
            pf.predict(&forward(1.0), 1.0);
            pf.update_pose_history();
            pf.update_weights(&measured, &seabed);
            for p in pf.particles() {
                assert_eq!(p.history().len(), k);
            }
            snapshots.push(*pf.particles()[0].history().last().unwrap());
        }
        let history = pf.particles()[0].history();
        for (k, entry) in snapshots.iter().enumerate() {
            assert_eq!(history.get(k), Some(entry));
        }
    }

    #[test]
    fn test_weights_normalized_and_favor_truth() {
        let config = ParticleFilterConfig {
            init_covariance: [0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            ..zero_noise(8)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        let seabed = FlatSeabed { depth: 20.0 };
        let measured = seabed.simulate_ranges(&Isometry3::identity(), 5);
        pf.update_weights(&measured, &seabed);

        let total: f64 = pf.particles().iter().map(|p| p.weight()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);

        let best = pf
            .particles()
            .iter()
            .max_by(|a, b| a.weight().total_cmp(&b.weight()))
            .unwrap();
        let closest = pf
            .particles()
            .iter()
            .min_by(|a, b| a.pose().position.z.abs().total_cmp(&b.pose().position.z.abs()))
            .unwrap();
        assert_eq!(best.id(), closest.id());
    }

    #[test]
    fn test_blind_simulator_counts_missed_measurements() {
        let mut pf = ParticleFilter::new(zero_noise(6), FrameAnchors::default()).unwrap();
        pf.update_weights(&DVector::from_element(5, 10.0), &Blind);
        assert_eq!(pf.missed_measurements(), 6);
        for p in pf.particles() {
            assert_relative_eq!(p.weight(), 1.0 / 6.0, epsilon = 1e-12);
        }
        let outcome = pf.resample();
        assert!(!outcome.resampled);
    }

    #[test]
    fn test_resampling_creates_children() {
        let config = ParticleFilterConfig {
            init_covariance: [0.0, 0.0, 4.0, 0.0, 0.0, 0.0],
            measurement_std: 0.01,
            ..zero_noise(10)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        let seabed = FlatSeabed { depth: 20.0 };
        let measured = seabed.simulate_ranges(&Isometry3::identity(), 5);
        let roots: Vec<_> = pf.particles().iter().map(|p| p.id()).collect();

        let mut resampled = false;
        for _ in 0..3 {
            pf.update_weights(&measured, &seabed);
            resampled |= pf.resample().resampled;
        }
        assert!(resampled);
        assert!(pf.lineage().len() > roots.len());
        for (slot, p) in pf.particles().iter().enumerate() {
            assert_eq!(p.index(), slot);
            let parent = p.parent().unwrap();
            assert_eq!(pf.lineage().parent(p.id()), Some(parent));
            assert!(roots.contains(&pf.lineage().root(p.id())));
        }
    }

    #[test]
    fn test_dead_reckoning_ignores_noise() {
        let config = ParticleFilterConfig {
            motion_covariance: [0.5; 6],
            ..zero_noise(3)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        pf.predict(&forward(1.0), 4.0);
        assert_relative_eq!(
            pf.dead_reckoning_pose().position,
            Vector3::new(4.0, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_circular_mean_across_wrap() {
        let config = ParticleFilterConfig {
            seed: Some(1),
            ..zero_noise(2)
        };
        let mut pf = ParticleFilter::new(config, FrameAnchors::default()).unwrap();
        pf.particles[0].pose = Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, 0.1));
        pf.particles[1].pose = Pose::new(Vector3::zeros(), Vector3::new(0.0, 0.0, -0.1));
        let mean = pf.mean_pose();
        assert_abs_diff_eq!(normalize_angle_signed(mean.rpy.z), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pf.covariance()[(5, 5)], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let anchors = FrameAnchors::default();
        assert_eq!(
            ParticleFilter::new(zero_noise(0), anchors).err(),
            Some(ConfigError::NoParticles)
        );
        let negative = ParticleFilterConfig {
            motion_covariance: [0.1, 0.1, -0.1, 0.0, 0.0, 0.0],
            ..zero_noise(2)
        };
        assert!(matches!(
            ParticleFilter::new(negative, anchors).err(),
            Some(ConfigError::InvalidCovariance { index: 2, .. })
        ));
        let no_beams = ParticleFilterConfig {
            beams_num: 0,
            ..zero_noise(2)
        };
        assert_eq!(
            ParticleFilter::new(no_beams, anchors).err(),
            Some(ConfigError::NoBeams)
        );
    }

    #[test]
    fn test_state_estimator_interface() {
        let mut pf = ParticleFilter::new(zero_noise(2), FrameAnchors::default()).unwrap();
        let odometry = forward(1.0);
        pf.process(
            &ModuleInput::Odometry {
                odometry: &odometry,
                dt: 2.0,
            },
            &FilterContext::default(),
        );
        let estimate = pf.estimate();
        assert_relative_eq!(
            estimate.pose.translation.vector,
            Vector3::new(2.0, 0.0, 0.0),
            epsilon = 1e-12
        );
        assert_eq!(pf.particles()[0].history().len(), 1);
    }
}
