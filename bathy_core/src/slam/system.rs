// bathy_core/src/slam/system.rs

use crate::error::{ConfigError, GraphError, SlamError};
use crate::estimation::particle_filter::{ParticleFilter, ParticleFilterConfig, ResampleOutcome};
use crate::estimation::{FilterContext, FrameAnchors, RaySimulator, StateEstimator};
use crate::mapping::landmarks::{LandmarkConfig, LandmarkExtractor, NearestNeighborAssociation};
use crate::mapping::submap::{CompletedSubmap, Submap, SubmapBuilder, SubmapConfig};
use crate::messages::{MbesReading, ModuleInput, OdometryInput, Ping, PoseEstimate};
use crate::slam::graph::{CommitReport, FactorGraph, GraphConfig, LoopClosure};
use crate::types::Landmark;
use log::{debug, info, warn};
use nalgebra::Isometry3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Latest published estimate, replaced wholesale by the controller.
pub type EstimateSnapshot = Arc<RwLock<Option<PoseEstimate>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub filter: ParticleFilterConfig,
    pub submap: SubmapConfig,
    pub landmarks: LandmarkConfig,
    pub graph: GraphConfig,
    /// Completed submaps staged before the graph is solved.
    pub commit_every: usize,
    /// Solve right away when a submap closes a loop.
    pub commit_on_loop_closure: bool,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            filter: ParticleFilterConfig::default(),
            submap: SubmapConfig::default(),
            landmarks: LandmarkConfig::default(),
            graph: GraphConfig::default(),
            commit_every: 1,
            commit_on_loop_closure: true,
        }
    }
}

/// What happened to the graph when a submap completed.
#[derive(Debug, Clone)]
pub struct SubmapReport {
    pub submap_id: usize,
    /// Graph node created for the submap.
    pub pose_index: usize,
    pub landmarks: usize,
    pub loop_closures: Vec<LoopClosure>,
    /// `None` when the submap was only staged.
    pub commit: Option<CommitReport>,
}

#[derive(Debug, Clone)]
pub struct PingReport {
    pub resample: ResampleOutcome,
    pub submap: Option<SubmapReport>,
}

/// Sequences one ping at a time through the filter, the submap builder and
/// the graph, and publishes the corrected pose.
pub struct BathySlam {
    config: SlamConfig,
    filter: ParticleFilter,
    builder: SubmapBuilder,
    graph: FactorGraph,
    submaps: Vec<Submap>,
    /// Filter pose each graph node was created from, `[origin, submap poses..]`.
    node_poses: Vec<Isometry3<f64>>,
    /// Submaps staged in the graph since the last commit.
    uncommitted: usize,
    /// `x_k · submap_pose_k⁻¹` for the newest committed node.
    correction: Isometry3<f64>,
    last_odometry: Option<f64>,
    snapshot: EstimateSnapshot,
}

impl BathySlam {
    pub fn new(config: SlamConfig, anchors: FrameAnchors) -> Result<Self, SlamError> {
        if config.commit_every == 0 {
            return Err(ConfigError::NotPositive {
                name: "commit_every",
                value: 0.0,
            }
            .into());
        }
        let filter = ParticleFilter::new(config.filter.clone(), anchors)?;
        let origin = filter.mean_map_pose();

        let extractor = LandmarkExtractor::new(&config.landmarks)?;
        let association = NearestNeighborAssociation::new(config.landmarks.association_distance)?;
        let builder = SubmapBuilder::new(
            config.submap.clone(),
            extractor,
            Box::new(association),
            origin,
        )?;

        let mut graph = FactorGraph::new(&config.graph)?;
        graph.add_prior(origin)?;
        graph.commit()?;

        let slam = Self {
            config,
            filter,
            builder,
            graph,
            submaps: Vec::new(),
            node_poses: vec![origin],
            uncommitted: 0,
            correction: Isometry3::identity(),
            last_odometry: None,
            snapshot: Arc::new(RwLock::new(None)),
        };
        slam.publish();
        Ok(slam)
    }

    /// Runs one synchronized odometry + sonar pair through the system.
    ///
    /// The first call only weights, later calls integrate odometry over the
    /// time since the previous one.
    pub fn process_ping(
        &mut self,
        odometry: &OdometryInput,
        reading: MbesReading,
        simulator: &dyn RaySimulator,
    ) -> Result<PingReport, SlamError> {
        let dt = self
            .last_odometry
            .map_or(0.0, |last| odometry.timestamp - last);
        self.last_odometry = Some(odometry.timestamp);

        let context = FilterContext {
            simulator: Some(simulator),
        };
        self.filter
            .process(&ModuleInput::Odometry { odometry, dt }, &context);
        let measured = reading.cloud.beam_ranges(self.filter.config().beams_num);
        self.filter
            .process(&ModuleInput::Ranges { measured: &measured }, &context);
        let resample = self.filter.resample();

        let ping = Ping::new(reading, self.filter.mean_map_pose());
        let submap = match self.builder.add_ping(ping) {
            Some(completed) => Some(self.integrate(completed, false)?),
            None => None,
        };

        self.publish();
        Ok(PingReport { resample, submap })
    }

    /// Closes the active submap, if any, and solves everything staged.
    pub fn flush(&mut self) -> Result<Option<SubmapReport>, SlamError> {
        let report = match self.builder.flush() {
            Some(completed) => Some(self.integrate(completed, true)?),
            None => {
                if self.graph.has_staged() {
                    self.commit()?;
                }
                None
            }
        };
        self.publish();
        Ok(report)
    }

    /// Pauses or resumes submap accumulation. The filter keeps running.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.builder.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.builder.is_enabled()
    }

    /// Shared handle to the latest published estimate.
    pub fn snapshot(&self) -> EstimateSnapshot {
        Arc::clone(&self.snapshot)
    }

    /// Filter mean with the latest graph correction applied.
    pub fn corrected_pose(&self) -> Isometry3<f64> {
        self.correction * self.filter.mean_map_pose()
    }

    pub fn correction(&self) -> &Isometry3<f64> {
        &self.correction
    }

    pub fn filter(&self) -> &ParticleFilter {
        &self.filter
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    pub fn builder(&self) -> &SubmapBuilder {
        &self.builder
    }

    pub fn submaps(&self) -> &[Submap] {
        &self.submaps
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    // --- Private Helper Methods ---

    fn integrate(
        &mut self,
        completed: CompletedSubmap,
        force_commit: bool,
    ) -> Result<SubmapReport, SlamError> {
        let CompletedSubmap { submap, delta } = completed;
        let step = self.graph.tip().ok_or(GraphError::NotInitialized)?;
        let initial = self
            .graph
            .pose_estimate(step)
            .map_or(*submap.pose(), |previous| previous * delta);

        let pose_index = self.graph.add_odom_factor(initial, delta, step)?;
        let loop_closures =
            self.graph
                .add_landmarks_factor(submap.landmarks(), step, submap.pose())?;
        self.node_poses.push(*submap.pose());
        self.uncommitted += 1;
        debug!(
            "Submap {} staged as x{} with {} landmarks",
            submap.id(),
            pose_index,
            submap.landmarks().len()
        );

        let due = force_commit
            || self.uncommitted >= self.config.commit_every
            || (self.config.commit_on_loop_closure && !loop_closures.is_empty());
        let commit = if due { self.commit()? } else { None };

        let report = SubmapReport {
            submap_id: submap.id(),
            pose_index,
            landmarks: submap.landmarks().len(),
            loop_closures,
            commit,
        };
        self.submaps.push(submap);
        Ok(report)
    }

    /// Solves the graph and pulls its estimates back into association and the
    /// published correction. A solver failure leaves everything staged.
    fn commit(&mut self) -> Result<Option<CommitReport>, SlamError> {
        let report = match self.graph.commit() {
            Ok(report) => report,
            Err(GraphError::SolverFailed(reason)) => {
                warn!("Graph solve failed, retrying on the next commit: {}", reason);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        self.uncommitted = 0;

        let refreshed = self.graph.tip().and_then(|tip| {
            let refined = self.graph.pose(tip)?;
            Some(refined * self.node_poses.get(tip)?.inverse())
        });
        if let Some(correction) = refreshed {
            self.correction = correction;
        }

        // Candidates are extracted from uncorrected pings, so the refined
        // landmarks are matched in that frame too.
        let landmarks = self.graph.landmarks();
        let uncorrected = in_filter_frame(&landmarks, &self.correction);
        self.builder.association_mut().update_known(&uncorrected);
        info!(
            "Graph solved: {} poses, {} landmarks, correction {:?}",
            self.graph.pose_count(),
            landmarks.len(),
            self.correction.translation.vector.as_slice()
        );
        Ok(report)
    }

    fn publish(&self) {
        let estimate = self.filter.estimate();
        let corrected = PoseEstimate {
            pose: self.correction * estimate.pose,
            ..estimate
        };
        *self.snapshot.write() = Some(corrected);
    }
}

/// Maps graph-frame landmarks into the frame the filter stamps pings in.
fn in_filter_frame(landmarks: &[Landmark], correction: &Isometry3<f64>) -> Vec<Landmark> {
    let inverse = correction.inverse();
    landmarks
        .iter()
        .map(|l| Landmark {
            id: l.id,
            position: inverse * l.position,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::landmarks::LandmarkCandidate;
    use crate::mapping::submap::CompletionCriterion;
    use crate::messages::{Point, PointCloud};
    use crate::types::LandmarkId;
    use approx::assert_abs_diff_eq;
    use nalgebra::{DVector, Point3, Vector3};

    const DEPTH: f64 = 20.0;
    const BEAMS: usize = 9;

    /// Flat seabed at `z = -DEPTH`, beams fanned across-track below the sensor.
    struct FlatSeabed;

    fn beam_angle(i: usize) -> f64 {
        -0.6 + 1.2 * i as f64 / (BEAMS - 1) as f64
    }

    impl RaySimulator for FlatSeabed {
        fn simulate_ranges(&self, sensor_pose: &Isometry3<f64>, beams: usize) -> DVector<f64> {
            let height = DEPTH + sensor_pose.translation.vector.z;
            DVector::from_fn(beams, |i, _| height / beam_angle(i).cos())
        }
    }

    fn reading(t: f64) -> MbesReading {
        let points = (0..BEAMS)
            .map(|i| {
                let a = beam_angle(i);
                let r = DEPTH / a.cos();
                Point::new(0.0, r * a.sin(), -r * a.cos())
            })
            .collect();
        MbesReading {
            timestamp: t,
            frame: Default::default(),
            cloud: PointCloud {
                points,
                timestamp: t,
                ..Default::default()
            },
            mount: Isometry3::identity(),
        }
    }

    fn forward(t: f64) -> OdometryInput {
        OdometryInput {
            timestamp: t,
            linear_velocity: Vector3::new(1.0, 0.0, 0.0),
            ..Default::default()
        }
    }

    fn config(pings: usize) -> SlamConfig {
        let mut config = SlamConfig::default();
        config.filter.particle_count = 4;
        config.filter.beams_num = BEAMS;
        config.filter.measurement_std = 0.1;
        config.filter.resampling_noise_covariance = [0.0; 6];
        config.filter.seed = Some(3);
        config.submap.completion = CompletionCriterion::PingCount { count: pings };
        config
    }

    #[test]
    fn test_initial_snapshot_published() {
        let slam = BathySlam::new(config(5), FrameAnchors::default()).unwrap();
        let snapshot = slam.snapshot();
        let estimate = snapshot.read().clone().unwrap();
        assert_abs_diff_eq!(estimate.pose.translation.vector, Vector3::zeros(), epsilon = 1e-12);
        assert_eq!(slam.graph().pose_count(), 1);
        assert!(!slam.graph().has_staged());
    }

    #[test]
    fn test_submap_completion_reaches_graph() {
        let mut slam = BathySlam::new(config(5), FrameAnchors::default()).unwrap();
        let mut reports = Vec::new();
        for k in 0..6 {
            let t = k as f64;
            reports.push(slam.process_ping(&forward(t), reading(t), &FlatSeabed).unwrap());
        }
        let completed: Vec<&SubmapReport> = reports.iter().filter_map(|r| r.submap.as_ref()).collect();
        assert_eq!(completed.len(), 1);
        assert!(reports[4].submap.is_some());
        assert_eq!(completed[0].pose_index, 1);
        assert!(completed[0].commit.is_some());
        assert_eq!(slam.graph().pose_count(), 2);
        assert_eq!(slam.builder().pending_pings(), 1);

        // Deterministic motion: the fifth ping was 4 s at 1 m/s from the start.
        let x1 = slam.graph().pose(1).unwrap();
        assert_abs_diff_eq!(x1.translation.vector.x, 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(slam.correction().translation.vector.norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_first_ping_does_not_move() {
        let mut slam = BathySlam::new(config(5), FrameAnchors::default()).unwrap();
        slam.process_ping(&forward(10.0), reading(10.0), &FlatSeabed).unwrap();
        assert_abs_diff_eq!(
            slam.filter().mean_map_pose().translation.vector,
            Vector3::zeros(),
            epsilon = 1e-12
        );
        slam.process_ping(&forward(10.5), reading(10.5), &FlatSeabed).unwrap();
        assert_abs_diff_eq!(slam.corrected_pose().translation.vector.x, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_flush_and_disable() {
        let mut slam = BathySlam::new(config(5), FrameAnchors::default()).unwrap();
        slam.set_enabled(false);
        for k in 0..8 {
            let t = k as f64;
            let report = slam.process_ping(&forward(t), reading(t), &FlatSeabed).unwrap();
            assert!(report.submap.is_none());
        }
        assert_eq!(slam.builder().pending_pings(), 0);
        assert!(slam.flush().unwrap().is_none());

        slam.set_enabled(true);
        for k in 8..10 {
            let t = k as f64;
            slam.process_ping(&forward(t), reading(t), &FlatSeabed).unwrap();
        }
        let report = slam.flush().unwrap().unwrap();
        assert_eq!(report.pose_index, 1);
        assert!(report.commit.is_some());
        assert!(slam.flush().unwrap().is_none());
        assert_eq!(slam.submaps().len(), 1);
        assert_eq!(slam.submaps()[0].pings().len(), 2);
    }

    #[test]
    fn test_batched_commits() {
        let mut config = config(2);
        config.commit_every = 2;
        let mut slam = BathySlam::new(config, FrameAnchors::default()).unwrap();
        let mut commits = Vec::new();
        for k in 0..8 {
            let t = k as f64;
            if let Some(submap) = slam.process_ping(&forward(t), reading(t), &FlatSeabed).unwrap().submap {
                commits.push(submap.commit.is_some());
            }
        }
        assert_eq!(commits, vec![false, true, false, true]);
        assert_eq!(slam.graph().pose_count(), 5);
        assert!(!slam.graph().has_staged());
    }

    #[test]
    fn test_refined_landmarks_reidentified_through_correction() {
        let mut config = config(5);
        config.landmarks.association_distance = 3.0;
        let mut slam = BathySlam::new(config, FrameAnchors::default()).unwrap();

        // The graph moved everything 8 m along x, well past the gate.
        slam.correction = Isometry3::translation(8.0, 0.0, 0.0);
        let refined = [Landmark {
            id: LandmarkId(4),
            position: Point3::new(18.0, 2.0, -20.0),
        }];
        let uncorrected = in_filter_frame(&refined, &slam.correction);
        assert_abs_diff_eq!(uncorrected[0].position, Point3::new(10.0, 2.0, -20.0), epsilon = 1e-12);

        let association = slam.builder.association_mut();
        association.update_known(&uncorrected);
        let seen = association.associate(&[LandmarkCandidate {
            position: Point3::new(10.5, 2.0, -20.0),
            salience: 1.0,
        }]);
        assert_eq!(seen[0].id, LandmarkId(4));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(5);
        bad.commit_every = 0;
        assert!(matches!(
            BathySlam::new(bad, FrameAnchors::default()),
            Err(SlamError::Config(ConfigError::NotPositive { .. }))
        ));

        let mut bad = config(5);
        bad.filter.particle_count = 0;
        assert!(matches!(
            BathySlam::new(bad, FrameAnchors::default()),
            Err(SlamError::Config(ConfigError::NoParticles))
        ));
    }
}
