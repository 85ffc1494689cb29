// bathy_core/src/mapping/submap.rs

use crate::error::ConfigError;
use crate::mapping::landmarks::{DataAssociation, LandmarkExtractor};
use crate::messages::Ping;
use crate::types::LandmarkSet;
use log::{debug, info};
use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// When the accumulating submap is closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionCriterion {
    PingCount { count: usize },
    /// Time between the first and the last ping (s).
    Duration { seconds: f64 },
    /// Path length travelled by the stamped poses (m).
    Distance { meters: f64 },
}

impl Default for CompletionCriterion {
    fn default() -> Self {
        Self::PingCount { count: 50 }
    }
}

/// Which pose stands for the whole submap in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentativePose {
    #[default]
    LastPing,
    /// Translation average plus normalized quaternion average.
    Mean,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmapConfig {
    pub completion: CompletionCriterion,
    pub representative_pose: RepresentativePose,
}

impl SubmapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (name, value) = match self.completion {
            CompletionCriterion::PingCount { count } => ("completion.count", count as f64),
            CompletionCriterion::Duration { seconds } => ("completion.seconds", seconds),
            CompletionCriterion::Distance { meters } => ("completion.meters", meters),
        };
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::NotPositive { name, value });
        }
        Ok(())
    }
}

/// A finalized batch of pings. Immutable.
#[derive(Debug, Clone)]
pub struct Submap {
    id: usize,
    pings: Vec<Ping>,
    cloud: Vec<Point3<f64>>,
    pose: Isometry3<f64>,
    landmarks: LandmarkSet,
}

impl Submap {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pings(&self) -> &[Ping] {
        &self.pings
    }

    /// All returns in the map frame.
    pub fn cloud(&self) -> &[Point3<f64>] {
        &self.cloud
    }

    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }
}

/// What a completion event hands to the graph.
#[derive(Debug, Clone)]
pub struct CompletedSubmap {
    pub submap: Submap,
    /// `previous⁻¹ · current`, the odometry measurement between submaps.
    pub delta: Isometry3<f64>,
}

/// Accumulates pings into the active submap.
pub struct SubmapBuilder {
    config: SubmapConfig,
    extractor: LandmarkExtractor,
    association: Box<dyn DataAssociation>,
    pending: Vec<Ping>,
    travelled: f64,
    /// Position the next ping's travel is measured from. Cleared on resume
    /// so time spent paused does not count.
    last_position: Option<Vector3<f64>>,
    previous_pose: Isometry3<f64>,
    next_id: usize,
    enabled: bool,
}

impl SubmapBuilder {
    /// `origin` is the pose the first submap's delta is measured from.
    pub fn new(
        config: SubmapConfig,
        extractor: LandmarkExtractor,
        association: Box<dyn DataAssociation>,
        origin: Isometry3<f64>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            extractor,
            association,
            pending: Vec::new(),
            travelled: 0.0,
            last_position: None,
            previous_pose: origin,
            next_id: 0,
            enabled: true,
        })
    }

    /// Adds a ping and returns the finished submap if this ping completed it.
    /// Ignored while disabled.
    pub fn add_ping(&mut self, ping: Ping) -> Option<CompletedSubmap> {
        if !self.enabled {
            debug!("Submap builder disabled, ping at t={} skipped", ping.timestamp());
            return None;
        }
        let position = ping.pose().translation.vector;
        if let Some(last) = self.last_position.replace(position) {
            self.travelled += (position - last).norm();
        }
        self.pending.push(ping);

        if self.is_complete() {
            Some(self.finalize())
        } else {
            None
        }
    }

    /// Finalizes whatever has accumulated, `None` if nothing has.
    pub fn flush(&mut self) -> Option<CompletedSubmap> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.finalize())
        }
    }

    /// Pauses or resumes accumulation. Nothing accumulated is discarded.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "Submap accumulation {} with {} pending pings",
                if enabled { "resumed" } else { "paused" },
                self.pending.len()
            );
            if enabled {
                self.last_position = None;
            }
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pending_pings(&self) -> usize {
        self.pending.len()
    }

    pub fn previous_pose(&self) -> &Isometry3<f64> {
        &self.previous_pose
    }

    pub fn association(&self) -> &dyn DataAssociation {
        self.association.as_ref()
    }

    pub fn association_mut(&mut self) -> &mut dyn DataAssociation {
        self.association.as_mut()
    }

    fn is_complete(&self) -> bool {
        match self.config.completion {
            CompletionCriterion::PingCount { count } => self.pending.len() >= count,
            CompletionCriterion::Duration { seconds } => match (self.pending.first(), self.pending.last()) {
                (Some(first), Some(last)) => last.timestamp() - first.timestamp() >= seconds,
                _ => false,
            },
            CompletionCriterion::Distance { meters } => self.travelled >= meters,
        }
    }

    fn finalize(&mut self) -> CompletedSubmap {
        let pings = std::mem::take(&mut self.pending);
        self.travelled = 0.0;
        self.last_position = None;

        let cloud: Vec<Point3<f64>> = pings.iter().flat_map(|p| p.map_points()).collect();
        let pose = match self.config.representative_pose {
            RepresentativePose::LastPing => *pings[pings.len() - 1].pose(),
            RepresentativePose::Mean => mean_isometry(pings.iter().map(|p| p.pose())),
        };

        let candidates = self.extractor.extract(&cloud);
        let landmarks = self.association.associate(&candidates);

        let delta = self.previous_pose.inverse() * pose;
        self.previous_pose = pose;
        let id = self.next_id;
        self.next_id += 1;

        info!(
            "Submap {} finalized: {} pings, {} points, {} landmarks",
            id,
            pings.len(),
            cloud.len(),
            landmarks.len()
        );

        CompletedSubmap {
            submap: Submap {
                id,
                pings,
                cloud,
                pose,
                landmarks,
            },
            delta,
        }
    }
}

/// Averages translations and sign-aligned quaternions.
fn mean_isometry<'a>(poses: impl Iterator<Item = &'a Isometry3<f64>>) -> Isometry3<f64> {
    let mut translation = Vector3::zeros();
    let mut quaternion = Quaternion::new(0.0, 0.0, 0.0, 0.0);
    let mut reference: Option<Quaternion<f64>> = None;
    let mut count = 0usize;
    for pose in poses {
        translation += pose.translation.vector;
        let q = *pose.rotation.quaternion();
        let reference = *reference.get_or_insert(q);
        quaternion += if q.dot(&reference) < 0.0 { -q } else { q };
        count += 1;
    }
    if count == 0 {
        return Isometry3::identity();
    }
    Isometry3::from_parts(
        Translation3::from(translation / count as f64),
        UnitQuaternion::new_normalize(quaternion),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::landmarks::{LandmarkConfig, NearestNeighborAssociation};
    use crate::messages::{MbesReading, Point, PointCloud};
    use crate::types::FrameHandle;
    use approx::assert_relative_eq;

    fn builder(completion: CompletionCriterion, representative_pose: RepresentativePose) -> SubmapBuilder {
        let landmarks = LandmarkConfig::default();
        SubmapBuilder::new(
            SubmapConfig {
                completion,
                representative_pose,
            },
            LandmarkExtractor::new(&landmarks).unwrap(),
            Box::new(NearestNeighborAssociation::new(landmarks.association_distance).unwrap()),
            Isometry3::identity(),
        )
        .unwrap()
    }

    fn ping(t: f64, x: f64) -> Ping {
        let reading = MbesReading {
            timestamp: t,
            frame: FrameHandle(1),
            cloud: PointCloud {
                points: vec![Point::new(0.0, -1.0, 10.0), Point::new(0.0, 1.0, 10.0)],
                ..Default::default()
            },
            mount: Isometry3::identity(),
        };
        Ping::new(reading, Isometry3::translation(x, 0.0, 0.0))
    }

    #[test]
    fn test_five_ping_threshold() {
        let mut b = builder(CompletionCriterion::PingCount { count: 5 }, RepresentativePose::LastPing);
        for i in 0..4 {
            assert!(b.add_ping(ping(i as f64, i as f64)).is_none());
        }
        let done = b.add_ping(ping(4.0, 4.0)).expect("fifth ping completes the submap");
        assert_eq!(done.submap.pings().len(), 5);
        assert_eq!(done.submap.cloud().len(), 10);
        assert_eq!(done.submap.id(), 0);
        assert_eq!(b.pending_pings(), 0);

        assert!(b.add_ping(ping(5.0, 5.0)).is_none());
        assert_eq!(b.pending_pings(), 1);
    }

    #[test]
    fn test_delta_chains_submaps() {
        let mut b = builder(CompletionCriterion::PingCount { count: 2 }, RepresentativePose::LastPing);
        b.add_ping(ping(0.0, 0.0));
        let first = b.add_ping(ping(1.0, 3.0)).unwrap();
        b.add_ping(ping(2.0, 4.0));
        let second = b.add_ping(ping(3.0, 7.0)).unwrap();

        assert_relative_eq!(first.delta.translation.vector, Vector3::new(3.0, 0.0, 0.0));
        assert_relative_eq!(second.delta.translation.vector, Vector3::new(4.0, 0.0, 0.0));
        assert_relative_eq!(second.submap.pose().translation.vector, Vector3::new(7.0, 0.0, 0.0));
    }

    #[test]
    fn test_mean_representative_pose() {
        let mut b = builder(CompletionCriterion::PingCount { count: 3 }, RepresentativePose::Mean);
        b.add_ping(ping(0.0, 0.0));
        b.add_ping(ping(1.0, 1.0));
        let done = b.add_ping(ping(2.0, 5.0)).unwrap();
        assert_relative_eq!(done.submap.pose().translation.vector, Vector3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn test_merged_cloud_is_in_map_frame() {
        let mut b = builder(CompletionCriterion::PingCount { count: 1 }, RepresentativePose::LastPing);
        let done = b.add_ping(ping(0.0, 2.0)).unwrap();
        assert_relative_eq!(done.submap.cloud()[0], Point3::new(2.0, -1.0, 10.0));
    }

    #[test]
    fn test_duration_and_distance_criteria() {
        let mut by_time = builder(CompletionCriterion::Duration { seconds: 2.0 }, RepresentativePose::LastPing);
        assert!(by_time.add_ping(ping(0.0, 0.0)).is_none());
        assert!(by_time.add_ping(ping(1.0, 0.0)).is_none());
        assert!(by_time.add_ping(ping(2.0, 0.0)).is_some());

        let mut by_distance = builder(CompletionCriterion::Distance { meters: 5.0 }, RepresentativePose::LastPing);
        assert!(by_distance.add_ping(ping(0.0, 0.0)).is_none());
        assert!(by_distance.add_ping(ping(1.0, 3.0)).is_none());
        assert!(by_distance.add_ping(ping(2.0, 6.0)).is_some());
    }

    #[test]
    fn test_disable_keeps_pending_and_flush() {
        let mut b = builder(CompletionCriterion::PingCount { count: 3 }, RepresentativePose::LastPing);
        b.add_ping(ping(0.0, 0.0));
        b.set_enabled(false);
        assert!(b.add_ping(ping(1.0, 1.0)).is_none());
        assert!(b.add_ping(ping(2.0, 2.0)).is_none());
        assert_eq!(b.pending_pings(), 1);

        b.set_enabled(true);
        b.add_ping(ping(3.0, 3.0));
        let flushed = b.flush().unwrap();
        assert_eq!(flushed.submap.pings().len(), 2);
        assert!(b.flush().is_none());
    }

    #[test]
    fn test_distance_ignores_travel_while_paused() {
        let mut b = builder(CompletionCriterion::Distance { meters: 5.0 }, RepresentativePose::LastPing);
        assert!(b.add_ping(ping(0.0, 0.0)).is_none());
        assert!(b.add_ping(ping(1.0, 2.0)).is_none());
        b.set_enabled(false);
        assert!(b.add_ping(ping(2.0, 30.0)).is_none());
        b.set_enabled(true);

        // The 48 m covered while paused is not travel within the submap.
        assert!(b.add_ping(ping(3.0, 50.0)).is_none());
        assert!(b.add_ping(ping(4.0, 52.0)).is_none());
        let done = b.add_ping(ping(5.0, 53.0)).unwrap();
        assert_eq!(done.submap.pings().len(), 5);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = SubmapConfig {
            completion: CompletionCriterion::PingCount { count: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
