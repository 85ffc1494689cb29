// bathy_core/src/estimation/particle.rs

use crate::types::{ParticleId, Pose};
use nalgebra::{Isometry3, Rotation3, Vector3};

/// One map-frame sonar pose recorded in a particle's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub position: Vector3<f64>,
    pub rotation: Rotation3<f64>,
}

/// Append-only log of map-frame sonar poses.
///
/// There is no way to edit or remove an entry once pushed.
#[derive(Debug, Clone, Default)]
pub struct PoseHistory {
    entries: Vec<HistoryEntry>,
}

impl PoseHistory {
    pub(crate) fn push(&mut self, pose: &Isometry3<f64>) {
        self.entries.push(HistoryEntry {
            position: pose.translation.vector,
            rotation: pose.rotation.to_rotation_matrix(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}

/// A single trajectory hypothesis.
///
/// `pose` lives in the odometry frame. Only the filter mutates particles.
#[derive(Debug, Clone)]
pub struct Particle {
    pub(crate) id: ParticleId,
    pub(crate) parent: Option<ParticleId>,
    pub(crate) index: usize,
    pub(crate) pose: Pose,
    pub(crate) weight: f64,
    pub(crate) log_weight: f64,
    pub(crate) history: PoseHistory,
    pub(crate) beams: usize,
}

impl Particle {
    pub(crate) fn new(id: ParticleId, index: usize, pose: Pose, beams: usize, weight: f64) -> Self {
        Self {
            id,
            parent: None,
            index,
            pose,
            weight,
            log_weight: weight.ln(),
            history: PoseHistory::default(),
            beams,
        }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    pub fn parent(&self) -> Option<ParticleId> {
        self.parent
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    /// Normalized weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Unnormalized log-likelihood of the last weighting.
    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn history(&self) -> &PoseHistory {
        &self.history
    }

    pub fn beams(&self) -> usize {
        self.beams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_history_records_pose() {
        let mut history = PoseHistory::default();
        let pose = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.0, 0.0, 0.5));
        history.push(&pose);
        assert_eq!(history.len(), 1);
        let entry = history.last().unwrap();
        assert_relative_eq!(entry.position, Vector3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(entry.rotation.angle(), 0.5, epsilon = 1e-12);
    }
}
