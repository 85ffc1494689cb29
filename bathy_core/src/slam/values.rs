// bathy_core/src/slam/values.rs

use crate::types::LandmarkId;
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3, Vector6};
use std::collections::BTreeMap;
use std::fmt;

/// A variable in the graph: submap pose `x_i` or landmark `l_j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Pose(usize),
    Landmark(LandmarkId),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Pose(i) => write!(f, "x{}", i),
            Key::Landmark(id) => write!(f, "{}", id),
        }
    }
}

// --- Pose chart ---

/// `x ⊕ δ = x · Iso(δ_t, exp(δ_ω))` with `δ = [t, ω]`.
pub fn retract_pose(x: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let step = Isometry3::from_parts(
        Translation3::new(delta[0], delta[1], delta[2]),
        UnitQuaternion::from_scaled_axis(Vector3::new(delta[3], delta[4], delta[5])),
    );
    x * step
}

/// Inverse of [`retract_pose`]: `local(x, x ⊕ δ) = δ`.
pub fn local_pose(x: &Isometry3<f64>, y: &Isometry3<f64>) -> Vector6<f64> {
    let d = x.inverse() * y;
    let t = d.translation.vector;
    let w = d.rotation.scaled_axis();
    Vector6::new(t.x, t.y, t.z, w.x, w.y, w.z)
}

/// Variable assignments, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    poses: BTreeMap<usize, Isometry3<f64>>,
    landmarks: BTreeMap<LandmarkId, Point3<f64>>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pose(&mut self, index: usize, pose: Isometry3<f64>) {
        self.poses.insert(index, pose);
    }

    pub fn insert_landmark(&mut self, id: LandmarkId, position: Point3<f64>) {
        self.landmarks.insert(id, position);
    }

    pub fn pose(&self, index: usize) -> Option<&Isometry3<f64>> {
        self.poses.get(&index)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Point3<f64>> {
        self.landmarks.get(&id)
    }

    pub fn contains(&self, key: Key) -> bool {
        match key {
            Key::Pose(i) => self.poses.contains_key(&i),
            Key::Landmark(id) => self.landmarks.contains_key(&id),
        }
    }

    pub fn poses(&self) -> impl Iterator<Item = (usize, &Isometry3<f64>)> {
        self.poses.iter().map(|(i, p)| (*i, p))
    }

    pub fn landmarks(&self) -> impl Iterator<Item = (LandmarkId, &Point3<f64>)> {
        self.landmarks.iter().map(|(id, p)| (*id, p))
    }

    pub fn pose_count(&self) -> usize {
        self.poses.len()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn len(&self) -> usize {
        self.poses.len() + self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty() && self.landmarks.is_empty()
    }

    /// Adds the keys of `other` that are not assigned yet. Existing
    /// assignments win.
    pub fn insert_missing(&mut self, other: &Values) {
        for (i, pose) in &other.poses {
            self.poses.entry(*i).or_insert(*pose);
        }
        for (id, position) in &other.landmarks {
            self.landmarks.entry(*id).or_insert(*position);
        }
    }

    pub fn clear(&mut self) {
        self.poses.clear();
        self.landmarks.clear();
    }
}
