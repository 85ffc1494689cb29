// bathy_core/src/types.rs

use nalgebra::{Isometry3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};
use num_traits::{Float, FloatConst};
use std::fmt;

// --- Core Identifiers ---

/// A generic, framework-agnostic identifier for a coordinate frame.
/// On the vehicle this is a hardware id, in the simulator a plain counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameHandle(pub u64);

/// Persistent identity of a physical seabed feature.
///
/// The same id must refer to the same feature in every submap it appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LandmarkId(pub u64);

impl fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Stable identity of a particle. A resampled slot receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ParticleId(pub u64);

// --- Core Trait for Transform Lookups ---
// This is so fundamental it belongs here.
pub trait TfProvider {
    /// Gets the transform FROM `from` TO `to`, i.e. `T_to_from`.
    fn get_transform(&self, from: FrameHandle, to: FrameHandle) -> Option<Isometry3<f64>>;
}

// =========================================================================
// == Angles ==
// =========================================================================

/// Wraps an angle into `[0, 2π)`.
///
/// Normalizing an already normalized angle returns it unchanged.
pub fn normalize_angle<T: Float + FloatConst>(angle: T) -> T {
    let two_pi = T::PI() + T::PI();
    let mut wrapped = angle % two_pi;
    if wrapped < T::zero() {
        wrapped = wrapped + two_pi;
    }
    // A tiny negative remainder plus 2π rounds up to exactly 2π.
    if wrapped >= two_pi {
        wrapped = wrapped - two_pi;
    }
    wrapped
}

/// Wraps an angle into `[-π, π)`. Used when averaging headings.
pub fn normalize_angle_signed<T: Float + FloatConst>(angle: T) -> T {
    normalize_angle(angle + T::PI()) - T::PI()
}

/// Builds the rotation `Rx(roll) * Ry(pitch) * Rz(yaw)`.
pub fn rotation_from_rpy(rpy: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::x_axis(), rpy.x)
        * Rotation3::from_axis_angle(&Vector3::y_axis(), rpy.y)
        * Rotation3::from_axis_angle(&Vector3::z_axis(), rpy.z)
}

// =========================================================================
// == Pose ==
// =========================================================================

/// A 6-DoF pose: position plus roll/pitch/yaw, angles kept in `[0, 2π)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub rpy: Vector3<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, rpy: Vector3<f64>) -> Self {
        let mut pose = Self { position, rpy };
        pose.normalize_angles();
        pose
    }

    /// Builds a pose from `[x, y, z, roll, pitch, yaw]`.
    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self::new(
            Vector3::new(v[0], v[1], v[2]),
            Vector3::new(v[3], v[4], v[5]),
        )
    }

    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.position.x,
            self.position.y,
            self.position.z,
            self.rpy.x,
            self.rpy.y,
            self.rpy.z,
        )
    }

    pub fn normalize_angles(&mut self) {
        for i in 0..3 {
            self.rpy[i] = normalize_angle(self.rpy[i]);
        }
    }

    pub fn rotation(&self) -> Rotation3<f64> {
        rotation_from_rpy(&self.rpy)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.position),
            UnitQuaternion::from_rotation_matrix(&self.rotation()),
        )
    }
}

// =========================================================================
// == Landmarks ==
// =========================================================================

/// A seabed feature expressed in the map frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub id: LandmarkId,
    pub position: Point3<f64>,
}

pub type LandmarkSet = Vec<Landmark>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::{PI, TAU};

    #[test]
    fn test_normalize_angle_range() {
        let inputs = [
            -100.0,
            -TAU,
            -PI,
            -1e-12,
            0.0,
            1.0,
            PI,
            TAU - 1e-9,
            TAU,
            3.0 * TAU + 0.5,
            1e6,
        ];
        for angle in inputs {
            let wrapped = normalize_angle(angle);
            assert!(
                (0.0..TAU).contains(&wrapped),
                "angle {} wrapped to {}",
                angle,
                wrapped
            );
        }
        assert_abs_diff_eq!(normalize_angle(-PI / 2.0), 1.5 * PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(TAU + 0.25), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_angle_idempotent() {
        for i in -50..50 {
            let once = normalize_angle(i as f64 * 0.37);
            assert_eq!(normalize_angle(once), once);
        }
    }

    #[test]
    fn test_normalize_angle_f32() {
        let wrapped = normalize_angle(-0.5_f32);
        assert!((0.0..std::f32::consts::TAU).contains(&wrapped));
    }

    #[test]
    fn test_signed_angle() {
        assert_abs_diff_eq!(normalize_angle_signed(1.5 * PI), -0.5 * PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle_signed(0.25), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_isometry_matches_rotation_order() {
        let pose = Pose::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.1, 0.2, 0.3));
        let iso = pose.to_isometry();
        let expected = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.1)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), 0.2)
            * Rotation3::from_axis_angle(&Vector3::z_axis(), 0.3);
        let v = Vector3::new(0.3, -1.0, 2.0);
        assert_relative_eq!(iso.rotation * v, expected * v, epsilon = 1e-12);
        assert_relative_eq!(iso.translation.vector, pose.position, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_new_wraps_angles() {
        let pose = Pose::new(Vector3::zeros(), Vector3::new(-0.1, TAU + 0.2, 7.0));
        for i in 0..3 {
            assert!((0.0..TAU).contains(&pose.rpy[i]));
        }
        assert_abs_diff_eq!(pose.rpy.y, 0.2, epsilon = 1e-12);
    }
}
