// bathy_core/src/estimation/mod.rs

use crate::messages::{ModuleInput, PoseEstimate};
use crate::types::{FrameHandle, TfProvider};
use nalgebra::{DVector, Isometry3};

pub mod likelihood;
pub mod particle;
pub mod particle_filter;
pub mod resampling;

/// Produces the ranges a sonar at `sensor_pose` would measure.
///
/// The filter never casts rays itself. On the vehicle this is backed by the
/// map built so far, in the simulator by the synthetic seabed.
pub trait RaySimulator: Send + Sync {
    /// Returns exactly `beams` ranges. Beams that hit nothing are `NaN`.
    fn simulate_ranges(&self, sensor_pose: &Isometry3<f64>, beams: usize) -> DVector<f64>;
}

/// Provides the necessary world-context for an estimator to perform its work.
#[derive(Default)]
pub struct FilterContext<'a> {
    /// Needed to weight hypotheses against a ping.
    pub simulator: Option<&'a dyn RaySimulator>,
}

/// The contract for any algorithm that performs the "State Estimator" role.
pub trait StateEstimator: Send {
    /// The single, unified method for processing all types of input data.
    fn process(&mut self, input: &ModuleInput, context: &FilterContext);

    /// Current best estimate in the map frame.
    fn estimate(&self) -> PoseEstimate;
}

/// Fixed transforms resolved once at start-up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnchors {
    /// `T_map_odom`, where the odometry frame sits in the map.
    pub map_from_odom: Isometry3<f64>,
    /// `T_base_mbes`, the sonar mount on the vehicle.
    pub base_from_mbes: Isometry3<f64>,
}

impl Default for FrameAnchors {
    fn default() -> Self {
        Self {
            map_from_odom: Isometry3::identity(),
            base_from_mbes: Isometry3::identity(),
        }
    }
}

impl FrameAnchors {
    /// Resolves both anchors, `None` if the tree does not know one of them yet.
    pub fn lookup(
        tf: &dyn TfProvider,
        map: FrameHandle,
        odom: FrameHandle,
        base: FrameHandle,
        mbes: FrameHandle,
    ) -> Option<Self> {
        Some(Self {
            map_from_odom: tf.get_transform(odom, map)?,
            base_from_mbes: tf.get_transform(mbes, base)?,
        })
    }

    /// Vehicle pose in the map frame for a pose expressed in odom.
    pub fn vehicle_pose(&self, odom_pose: &Isometry3<f64>) -> Isometry3<f64> {
        self.map_from_odom * odom_pose
    }

    /// Sonar pose in the map frame for a vehicle pose expressed in odom.
    pub fn sensor_pose(&self, odom_pose: &Isometry3<f64>) -> Isometry3<f64> {
        self.map_from_odom * odom_pose * self.base_from_mbes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};
    use std::collections::HashMap;

    struct StaticTf(HashMap<(FrameHandle, FrameHandle), Isometry3<f64>>);

    impl TfProvider for StaticTf {
        fn get_transform(&self, from: FrameHandle, to: FrameHandle) -> Option<Isometry3<f64>> {
            self.0.get(&(from, to)).copied()
        }
    }

    const MAP: FrameHandle = FrameHandle(0);
    const ODOM: FrameHandle = FrameHandle(1);
    const BASE: FrameHandle = FrameHandle(2);
    const MBES: FrameHandle = FrameHandle(3);

    #[test]
    fn test_anchor_lookup_and_composition() {
        let map_from_odom = Isometry3::translation(10.0, 0.0, 0.0);
        let base_from_mbes = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, -0.5),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3),
        );
        let mut table = HashMap::new();
        table.insert((ODOM, MAP), map_from_odom);
        table.insert((MBES, BASE), base_from_mbes);
        let anchors = FrameAnchors::lookup(&StaticTf(table), MAP, ODOM, BASE, MBES).unwrap();

        let odom_pose = Isometry3::translation(1.0, 2.0, 0.0);
        let sensor = anchors.sensor_pose(&odom_pose);
        let expected = map_from_odom * odom_pose * base_from_mbes;
        assert_relative_eq!(sensor.to_homogeneous(), expected.to_homogeneous(), epsilon = 1e-12);
    }

    #[test]
    fn test_anchor_lookup_missing_frame() {
        let tf = StaticTf(HashMap::new());
        assert!(FrameAnchors::lookup(&tf, MAP, ODOM, BASE, MBES).is_none());
    }
}
