// bathy_core/src/messages.rs

use crate::types::FrameHandle;
use nalgebra::{DVector, Isometry3, Matrix6, Point3, Vector3};

// =========================================================================
// == Perception-Specific Data Structures ==
// =========================================================================

/// A single sonar return.
#[derive(Debug, Clone, Copy)]
pub struct Point {
    /// The 3D position of the point in the SENSOR's local coordinate frame.
    pub position: Point3<f64>,
    /// Optional: backscatter intensity of the return.
    pub intensity: Option<f32>,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: Point3::new(x, y, z),
            intensity: None,
        }
    }

    /// Placeholder for a beam that returned nothing.
    pub fn missing() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN)
    }

    pub fn is_valid(&self) -> bool {
        self.position.coords.iter().all(|c| c.is_finite())
    }
}

/// One swath of multibeam returns, ordered across-track.
///
/// A full swath holds one point per beam; beams without a return are
/// [`Point::missing`] so that a point's index is its beam index.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    /// The handle of the sensor that generated this point cloud.
    pub sensor_handle: FrameHandle,
    /// The timestamp of when the swath was captured.
    pub timestamp: f64,
    pub points: Vec<Point>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Beams that actually returned.
    pub fn valid_points(&self) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(|p| p.is_valid())
    }

    /// Picks `beams` ranges evenly spread over the swath.
    ///
    /// Missing points and beams the swath cannot supply are `NaN`, which the
    /// likelihood treats as missing.
    pub fn beam_ranges(&self, beams: usize) -> DVector<f64> {
        let n = self.points.len();
        if n < beams {
            return DVector::from_fn(beams, |i, _| {
                self.points
                    .get(i)
                    .map(|p| p.position.coords.norm())
                    .unwrap_or(f64::NAN)
            });
        }
        DVector::from_fn(beams, |i, _| {
            let index = if beams == 1 {
                0
            } else {
                (i as f64 * (n - 1) as f64 / (beams - 1) as f64).round() as usize
            };
            self.points[index].position.coords.norm()
        })
    }
}

// =========================================================================
// == Sensor Inputs ==
// =========================================================================

/// Dead-reckoning twist expressed in the vehicle frame.
#[derive(Clone, Debug, Default)]
pub struct OdometryInput {
    pub timestamp: f64,
    pub linear_velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub frame: FrameHandle,
}

/// A raw multibeam reading, before it is stamped with a vehicle pose.
#[derive(Clone, Debug)]
pub struct MbesReading {
    pub timestamp: f64,
    pub frame: FrameHandle,
    pub cloud: PointCloud,
    /// Sensor to vehicle mounting transform, `T_base_mbes`.
    pub mount: Isometry3<f64>,
}

/// A reading stamped with the vehicle pose at capture time.
///
/// Fields are private so a captured ping can not be edited.
#[derive(Clone, Debug)]
pub struct Ping {
    timestamp: f64,
    frame: FrameHandle,
    cloud: PointCloud,
    mount: Isometry3<f64>,
    pose: Isometry3<f64>,
}

impl Ping {
    pub fn new(reading: MbesReading, pose: Isometry3<f64>) -> Self {
        Self {
            timestamp: reading.timestamp,
            frame: reading.frame,
            cloud: reading.cloud,
            mount: reading.mount,
            pose,
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn frame(&self) -> FrameHandle {
        self.frame
    }

    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    pub fn mount(&self) -> &Isometry3<f64> {
        &self.mount
    }

    /// Vehicle pose in the map frame.
    pub fn pose(&self) -> &Isometry3<f64> {
        &self.pose
    }

    /// The swath transformed into the map frame (`pose * mount * point`).
    pub fn map_points(&self) -> impl Iterator<Item = Point3<f64>> + '_ {
        let sensor_to_map = self.pose * self.mount;
        self.cloud
            .valid_points()
            .map(move |p| sensor_to_map * p.position)
    }
}

/// The universal input packet for `StateEstimator` implementations.
pub enum ModuleInput<'a> {
    /// Integrate a twist over `dt` seconds.
    Odometry {
        odometry: &'a OdometryInput,
        dt: f64,
    },
    /// Weight the current hypotheses against measured ranges.
    Ranges { measured: &'a DVector<f64> },
}

// =========================================================================
// == Public API Messages (Topic Data) ==
// =========================================================================

/// The pose the system publishes, with its uncertainty.
#[derive(Clone, Debug)]
pub struct PoseEstimate {
    pub timestamp: f64,
    /// Vehicle pose in the map frame.
    pub pose: Isometry3<f64>,
    /// Ordered `[x, y, z, roll, pitch, yaw]`.
    pub covariance: Matrix6<f64>,
}

impl Default for PoseEstimate {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            pose: Isometry3::identity(),
            covariance: Matrix6::zeros(),
        }
    }
}
