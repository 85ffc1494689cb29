// bathy_sim/src/simulation/survey.rs

use anyhow::Context;
use bathy_core::messages::OdometryInput;
use bathy_core::types::Pose;
use nalgebra::{Isometry3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

use crate::simulation::config::{OdometryNoiseConfig, SurveyConfig};
use crate::simulation::transforms::BASE_FRAME;

/// A constant body-frame twist held for `duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Leg {
    pub duration: f64,
    pub linear: Vector3<f64>,
    pub angular: Vector3<f64>,
}

/// The commanded motion of a whole survey.
#[derive(Debug, Clone)]
pub struct SurveyPlan {
    legs: Vec<Leg>,
}

impl SurveyPlan {
    /// Parallel lines along the start heading, joined by half-circle turns
    /// that alternate to port and starboard.
    pub fn lawnmower(config: &SurveyConfig) -> Self {
        let forward = Vector3::new(config.speed, 0.0, 0.0);
        let radius = 0.5 * config.line_spacing;
        let turn_rate = config.speed / radius;

        let mut legs = Vec::with_capacity(2 * config.lines);
        for line in 0..config.lines {
            legs.push(Leg {
                duration: config.line_length / config.speed,
                linear: forward,
                angular: Vector3::zeros(),
            });
            if line + 1 < config.lines {
                let direction = if line % 2 == 0 { 1.0 } else { -1.0 };
                legs.push(Leg {
                    duration: PI * radius / config.speed,
                    linear: forward,
                    angular: Vector3::new(0.0, 0.0, direction * turn_rate),
                });
            }
        }
        Self { legs }
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn duration(&self) -> f64 {
        self.legs.iter().map(|leg| leg.duration).sum()
    }

    /// The leg being flown at time `t`, `None` once the survey is over.
    pub fn leg_at(&self, t: f64) -> Option<&Leg> {
        let mut start = 0.0;
        for leg in &self.legs {
            if t < start + leg.duration {
                return Some(leg);
            }
            start += leg.duration;
        }
        None
    }
}

/// Ground-truth vehicle, integrated the same way the filter integrates odometry.
#[derive(Debug, Clone)]
pub struct Vehicle {
    map_from_odom: Isometry3<f64>,
    odom_pose: Pose,
}

impl Vehicle {
    /// The odometry frame is anchored at the start pose.
    pub fn new(start: Isometry3<f64>) -> Self {
        Self {
            map_from_odom: start,
            odom_pose: Pose::default(),
        }
    }

    pub fn advance(&mut self, linear: &Vector3<f64>, angular: &Vector3<f64>, dt: f64) {
        self.odom_pose.rpy += angular * dt;
        self.odom_pose.normalize_angles();
        let step = self.odom_pose.rotation() * (linear * dt);
        self.odom_pose.position += step;
    }

    pub fn odom_pose(&self) -> &Pose {
        &self.odom_pose
    }

    pub fn map_from_odom(&self) -> &Isometry3<f64> {
        &self.map_from_odom
    }

    pub fn map_pose(&self) -> Isometry3<f64> {
        self.map_from_odom * self.odom_pose.to_isometry()
    }
}

/// Adds white noise to the commanded twist.
#[derive(Debug, Clone)]
pub struct OdometrySensor {
    linear: [Normal<f64>; 3],
    angular: [Normal<f64>; 3],
}

impl OdometrySensor {
    pub fn new(config: &OdometryNoiseConfig) -> anyhow::Result<Self> {
        let axis = |std: f64| Normal::new(0.0, std).context("invalid odometry noise");
        Ok(Self {
            linear: [
                axis(config.linear_std[0])?,
                axis(config.linear_std[1])?,
                axis(config.linear_std[2])?,
            ],
            angular: [
                axis(config.angular_std[0])?,
                axis(config.angular_std[1])?,
                axis(config.angular_std[2])?,
            ],
        })
    }

    pub fn measure<R: Rng + ?Sized>(&self, leg: &Leg, timestamp: f64, rng: &mut R) -> OdometryInput {
        OdometryInput {
            timestamp,
            linear_velocity: Vector3::from_fn(|i, _| leg.linear[i] + self.linear[i].sample(rng)),
            angular_velocity: Vector3::from_fn(|i, _| leg.angular[i] + self.angular[i].sample(rng)),
            frame: BASE_FRAME,
        }
    }
}
