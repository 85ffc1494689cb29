// bathy_core/src/slam/graph.rs

use crate::error::{ConfigError, GraphError};
use crate::noise::GaussianNoiseModel;
use crate::slam::factors::{BearingRange, Factor};
use crate::slam::solver::{IncrementalSolver, SchurSolver, SolverConfig, SolverReport};
use crate::slam::values::Values;
use crate::types::{Landmark, LandmarkId};
use log::{debug, info, warn};
use nalgebra::{DMatrix, Isometry3, Point3};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// `[x, y, z, roll, pitch, yaw]` standard deviations of the origin prior.
    pub prior_sigmas: [f64; 6],
    /// Standard deviations of the submap-to-submap odometry.
    pub odometry_sigmas: [f64; 6],
    /// `[bearing, bearing, range]` standard deviations.
    pub bearing_range_sigmas: [f64; 3],
    pub solver: SolverConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            prior_sigmas: [0.01, 0.01, 0.01, 0.001, 0.001, 0.001],
            odometry_sigmas: [0.1, 0.1, 0.1, 0.01, 0.01, PI / 100.0],
            bearing_range_sigmas: [0.01, 0.03, 0.05],
            solver: SolverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// No prior yet, every factor is rejected.
    Uninitialized,
    Active,
}

/// A landmark seen again after at least one submap without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopClosure {
    pub landmark: LandmarkId,
    /// Pose node that re-observed the landmark.
    pub pose_index: usize,
    /// Pose node that saw it before.
    pub last_seen_pose: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitReport {
    pub solver: SolverReport,
    /// Factors folded in by this commit.
    pub factors: usize,
    /// Initial values folded in by this commit.
    pub values: usize,
}

/// Submap pose chain plus landmarks, staged and committed in batches.
///
/// Factors are staged by `add_*` and only reach the solver on `commit`.
/// A failed commit keeps the staging area as it was.
pub struct FactorGraph {
    prior_noise: GaussianNoiseModel,
    odometry_noise: GaussianNoiseModel,
    bearing_range_noise: GaussianNoiseModel,
    solver: Box<dyn IncrementalSolver>,

    staged_factors: Vec<Factor>,
    staged_values: Values,

    /// Length of the chain including staged nodes.
    pose_count: usize,
    /// Pose node each landmark was last observed from.
    last_seen: HashMap<LandmarkId, usize>,
    /// Landmark ids of the most recent `add_landmarks_factor` call.
    previous_landmarks: HashSet<LandmarkId>,
    loop_closures: Vec<LoopClosure>,
}

impl FactorGraph {
    pub fn new(config: &GraphConfig) -> Result<Self, ConfigError> {
        Self::with_solver(config, Box::new(SchurSolver::new(config.solver.clone())))
    }

    pub fn with_solver(
        config: &GraphConfig,
        solver: Box<dyn IncrementalSolver>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            prior_noise: GaussianNoiseModel::from_sigmas("prior_sigmas", &config.prior_sigmas)?,
            odometry_noise: GaussianNoiseModel::from_sigmas(
                "odometry_sigmas",
                &config.odometry_sigmas,
            )?,
            bearing_range_noise: GaussianNoiseModel::from_sigmas(
                "bearing_range_sigmas",
                &config.bearing_range_sigmas,
            )?,
            solver,
            staged_factors: Vec::new(),
            staged_values: Values::new(),
            pose_count: 0,
            last_seen: HashMap::new(),
            previous_landmarks: HashSet::new(),
            loop_closures: Vec::new(),
        })
    }

    /// Replaces the default noise models with full covariances.
    pub fn set_odometry_covariance(&mut self, covariance: DMatrix<f64>) -> Result<(), ConfigError> {
        if covariance.nrows() != 6 {
            return Err(ConfigError::WrongDimension {
                name: "odometry_covariance",
                expected: 6,
                actual: covariance.nrows(),
            });
        }
        self.odometry_noise = GaussianNoiseModel::from_covariance("odometry_covariance", covariance)?;
        Ok(())
    }

    pub fn state(&self) -> GraphState {
        if self.pose_count == 0 {
            GraphState::Uninitialized
        } else {
            GraphState::Active
        }
    }

    // --- Staging ---

    /// Anchors `x_0` at `pose`.
    pub fn add_prior(&mut self, pose: Isometry3<f64>) -> Result<(), GraphError> {
        if self.pose_count > 0 {
            return Err(GraphError::AlreadyInitialized);
        }
        self.staged_factors.push(Factor::Prior {
            pose: 0,
            prior: pose,
            noise: self.prior_noise.clone(),
        });
        self.staged_values.insert_pose(0, pose);
        self.pose_count = 1;
        info!("Prior added at {:?}", pose.translation.vector.as_slice());
        Ok(())
    }

    /// Stages `x_step → x_step+1` with measurement `relative`, and
    /// `factor_pose` as the initial estimate of the new node.
    ///
    /// `x_step` must be the current tip of the chain. Returns `step + 1`.
    pub fn add_odom_factor(
        &mut self,
        factor_pose: Isometry3<f64>,
        relative: Isometry3<f64>,
        step: usize,
    ) -> Result<usize, GraphError> {
        self.require_pose(step)?;
        let tip = self.pose_count - 1;
        if step != tip {
            return Err(GraphError::NotChainTip { step, tip });
        }
        let next = step + 1;
        self.staged_factors.push(Factor::Between {
            from: step,
            to: next,
            measured: relative,
            noise: self.odometry_noise.clone(),
        });
        self.staged_values.insert_pose(next, factor_pose);
        self.pose_count += 1;
        debug!("Odometry factor x{} -> x{} staged", step, next);
        Ok(next)
    }

    /// Stages one bearing-range factor from `x_step+1` to every landmark.
    ///
    /// `landmarks` are in the map frame and `pose` is the submap pose they
    /// were measured from. New ids get an initial estimate; ids seen before
    /// are re-observations, and those missing from the previous call's set
    /// are returned as loop closures.
    pub fn add_landmarks_factor(
        &mut self,
        landmarks: &[Landmark],
        step: usize,
        pose: &Isometry3<f64>,
    ) -> Result<Vec<LoopClosure>, GraphError> {
        let node = step + 1;
        self.require_pose(node)?;
        let node_estimate = self.pose_estimate(node).unwrap_or(*pose);

        let mut closures = Vec::new();
        let mut current = HashSet::with_capacity(landmarks.len());
        for landmark in landmarks {
            let measured = BearingRange::from_point(pose, &landmark.position);
            self.staged_factors.push(Factor::BearingRange {
                pose: node,
                landmark: landmark.id,
                measured,
                noise: self.bearing_range_noise.clone(),
            });

            let repeated = !current.insert(landmark.id);
            match self.last_seen.get(&landmark.id).copied() {
                None if !repeated => {
                    // Place it where this node, as currently estimated, sees it.
                    let local = pose.inverse_transform_point(&landmark.position);
                    self.staged_values
                        .insert_landmark(landmark.id, node_estimate * local);
                }
                Some(last_seen_pose)
                    if !repeated && !self.previous_landmarks.contains(&landmark.id) =>
                {
                    let closure = LoopClosure {
                        landmark: landmark.id,
                        pose_index: node,
                        last_seen_pose,
                    };
                    info!(
                        "Loop closure: {} re-observed from x{}, last seen from x{}",
                        landmark.id, node, last_seen_pose
                    );
                    closures.push(closure);
                }
                _ => {}
            }
            self.last_seen.insert(landmark.id, node);
        }

        self.previous_landmarks = current;
        self.loop_closures.extend_from_slice(&closures);
        Ok(closures)
    }

    // --- Solving ---

    /// Folds the staging area into the solver. `Ok(None)` when nothing is staged.
    pub fn commit(&mut self) -> Result<Option<CommitReport>, GraphError> {
        if self.staged_factors.is_empty() && self.staged_values.is_empty() {
            return Ok(None);
        }
        let factors = self.staged_factors.len();
        let values = self.staged_values.len();
        match self
            .solver
            .update(self.staged_factors.clone(), self.staged_values.clone())
        {
            Ok(solver) => {
                self.staged_factors.clear();
                self.staged_values.clear();
                info!(
                    "Graph committed: {} factors, {} values, cost {:.4e} -> {:.4e} in {} iterations",
                    factors, values, solver.initial_cost, solver.final_cost, solver.iterations
                );
                Ok(Some(CommitReport {
                    solver,
                    factors,
                    values,
                }))
            }
            Err(err) => {
                warn!("Commit failed, {} factors stay staged: {}", factors, err);
                Err(err)
            }
        }
    }

    // --- Queries ---

    /// Committed estimate of `x_index`.
    pub fn pose(&self, index: usize) -> Option<Isometry3<f64>> {
        self.solver.estimate().pose(index).copied()
    }

    /// Committed estimate, falling back to the staged initial value.
    pub fn pose_estimate(&self, index: usize) -> Option<Isometry3<f64>> {
        self.pose(index)
            .or_else(|| self.staged_values.pose(index).copied())
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<Point3<f64>> {
        self.solver.estimate().landmark(id).copied()
    }

    /// All committed landmark estimates.
    pub fn landmarks(&self) -> Vec<Landmark> {
        self.solver
            .estimate()
            .landmarks()
            .map(|(id, position)| Landmark {
                id,
                position: *position,
            })
            .collect()
    }

    pub fn estimate(&self) -> &Values {
        self.solver.estimate()
    }

    /// Chain length including staged nodes.
    pub fn pose_count(&self) -> usize {
        self.pose_count
    }

    /// Index of the newest node in the chain.
    pub fn tip(&self) -> Option<usize> {
        self.pose_count.checked_sub(1)
    }

    pub fn staged_factor_count(&self) -> usize {
        self.staged_factors.len()
    }

    pub fn has_staged(&self) -> bool {
        !self.staged_factors.is_empty() || !self.staged_values.is_empty()
    }

    pub fn committed_factor_count(&self) -> usize {
        self.solver.factor_count()
    }

    pub fn loop_closures(&self) -> &[LoopClosure] {
        &self.loop_closures
    }

    fn require_pose(&self, index: usize) -> Result<(), GraphError> {
        if self.pose_count == 0 {
            return Err(GraphError::NotInitialized);
        }
        if index >= self.pose_count {
            return Err(GraphError::UnknownPose(index));
        }
        Ok(())
    }
}
