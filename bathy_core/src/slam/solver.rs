// bathy_core/src/slam/solver.rs

use crate::error::GraphError;
use crate::slam::factors::Factor;
use crate::slam::values::{retract_pose, Key, Values};
use crate::types::LandmarkId;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3, Point3, SMatrix, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

type Matrix6x3 = SMatrix<f64, 6, 3>;

const MAX_LAMBDA: f64 = 1e10;
const MIN_LAMBDA: f64 = 1e-12;
/// Keeps unconstrained directions of the damped system solvable.
const DIAGONAL_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// Relative cost decrease below which the solve has converged.
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            initial_lambda: 1e-4,
        }
    }
}

/// Summary of a single `update`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolverReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Folds new factors and initial values into a persistent estimate.
///
/// After every successful update the estimate must equal a batch nonlinear
/// least-squares solution over everything folded so far. A failed update
/// leaves the solver exactly as it was.
pub trait IncrementalSolver: Send {
    fn update(&mut self, factors: Vec<Factor>, values: Values) -> Result<SolverReport, GraphError>;

    fn estimate(&self) -> &Values;

    fn factor_count(&self) -> usize;
}

/// Levenberg-Marquardt over all accumulated factors, warm-started from the
/// previous estimate. Landmarks are eliminated through their 3x3 blocks so
/// the dense system only has pose dimensions.
#[derive(Debug, Clone, Default)]
pub struct SchurSolver {
    config: SolverConfig,
    factors: Vec<Factor>,
    estimate: Values,
}

/// Normal equations `H·δ = -g`, split into pose and landmark blocks.
struct NormalEquations {
    /// Dense pose-pose block and gradient, 6 rows per pose slot.
    h_pp: DMatrix<f64>,
    g_p: DVector<f64>,
    landmarks: BTreeMap<LandmarkId, LandmarkBlock>,
}

struct LandmarkBlock {
    h_ll: Matrix3<f64>,
    g_l: Vector3<f64>,
    /// Cross terms `H_pl` keyed by pose slot.
    h_pl: BTreeMap<usize, Matrix6x3>,
}

impl SchurSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            factors: Vec::new(),
            estimate: Values::new(),
        }
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Runs LM on `factors` starting from `values`, returning the optimum.
    pub fn optimize(
        &self,
        factors: &[Factor],
        mut values: Values,
    ) -> Result<(Values, SolverReport), GraphError> {
        for factor in factors {
            for key in factor.keys() {
                if !values.contains(key) {
                    return Err(GraphError::SolverFailed(format!(
                        "factor references {} which has no estimate",
                        key
                    )));
                }
            }
        }

        let slots: BTreeMap<usize, usize> = values
            .poses()
            .enumerate()
            .map(|(slot, (index, _))| (index, slot))
            .collect();

        let initial_cost = total_cost(factors, &values)?;
        let mut report = SolverReport {
            initial_cost,
            final_cost: initial_cost,
            ..Default::default()
        };
        if initial_cost <= f64::EPSILON {
            report.converged = true;
            return Ok((values, report));
        }

        let mut cost = initial_cost;
        let mut lambda = self.config.initial_lambda;
        let mut solved_once = false;

        while report.iterations < self.config.max_iterations {
            report.iterations += 1;
            let system = build_normal_equations(factors, &values, &slots)?;

            // Inner loop: raise the damping until a step decreases the cost.
            let mut accepted = false;
            while lambda <= MAX_LAMBDA {
                let Some((delta_p, delta_l)) = solve_damped(&system, lambda) else {
                    lambda *= 10.0;
                    continue;
                };
                solved_once = true;
                let candidate = apply_step(&values, &slots, &delta_p, &delta_l);
                let new_cost = total_cost(factors, &candidate)?;
                if new_cost.is_finite() && new_cost < cost {
                    let decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    values = candidate;
                    cost = new_cost;
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);
                    accepted = true;
                    if decrease < self.config.tolerance || cost <= f64::EPSILON {
                        report.converged = true;
                    }
                    break;
                }
                lambda *= 10.0;
            }

            if !accepted {
                if !solved_once {
                    return Err(GraphError::SolverFailed(
                        "linear system could not be factorized at any damping".to_string(),
                    ));
                }
                // No step improves the cost any more, so this is a minimum.
                debug!("LM stopped after {} iterations, damping exhausted", report.iterations);
                report.converged = true;
            }
            if report.converged {
                break;
            }
        }

        if !cost.is_finite() {
            return Err(GraphError::SolverFailed(format!("cost diverged to {}", cost)));
        }
        if !report.converged {
            warn!(
                "LM hit {} iterations without converging (cost {:.6e})",
                self.config.max_iterations, cost
            );
        }
        report.final_cost = cost;
        Ok((values, report))
    }
}

impl IncrementalSolver for SchurSolver {
    fn update(&mut self, factors: Vec<Factor>, values: Values) -> Result<SolverReport, GraphError> {
        let mut all_factors = self.factors.clone();
        all_factors.extend(factors);
        let mut initial = self.estimate.clone();
        initial.insert_missing(&values);

        let (estimate, report) = self.optimize(&all_factors, initial)?;
        self.factors = all_factors;
        self.estimate = estimate;
        Ok(report)
    }

    fn estimate(&self) -> &Values {
        &self.estimate
    }

    fn factor_count(&self) -> usize {
        self.factors.len()
    }
}

// --- Private Helper Functions ---

fn total_cost(factors: &[Factor], values: &Values) -> Result<f64, GraphError> {
    factors.iter().map(|f| f.cost(values)).sum()
}

fn build_normal_equations(
    factors: &[Factor],
    values: &Values,
    slots: &BTreeMap<usize, usize>,
) -> Result<NormalEquations, GraphError> {
    let n = slots.len() * 6;
    let mut system = NormalEquations {
        h_pp: DMatrix::zeros(n, n),
        g_p: DVector::zeros(n),
        landmarks: BTreeMap::new(),
    };

    for factor in factors {
        let linear = factor.linearize(values)?;
        let r = &linear.residual;
        for (a, key_a) in linear.keys.iter().enumerate() {
            let j_a = &linear.jacobians[a];
            match key_a {
                Key::Pose(i) => {
                    let sa = slots[i] * 6;
                    let g = j_a.transpose() * r;
                    let mut g_block = system.g_p.rows_mut(sa, 6);
                    g_block += g;
                }
                Key::Landmark(id) => {
                    let block = landmark_block(&mut system.landmarks, *id);
                    block.g_l += Vector3::from_iterator((j_a.transpose() * r).iter().copied());
                }
            }

            for (b, key_b) in linear.keys.iter().enumerate() {
                let h = j_a.transpose() * &linear.jacobians[b];
                match (key_a, key_b) {
                    (Key::Pose(i), Key::Pose(j)) => {
                        let (si, sj) = (slots[i] * 6, slots[j] * 6);
                        let mut h_block = system.h_pp.view_mut((si, sj), (6, 6));
                        h_block += h;
                    }
                    (Key::Landmark(id), Key::Landmark(other)) if id == other => {
                        let block = landmark_block(&mut system.landmarks, *id);
                        block.h_ll += Matrix3::from_iterator(h.iter().copied());
                    }
                    (Key::Pose(i), Key::Landmark(id)) => {
                        let block = landmark_block(&mut system.landmarks, *id);
                        let cross = block.h_pl.entry(slots[i]).or_insert_with(Matrix6x3::zeros);
                        *cross += Matrix6x3::from_iterator(h.iter().copied());
                    }
                    // The transpose of the pose-landmark term, or a coupling
                    // between two landmarks no factor type produces.
                    _ => {}
                }
            }
        }
    }
    Ok(system)
}

fn landmark_block(
    blocks: &mut BTreeMap<LandmarkId, LandmarkBlock>,
    id: LandmarkId,
) -> &mut LandmarkBlock {
    blocks.entry(id).or_insert_with(|| LandmarkBlock {
        h_ll: Matrix3::zeros(),
        g_l: Vector3::zeros(),
        h_pl: BTreeMap::new(),
    })
}

/// Solves the damped system through the Schur complement on the landmarks.
/// `None` when a block or the reduced system is not positive definite.
fn solve_damped(
    system: &NormalEquations,
    lambda: f64,
) -> Option<(DVector<f64>, HashMap<LandmarkId, Vector3<f64>>)> {
    let mut reduced = system.h_pp.clone();
    for i in 0..reduced.nrows() {
        reduced[(i, i)] += lambda * system.h_pp[(i, i)].max(DIAGONAL_FLOOR);
    }
    let mut rhs = -&system.g_p;

    let mut inverses = Vec::with_capacity(system.landmarks.len());
    for block in system.landmarks.values() {
        let mut h_ll = block.h_ll;
        for i in 0..3 {
            h_ll[(i, i)] += lambda * block.h_ll[(i, i)].max(DIAGONAL_FLOOR);
        }
        let h_ll_inv = h_ll.cholesky()?.inverse();

        for (&si, h_il) in &block.h_pl {
            let w = h_il * h_ll_inv;
            let mut rhs_block = rhs.rows_mut(si * 6, 6);
            rhs_block += w * block.g_l;
            for (&sj, h_jl) in &block.h_pl {
                let mut s_block = reduced.view_mut((si * 6, sj * 6), (6, 6));
                s_block -= w * h_jl.transpose();
            }
        }
        inverses.push(h_ll_inv);
    }

    let delta_p = reduced.cholesky()?.solve(&rhs);

    let delta_l = system
        .landmarks
        .iter()
        .zip(inverses)
        .map(|((id, block), h_ll_inv)| {
            let mut b = -block.g_l;
            for (&si, h_il) in &block.h_pl {
                let dp = Vector6::from_iterator(delta_p.rows(si * 6, 6).iter().copied());
                b -= h_il.transpose() * dp;
            }
            (*id, h_ll_inv * b)
        })
        .collect();

    Some((delta_p, delta_l))
}

fn apply_step(
    values: &Values,
    slots: &BTreeMap<usize, usize>,
    delta_p: &DVector<f64>,
    delta_l: &HashMap<LandmarkId, Vector3<f64>>,
) -> Values {
    let mut next = Values::new();
    for (index, pose) in values.poses() {
        let d = Vector6::from_iterator(delta_p.rows(slots[&index] * 6, 6).iter().copied());
        next.insert_pose(index, retract_pose(pose, &d));
    }
    for (id, position) in values.landmarks() {
        let d = delta_l.get(&id).copied().unwrap_or_else(Vector3::zeros);
        next.insert_landmark(id, Point3::from(position.coords + d));
    }
    next
}
