// bathy_core/src/slam/factors.rs

use crate::error::GraphError;
use crate::noise::GaussianNoiseModel;
use crate::slam::values::{local_pose, retract_pose, Key, Values};
use crate::types::LandmarkId;
use nalgebra::{DMatrix, DVector, Isometry3, Point3, Unit, Vector3, Vector6};

/// Central-difference step for numeric Jacobians.
const JACOBIAN_STEP: f64 = 1e-6;

/// Direction and distance to a landmark, in the pose's body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearingRange {
    pub bearing: Unit<Vector3<f64>>,
    pub range: f64,
}

impl BearingRange {
    /// Measures `point` (map frame) as seen from `pose`.
    pub fn from_point(pose: &Isometry3<f64>, point: &Point3<f64>) -> Self {
        let local = pose.inverse_transform_point(point).coords;
        let range = local.norm();
        let bearing = Unit::try_new(local, 1e-12).unwrap_or_else(Vector3::x_axis);
        Self { bearing, range }
    }

    /// Two unit vectors spanning the plane orthogonal to the bearing.
    fn tangent_basis(&self) -> (Vector3<f64>, Vector3<f64>) {
        let b = self.bearing.into_inner();
        let helper = if b.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let e1 = b.cross(&helper).normalize();
        let e2 = b.cross(&e1);
        (e1, e2)
    }
}

/// A measurement constraint between graph variables.
#[derive(Debug, Clone)]
pub enum Factor {
    /// Anchors a pose, error `local(prior, x)`.
    Prior {
        pose: usize,
        prior: Isometry3<f64>,
        noise: GaussianNoiseModel,
    },
    /// Relative motion, error `local(measured, x_from⁻¹ · x_to)`.
    Between {
        from: usize,
        to: usize,
        measured: Isometry3<f64>,
        noise: GaussianNoiseModel,
    },
    /// Bearing projected on the measured direction's tangent plane, plus range.
    BearingRange {
        pose: usize,
        landmark: LandmarkId,
        measured: BearingRange,
        noise: GaussianNoiseModel,
    },
}

/// The value a factor reads for one of its keys.
#[derive(Debug, Clone, Copy)]
enum Variable {
    Pose(Isometry3<f64>),
    Landmark(Point3<f64>),
}

impl Variable {
    fn dim(&self) -> usize {
        match self {
            Variable::Pose(_) => 6,
            Variable::Landmark(_) => 3,
        }
    }

    fn perturbed(&self, axis: usize, step: f64) -> Self {
        match self {
            Variable::Pose(x) => {
                let mut delta = Vector6::zeros();
                delta[axis] = step;
                Variable::Pose(retract_pose(x, &delta))
            }
            Variable::Landmark(p) => {
                let mut q = *p;
                q[axis] += step;
                Variable::Landmark(q)
            }
        }
    }

    fn pose(&self) -> Isometry3<f64> {
        match self {
            Variable::Pose(x) => *x,
            Variable::Landmark(_) => Isometry3::identity(),
        }
    }

    fn point(&self) -> Point3<f64> {
        match self {
            Variable::Landmark(p) => *p,
            Variable::Pose(x) => Point3::from(x.translation.vector),
        }
    }
}

/// Whitened linearization `‖J·δ + r‖²` of one factor.
#[derive(Debug, Clone)]
pub struct LinearizedFactor {
    pub keys: Vec<Key>,
    /// One block per key, rows = factor dimension.
    pub jacobians: Vec<DMatrix<f64>>,
    pub residual: DVector<f64>,
}

impl Factor {
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::Prior { pose, .. } => vec![Key::Pose(*pose)],
            Factor::Between { from, to, .. } => vec![Key::Pose(*from), Key::Pose(*to)],
            Factor::BearingRange { pose, landmark, .. } => {
                vec![Key::Pose(*pose), Key::Landmark(*landmark)]
            }
        }
    }

    pub fn noise(&self) -> &GaussianNoiseModel {
        match self {
            Factor::Prior { noise, .. }
            | Factor::Between { noise, .. }
            | Factor::BearingRange { noise, .. } => noise,
        }
    }

    pub fn dim(&self) -> usize {
        self.noise().dim()
    }

    /// Unwhitened error at `values`.
    pub fn error(&self, values: &Values) -> Result<DVector<f64>, GraphError> {
        Ok(self.evaluate(&self.fetch(values)?))
    }

    /// `½‖e‖²_Σ` at `values`.
    pub fn cost(&self, values: &Values) -> Result<f64, GraphError> {
        Ok(0.5 * self.noise().mahalanobis(&self.error(values)?))
    }

    /// Whitened residual and central-difference Jacobians at `values`.
    pub fn linearize(&self, values: &Values) -> Result<LinearizedFactor, GraphError> {
        let variables = self.fetch(values)?;
        let residual = self.evaluate(&variables);
        let rows = residual.len();

        let mut jacobians = Vec::with_capacity(variables.len());
        for (k, variable) in variables.iter().enumerate() {
            let mut jacobian = DMatrix::zeros(rows, variable.dim());
            for axis in 0..variable.dim() {
                let mut plus = variables.clone();
                let mut minus = variables.clone();
                plus[k] = variable.perturbed(axis, JACOBIAN_STEP);
                minus[k] = variable.perturbed(axis, -JACOBIAN_STEP);
                let column =
                    (self.evaluate(&plus) - self.evaluate(&minus)) / (2.0 * JACOBIAN_STEP);
                jacobian.set_column(axis, &column);
            }
            jacobians.push(self.noise().whiten_jacobian(&jacobian));
        }

        Ok(LinearizedFactor {
            keys: self.keys(),
            jacobians,
            residual: self.noise().whiten(&residual),
        })
    }

    fn fetch(&self, values: &Values) -> Result<Vec<Variable>, GraphError> {
        self.keys()
            .into_iter()
            .map(|key| match key {
                Key::Pose(i) => values
                    .pose(i)
                    .map(|x| Variable::Pose(*x))
                    .ok_or(GraphError::UnknownPose(i)),
                Key::Landmark(id) => values
                    .landmark(id)
                    .map(|p| Variable::Landmark(*p))
                    .ok_or(GraphError::UnknownLandmark(id)),
            })
            .collect()
    }

    fn evaluate(&self, variables: &[Variable]) -> DVector<f64> {
        match self {
            Factor::Prior { prior, .. } => {
                let e = local_pose(prior, &variables[0].pose());
                DVector::from_column_slice(e.as_slice())
            }
            Factor::Between { measured, .. } => {
                let relative = variables[0].pose().inverse() * variables[1].pose();
                let e = local_pose(measured, &relative);
                DVector::from_column_slice(e.as_slice())
            }
            Factor::BearingRange { measured, .. } => {
                let predicted = BearingRange::from_point(&variables[0].pose(), &variables[1].point());
                let (e1, e2) = measured.tangent_basis();
                let u = predicted.bearing.into_inner();
                DVector::from_vec(vec![
                    e1.dot(&u),
                    e2.dot(&u),
                    predicted.range - measured.range,
                ])
            }
        }
    }
}
