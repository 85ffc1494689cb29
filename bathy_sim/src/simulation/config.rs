// bathy_sim/src/simulation/config.rs

use anyhow::{ensure, Context};
use bathy_core::slam::SlamConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use nalgebra::{Isometry3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::simulation::utils::serde_helpers;

/// Prefix of environment variables that override scenario values, with `__`
/// separating nested keys (`BATHY_SIMULATION__SEED=3`).
pub const ENV_PREFIX: &str = "BATHY_";

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # ScenarioConfig
/// The root of the data parsed from a `scenario.toml` file. Every section is
/// optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub simulation: Simulation,
    #[serde(default)]
    pub seabed: SeabedConfig,
    #[serde(default)]
    pub survey: SurveyConfig,
    #[serde(default)]
    pub sonar: SonarConfig,
    #[serde(default)]
    pub odometry: OdometryNoiseConfig,
    #[serde(default)]
    pub slam: SlamConfig,
}

impl ScenarioConfig {
    /// Loads a scenario file, applies environment overrides and validates it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load scenario {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a scenario from TOML text, without environment overrides.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::string(text))
            .extract()
            .context("failed to parse scenario")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let sim = &self.simulation;
        ensure!(sim.ping_rate > 0.0, "simulation.ping_rate must be positive");
        ensure!(sim.duration_seconds > 0.0, "simulation.duration_seconds must be positive");
        ensure!(sim.broadcast_period > 0.0, "simulation.broadcast_period must be positive");

        let [x_min, x_max, y_min, y_max] = self.seabed.area;
        ensure!(x_min < x_max && y_min < y_max, "seabed.area must be [x_min, x_max, y_min, y_max]");
        ensure!(self.seabed.bump_radius > 0.0, "seabed.bump_radius must be positive");

        ensure!(self.survey.lines > 0, "survey.lines must be at least 1");
        ensure!(self.survey.speed > 0.0, "survey.speed must be positive");
        ensure!(self.survey.line_length > 0.0, "survey.line_length must be positive");
        ensure!(self.survey.line_spacing > 0.0, "survey.line_spacing must be positive");

        ensure!(self.sonar.beams >= 2, "sonar.beams must be at least 2");
        ensure!(
            self.sonar.aperture_deg > 0.0 && self.sonar.aperture_deg < 180.0,
            "sonar.aperture_deg must lie in (0, 180)"
        );
        ensure!(self.sonar.max_range > 0.0, "sonar.max_range must be positive");
        ensure!(self.sonar.range_noise >= 0.0, "sonar.range_noise must not be negative");
        ensure!(
            self.odometry
                .linear_std
                .iter()
                .chain(&self.odometry.angular_std)
                .all(|s| s.is_finite() && *s >= 0.0),
            "odometry noise must be finite and non-negative"
        );
        Ok(())
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// These map directly to the sections in the scenario file.
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Simulation {
    /// Optional seed for the pseudo-random number generator for determinism.
    pub seed: Option<u64>,
    /// Synchronized odometry + sonar pairs per second.
    pub ping_rate: f64,
    /// Upper bound on simulated time; the survey may end earlier.
    pub duration_seconds: f64,
    /// Period of the pose broadcast (s).
    pub broadcast_period: f64,
    /// Pace pings at `ping_rate` in wall-clock time instead of as fast as possible.
    pub realtime: bool,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            seed: None,
            ping_rate: 2.0,
            duration_seconds: 900.0,
            broadcast_period: 1.0,
            realtime: false,
        }
    }
}

/// Synthetic terrain: a flat floor with ripples and randomly placed mounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeabedConfig {
    /// Depth of the flat floor below `z = 0` (m).
    pub depth: f64,
    /// `[x_min, x_max, y_min, y_max]` over which mounds are scattered.
    pub area: [f64; 4],
    pub bump_count: usize,
    pub bump_height: f64,
    pub bump_radius: f64,
    pub ripple_amplitude: f64,
    pub ripple_wavelength: f64,
}

impl Default for SeabedConfig {
    fn default() -> Self {
        Self {
            depth: 40.0,
            area: [-40.0, 240.0, -60.0, 180.0],
            bump_count: 40,
            bump_height: 5.0,
            bump_radius: 8.0,
            ripple_amplitude: 0.3,
            ripple_wavelength: 50.0,
        }
    }
}

/// Lawnmower pattern: parallel lines joined by half-circle turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SurveyConfig {
    pub start: PoseConfig,
    pub lines: usize,
    pub line_length: f64,
    pub line_spacing: f64,
    /// Forward speed (m/s).
    pub speed: f64,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            start: PoseConfig {
                translation: Vector3::new(0.0, 0.0, -10.0),
                rotation: Rotation3::identity(),
            },
            lines: 4,
            line_length: 200.0,
            line_spacing: 40.0,
            speed: 2.0,
        }
    }
}

/// Multibeam geometry. Beams fan across-track in the sensor's y-z plane,
/// pointing down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SonarConfig {
    pub beams: usize,
    pub aperture_deg: f64,
    pub max_range: f64,
    /// Standard deviation of the range noise (m).
    pub range_noise: f64,
    /// `T_base_mbes`.
    pub mount: PoseConfig,
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            beams: 64,
            aperture_deg: 120.0,
            max_range: 100.0,
            range_noise: 0.05,
            mount: PoseConfig {
                translation: Vector3::new(0.0, 0.0, -0.5),
                rotation: Rotation3::identity(),
            },
        }
    }
}

/// Noise added to the commanded twist before it reaches the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OdometryNoiseConfig {
    /// Per-axis standard deviation of the body-frame velocity (m/s).
    pub linear_std: [f64; 3],
    /// Per-axis standard deviation of the angular rate (rad/s).
    pub angular_std: [f64; 3],
}

impl Default for OdometryNoiseConfig {
    fn default() -> Self {
        Self {
            linear_std: [0.05, 0.05, 0.0],
            angular_std: [0.0, 0.0, 0.002],
        }
    }
}

// =========================================================================
// == Helper Structs for Nested Configuration ==
// =========================================================================

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct PoseConfig {
    #[serde(with = "serde_helpers::vec3_from_array")]
    pub translation: Vector3<f64>,
    /// `[roll, pitch, yaw]` in degrees.
    #[serde(with = "serde_helpers::rotation_from_rpy_deg")]
    pub rotation: Rotation3<f64>,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: Rotation3::identity(),
        }
    }
}

impl PoseConfig {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&self.rotation),
        )
    }
}
