// bathy_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Bathymetric SLAM over a simulated multibeam survey.
///
/// Runs a scripted survey over a synthetic seabed through the particle
/// filter and the submap graph, and reports how far the estimate drifted
/// compared to dead reckoning.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(
        short,
        long,
        default_value = "assets/scenarios/lawnmower_survey.toml"
    )]
    pub scenario: PathBuf,

    /// Overrides `simulation.seed`.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Pace pings in wall-clock time.
    #[arg(long, default_value_t = false)]
    pub realtime: bool,

    /// Print the resolved scenario as TOML and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}
