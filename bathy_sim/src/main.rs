// bathy_sim/src/main.rs

use anyhow::Context;
use bathy_sim::cli::Cli;
use bathy_sim::prelude::*;
use clap::Parser;
use log::info;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = ScenarioConfig::load(&cli.scenario)?;
    if let Some(seed) = cli.seed {
        config.simulation.seed = Some(seed);
    }
    config.simulation.realtime |= cli.realtime;

    if cli.print_config {
        let text = toml::to_string_pretty(&config).context("failed to render scenario")?;
        println!("{}", text);
        return Ok(());
    }

    info!("Running scenario {}", cli.scenario.display());
    let node = SimulationNode::spawn(config)?;
    let (summary, broadcasts) = node.join()?;
    info!("Survey finished after {} pose broadcasts", broadcasts);
    println!("{}", summary);
    Ok(())
}
