//! # BeeAL CLI
//!
//! Command-line interface for the honeybee antennal lobe simulator.

use anyhow::Context;
use beeal_core::ExecMode;
use beeal_model::Topology;
use beeal_sim::{write_diagnostics, write_spike_log, RunConfig, Simulation};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "beeal")]
#[command(version = "0.1.0")]
#[command(about = "Honeybee antennal lobe spiking-network simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    ///
    /// Reads `<basename>.in` (parameter overrides) and `<basename>.protocol`
    /// (stimulus script) from the run directory; writes `<basename>.st`
    /// (spike log), `<basename>.out` (diagnostic trace) and
    /// `<basename>.json` (effective configuration) next to them.
    Run {
        /// Run directory
        dir: PathBuf,
        /// Base name of the input and output files
        basename: String,
        /// Integrate populations with the parallel backend
        #[arg(short, long)]
        parallel: bool,
    },

    /// Print the standard model layout
    Info,
}

fn run(dir: PathBuf, basename: String, parallel: bool) -> anyhow::Result<()> {
    let mut config = RunConfig::default();
    let param_file = dir.join(format!("{}.in", basename));
    config
        .apply_override_file(&param_file)
        .with_context(|| format!("reading parameter table {}", param_file.display()))?;
    if parallel {
        config.sim.exec_mode = ExecMode::Parallel;
    }

    println!(
        "{} {} glomeruli, {} odors, seed {}",
        "Building antennal lobe:".green().bold(),
        config.model.topology.n_glo,
        config.n_odor,
        config.sim.seed
    );

    let protocol_file = dir.join(format!("{}.protocol", basename));
    let mut sim = Simulation::from_config(&config, &protocol_file)
        .with_context(|| format!("assembling run from {}", protocol_file.display()))?;

    println!(
        "{} {} protocol items",
        "Running:".green().bold(),
        sim.protocol.items.len()
    );
    sim.run().context("simulation run failed")?;
    println!(
        "  finished at t = {} ms ({} steps, {} spikes)",
        sim.t(),
        sim.step_count(),
        sim.spikes.len()
    );

    let spike_file = dir.join(format!("{}.st", basename));
    write_spike_log(&sim.spikes, BufWriter::new(File::create(&spike_file)?))?;
    let diag_file = dir.join(format!("{}.out", basename));
    write_diagnostics(&sim.diagnostics, BufWriter::new(File::create(&diag_file)?))?;
    let config_file = dir.join(format!("{}.json", basename));
    std::fs::write(&config_file, config.to_json()?)?;

    println!("{}", "Wrote:".green().bold());
    println!("  {}", spike_file.display());
    println!("  {}", diag_file.display());
    println!("  {}", config_file.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dir,
            basename,
            parallel,
        } => run(dir, basename, parallel)?,

        Commands::Info => {
            let topo = Topology::standard();
            println!("{}", "Standard antennal lobe layout:".green().bold());
            println!();
            println!(
                "  {} glomeruli x ({} ORN, {} PN, {} hLN), {} LHI",
                topo.n_glo, topo.n_orn, topo.n_pn, topo.n_hln, topo.n_lhi
            );
            println!(
                "  {} units total, global index order {} < {} < {} < {}",
                topo.n_total(),
                "ORN".cyan(),
                "PN".cyan(),
                "hLN".cyan(),
                "LHI".cyan()
            );
            println!(
                "  spike index ranges: ORN 0..{}, PN {}..{}, hLN {}..{}, LHI {}..{}",
                topo.pn_offset(),
                topo.pn_offset(),
                topo.hln_offset(),
                topo.hln_offset(),
                topo.lhi_offset(),
                topo.lhi_offset(),
                topo.n_total()
            );
        }
    }

    Ok(())
}
