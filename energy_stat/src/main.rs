use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::Context;
use clap::Parser;
use log::info;

use cli::{Cli, Destination};
use energy_probes::{Experiment, Registry};

mod cli;

fn main() -> anyhow::Result<()> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("warn");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    // discover the counters of this machine
    let mut registry = Registry::with_default_sources();
    registry.setup();

    if cli.list {
        return list_counters(&registry);
    }

    let settings = cli.settings(&registry)?;
    info!("measuring {:?} every {:?}", settings.counters, settings.interval);

    let output: Box<dyn Write + Send> = match cli.destination() {
        Destination::File(path) => {
            let file = File::create(&path).with_context(|| format!("Cannot create output file {path:?}"))?;
            Box::new(BufWriter::new(file))
        }
        Destination::Stdout => Box::new(io::stdout()),
        Destination::Stderr => Box::new(io::stderr()),
    };

    let mut experiment = Experiment::new(&registry, settings, output);
    experiment.run()?;
    experiment.print_result()?;
    Ok(())
}

fn list_counters(registry: &Registry) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "Available counters:")?;
    for counter in registry.available_counters() {
        writeln!(out, "\t{counter}")?;
    }
    writeln!(out, "Available aliases:")?;
    for (alias, target) in registry.available_aliases() {
        writeln!(out, "\t{alias:<8} -> {target}")?;
    }
    Ok(())
}
