use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;
use energy_probes::{ContinuousSettings, ExperimentSettings, Registry, Workload};

/// Measures the energy consumed by a command, like `perf stat` does for performance counters.
#[derive(Parser, Debug)]
#[command(author, version)]
pub struct Cli {
    /// List the available counters and aliases, then exit.
    #[arg(short, long)]
    pub list: bool,

    /// Print the power of every counter (mW) to stdout at each interval, instead of the energy at the end.
    #[arg(short, long)]
    pub continuous: bool,

    /// Report the energy-delayed product (mJs) instead of the energy (mJ).
    #[arg(short = 'p', long)]
    pub edp: bool,

    /// The counters to sample, as `source:counter` or alias. All of them by default.
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub counters: Vec<String>,

    /// How many times to run the command.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub runs: u32,

    /// Pause between two runs, in milliseconds.
    #[arg(short, long, default_value_t = 0)]
    pub delay: u64,

    /// Sampling interval, in milliseconds.
    #[arg(short, long, default_value_t = 50, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Start sampling this many milliseconds before the command.
    /// Negative values delay the sampling after the command is started.
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub before: i64,

    /// Keep sampling this many milliseconds after the command exits.
    #[arg(short, long, default_value_t = 0)]
    pub after: u64,

    /// Sample until interrupted, without running any command (continuous mode only).
    #[arg(short, long, requires = "continuous")]
    pub no_workload: bool,

    /// Write the measurements to this file instead of stderr (stdout in continuous mode).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Run the command as this user id.
    #[arg(short = 'U', long)]
    pub uid: Option<u32>,

    /// Print the name of the counters before the measurements (continuous mode).
    #[arg(long)]
    pub header: bool,

    /// Prefix each line with the current time (continuous mode).
    #[arg(long)]
    pub timestamp: bool,

    /// The command to measure, and its arguments.
    #[arg(trailing_var_arg = true)]
    pub workload: Vec<String>,
}

/// Where the measurements are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    File(PathBuf),
    Stdout,
    Stderr,
}

impl Cli {
    /// The continuous lines go to stdout, so that they can be piped; the summary goes to stderr.
    pub fn destination(&self) -> Destination {
        match &self.output {
            Some(path) => Destination::File(path.clone()),
            None if self.continuous => Destination::Stdout,
            None => Destination::Stderr,
        }
    }

    /// Checks the arguments against the counters of this machine.
    pub fn settings(&self, registry: &Registry) -> anyhow::Result<ExperimentSettings> {
        let workload = match (self.workload.split_first(), self.no_workload) {
            (Some(_), true) => bail!("a command was given with --no-workload"),
            (None, true) => None,
            (None, false) => bail!("no command to measure"),
            (Some((program, args)), false) => Some(Workload {
                program: program.clone(),
                args: args.to_vec(),
                uid: self.uid,
            }),
        };

        let counters = if self.counters.is_empty() {
            registry.available_counters()
        } else {
            self.counters.clone()
        };
        if counters.is_empty() {
            return Err(anyhow!("no energy counter available on this machine"));
        }

        let continuous = self.continuous.then_some(ContinuousSettings {
            header: self.header,
            timestamp: self.timestamp,
        });

        Ok(ExperimentSettings {
            interval: Duration::from_millis(self.interval),
            before_ms: self.before,
            after: Duration::from_millis(self.after),
            delay: Duration::from_millis(self.delay),
            runs: self.runs,
            counters,
            energy_delayed_product: self.edp,
            continuous,
            workload,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use energy_probes::sources::dummy::DummySource;
    use energy_probes::Registry;

    use super::{Cli, Destination};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_source(DummySource::new("dummy", 1.0).with_counters(&["a", "b"]));
        registry.setup();
        registry
    }

    #[test]
    fn full_command_line() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "energy_stat", "-e", "CPU,dummy:a", "-r", "3", "-i", "10", "-b", "-20", "-a", "5", "-p", "-U", "1000",
            "stress", "-c", "4",
        ])?;
        let settings = cli.settings(&registry())?;
        assert_eq!(settings.counters, vec!["CPU", "dummy:a"]);
        assert_eq!(settings.runs, 3);
        assert_eq!(settings.interval, Duration::from_millis(10));
        assert_eq!(settings.before_ms, -20);
        assert_eq!(settings.after, Duration::from_millis(5));
        assert!(settings.energy_delayed_product);
        assert!(settings.continuous.is_none());

        let workload = settings.workload.unwrap();
        assert_eq!(workload.program, "stress");
        assert_eq!(workload.args, vec!["-c", "4"]);
        assert_eq!(workload.uid, Some(1000));
        Ok(())
    }

    #[test]
    fn all_counters_by_default() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["energy_stat", "sleep", "1"])?;
        let settings = cli.settings(&registry())?;
        assert_eq!(settings.counters, vec!["dummy:a", "dummy:b"]);
        assert_eq!(settings.interval, Duration::from_millis(50));

        assert!(cli.settings(&Registry::new()).is_err());
        Ok(())
    }

    #[test]
    fn workload_is_required_unless_no_workload() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["energy_stat", "-e", "dummy:a"])?;
        assert!(cli.settings(&registry()).is_err());

        let cli = Cli::try_parse_from(["energy_stat", "-c", "-n", "--header", "--timestamp"])?;
        let settings = cli.settings(&registry())?;
        assert!(settings.workload.is_none());
        let continuous = settings.continuous.unwrap();
        assert!(continuous.header && continuous.timestamp);

        let cli = Cli::try_parse_from(["energy_stat", "-c", "-n", "sleep", "1"])?;
        assert!(cli.settings(&registry()).is_err());
        Ok(())
    }

    #[test]
    fn continuous_lines_go_to_stdout() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["energy_stat", "-c", "sleep", "1"])?;
        assert_eq!(cli.destination(), Destination::Stdout);

        let cli = Cli::try_parse_from(["energy_stat", "sleep", "1"])?;
        assert_eq!(cli.destination(), Destination::Stderr);

        let cli = Cli::try_parse_from(["energy_stat", "-c", "-o", "power.csv", "sleep", "1"])?;
        assert_eq!(cli.destination(), Destination::File("power.csv".into()));
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["energy_stat", "-n", "sleep"]).is_err());
        assert!(Cli::try_parse_from(["energy_stat", "-r", "0", "sleep"]).is_err());
        assert!(Cli::try_parse_from(["energy_stat", "-i", "0", "sleep"]).is_err());
        assert!(Cli::try_parse_from(["energy_stat", "-a", "-5", "sleep"]).is_err());
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
