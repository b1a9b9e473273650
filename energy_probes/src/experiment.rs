use std::io::Write;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::registry::Registry;
use crate::sampler::{Sampler, SharedOutput, TickMode};
use crate::stats::{mean_and_stddev_percent, Spread};
use crate::ProbeError;

/// The program to measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub program: String,
    pub args: Vec<String>,
    /// Run the program as this user.
    pub uid: Option<u32>,
}

impl Workload {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Workload {
        Workload {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            uid: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        #[cfg(unix)]
        if let Some(uid) = self.uid {
            use std::os::unix::process::CommandExt;
            cmd.uid(uid);
        }
        cmd
    }

    /// The command line, for display purposes.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program).chain(&self.args).cloned().collect::<Vec<_>>().join(" ")
    }
}

/// Options of the continuous printing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuousSettings {
    /// Print the counter names before each run.
    pub header: bool,
    /// Prefix each line with a timestamp.
    pub timestamp: bool,
}

#[derive(Debug, Clone)]
pub struct ExperimentSettings {
    /// Sampling interval.
    pub interval: Duration,
    /// Start sampling this many milliseconds before the workload.
    /// A negative value delays the start of the sampling after the workload is launched.
    pub before_ms: i64,
    /// Keep sampling for this long after the workload exited.
    pub after: Duration,
    /// Pause between two runs.
    pub delay: Duration,
    pub runs: u32,
    /// Counter names or aliases.
    pub counters: Vec<String>,
    /// Report the energy-delayed product instead of the energy.
    pub energy_delayed_product: bool,
    /// Print the power continuously instead of computing the energy.
    pub continuous: Option<ContinuousSettings>,
    /// `None` is only valid in continuous mode: then the sampling never stops.
    pub workload: Option<Workload>,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        ExperimentSettings {
            interval: Duration::from_millis(50),
            before_ms: 0,
            after: Duration::ZERO,
            delay: Duration::ZERO,
            runs: 1,
            counters: Vec::new(),
            energy_delayed_product: false,
            continuous: None,
            workload: None,
        }
    }
}

impl ExperimentSettings {
    /// How long the sampling runs before the workload is launched.
    fn lead_time(&self) -> Duration {
        Duration::from_millis(self.before_ms.max(0) as u64)
    }

    /// How long to wait after the launch of the workload before sampling.
    fn start_delay(&self) -> Duration {
        Duration::from_millis((-self.before_ms).max(0) as u64)
    }

    /// The unit of the values returned by [`Experiment::calc_result`].
    pub fn unit(&self) -> &'static str {
        if self.energy_delayed_product {
            "mJs"
        } else {
            "mJ"
        }
    }
}

/// The outcome of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Energy consumed according to each counter, in Joules, in the order of the settings.
    pub energies: Vec<f64>,
    /// How long the workload ran.
    pub workload_wall_time: Duration,
}

/// The statistics of one counter across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSummary {
    pub name: String,
    pub value: Spread,
    pub unit: &'static str,
}

/// The statistics of a whole experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub counters: Vec<CounterSummary>,
    /// In seconds.
    pub wall_time: Spread,
    pub runs: usize,
}

/// Runs a workload several times while sampling energy counters.
pub struct Experiment<'r> {
    registry: &'r Registry,
    settings: ExperimentSettings,
    output: SharedOutput,
    results: Vec<RunResult>,
}

impl<'r> Experiment<'r> {
    pub fn new(registry: &'r Registry, settings: ExperimentSettings, output: Box<dyn Write + Send>) -> Experiment<'r> {
        Experiment {
            registry,
            settings,
            output: Arc::new(Mutex::new(output)),
            results: Vec::new(),
        }
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    /// The results of the runs performed so far.
    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    /// Performs all the runs, pausing between them.
    pub fn run(&mut self) -> Result<(), ProbeError> {
        self.results.clear();
        self.results.reserve(self.settings.runs as usize);

        for i in 0..self.settings.runs {
            if self.settings.continuous.is_some() && self.settings.runs > 1 {
                self.write_line(&format!("### Run {i}"))?;
            }
            let result = self.run_single()?;
            info!(
                "run {i}: {:?} in {:.3}s",
                result.energies,
                result.workload_wall_time.as_secs_f64()
            );
            self.results.push(result);
            thread::sleep(self.settings.delay);
        }
        Ok(())
    }

    /// Performs one run: samples the counters while the workload executes.
    pub fn run_single(&self) -> Result<RunResult, ProbeError> {
        let settings = &self.settings;
        if settings.workload.is_none() && settings.continuous.is_none() {
            return Err(ProbeError::MissingWorkload);
        }

        let mode = match settings.continuous {
            Some(continuous) => TickMode::ContinuousPrint {
                output: self.output.clone(),
                timestamp: continuous.timestamp,
            },
            None => TickMode::Accumulate,
        };
        let sampler = Sampler::new(self.registry, settings.interval, &settings.counters, mode)?;
        if settings.continuous.is_some_and(|c| c.header) {
            self.write_line(&sampler.counter_names().join(","))?;
        }

        let lead_time = settings.lead_time();
        if !lead_time.is_zero() {
            sampler.start(Duration::ZERO);
            thread::sleep(lead_time);
        }

        let start_time = Instant::now();
        let Some(workload) = &settings.workload else {
            // nothing to wait for: sample until the process is interrupted or a tick fails
            sampler.start(settings.start_delay());
            let energies = sampler.wait()?;
            return Ok(RunResult {
                energies,
                workload_wall_time: start_time.elapsed(),
            });
        };

        let mut child = workload.command().spawn().map_err(|cause| ProbeError::WorkloadExec {
            program: workload.program.clone(),
            cause,
        })?;
        sampler.start(settings.start_delay());
        let status = child.wait().map_err(|cause| ProbeError::WorkloadExec {
            program: workload.program.clone(),
            cause,
        })?;
        if !status.success() {
            warn!("workload '{}' exited with {status}", workload.command_line());
        }
        let end_time = Instant::now();

        let energies = sampler.stop(settings.after)?;
        let workload_wall_time = end_time - start_time;
        debug!("workload ran for {workload_wall_time:?}");

        Ok(RunResult {
            energies,
            workload_wall_time,
        })
    }

    /// The reported value of a counter for one run: the energy in mJ,
    /// or the energy-delayed product in mJs.
    pub fn calc_result(&self, result: &RunResult, counter_index: usize) -> f64 {
        let millijoules = result.energies[counter_index] * 1000.0;
        if self.settings.energy_delayed_product {
            millijoules * result.workload_wall_time.as_secs_f64()
        } else {
            millijoules
        }
    }

    /// Mean and spread of every counter and of the wall time, across the runs.
    pub fn summary(&self) -> Summary {
        let counters = self
            .settings
            .counters
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let values: Vec<f64> = self.results.iter().map(|r| self.calc_result(r, i)).collect();
                CounterSummary {
                    name: name.clone(),
                    value: mean_and_stddev_percent(&values),
                    unit: self.settings.unit(),
                }
            })
            .collect();

        let wall_times: Vec<f64> = self
            .results
            .iter()
            .map(|r| r.workload_wall_time.as_secs_f64())
            .collect();

        Summary {
            counters,
            wall_time: mean_and_stddev_percent(&wall_times),
            runs: self.results.len(),
        }
    }

    /// Writes the summary to the output. Does nothing in continuous mode.
    pub fn print_result(&self) -> Result<(), ProbeError> {
        if self.settings.continuous.is_some() {
            return Ok(());
        }
        let mut out = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        write_report(&mut *out, &self.settings, &self.summary())?;
        out.flush()?;
        Ok(())
    }

    fn write_line(&self, line: &str) -> Result<(), ProbeError> {
        let mut out = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

/// Formats the summary as an aligned table.
pub fn write_report(out: &mut dyn Write, settings: &ExperimentSettings, summary: &Summary) -> std::io::Result<()> {
    let workload = settings.workload.as_ref().map(Workload::command_line).unwrap_or_default();
    writeln!(out, "Energy counter stats for '{workload}':")?;
    writeln!(
        out,
        "[interval: {}ms, before: {}ms, after: {}ms, delay: {}ms, runs: {}]",
        settings.interval.as_millis(),
        settings.before_ms,
        settings.after.as_millis(),
        settings.delay.as_millis(),
        summary.runs
    )?;
    writeln!(out)?;

    let lines: Vec<[String; 3]> = summary
        .counters
        .iter()
        .map(|c| {
            [
                format!("{:.2} {}", c.value.mean, c.unit),
                c.name.clone(),
                format!("{:.2}", c.value.stddev_percent),
            ]
        })
        .collect();

    let mut widths = [0; 3];
    for line in &lines {
        for (width, column) in widths.iter_mut().zip(line) {
            *width = (*width).max(column.len());
        }
    }

    for [value, name, spread] in &lines {
        write!(out, "\t{value:>w0$} {name:<w1$}", w0 = widths[0], w1 = widths[1])?;
        if summary.runs > 1 {
            write!(out, "\t( +- {spread:>w2$}% )", w2 = widths[2])?;
        }
        writeln!(out)?;
    }
    writeln!(out)?;

    write!(out, "\t{:.8} seconds time elapsed ", summary.wall_time.mean)?;
    if summary.runs > 1 {
        write!(out, "( +- {:.2}% )", summary.wall_time.stddev_percent)?;
    }
    writeln!(out)?;
    writeln!(out)?;
    Ok(())
}
