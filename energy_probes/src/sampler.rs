use std::fmt::Write as _;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use time::OffsetDateTime;

use crate::counter::Counter;
use crate::registry::Registry;
use crate::ProbeError;

/// Output shared between the sampler thread (continuous printing) and the experiment (summary).
pub type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

/// What the sampler does on each tick.
#[derive(Clone)]
pub enum TickMode {
    /// Record one reading of every counter, to compute the energy at the end.
    Accumulate,
    /// Print the power of every counter, in milliwatts, as one CSV line.
    ContinuousPrint {
        output: SharedOutput,
        /// Prefix each line with the current UNIX time, in seconds.
        timestamp: bool,
    },
}

/// Start/stop handshake between the control thread and the sampler thread.
struct Signal {
    startable: Mutex<bool>,
    start: Condvar,
    done: AtomicBool,
}

impl Signal {
    fn notify_start(&self) {
        *self.startable.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.start.notify_one();
    }

    fn wait_for_start(&self) {
        let guard = self.startable.lock().unwrap_or_else(PoisonError::into_inner);
        let _started = self
            .start
            .wait_while(guard, |startable| !*startable)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Periodically samples a set of counters on a dedicated thread.
///
/// The thread is spawned by [`Sampler::new`] and waits for [`Sampler::start`].
/// [`Sampler::stop`] joins it and returns the energy of every counter, in the
/// order of the names given to `new`.
pub struct Sampler {
    interval: Duration,
    names: Vec<String>,
    signal: Arc<Signal>,
    ticks: Arc<AtomicU64>,
    worker: Option<JoinHandle<Result<Vec<Counter>, ProbeError>>>,
}

impl Sampler {
    /// Opens every counter and spawns the sampler thread.
    ///
    /// Fails if any of the names cannot be opened, in which case nothing is sampled.
    pub fn new<S: AsRef<str>>(
        registry: &Registry,
        interval: Duration,
        counter_names: &[S],
        mode: TickMode,
    ) -> Result<Sampler, ProbeError> {
        let counters = counter_names
            .iter()
            .map(|name| registry.open_counter(name.as_ref()))
            .collect::<Result<Vec<Counter>, ProbeError>>()
            .inspect_err(|_| registry.forget_open_sources())?;
        registry.call_initialize_on_open_sources()?;

        let names = counters.iter().map(|c| c.name().to_owned()).collect();
        let signal = Arc::new(Signal {
            startable: Mutex::new(false),
            start: Condvar::new(),
            done: AtomicBool::new(false),
        });
        let ticks = Arc::new(AtomicU64::new(0));

        let worker = {
            let signal = signal.clone();
            let ticks = ticks.clone();
            thread::Builder::new()
                .name("sampler".to_owned())
                .spawn(move || run(counters, interval, mode, &signal, &ticks))?
        };

        Ok(Sampler {
            interval,
            names,
            signal,
            ticks,
            worker: Some(worker),
        })
    }

    /// The display names of the counters, in sampling order.
    pub fn counter_names(&self) -> &[String] {
        &self.names
    }

    /// How many ticks have been performed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Waits for `delay`, then lets the sampler thread begin ticking.
    pub fn start(&self, delay: Duration) {
        thread::sleep(delay);
        self.signal.notify_start();
    }

    /// Waits for `delay`, stops the sampler thread and returns the energy consumed
    /// according to each counter, in Joules.
    ///
    /// Can be called without [`Sampler::start`]: the thread is released before being joined.
    pub fn stop(mut self, delay: Duration) -> Result<Vec<f64>, ProbeError> {
        thread::sleep(delay);
        let counters = self.finish()?;
        debug!("sampler stopped after {} tick(s)", self.ticks());
        Ok(counters.iter().map(|c| c.accumulator(self.interval)).collect())
    }

    /// Blocks until the sampler thread ends by itself, which only happens when a tick fails.
    ///
    /// Returns the energies like [`Sampler::stop`] if the thread ever ends without an error.
    pub fn wait(mut self) -> Result<Vec<f64>, ProbeError> {
        let counters = match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| ProbeError::SamplerPanicked)??,
            None => Vec::new(),
        };
        Ok(counters.iter().map(|c| c.accumulator(self.interval)).collect())
    }

    fn finish(&mut self) -> Result<Vec<Counter>, ProbeError> {
        self.signal.done.store(true, Ordering::Release);
        // release the thread in case it is still waiting to start
        self.signal.notify_start();
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| ProbeError::SamplerPanicked)?,
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.finish();
        }
    }
}

fn run(
    mut counters: Vec<Counter>,
    interval: Duration,
    mode: TickMode,
    signal: &Signal,
    ticks: &AtomicU64,
) -> Result<Vec<Counter>, ProbeError> {
    signal.wait_for_start();

    while !signal.done.load(Ordering::Acquire) {
        // NOTE: the scheduler adds a small skid between the deadline and this instant
        let entry = Instant::now();
        match &mode {
            TickMode::Accumulate => accumulate_tick(&mut counters)?,
            TickMode::ContinuousPrint { output, timestamp } => {
                continuous_print_tick(&mut counters, output, *timestamp)?
            }
        }
        ticks.fetch_add(1, Ordering::Relaxed);
        sleep_until(entry + interval);
    }
    Ok(counters)
}

fn accumulate_tick(counters: &mut [Counter]) -> Result<(), ProbeError> {
    for counter in counters {
        counter.accumulate()?;
    }
    Ok(())
}

fn continuous_print_tick(counters: &mut [Counter], output: &SharedOutput, timestamp: bool) -> Result<(), ProbeError> {
    let mut line = String::with_capacity(16 * (counters.len() + 1));
    if timestamp {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9;
        let _ = write!(line, "{now:.6},");
    }
    for (i, counter) in counters.iter_mut().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&counter.read_compact()?);
    }
    line.push('\n');

    let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Sleeps until an absolute deadline, so that the duration of the tick does not add up to the period.
fn sleep_until(deadline: Instant) {
    if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        thread::sleep(remaining);
    }
}
