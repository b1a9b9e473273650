use std::time::{Duration, Instant};

use log::warn;

use crate::ProbeError;

/// An instantaneous power reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub timestamp: Instant,
    pub watts: f64,
}

impl PowerSample {
    pub fn now(watts: f64) -> PowerSample {
        PowerSample {
            timestamp: Instant::now(),
            watts,
        }
    }
}

/// A reading of a monotonically increasing energy register, already converted to Joules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergySample {
    pub timestamp: Instant,
    pub joules: f64,
}

impl EnergySample {
    pub fn now(joules: f64) -> EnergySample {
        EnergySample {
            timestamp: Instant::now(),
            joules,
        }
    }
}

/// The contract between the sampler and an open hardware counter.
///
/// Every call happens on the sampler thread, at the sampling cadence,
/// so the implementations must never block for an unbounded time.
pub trait CounterSource: Send {
    /// Reads the current power.
    fn read(&mut self) -> anyhow::Result<PowerSample>;

    /// Records one more reading into the running total.
    fn accumulate(&mut self) -> anyhow::Result<()>;

    /// Reduces the recorded readings into the consumed energy, in Joules.
    ///
    /// `interval` is the configured sampling interval.
    fn accumulator(&self, interval: Duration) -> f64;

    /// Reads the current power as a compact string, for continuous printing (integer milliwatts).
    fn read_compact(&mut self) -> anyhow::Result<String> {
        let sample = self.read()?;
        Ok(format!("{}", (sample.watts * 1000.0).round() as i64))
    }
}

/// A backend that measures power directly (serial power meter, hwmon file, ...).
pub trait PowerProbe: Send {
    fn read_power(&mut self) -> anyhow::Result<PowerSample>;
}

/// A backend that exposes an energy register (RAPL and friends).
///
/// The returned values must increase monotonically: wrap-arounds of the
/// underlying hardware register are corrected by the backend.
pub trait EnergyProbe: Send {
    fn read_energy(&mut self) -> anyhow::Result<EnergySample>;
}

/// Turns a [`PowerProbe`] into a [`CounterSource`] by integrating the power over time.
pub struct PowerCounter<P> {
    probe: P,
    samples: Vec<PowerSample>,
}

impl<P: PowerProbe> PowerCounter<P> {
    pub fn new(probe: P) -> PowerCounter<P> {
        PowerCounter {
            probe,
            samples: Vec::new(),
        }
    }

    /// The readings recorded so far.
    pub fn samples(&self) -> &[PowerSample] {
        &self.samples
    }
}

impl<P: PowerProbe> CounterSource for PowerCounter<P> {
    fn read(&mut self) -> anyhow::Result<PowerSample> {
        self.probe.read_power()
    }

    fn accumulate(&mut self) -> anyhow::Result<()> {
        let sample = self.probe.read_power()?;
        self.samples.push(sample);
        Ok(())
    }

    fn accumulator(&self, interval: Duration) -> f64 {
        lower_darboux_sum(&self.samples, interval)
    }
}

/// Approximates the energy (in Joules) from power samples taken at the start of each tick.
///
/// Every sample is assumed to hold until the next one, and the last one for exactly one `interval`.
/// Because the power is measured at the start of the interval instead of being averaged over it,
/// this is a lower Darboux sum and underestimates the energy when the power rises.
pub fn lower_darboux_sum(samples: &[PowerSample], interval: Duration) -> f64 {
    let inner: f64 = samples
        .windows(2)
        .map(|pair| {
            let dt = pair[1].timestamp.saturating_duration_since(pair[0].timestamp);
            pair[0].watts * dt.as_secs_f64()
        })
        .sum();

    let last = samples.last().map_or(0.0, |s| s.watts * interval.as_secs_f64());
    inner + last
}

/// Turns an [`EnergyProbe`] into a [`CounterSource`] by differencing consecutive reads.
pub struct EnergyCounter<E> {
    probe: E,
    previous: Option<EnergySample>,
    /// The energy consumed between the first and the last call to `accumulate`, in Joules.
    consumed: f64,
}

impl<E: EnergyProbe> EnergyCounter<E> {
    pub fn new(probe: E) -> EnergyCounter<E> {
        EnergyCounter {
            probe,
            previous: None,
            consumed: 0.0,
        }
    }

    /// Reads the register and returns the energy consumed since the previous read,
    /// with the time elapsed between the two. Returns `None` on the first read.
    fn advance(&mut self) -> anyhow::Result<(EnergySample, Option<(f64, Duration)>)> {
        let current = self.probe.read_energy()?;
        let diff = self.previous.map(|prev| {
            let dt = current.timestamp.saturating_duration_since(prev.timestamp);
            let joules = if current.joules < prev.joules {
                warn!(
                    "energy register went backwards ({} J -> {} J), ignoring this interval",
                    prev.joules, current.joules
                );
                0.0
            } else {
                current.joules - prev.joules
            };
            (joules, dt)
        });
        self.previous = Some(current);
        Ok((current, diff))
    }
}

impl<E: EnergyProbe> CounterSource for EnergyCounter<E> {
    fn read(&mut self) -> anyhow::Result<PowerSample> {
        let (current, diff) = self.advance()?;
        let watts = match diff {
            Some((joules, dt)) if !dt.is_zero() => joules / dt.as_secs_f64(),
            // no baseline yet
            _ => 0.0,
        };
        Ok(PowerSample {
            timestamp: current.timestamp,
            watts,
        })
    }

    fn accumulate(&mut self) -> anyhow::Result<()> {
        if let (_, Some((joules, _))) = self.advance()? {
            self.consumed += joules;
        }
        Ok(())
    }

    fn accumulator(&self, _interval: Duration) -> f64 {
        self.consumed
    }
}

/// An open counter, tagged with the name it was requested with.
pub struct Counter {
    name: String,
    source: Box<dyn CounterSource>,
}

impl Counter {
    pub fn new(name: impl Into<String>, source: Box<dyn CounterSource>) -> Counter {
        Counter {
            name: name.into(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self) -> Result<PowerSample, ProbeError> {
        self.source.read().map_err(|cause| self.read_error(cause))
    }

    pub fn read_compact(&mut self) -> Result<String, ProbeError> {
        self.source.read_compact().map_err(|cause| self.read_error(cause))
    }

    pub fn accumulate(&mut self) -> Result<(), ProbeError> {
        self.source.accumulate().map_err(|cause| self.read_error(cause))
    }

    pub fn accumulator(&self, interval: Duration) -> f64 {
        self.source.accumulator(interval)
    }

    fn read_error(&self, cause: anyhow::Error) -> ProbeError {
        ProbeError::HardwareRead {
            counter: self.name.clone(),
            cause,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use approx::assert_relative_eq;

    use super::*;

    /// Replays a fixed list of register values.
    pub(crate) struct ScriptedEnergy {
        pub values: VecDeque<EnergySample>,
    }

    impl EnergyProbe for ScriptedEnergy {
        fn read_energy(&mut self) -> anyhow::Result<EnergySample> {
            self.values.pop_front().ok_or_else(|| anyhow::anyhow!("no more values"))
        }
    }

    fn scripted(start: Instant, joules: &[f64]) -> ScriptedEnergy {
        let values = joules
            .iter()
            .enumerate()
            .map(|(i, &joules)| EnergySample {
                timestamp: start + Duration::from_secs(i as u64),
                joules,
            })
            .collect();
        ScriptedEnergy { values }
    }

    fn evenly_spaced(start: Instant, step: Duration, watts: &[f64]) -> Vec<PowerSample> {
        watts
            .iter()
            .enumerate()
            .map(|(i, &watts)| PowerSample {
                timestamp: start + step * i as u32,
                watts,
            })
            .collect()
    }

    #[test]
    fn darboux_sum_of_nothing_is_zero() {
        assert_eq!(lower_darboux_sum(&[], Duration::from_millis(100)), 0.0);
    }

    #[test]
    fn darboux_sum_constant_power() {
        let step = Duration::from_millis(100);
        for n in 1..20 {
            let samples = evenly_spaced(Instant::now(), step, &vec![2.5; n]);
            assert_relative_eq!(lower_darboux_sum(&samples, step), 2.5 * 0.1 * n as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn darboux_sum_uses_left_endpoints() {
        let start = Instant::now();
        let samples = vec![
            PowerSample { timestamp: start, watts: 1.0 },
            PowerSample { timestamp: start + Duration::from_millis(300), watts: 10.0 },
            PowerSample { timestamp: start + Duration::from_millis(400), watts: 4.0 },
        ];
        // 1 W for 0.3 s, 10 W for 0.1 s, then 4 W for one interval of 0.05 s
        let energy = lower_darboux_sum(&samples, Duration::from_millis(50));
        assert_relative_eq!(energy, 0.3 + 1.0 + 0.2, epsilon = 1e-9);
    }

    #[test]
    fn energy_counter_first_read_is_zero_power() {
        let mut counter = EnergyCounter::new(scripted(Instant::now(), &[100.0, 140.0, 140.0]));
        let powers: Vec<f64> = (0..3).map(|_| counter.read().unwrap().watts).collect();
        assert_eq!(powers.len(), 3);
        assert_relative_eq!(powers[0], 0.0);
        assert_relative_eq!(powers[1], 40.0, epsilon = 1e-9);
        assert_relative_eq!(powers[2], 0.0);
    }

    #[test]
    fn energy_counter_accumulates_deltas() {
        let mut counter = EnergyCounter::new(scripted(Instant::now(), &[100.0, 140.0, 141.5, 150.0]));
        for _ in 0..4 {
            counter.accumulate().unwrap();
        }
        // the interval does not matter for differencing sources
        assert_relative_eq!(counter.accumulator(Duration::from_secs(10)), 50.0, epsilon = 1e-9);
        assert!(counter.accumulate().is_err());
    }

    #[test]
    fn energy_counter_ignores_backward_steps() {
        let mut counter = EnergyCounter::new(scripted(Instant::now(), &[10.0, 12.0, 5.0, 6.0]));
        for _ in 0..4 {
            counter.accumulate().unwrap();
        }
        assert_relative_eq!(counter.accumulator(Duration::ZERO), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn compact_read_is_milliwatts() {
        struct Fixed;
        impl PowerProbe for Fixed {
            fn read_power(&mut self) -> anyhow::Result<PowerSample> {
                Ok(PowerSample::now(1.2346))
            }
        }
        let mut counter = PowerCounter::new(Fixed);
        assert_eq!(counter.read_compact().unwrap(), "1235");
        assert!(counter.samples().is_empty());
        counter.accumulate().unwrap();
        assert_eq!(counter.samples().len(), 1);
    }

    #[test]
    fn counter_tags_read_errors_with_its_name() {
        let mut counter = Counter::new("rapl:pkg", Box::new(EnergyCounter::new(scripted(Instant::now(), &[]))));
        match counter.accumulate() {
            Err(ProbeError::HardwareRead { counter, .. }) => assert_eq!(counter, "rapl:pkg"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
