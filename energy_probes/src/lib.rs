//! Energy counters of the machine (RAPL, hwmon, serial power meters...) behind
//! a single registry, and an experiment driver that measures the energy
//! consumed by a workload.

pub mod counter;
pub mod error;
pub mod experiment;
pub mod registry;
pub mod sampler;
pub mod sources;
pub mod stats;

pub use counter::{
    lower_darboux_sum, Counter, CounterSource, EnergyCounter, EnergyProbe, EnergySample, PowerCounter, PowerProbe,
    PowerSample,
};
pub use error::ProbeError;
pub use experiment::{
    write_report, ContinuousSettings, CounterSummary, Experiment, ExperimentSettings, RunResult, Summary, Workload,
};
pub use registry::{Registry, Source, SEPARATOR};
pub use sampler::{Sampler, SharedOutput, TickMode};
pub use stats::{mean_and_stddev_percent, Spread};
