use std::io;

use thiserror::Error;

/// Failures surfaced by the registry, the sampler and the experiment driver.
///
/// Backends report their own problems with [`anyhow::Error`], which is kept
/// as the `cause` of the variant that describes where it happened.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The name does not resolve to `source:counter` nor to a registered alias.
    #[error("unknown counter \"{0}\"")]
    UnknownCounter(String),

    #[error("cannot open counter \"{counter}\"")]
    HardwareOpen {
        counter: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("failed to read counter \"{counter}\"")]
    HardwareRead {
        counter: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("failed to initialize source \"{source_id}\" for the experiment")]
    Initialize {
        source_id: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("failed to execute workload \"{program}\"")]
    WorkloadExec {
        program: String,
        #[source]
        cause: io::Error,
    },

    #[error("alias \"{alias}\" is already registered (-> {target})")]
    AliasConflict { alias: String, target: String },

    #[error("alias \"{alias}\" points to a counter that does not exist: {target}")]
    UnknownAliasTarget { alias: String, target: String },

    #[error("no workload to measure")]
    MissingWorkload,

    #[error("the sampler thread panicked")]
    SamplerPanicked,

    #[error("i/o error")]
    Io(#[from] io::Error),
}
