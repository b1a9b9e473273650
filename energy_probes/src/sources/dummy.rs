//! A source without hardware: every counter reports the same constant power.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::counter::{CounterSource, PowerCounter, PowerProbe, PowerSample};
use crate::registry::Source;

pub struct DummySource {
    id: String,
    watts: f64,
    counters: Vec<String>,
    aliases: Vec<(String, String)>,
    initializations: Arc<AtomicUsize>,
}

impl DummySource {
    /// Creates a source named `id` with a single counter, `constant`.
    pub fn new(id: &str, watts: f64) -> DummySource {
        DummySource {
            id: id.to_owned(),
            watts,
            counters: vec!["constant".to_owned()],
            aliases: Vec::new(),
            initializations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the list of counters.
    pub fn with_counters(mut self, counters: &[&str]) -> DummySource {
        self.counters = counters.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, alias: &str, counter: &str) -> DummySource {
        self.aliases.push((alias.to_owned(), counter.to_owned()));
        self
    }

    /// How many times the source has been initialized for an experiment.
    pub fn initializations(&self) -> Arc<AtomicUsize> {
        self.initializations.clone()
    }
}

struct ConstantPower(f64);

impl PowerProbe for ConstantPower {
    fn read_power(&mut self) -> anyhow::Result<PowerSample> {
        Ok(PowerSample::now(self.0))
    }
}

impl Source for DummySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        Ok(self.counters.clone())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        if !self.counters.iter().any(|c| c == counter) {
            return Ok(None);
        }
        Ok(Some(Box::new(PowerCounter::new(ConstantPower(self.watts)))))
    }

    fn possible_aliases(&self) -> Vec<(String, String)> {
        self.aliases.clone()
    }

    fn initialize_experiment(&self) -> anyhow::Result<()> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
