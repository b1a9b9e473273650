use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::counter::{Counter, CounterSource};
use crate::ProbeError;

/// Separates the source id from the counter name, as in `rapl:pkg`.
pub const SEPARATOR: char = ':';

/// A hardware backend that groups one or more counters.
///
/// Registering a source is cheap; the discovery happens in [`Source::detect_available_counters`],
/// called once by [`Registry::setup`].
pub trait Source: Send + Sync {
    /// The id of the source, used as the prefix of qualified counter names.
    fn id(&self) -> &str;

    /// Lists the counters present on this machine.
    ///
    /// Finding nothing is not an error: return an empty list.
    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>>;

    /// Opens a counter previously returned by [`Source::detect_available_counters`].
    ///
    /// Returns `Ok(None)` if the name is unknown.
    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>>;

    /// Short names offered by this source, as `(alias, counter)` pairs.
    fn possible_aliases(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Called once per run, after all the counters of the run have been opened,
    /// if at least one of them belongs to this source.
    fn initialize_experiment(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct SourceEntry {
    source: Box<dyn Source>,
    counters: Vec<String>,
    set_up: bool,
    has_open_counter: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AliasTarget {
    source_id: String,
    counter: String,
}

impl AliasTarget {
    fn qualified_name(&self) -> String {
        format!("{}{SEPARATOR}{}", self.source_id, self.counter)
    }
}

/// Table of the known sources and aliases.
///
/// Build it once at startup, register the sources, call [`Registry::setup`],
/// then share it (by reference) with whoever needs to open counters.
#[derive(Default)]
pub struct Registry {
    /// In registration order, which is also the order of alias registration.
    sources: Vec<SourceEntry>,
    aliases: BTreeMap<String, AliasTarget>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Creates a registry that knows about every hardware backend of this crate.
    pub fn with_default_sources() -> Registry {
        let mut registry = Registry::new();
        crate::sources::register_default_sources(&mut registry);
        registry
    }

    /// Adds a source, replacing any previous source with the same id.
    pub fn register_source<S: Source + 'static>(&mut self, source: S) {
        let entry = SourceEntry {
            source: Box::new(source),
            counters: Vec::new(),
            set_up: false,
            has_open_counter: AtomicBool::new(false),
        };
        let id = entry.source.id();
        match self.sources.iter_mut().find(|e| e.source.id() == id) {
            Some(existing) => *existing = entry,
            None => self.sources.push(entry),
        }
    }

    /// Runs the hardware discovery of every source that has not been set up yet,
    /// then registers the aliases they offer.
    ///
    /// Failures are logged and do not prevent the other sources from being set up.
    pub fn setup(&mut self) {
        let mut offered = Vec::new();
        for entry in self.sources.iter_mut().filter(|e| !e.set_up) {
            let id = entry.source.id().to_owned();
            entry.counters = match entry.source.detect_available_counters() {
                Ok(counters) => counters,
                Err(e) => {
                    warn!("Failed to detect the counters of source {id}: {e:#}");
                    Vec::new()
                }
            };
            entry.set_up = true;
            debug!("source {id}: {} counter(s) {:?}", entry.counters.len(), entry.counters);

            for (alias, counter) in entry.source.possible_aliases() {
                offered.push((alias, id.clone(), counter));
            }
        }

        for (alias, source_id, counter) in offered {
            if let Err(e) = self.register_alias(&alias, &source_id, &counter) {
                info!("Alias not registered: {e}");
            }
        }
    }

    /// Maps `alias` to `source_id:counter`.
    ///
    /// Fails if the alias is taken, or if the counter does not exist.
    pub fn register_alias(&mut self, alias: &str, source_id: &str, counter: &str) -> Result<(), ProbeError> {
        let target = AliasTarget {
            source_id: source_id.to_owned(),
            counter: counter.to_owned(),
        };
        if let Some(existing) = self.aliases.get(alias) {
            return Err(ProbeError::AliasConflict {
                alias: alias.to_owned(),
                target: existing.qualified_name(),
            });
        }
        if self.find_counter(source_id, counter).is_none() {
            return Err(ProbeError::UnknownAliasTarget {
                alias: alias.to_owned(),
                target: target.qualified_name(),
            });
        }
        self.aliases.insert(alias.to_owned(), target);
        Ok(())
    }

    /// Opens a counter, given either as `source:counter` or as an alias.
    pub fn open_counter(&self, name: &str) -> Result<Counter, ProbeError> {
        let (source_id, counter) = match name.split_once(SEPARATOR) {
            Some(qualified) => qualified,
            None => {
                let target = self
                    .aliases
                    .get(name)
                    .ok_or_else(|| ProbeError::UnknownCounter(name.to_owned()))?;
                (target.source_id.as_str(), target.counter.as_str())
            }
        };

        let entry = self
            .find_counter(source_id, counter)
            .ok_or_else(|| ProbeError::UnknownCounter(name.to_owned()))?;

        let opened = entry.source.open_counter(counter).map_err(|cause| ProbeError::HardwareOpen {
            counter: name.to_owned(),
            cause,
        })?;
        let source = opened.ok_or_else(|| ProbeError::UnknownCounter(name.to_owned()))?;

        entry.has_open_counter.store(true, Ordering::Release);
        debug!("opened counter {name} ({source_id}{SEPARATOR}{counter})");
        Ok(Counter::new(name, source))
    }

    /// Every available counter, as `source:counter`.
    pub fn available_counters(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|e| {
                let id = e.source.id();
                e.counters.iter().map(move |c| format!("{id}{SEPARATOR}{c}"))
            })
            .collect()
    }

    /// Every registered alias, with the counter it points to (`source:counter`).
    pub fn available_aliases(&self) -> Vec<(String, String)> {
        self.aliases
            .iter()
            .map(|(alias, target)| (alias.clone(), target.qualified_name()))
            .collect()
    }

    /// Calls [`Source::initialize_experiment`] on every source that had a counter opened
    /// since the last call, exactly once per source.
    pub fn call_initialize_on_open_sources(&self) -> Result<(), ProbeError> {
        for entry in &self.sources {
            if entry.has_open_counter.swap(false, Ordering::AcqRel) {
                let id = entry.source.id();
                debug!("initializing source {id} for the experiment");
                entry
                    .source
                    .initialize_experiment()
                    .map_err(|cause| ProbeError::Initialize {
                        source_id: id.to_owned(),
                        cause,
                    })?;
            }
        }
        Ok(())
    }

    /// Forgets which sources had a counter opened, without initializing them.
    ///
    /// Used when a run is abandoned before it starts, so that the next run only
    /// initializes the sources it actually uses.
    pub fn forget_open_sources(&self) {
        for entry in &self.sources {
            entry.has_open_counter.store(false, Ordering::Release);
        }
    }

    fn find_counter(&self, source_id: &str, counter: &str) -> Option<&SourceEntry> {
        self.sources
            .iter()
            .find(|e| e.source.id() == source_id)
            .filter(|e| e.counters.iter().any(|c| c == counter))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::sampler::{Sampler, TickMode};
    use crate::sources::dummy::DummySource;
    use crate::{ProbeError, Source};

    use super::Registry;

    fn registry_with(sources: Vec<DummySource>) -> Registry {
        let mut registry = Registry::new();
        for s in sources {
            registry.register_source(s);
        }
        registry.setup();
        registry
    }

    #[test]
    fn qualified_and_alias_resolve_to_the_same_counter() {
        let registry = registry_with(vec![DummySource::new("dummy", 3.0).with_alias("CONST", "constant")]);
        let mut by_name = registry.open_counter("dummy:constant").unwrap();
        let mut by_alias = registry.open_counter("CONST").unwrap();
        assert_eq!(by_name.name(), "dummy:constant");
        assert_eq!(by_alias.name(), "CONST");
        assert_eq!(by_name.read().unwrap().watts, by_alias.read().unwrap().watts);
        assert_eq!(by_name.read_compact().unwrap(), by_alias.read_compact().unwrap());
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = registry_with(vec![DummySource::new("dummy", 1.0)]);
        for name in ["doesnotexist", "nope:constant", "dummy:nope", "dummy:", ":constant"] {
            match registry.open_counter(name) {
                Err(ProbeError::UnknownCounter(n)) => assert_eq!(n, name),
                Err(e) => panic!("unexpected error for {name}: {e}"),
                Ok(_) => panic!("{name} should not resolve"),
            }
        }
    }

    #[test]
    fn first_alias_wins() {
        let registry = registry_with(vec![
            DummySource::new("first", 1.0).with_alias("IN", "constant"),
            DummySource::new("second", 2.0).with_alias("IN", "constant"),
        ]);
        assert_eq!(
            registry.available_aliases(),
            vec![("IN".to_owned(), "first:constant".to_owned())]
        );

        let mut registry = registry;
        match registry.register_alias("IN", "second", "constant") {
            Err(ProbeError::AliasConflict { alias, target }) => {
                assert_eq!(alias, "IN");
                assert_eq!(target, "first:constant");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let mut counter = registry.open_counter("IN").unwrap();
        assert_eq!(counter.read().unwrap().watts, 1.0);
    }

    #[test]
    fn alias_to_missing_counter_is_rejected() {
        let mut registry = registry_with(vec![DummySource::new("dummy", 1.0).with_alias("GPU", "gpu")]);
        assert!(registry.available_aliases().is_empty());
        assert!(matches!(
            registry.register_alias("X", "nowhere", "constant"),
            Err(ProbeError::UnknownAliasTarget { .. })
        ));
        assert!(registry.register_alias("X", "dummy", "constant").is_ok());
    }

    #[test]
    fn setup_twice_keeps_the_tables_intact() {
        let mut registry = registry_with(vec![DummySource::new("dummy", 1.0).with_alias("CONST", "constant")]);
        let counters = registry.available_counters();
        let aliases = registry.available_aliases();
        registry.setup();
        assert_eq!(registry.available_counters(), counters);
        assert_eq!(registry.available_aliases(), aliases);
        assert_eq!(counters, vec!["dummy:constant".to_owned()]);
    }

    #[test]
    fn registering_the_same_id_replaces_the_source() {
        let mut registry = Registry::new();
        registry.register_source(DummySource::new("dummy", 1.0));
        registry.register_source(DummySource::new("dummy", 5.0).with_counters(&["a", "b"]));
        registry.setup();
        assert_eq!(registry.available_counters(), vec!["dummy:a".to_owned(), "dummy:b".to_owned()]);
        let mut counter = registry.open_counter("dummy:b").unwrap();
        assert_eq!(counter.read().unwrap().watts, 5.0);
    }

    #[test]
    fn initialization_happens_once_per_touched_source() {
        let touched = DummySource::new("touched", 1.0).with_counters(&["a", "b"]);
        let untouched = DummySource::new("untouched", 1.0);
        let touched_inits = touched.initializations();
        let untouched_inits = untouched.initializations();
        let registry = registry_with(vec![touched, untouched]);

        let _a = registry.open_counter("touched:a").unwrap();
        let _b = registry.open_counter("touched:b").unwrap();
        registry.call_initialize_on_open_sources().unwrap();
        assert_eq!(touched_inits.load(Ordering::SeqCst), 1);
        assert_eq!(untouched_inits.load(Ordering::SeqCst), 0);

        // the flag is reset after the call
        registry.call_initialize_on_open_sources().unwrap();
        assert_eq!(touched_inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandoned_sampler_does_not_initialize_its_sources() {
        let first = DummySource::new("a", 1.0);
        let second = DummySource::new("b", 1.0);
        let first_inits = first.initializations();
        let second_inits = second.initializations();
        let registry = registry_with(vec![first, second]);

        let interval = Duration::from_millis(10);
        let res = Sampler::new(&registry, interval, &["a:constant", "doesnotexist"], TickMode::Accumulate);
        assert!(matches!(res, Err(ProbeError::UnknownCounter(_))));

        let sampler = Sampler::new(&registry, interval, &["b:constant"], TickMode::Accumulate).unwrap();
        sampler.stop(Duration::ZERO).unwrap();
        assert_eq!(first_inits.load(Ordering::SeqCst), 0);
        assert_eq!(second_inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_failures_are_reported() {
        struct Broken;
        impl Source for Broken {
            fn id(&self) -> &str {
                "broken"
            }
            fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
                Ok(vec!["x".to_owned()])
            }
            fn open_counter(&self, _counter: &str) -> anyhow::Result<Option<Box<dyn crate::CounterSource>>> {
                Err(anyhow::anyhow!("permission denied"))
            }
        }

        let mut registry = Registry::new();
        registry.register_source(Broken);
        registry.setup();
        match registry.open_counter("broken:x") {
            Err(ProbeError::HardwareOpen { counter, cause }) => {
                assert_eq!(counter, "broken:x");
                assert_eq!(cause.to_string(), "permission denied");
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("broken:x should not open"),
        }
        // nothing was opened, nothing to initialize
        registry.call_initialize_on_open_sources().unwrap();
    }

    #[test]
    fn detection_errors_make_the_source_empty() {
        struct Failing(Arc<AtomicUsize>);
        impl Source for Failing {
            fn id(&self) -> &str {
                "failing"
            }
            fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("malformed sysfs"))
            }
            fn open_counter(&self, _counter: &str) -> anyhow::Result<Option<Box<dyn crate::CounterSource>>> {
                Ok(None)
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        registry.register_source(Failing(calls.clone()));
        registry.register_source(DummySource::new("dummy", 1.0));
        registry.setup();
        registry.setup();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.available_counters(), vec!["dummy:constant".to_owned()]);

        let counter = registry.open_counter("dummy:constant").unwrap();
        assert_eq!(counter.accumulator(Duration::from_millis(10)), 0.0);
    }
}
