//! Hardware backends.

use crate::registry::Registry;

pub mod dummy;
pub mod hwmon;
pub mod jetson;
pub mod mcp;
pub mod msr;
pub mod perf_event;
pub mod powercap;
pub mod rapl;
mod sysfs;

/// Registers every backend supported on this platform.
///
/// The order matters: when two sources offer the same alias, the first one gets it.
pub fn register_default_sources(registry: &mut Registry) {
    registry.register_source(perf_event::PerfEventSource::new());
    registry.register_source(powercap::PowercapSource::new());
    registry.register_source(msr::MsrSource::new());
    registry.register_source(hwmon::Ina226Source::new());
    registry.register_source(jetson::JetsonSource::new());
    registry.register_source(mcp::McpSource::new());
}
