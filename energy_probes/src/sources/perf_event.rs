//! RAPL through the `power` PMU of perf_event.

use anyhow::{ensure, Context, Result};
use enum_map::EnumMap;
use log::debug;
use perf_event_open_sys as sys;
use std::{
    fs::{self, File},
    io::Read,
    os::fd::FromRawFd,
    path::{Path, PathBuf},
};

use crate::counter::{CounterSource, EnergyCounter};
use crate::registry::Source;

use super::rapl::{cpus_to_monitor, CpuId, DomainRegisters, RaplDomainType, RawRegister};
use super::sysfs::{read_parsed, read_trimmed};

// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver.

const POWER_DEVICE_PATH: &str = "/sys/devices/power";
pub(crate) const PERF_MAX_ENERGY: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct PowerEvent {
    /// The name of the power event, as reported by the sysfs. This corresponds to a RAPL **domain name**, like "pkg".
    pub name: String,
    /// The RAPL domain type, as an enum.
    pub domain: RaplDomainType,
    /// The event code to use as a "config" field for perf_event_open
    pub code: u8,
    /// The scale to apply in order to get joules (`energy_j = count * scale`).
    /// Should be "0x1.0p-32"
    pub scale: f64,
}

impl PowerEvent {
    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// with `attr.config = self.code` and `attr.type = pmu_type`.
    pub fn perf_event_open(&self, pmu_type: u32, cpu_id: u32) -> std::io::Result<File> {
        // For RAPL PMU events, we use (-1, cpu) which means "all processes, one cpu".
        let pid = -1;
        let cpu = cpu_id as i32;

        let mut attr = sys::bindings::perf_event_attr::default();
        attr.config = self.code.into();
        attr.type_ = pmu_type;
        attr.size = core::mem::size_of_val(&attr) as u32;
        debug!("{attr:?}");

        let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
        if result == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            // the fd is valid and owned by nobody else
            Ok(unsafe { File::from_raw_fd(result) })
        }
    }
}

/// Retrieves the type of the RAPL PMU (Power Monitoring Unit) in the Linux kernel.
fn pmu_type(power_device: &Path) -> Result<u32> {
    read_parsed(&power_device.join("type"))
}

/// Retrieves all RAPL power events exposed in sysfs.
/// There can be more than just `cores`, `pkg` and `ram`.
/// For instance, there can be `gpu` and `psys`.
pub fn all_power_events(power_device: &Path) -> Result<Vec<PowerEvent>> {
    fn read_event_code(path: &Path) -> Result<u8> {
        let read = read_trimmed(path)?;
        let code_str = read
            .strip_prefix("event=0x")
            .with_context(|| format!("Failed to strip {path:?}: '{read}'"))?;
        let code = u8::from_str_radix(code_str, 16).with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
        Ok(code)
    }

    fn parse_event_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "cores" => Some(RaplDomainType::PP0),
            "gpu" => Some(RaplDomainType::PP1),
            "psys" => Some(RaplDomainType::Platform),
            "pkg" => Some(RaplDomainType::Package),
            "ram" => Some(RaplDomainType::Dram),
            _ => None,
        }
    }

    let mut events: Vec<PowerEvent> = Vec::new();
    for e in fs::read_dir(power_device.join("events"))? {
        let path = e?.path();
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        // only list the main file, not *.unit nor *.scale
        if !path.is_file() || file_name.contains('.') {
            continue;
        }
        // The files are named "energy-pkg", "energy-ram", ...
        let Some(event_name) = file_name.strip_prefix("energy-") else {
            continue;
        };
        let Some(domain) = parse_event_name(event_name) else {
            debug!("ignoring unknown RAPL perf event {event_name}");
            continue;
        };
        let unit = read_trimmed(&path.with_extension("unit"))?;
        ensure!(unit == "Joules", "unexpected unit for RAPL perf event {event_name}: '{unit}'");
        events.push(PowerEvent {
            name: event_name.to_owned(),
            domain,
            code: read_event_code(&path)?,
            scale: read_parsed(&path.with_extension("scale"))?,
        });
    }
    events.sort_by_key(|e| e.domain as usize);
    Ok(events)
}

struct PerfRegister {
    fd: File,
}

impl RawRegister for PerfRegister {
    fn read_raw(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        // rewind() is INVALID for perf events, we must read "at the cursor" every time
        self.fd
            .read_exact(&mut buf)
            .with_context(|| format!("failed to read perf_event {:?}", self.fd))?;
        Ok(u64::from_ne_bytes(buf))
    }
}

/// RAPL energy counters read with perf_event, one counter per domain, summed over the sockets.
pub struct PerfEventSource {
    power_device: PathBuf,
    pmu_type: u32,
    cpus: Vec<CpuId>,
    events: EnumMap<RaplDomainType, Option<PowerEvent>>,
}

impl PerfEventSource {
    pub fn new() -> PerfEventSource {
        PerfEventSource::with_power_device(POWER_DEVICE_PATH)
    }

    /// Discovers the PMU in `power_device` instead of `/sys/devices/power`.
    pub fn with_power_device(power_device: impl Into<PathBuf>) -> PerfEventSource {
        PerfEventSource {
            power_device: power_device.into(),
            pmu_type: 0,
            cpus: Vec::new(),
            events: EnumMap::default(),
        }
    }
}

impl Default for PerfEventSource {
    fn default() -> Self {
        PerfEventSource::new()
    }
}

impl Source for PerfEventSource {
    fn id(&self) -> &str {
        "rapl"
    }

    fn detect_available_counters(&mut self) -> Result<Vec<String>> {
        if !self.power_device.join("type").exists() {
            debug!("no RAPL PMU in {:?}", self.power_device);
            return Ok(Vec::new());
        }
        self.pmu_type = pmu_type(&self.power_device)?;
        self.cpus = cpus_to_monitor(&self.power_device)?;
        for event in all_power_events(&self.power_device)? {
            let domain = event.domain;
            self.events[domain] = Some(event);
        }
        Ok(self
            .events
            .iter()
            .filter(|(_, e)| e.is_some())
            .map(|(domain, _)| domain.counter_name().to_owned())
            .collect())
    }

    fn open_counter(&self, counter: &str) -> Result<Option<Box<dyn CounterSource>>> {
        let Some(event) = RaplDomainType::from_counter_name(counter).and_then(|d| self.events[d].as_ref()) else {
            return Ok(None);
        };
        let mut registers = DomainRegisters::default();
        for CpuId { cpu, socket } in &self.cpus {
            let fd = event.perf_event_open(self.pmu_type, *cpu).with_context(|| {
                format!("perf_event_open failed for event {} on cpu {cpu} (socket {socket})", event.name)
            })?;
            registers.push(Box::new(PerfRegister { fd }), event.scale, PERF_MAX_ENERGY);
        }
        Ok(Some(Box::new(EnergyCounter::new(registers))))
    }

    fn possible_aliases(&self) -> Vec<(String, String)> {
        [("CPU", "cores"), ("GPU", "gpu"), ("RAM", "ram")]
            .into_iter()
            .map(|(alias, counter)| (alias.to_owned(), counter.to_owned()))
            .collect()
    }
}
