// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use enum_map::EnumMap;
use log::debug;

use crate::counter::{CounterSource, EnergyCounter};
use crate::registry::Source;

use super::rapl::{DomainRegisters, RaplDomainType, RawRegister};
use super::sysfs::{read_parsed, read_trimmed, ValueFile};

const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoules

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The RAPL domain type, as an enum
    pub domain: RaplDomainType,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The id of the socket that "contains" this zone, if applicable (psys has no socket)
    pub socket_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }
}

/// Discovers all the RAPL power zones under `root`, parents before their children.
pub fn all_power_zones(root: &Path) -> anyhow::Result<Vec<PowerZone>> {
    fn parse_zone_name(name: &str) -> Option<RaplDomainType> {
        match name {
            "psys" => Some(RaplDomainType::Platform),
            "core" => Some(RaplDomainType::PP0),
            "uncore" => Some(RaplDomainType::PP1),
            "dram" => Some(RaplDomainType::Dram),
            _ if name.starts_with("package-") => Some(RaplDomainType::Package),
            _ => None,
        }
    }

    fn explore_rec(dir: &Path, parent_socket: Option<u32>, flat: &mut Vec<PowerZone>) -> anyhow::Result<()> {
        let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        subdirs.retain(|p| {
            p.is_dir()
                && p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(POWER_ZONE_PREFIX))
        });
        subdirs.sort();

        for path in subdirs {
            let name = read_trimmed(&path.join("name"))?;
            let socket_id = match (parent_socket, name.strip_prefix("package-")) {
                (Some(parent_id), _) => Some(parent_id),
                (None, Some(id_str)) => Some(
                    id_str
                        .parse()
                        .with_context(|| format!("Failed to extract package id from '{name}'"))?,
                ),
                (None, None) => None,
            };
            let Some(domain) = parse_zone_name(&name) else {
                debug!("ignoring unknown RAPL powercap zone {name}");
                continue;
            };
            flat.push(PowerZone {
                name,
                domain,
                path: path.clone(),
                socket_id,
            });
            // recursively explore
            explore_rec(&path, socket_id, flat)?;
        }
        Ok(())
    }

    let mut flat = Vec::new();
    explore_rec(root, None, &mut flat)?;
    Ok(flat)
}

struct PowercapRegister {
    file: ValueFile,
}

impl RawRegister for PowercapRegister {
    fn read_raw(&mut self) -> anyhow::Result<u64> {
        self.file.read()
    }
}

/// RAPL energy counters read from the powercap sysfs, one counter per domain, summed over the sockets.
pub struct PowercapSource {
    root: PathBuf,
    zones: EnumMap<RaplDomainType, Vec<PowerZone>>,
}

impl PowercapSource {
    pub fn new() -> PowercapSource {
        PowercapSource::with_root(POWERCAP_RAPL_PATH)
    }

    /// Explores `root` instead of `/sys/devices/virtual/powercap/intel-rapl`.
    pub fn with_root(root: impl Into<PathBuf>) -> PowercapSource {
        PowercapSource {
            root: root.into(),
            zones: EnumMap::default(),
        }
    }
}

impl Default for PowercapSource {
    fn default() -> Self {
        PowercapSource::new()
    }
}

impl Source for PowercapSource {
    fn id(&self) -> &str {
        "powercap"
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        if !self.root.is_dir() {
            debug!("no powercap RAPL zones in {:?}", self.root);
            return Ok(Vec::new());
        }
        for zone in all_power_zones(&self.root)? {
            debug!("powercap zone {} ({:?}, socket {:?}): {:?}", zone.name, zone.domain, zone.socket_id, zone.path);
            self.zones[zone.domain].push(zone);
        }
        Ok(self
            .zones
            .iter()
            .filter(|(_, zones)| !zones.is_empty())
            .map(|(domain, _)| domain.counter_name().to_owned())
            .collect())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        let Some(domain) = RaplDomainType::from_counter_name(counter) else {
            return Ok(None);
        };
        let zones = &self.zones[domain];
        if zones.is_empty() {
            return Ok(None);
        }

        let mut registers = DomainRegisters::default();
        for zone in zones {
            let file = ValueFile::open(zone.energy_path())?;
            // the maximum energy depends on the zone
            let max_energy_uj: u64 = read_parsed(&zone.max_energy_path())?;
            registers.push(Box::new(PowercapRegister { file }), POWERCAP_ENERGY_UNIT, max_energy_uj);
        }
        Ok(Some(Box::new(EnergyCounter::new(registers))))
    }
}
