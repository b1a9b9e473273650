//! Power rails of the NVIDIA Jetson boards, measured by `ina3221x` chips on the I2C bus.

use std::{collections::BTreeMap, path::PathBuf};

use log::debug;

use crate::counter::{CounterSource, PowerCounter};
use crate::registry::Source;

use super::sysfs::{read_trimmed, PowerFile};

const I2C_DEVICES_PATH: &str = "/sys/bus/i2c/devices";
/// TX2 boards use bus 0, Xavier AGX boards use bus 1.
const SENSOR_DEVICES: [&str; 4] = ["0-0040", "0-0041", "1-0040", "1-0041"];
const CHANNELS_PER_CHIP: u32 = 3;
/// `in_powerN_input` is in milliWatts.
const POWER_SCALE: f64 = 1e-3;

const ALIASES: [(&str, &str); 5] = [
    ("CPU", "VDD_SYS_CPU"),
    ("GPU", "VDD_SYS_GPU"),
    ("SOC", "VDD_SYS_SOC"),
    ("RAM", "VDD_SYS_DDR"),
    ("IN", "VDD_IN"),
];

pub struct JetsonSource {
    root: PathBuf,
    /// Rail name -> power file.
    rails: BTreeMap<String, PathBuf>,
}

impl JetsonSource {
    pub fn new() -> JetsonSource {
        JetsonSource::with_root(I2C_DEVICES_PATH)
    }

    /// Looks for the sensors in `root` instead of `/sys/bus/i2c/devices`.
    pub fn with_root(root: impl Into<PathBuf>) -> JetsonSource {
        JetsonSource {
            root: root.into(),
            rails: BTreeMap::new(),
        }
    }
}

impl Default for JetsonSource {
    fn default() -> Self {
        JetsonSource::new()
    }
}

impl Source for JetsonSource {
    fn id(&self) -> &str {
        "jetson"
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        self.rails.clear();
        for device in SENSOR_DEVICES {
            let iio = self.root.join(device).join("iio_device");
            match read_trimmed(&iio.join("name")) {
                Ok(name) if name == "ina3221x" => (),
                _ => continue,
            }
            for channel in 0..CHANNELS_PER_CHIP {
                let power_file = iio.join(format!("in_power{channel}_input"));
                let Ok(rail) = read_trimmed(&iio.join(format!("rail_name_{channel}"))) else {
                    continue;
                };
                if !power_file.is_file() {
                    continue;
                }
                debug!("jetson rail {rail}: {power_file:?}");
                self.rails.insert(rail, power_file);
            }
        }
        Ok(self.rails.keys().cloned().collect())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        let Some(path) = self.rails.get(counter) else {
            return Ok(None);
        };
        let probe = PowerFile::open(path.clone(), POWER_SCALE)?;
        Ok(Some(Box::new(PowerCounter::new(probe))))
    }

    fn possible_aliases(&self) -> Vec<(String, String)> {
        ALIASES
            .iter()
            .filter(|(_, rail)| self.rails.contains_key(*rail))
            .map(|(alias, rail)| (alias.to_string(), rail.to_string()))
            .collect()
    }
}
