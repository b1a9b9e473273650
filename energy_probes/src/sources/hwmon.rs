//! INA226 current/power monitors exposed by the hwmon subsystem.

use std::{fs, path::PathBuf};

use log::debug;

use crate::counter::{CounterSource, PowerCounter};
use crate::registry::Source;

use super::sysfs::{read_trimmed, PowerFile};

const HWMON_PATH: &str = "/sys/class/hwmon";
const CHIP_NAME: &str = "ina226";
/// `power1_input` is in microWatts.
const POWER_SCALE: f64 = 1e-6;

pub struct Ina226Source {
    root: PathBuf,
    /// Counter name and power file, in the order of the hwmon devices.
    sensors: Vec<(String, PathBuf)>,
}

impl Ina226Source {
    pub fn new() -> Ina226Source {
        Ina226Source::with_root(HWMON_PATH)
    }

    /// Looks for the chips in `root` instead of `/sys/class/hwmon`.
    pub fn with_root(root: impl Into<PathBuf>) -> Ina226Source {
        Ina226Source {
            root: root.into(),
            sensors: Vec::new(),
        }
    }
}

impl Default for Ina226Source {
    fn default() -> Self {
        Ina226Source::new()
    }
}

impl Source for Ina226Source {
    fn id(&self) -> &str {
        CHIP_NAME
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut devices: Vec<PathBuf> = fs::read_dir(&self.root)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        devices.sort();

        self.sensors.clear();
        for device in devices {
            // other chips may lack the name attribute
            let Ok(name) = read_trimmed(&device.join("name")) else {
                continue;
            };
            if name != CHIP_NAME {
                continue;
            }
            let Some(dir_name) = device.file_name() else {
                continue;
            };
            let counter = format!("power-{}", dir_name.to_string_lossy());
            debug!("found {CHIP_NAME} {counter} in {device:?}");
            self.sensors.push((counter, device.join("power1_input")));
        }
        Ok(self.sensors.iter().map(|(name, _)| name.clone()).collect())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        let Some((_, path)) = self.sensors.iter().find(|(name, _)| name == counter) else {
            return Ok(None);
        };
        let probe = PowerFile::open(path.clone(), POWER_SCALE)?;
        Ok(Some(Box::new(PowerCounter::new(probe))))
    }

    fn possible_aliases(&self) -> Vec<(String, String)> {
        self.sensors
            .first()
            .map(|(name, _)| vec![("IN".to_owned(), name.clone())])
            .unwrap_or_default()
    }
}
