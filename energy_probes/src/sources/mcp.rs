//! MCP39F511N dual-channel power meters, connected through USB (CDC ACM serial devices).
//!
//! Both channels of a meter are returned by the same request, so the two counters
//! of one device share the serial link. The first channel read in a tick queries
//! the meter and caches the value of the other channel.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use anyhow::{anyhow, ensure, Context};
use log::debug;
use regex::Regex;

use crate::counter::{CounterSource, PowerCounter, PowerProbe, PowerSample};
use crate::registry::Source;

const DEV_PATH: &str = "/dev";
const DEVICE_PREFIX: &str = "ttyACM";
const BAUD_RATE: u32 = 115_200;
const LINK_TIMEOUT: Duration = Duration::from_millis(100);

const FRAME_HEADER: u8 = 0xA5;
const ACK: u8 = 0x06;
/// Set the address pointer to 0x0016 (active power of channel 1), then read 8 bytes
/// (active power of both channels).
const READ_ACTIVE_POWER: [u8; 7] = [FRAME_HEADER, 0x08, 0x41, 0x00, 0x16, 0x4E, 0x08];
const RESPONSE_LEN: usize = 11;
/// The meter reports power in steps of 10 mW.
const POWER_UNIT: f64 = 0.01;

/// A bidirectional byte link to a meter.
pub trait MeterLink: Read + Write + Send {}

impl<T: Read + Write + Send> MeterLink for T {}

type LinkOpener = fn(&Path) -> anyhow::Result<Box<dyn MeterLink>>;

fn open_serial_link(path: &Path) -> anyhow::Result<Box<dyn MeterLink>> {
    let port = serialport::new(path.to_string_lossy(), BAUD_RATE)
        .timeout(LINK_TIMEOUT)
        .open()
        .with_context(|| format!("Cannot open serial device {path:?}"))?;
    Ok(Box::new(port))
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Sends the power request and decodes the power of both channels, in Watts.
fn query_power(link: &mut dyn MeterLink) -> anyhow::Result<[f64; 2]> {
    let mut request = [0u8; READ_ACTIVE_POWER.len() + 1];
    request[..READ_ACTIVE_POWER.len()].copy_from_slice(&READ_ACTIVE_POWER);
    request[READ_ACTIVE_POWER.len()] = checksum(&READ_ACTIVE_POWER);
    link.write_all(&request)?;
    link.flush()?;

    let mut response = [0u8; RESPONSE_LEN];
    link.read_exact(&mut response).context("no response from the meter")?;
    ensure!(response[0] == ACK, "the meter did not acknowledge the request: {:#04x}", response[0]);
    ensure!(
        response[1] as usize == RESPONSE_LEN,
        "unexpected response length {}",
        response[1]
    );
    let expected = checksum(&response[..RESPONSE_LEN - 1]);
    ensure!(
        response[RESPONSE_LEN - 1] == expected,
        "bad checksum {:#04x}, expected {expected:#04x}",
        response[RESPONSE_LEN - 1]
    );

    let channel = |offset: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&response[2 + offset..2 + offset + 4]);
        u32::from_le_bytes(raw) as f64 * POWER_UNIT
    };
    Ok([channel(0), channel(4)])
}

struct MeterState {
    link: Box<dyn MeterLink>,
    /// Values returned by the last query and not consumed yet.
    cached: [Option<f64>; 2],
}

/// One physical meter, shared by the counters of its two channels.
struct SharedMeter {
    state: Mutex<MeterState>,
}

impl SharedMeter {
    fn read_channel(&self, channel: usize) -> anyhow::Result<f64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(watts) = state.cached[channel].take() {
            return Ok(watts);
        }
        let [ch1, ch2] = query_power(state.link.as_mut())?;
        state.cached = [Some(ch1), Some(ch2)];
        state.cached[channel]
            .take()
            .ok_or_else(|| anyhow!("channel {} out of range", channel + 1))
    }

    fn clear_cache(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).cached = [None, None];
    }
}

struct ChannelProbe {
    meter: Arc<SharedMeter>,
    /// 0 or 1
    channel: usize,
}

impl PowerProbe for ChannelProbe {
    fn read_power(&mut self) -> anyhow::Result<PowerSample> {
        Ok(PowerSample::now(self.meter.read_channel(self.channel)?))
    }
}

pub struct McpSource {
    dev_dir: PathBuf,
    devices: Vec<PathBuf>,
    opener: LinkOpener,
    /// Meters with at least one open channel, by device index.
    meters: Mutex<HashMap<usize, Weak<SharedMeter>>>,
}

impl McpSource {
    pub fn new() -> McpSource {
        McpSource::with_links(DEV_PATH, open_serial_link)
    }

    /// Looks for the devices in `dev_dir`, and connects to them with `opener`.
    pub fn with_links(dev_dir: impl Into<PathBuf>, opener: LinkOpener) -> McpSource {
        McpSource {
            dev_dir: dev_dir.into(),
            devices: Vec::new(),
            opener,
            meters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the meter of the device, connecting to it if none of its channels is open.
    fn meter(&self, index: usize) -> anyhow::Result<Arc<SharedMeter>> {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(meter) = meters.get(&index).and_then(Weak::upgrade) {
            return Ok(meter);
        }
        let path = &self.devices[index];
        debug!("connecting to MCP39F511N {path:?}");
        let meter = Arc::new(SharedMeter {
            state: Mutex::new(MeterState {
                link: (self.opener)(path)?,
                cached: [None, None],
            }),
        });
        meters.insert(index, Arc::downgrade(&meter));
        Ok(meter)
    }
}

impl Default for McpSource {
    fn default() -> Self {
        McpSource::new()
    }
}

impl Source for McpSource {
    fn id(&self) -> &str {
        "mcp"
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        if !self.dev_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut candidates: Vec<PathBuf> = fs::read_dir(&self.dev_dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        candidates.retain(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(DEVICE_PREFIX))
        });
        candidates.sort();

        // TODO: check the USB vendor and product ids (0x04d8:0x00dd) of the serial devices
        self.devices = candidates
            .into_iter()
            .filter(|p| match File::open(p) {
                Ok(_) => true,
                Err(e) => {
                    debug!("skipping {p:?}: {e}");
                    false
                }
            })
            .collect();

        Ok((0..self.devices.len())
            .flat_map(|i| [format!("dev{i}ch1"), format!("dev{i}ch2")])
            .collect())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        let counter_regex = Regex::new(r"^dev(\d+)ch([12])$")?;
        let Some(captures) = counter_regex.captures(counter) else {
            return Ok(None);
        };
        let (Ok(index), Ok(channel)) = (captures[1].parse::<usize>(), captures[2].parse::<usize>()) else {
            return Ok(None);
        };
        if index >= self.devices.len() {
            return Ok(None);
        }
        let probe = ChannelProbe {
            meter: self.meter(index)?,
            channel: channel - 1,
        };
        Ok(Some(Box::new(PowerCounter::new(probe))))
    }

    fn possible_aliases(&self) -> Vec<(String, String)> {
        [
            ("EXT_IN", "dev0ch1"),
            ("MCP1", "dev0ch1"),
            ("MCP2", "dev0ch2"),
            ("MCP3", "dev1ch1"),
            ("MCP4", "dev1ch2"),
        ]
        .into_iter()
        .map(|(alias, counter)| (alias.to_owned(), counter.to_owned()))
        .collect()
    }

    fn initialize_experiment(&self) -> anyhow::Result<()> {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        meters.retain(|_, meter| meter.strong_count() > 0);
        for meter in meters.values().filter_map(Weak::upgrade) {
            meter.clear_cache();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{self, Read, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use approx::assert_relative_eq;

    use super::*;

    /// Answers every well-formed request with a fixed response.
    struct FakeMeter {
        answer: Vec<u8>,
        pending: Vec<u8>,
        queries: &'static AtomicUsize,
    }

    fn response(ch1: u32, ch2: u32) -> Vec<u8> {
        let mut r = vec![ACK, RESPONSE_LEN as u8];
        r.extend_from_slice(&ch1.to_le_bytes());
        r.extend_from_slice(&ch2.to_le_bytes());
        r.push(checksum(&r));
        r
    }

    impl Write for FakeMeter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            assert_eq!(buf, [0xA5, 0x08, 0x41, 0x00, 0x16, 0x4E, 0x08, 0x5A]);
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.pending = self.answer.clone();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeMeter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    static SHARED_QUERIES: AtomicUsize = AtomicUsize::new(0);

    /// 12.34 W on channel 1, 5 W on channel 2.
    fn fake_link(_path: &Path) -> anyhow::Result<Box<dyn MeterLink>> {
        Ok(Box::new(FakeMeter {
            answer: response(1234, 500),
            pending: Vec::new(),
            queries: &SHARED_QUERIES,
        }))
    }

    #[test]
    fn request_checksum() {
        assert_eq!(checksum(&READ_ACTIVE_POWER), 0x5A);
    }

    #[test]
    fn decode_response() {
        static QUERIES: AtomicUsize = AtomicUsize::new(0);
        let meter = |answer| FakeMeter {
            answer,
            pending: Vec::new(),
            queries: &QUERIES,
        };

        let [ch1, ch2] = query_power(&mut meter(response(100, 4_000_000))).unwrap();
        assert_relative_eq!(ch1, 1.0);
        assert_relative_eq!(ch2, 40_000.0);

        let mut corrupted = response(1, 2);
        corrupted[4] ^= 0xff;
        assert!(query_power(&mut meter(corrupted)).is_err());

        let mut nack = response(1, 2);
        nack[0] = 0x15;
        assert!(query_power(&mut meter(nack)).is_err());

        // timeout
        assert!(query_power(&mut meter(vec![ACK, 0x0B, 1, 2])).is_err());
        assert_eq!(QUERIES.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn channels_share_one_query_per_tick() -> anyhow::Result<()> {
        let dev = tempfile::tempdir()?;
        fs::write(dev.path().join("ttyACM0"), "")?;
        fs::write(dev.path().join("ttyS0"), "")?;

        let mut source = McpSource::with_links(dev.path(), fake_link);
        assert_eq!(source.detect_available_counters()?, vec!["dev0ch1", "dev0ch2"]);

        let mut ch1 = source.open_counter("dev0ch1")?.expect("should open");
        let mut ch2 = source.open_counter("dev0ch2")?.expect("should open");
        assert!(source.open_counter("dev1ch1")?.is_none());
        assert!(source.open_counter("dev0ch3")?.is_none());
        source.initialize_experiment()?;

        let before = SHARED_QUERIES.load(Ordering::SeqCst);
        assert_relative_eq!(ch1.read()?.watts, 12.34);
        assert_relative_eq!(ch2.read()?.watts, 5.0);
        assert_eq!(SHARED_QUERIES.load(Ordering::SeqCst) - before, 1);

        // the same channel twice in a row queries again
        ch1.read()?;
        ch1.read()?;
        assert_eq!(SHARED_QUERIES.load(Ordering::SeqCst) - before, 3);

        // a new experiment starts without stale values
        source.initialize_experiment()?;
        ch2.read()?;
        assert_eq!(SHARED_QUERIES.load(Ordering::SeqCst) - before, 4);
        Ok(())
    }
}
