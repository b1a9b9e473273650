// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.

use std::{
    fs::File,
    io,
    os::unix::prelude::FileExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context};
use enum_map::{enum_map, EnumMap};
use log::debug;
use regex::Regex;

use crate::counter::{CounterSource, EnergyCounter};
use crate::registry::Source;

use super::rapl::{cpus_to_monitor, CpuId, DomainRegisters, RaplDomainType, RawRegister};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000064D;
}

/// MSR registers' addresses for AMD RAPL domains
mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// Mask to apply when reading the energy values
const MSR_ENERGY_MASK: u64 = 0xffffffff;

/// Maximum value of the MSR counter.
/// Note that this technically depends on the exact hardware, but for our purposes it's good enough.
const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

const POWER_DEVICE_PATH: &str = "/sys/devices/power";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Extract the energy unit from the Model Specific Register `msr`.
///
/// Some architectures use a different unit for some domains (e.g. DRAM),
/// this is not taken into account.
fn read_energy_unit(msr: &File, vendor: RaplVendor) -> io::Result<f64> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    Ok(energy_unit(read_msr(msr, offset)?))
}

/// The "energy status unit" is at bits 12:8 of the power unit register,
/// and the energy unit is `(1/2)^esu` Joules.
fn energy_unit(power_unit_register: u64) -> f64 {
    let esu = (power_unit_register & 0x1F00) >> 8;
    0.5_f64.powi(esu as i32)
}

/// Finds the CPU vendor in the output of `lscpu`.
pub fn cpu_vendor() -> anyhow::Result<RaplVendor> {
    // run: LC_ALL=C lscpu
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;
    parse_vendor(stdout)
}

fn parse_vendor(lscpu_output: &str) -> anyhow::Result<RaplVendor> {
    let vendor_regex = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let vendor = vendor_regex
        .captures(lscpu_output)
        .and_then(|c| c.get(1))
        .context("vendor id not found in lscpu output")?
        .as_str();

    match vendor {
        "AuthenticAMD" => Ok(RaplVendor::Amd),
        "GenuineIntel" => Ok(RaplVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}

pub fn domain_msr_addresses(vendor: RaplVendor) -> EnumMap<RaplDomainType, Option<Addr>> {
    match vendor {
        RaplVendor::Intel => enum_map! {
            RaplDomainType::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomainType::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomainType::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomainType::Platform => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        RaplVendor::Amd => enum_map! {
            RaplDomainType::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomainType::PP1 => None,
            RaplDomainType::Dram => None,
            RaplDomainType::Platform => None,
        },
    }
}

struct MsrRegister {
    fd: File,
    addr: Addr,
}

impl RawRegister for MsrRegister {
    fn read_raw(&mut self) -> anyhow::Result<u64> {
        let msr_value = read_msr(&self.fd, self.addr).with_context(|| format!("failed to read MSR {:#x}", self.addr))?;
        Ok(msr_value & MSR_ENERGY_MASK)
    }
}

/// RAPL energy counters read from the MSR device files (`/dev/cpu/<cpu>/msr`, one CPU per socket).
pub struct MsrSource {
    power_device: PathBuf,
    dev_cpu: PathBuf,
    cpus: Vec<CpuId>,
    vendor: RaplVendor,
    /// Only the domains that could be read during the detection.
    addresses: EnumMap<RaplDomainType, Option<Addr>>,
}

impl MsrSource {
    pub fn new() -> MsrSource {
        MsrSource {
            power_device: PathBuf::from(POWER_DEVICE_PATH),
            dev_cpu: PathBuf::from("/dev/cpu"),
            cpus: Vec::new(),
            vendor: RaplVendor::Intel,
            addresses: EnumMap::default(),
        }
    }

    fn msr_path(&self, cpu: u32) -> PathBuf {
        self.dev_cpu.join(cpu.to_string()).join("msr")
    }

    fn open_msr(&self, cpu: u32) -> anyhow::Result<File> {
        let path = self.msr_path(cpu);
        File::open(&path).with_context(|| format!("open {}", path.to_string_lossy()))
    }
}

impl Default for MsrSource {
    fn default() -> Self {
        MsrSource::new()
    }
}

fn is_permission_denied(path: &Path) -> bool {
    matches!(File::open(path), Err(e) if e.kind() == io::ErrorKind::PermissionDenied)
}

impl Source for MsrSource {
    fn id(&self) -> &str {
        "msr"
    }

    fn detect_available_counters(&mut self) -> anyhow::Result<Vec<String>> {
        let first_msr = self.msr_path(0);
        if !first_msr.exists() || !self.power_device.join("cpumask").exists() {
            debug!("no MSR device in {:?}", self.dev_cpu);
            return Ok(Vec::new());
        }
        if is_permission_denied(&first_msr) {
            debug!("MSR devices are not readable, they require CAP_SYS_RAWIO");
            return Ok(Vec::new());
        }

        self.cpus = cpus_to_monitor(&self.power_device)?;
        self.vendor = cpu_vendor()?;
        let Some(first) = self.cpus.first() else {
            return Ok(Vec::new());
        };
        let msr = self.open_msr(first.cpu)?;

        // keep the registers that actually exist on this model
        self.addresses = domain_msr_addresses(self.vendor);
        for (domain, addr) in self.addresses.iter_mut() {
            if let Some(a) = *addr {
                if let Err(e) = read_msr(&msr, a) {
                    debug!("MSR {a:#x} ({domain:?}) is not readable: {e}");
                    *addr = None;
                }
            }
        }

        Ok(self
            .addresses
            .iter()
            .filter(|(_, addr)| addr.is_some())
            .map(|(domain, _)| domain.counter_name().to_owned())
            .collect())
    }

    fn open_counter(&self, counter: &str) -> anyhow::Result<Option<Box<dyn CounterSource>>> {
        let Some(addr) = RaplDomainType::from_counter_name(counter).and_then(|d| self.addresses[d]) else {
            return Ok(None);
        };
        let mut registers = DomainRegisters::default();
        for CpuId { cpu, .. } in &self.cpus {
            let fd = self.open_msr(*cpu)?;
            let unit = read_energy_unit(&fd, self.vendor)?;
            registers.push(Box::new(MsrRegister { fd, addr }), unit, MSR_MAX_ENERGY);
        }
        Ok(Some(Box::new(EnergyCounter::new(registers))))
    }
}
