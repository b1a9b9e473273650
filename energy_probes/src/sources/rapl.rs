//! Pieces shared by the three ways of reading RAPL: perf_event, powercap and MSR.

use std::{fs, num::ParseIntError, path::Path};

use enum_map::Enum;
use log::debug;

use crate::counter::{EnergyProbe, EnergySample};

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    ///  DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub const ALL: [RaplDomainType; 5] = [
        RaplDomainType::Package,
        RaplDomainType::PP0,
        RaplDomainType::PP1,
        RaplDomainType::Dram,
        RaplDomainType::Platform,
    ];

    /// The name of the counter that exposes this domain, the same for every RAPL source.
    pub fn counter_name(self) -> &'static str {
        match self {
            RaplDomainType::Package => "pkg",
            RaplDomainType::PP0 => "cores",
            RaplDomainType::PP1 => "gpu",
            RaplDomainType::Dram => "ram",
            RaplDomainType::Platform => "psys",
        }
    }

    pub fn from_counter_name(name: &str) -> Option<RaplDomainType> {
        RaplDomainType::ALL.into_iter().find(|d| d.counter_name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Retrieves the CPUs to monitor (one per socket) in order
/// to get RAPL counters.
///
/// `power_device` is the sysfs directory of the RAPL PMU, usually `/sys/devices/power`.
pub fn cpus_to_monitor(power_device: &Path) -> anyhow::Result<Vec<CpuId>> {
    let mask = fs::read_to_string(power_device.join("cpumask"))?;
    parse_cpu_and_socket_list(&mask)
}

fn parse_cpu_and_socket_list(cpulist: &str) -> anyhow::Result<Vec<CpuId>> {
    let cpus = parse_cpu_list(cpulist);

    // here we assume that the cpumask contains one cpu per socket
    let cpus_and_sockets = cpus?
        .into_iter()
        .enumerate()
        .map(|(i, cpu)| CpuId { cpu, socket: i as u32 })
        .collect();

    Ok(cpus_and_sockets)
}

fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    // handles "n" or "start-end"
    fn parse_cpulist_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<Result<Vec<u32>, ParseIntError>>()?;

        match bounds.as_slice() {
            &[start, end] => Ok((start..=end).collect()),
            &[n] => Ok(vec![n]),
            _ => Err(anyhow::anyhow!("invalid cpulist: {}", item)),
        }
    }

    // this can be "0,64" or "0-1" or maybe "0-1,64-66"
    let cpus: Vec<u32> = cpulist
        .trim_end()
        .split(',')
        .map(parse_cpulist_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(cpus)
}

/// A raw hardware energy register, before the energy unit is applied.
pub(crate) trait RawRegister: Send {
    fn read_raw(&mut self) -> anyhow::Result<u64>;
}

/// Turns the successive values of a register that wraps at `max` into a monotonic total.
#[derive(Debug, Clone)]
pub(crate) struct WrapCorrection {
    max: u64,
    previous: Option<u64>,
    total: u64,
}

impl WrapCorrection {
    pub fn new(max: u64) -> WrapCorrection {
        WrapCorrection {
            max,
            previous: None,
            total: 0,
        }
    }

    /// Records a new raw value and returns the corrected total, in raw units,
    /// counted from the first value.
    pub fn push(&mut self, current: u64) -> u64 {
        if let Some(prev) = self.previous {
            let diff = if current < prev {
                // one or more overflow have occured, we cannot know how many,
                // so we correct only one.
                debug!("register wrapped around: {prev} -> {current} (max {})", self.max);
                self.max - prev + current
            } else {
                current - prev
            };
            self.total = self.total.wrapping_add(diff);
        }
        self.previous = Some(current);
        self.total
    }
}

struct TrackedRegister {
    register: Box<dyn RawRegister>,
    /// Joules per raw unit.
    unit: f64,
    correction: WrapCorrection,
}

/// The registers of one RAPL domain across all the sockets, read as a single energy probe.
#[derive(Default)]
pub(crate) struct DomainRegisters {
    registers: Vec<TrackedRegister>,
}

impl DomainRegisters {
    pub fn push(&mut self, register: Box<dyn RawRegister>, unit: f64, max: u64) {
        self.registers.push(TrackedRegister {
            register,
            unit,
            correction: WrapCorrection::new(max),
        });
    }
}

impl EnergyProbe for DomainRegisters {
    fn read_energy(&mut self) -> anyhow::Result<EnergySample> {
        let mut joules = 0.0;
        for reg in &mut self.registers {
            let raw = reg.register.read_raw()?;
            joules += reg.correction.push(raw) as f64 * reg.unit;
        }
        Ok(EnergySample::now(joules))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_parse_cpumask() -> anyhow::Result<()> {
        let single = "0";
        assert_eq!(parse_cpu_and_socket_list(single)?, vec![CpuId { cpu: 0, socket: 0 }]);

        let comma = "0,64\n";
        assert_eq!(
            parse_cpu_and_socket_list(comma)?,
            vec![CpuId { cpu: 0, socket: 0 }, CpuId { cpu: 64, socket: 1 }]
        );

        let combined = "1-3,5-6";
        assert_eq!(
            parse_cpu_and_socket_list(combined)?.iter().map(|c| c.cpu).collect::<Vec<_>>(),
            vec![1, 2, 3, 5, 6]
        );

        assert!(parse_cpu_list("1-2-3").is_err());
        assert!(parse_cpu_list("a").is_err());
        Ok(())
    }

    #[test]
    fn counter_names() {
        for domain in RaplDomainType::ALL {
            assert_eq!(RaplDomainType::from_counter_name(domain.counter_name()), Some(domain));
        }
        assert_eq!(RaplDomainType::from_counter_name("dram"), None);
    }

    #[test]
    fn wrap_correction() {
        let mut c = WrapCorrection::new(1000);
        assert_eq!(c.push(900), 0);
        assert_eq!(c.push(950), 50);
        // wrapped: 1000 - 950 + 20
        assert_eq!(c.push(20), 120);
        assert_eq!(c.push(20), 120);
    }

    struct Replay(VecDeque<u64>);

    impl RawRegister for Replay {
        fn read_raw(&mut self) -> anyhow::Result<u64> {
            self.0.pop_front().ok_or_else(|| anyhow::anyhow!("exhausted"))
        }
    }

    #[test]
    fn domain_registers_sum_the_sockets() {
        let mut domain = DomainRegisters::default();
        domain.push(Box::new(Replay(VecDeque::from([10, 20]))), 0.5, u32::MAX as u64);
        domain.push(Box::new(Replay(VecDeque::from([u32::MAX as u64 - 1, 3]))), 0.25, u32::MAX as u64);

        assert_relative_eq!(domain.read_energy().unwrap().joules, 0.0);
        // socket 0: 10 units of 0.5 J, socket 1: 4 units of 0.25 J after the wrap
        assert_relative_eq!(domain.read_energy().unwrap().joules, 5.0 + 1.0);
        assert!(domain.read_energy().is_err());
    }
}
