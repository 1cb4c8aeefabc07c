//! Host resource checks for the `n_cpus` and `mem_gb`/`mem_mb` parameters.
//!
//! Requests that the host cannot satisfy are clamped and reported as
//! warnings; the run always proceeds. A request below the pipeline's
//! memory floor is reported but left untouched.
//!
//! The host is queried on every call to [`validate`], never cached.

use crate::types::{OptionValue, ParamMap};
use std::fmt;
use std::io;
use tracing::warn;

/// Minimum memory (GB) the pipeline is expected to need.
pub const MEMORY_FLOOR_GB: f64 = 6.0;

/// Fraction of total host memory used when a request exceeds the host.
pub const MEMORY_HEADROOM_FRACTION: f64 = 0.9;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Snapshot of host capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpu_count: u64,
    pub total_memory_bytes: u64,
}

impl HostResources {
    pub fn total_memory(&self, unit: MemoryUnit) -> f64 {
        self.total_memory_bytes as f64 / unit.bytes()
    }
}

/// Source of host capacity.
pub trait HostProbe {
    fn snapshot(&self) -> io::Result<HostResources>;
}

/// Probe for the machine this process runs on.
///
/// CPUs come from the scheduler's view of available parallelism; memory
/// from `MemTotal` in `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveHost;

impl HostProbe for LiveHost {
    fn snapshot(&self) -> io::Result<HostResources> {
        let cpu_count = std::thread::available_parallelism()?.get() as u64;
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        let total_memory_bytes = parse_meminfo_total(&meminfo).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "MemTotal missing from /proc/meminfo")
        })?;
        Ok(HostResources {
            cpu_count,
            total_memory_bytes,
        })
    }
}

/// Extract `MemTotal` (reported in kB) as bytes.
fn parse_meminfo_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Probe returning a fixed snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FixedHost(pub HostResources);

impl HostProbe for FixedHost {
    fn snapshot(&self) -> io::Result<HostResources> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    Gb,
    Mb,
}

impl MemoryUnit {
    pub fn key(self) -> &'static str {
        match self {
            Self::Gb => "mem_gb",
            Self::Mb => "mem_mb",
        }
    }

    fn bytes(self) -> f64 {
        match self {
            Self::Gb => BYTES_PER_GB,
            Self::Mb => BYTES_PER_MB,
        }
    }

    fn floor(self) -> f64 {
        match self {
            Self::Gb => MEMORY_FLOOR_GB,
            Self::Mb => MEMORY_FLOOR_GB * 1024.0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Gb => "GB",
            Self::Mb => "MB",
        }
    }
}

/// A correction or caution raised while checking resource parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceWarning {
    NegativeCpus {
        requested: f64,
        clamped_to: u64,
    },
    CpusExceedHost {
        requested: f64,
        clamped_to: u64,
    },
    NegativeMemory {
        unit: MemoryUnit,
        requested: f64,
        clamped_to: f64,
    },
    MemoryBelowFloor {
        unit: MemoryUnit,
        requested: f64,
    },
    MemoryExceedsHost {
        unit: MemoryUnit,
        requested: f64,
        clamped_to: f64,
    },
}

impl fmt::Display for ResourceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeCpus { clamped_to, .. } => write!(
                f,
                "negative number of cpus requested; assuming host maximum of {clamped_to}"
            ),
            Self::CpusExceedHost {
                requested,
                clamped_to,
            } => write!(
                f,
                "requested {requested} cpus but the host has {clamped_to}; assuming host maximum"
            ),
            Self::NegativeMemory {
                unit, clamped_to, ..
            } => write!(
                f,
                "negative amount of memory requested; assuming host maximum of {clamped_to:.2} {}",
                unit.label()
            ),
            Self::MemoryBelowFloor { unit, requested } => write!(
                f,
                "requested {requested} {} is below the default of 6 GB; the pipeline may crash",
                unit.label()
            ),
            Self::MemoryExceedsHost {
                unit,
                requested,
                clamped_to,
            } => write!(
                f,
                "requested {requested} {unit} exceeds host memory; setting to 90 percent of host maximum, {clamped_to:.2} {unit}",
                unit = unit.label()
            ),
        }
    }
}

/// Check resource parameters against the host, clamping in place.
///
/// Returns every warning raised; each one is also logged. If the host
/// cannot be queried the parameters are left untouched.
pub fn validate(params: &mut ParamMap, host: &dyn HostProbe) -> Vec<ResourceWarning> {
    let resources = match host.snapshot() {
        Ok(resources) => resources,
        Err(err) => {
            warn!(error = %err, "could not query host resources; skipping resource checks");
            return Vec::new();
        }
    };

    let mut warnings = Vec::new();
    warnings.extend(check_cpus(params, &resources));

    // mem_gb takes precedence; mem_mb is only looked at when mem_gb is absent.
    if params.contains_key(MemoryUnit::Gb.key()) {
        warnings.extend(check_memory(params, &resources, MemoryUnit::Gb));
    } else if params.contains_key(MemoryUnit::Mb.key()) {
        warnings.extend(check_memory(params, &resources, MemoryUnit::Mb));
    }

    for warning in &warnings {
        warn!(%warning, "resource request adjusted");
    }
    warnings
}

fn check_cpus(params: &mut ParamMap, host: &HostResources) -> Option<ResourceWarning> {
    let requested = params.get("n_cpus")?.as_number()?.as_f64();
    let max = host.cpu_count;

    let warning = if requested < 0.0 {
        ResourceWarning::NegativeCpus {
            requested,
            clamped_to: max,
        }
    } else if requested > max as f64 {
        ResourceWarning::CpusExceedHost {
            requested,
            clamped_to: max,
        }
    } else {
        return None;
    };

    params.insert("n_cpus".to_string(), OptionValue::int(max as i64));
    Some(warning)
}

fn check_memory(
    params: &mut ParamMap,
    host: &HostResources,
    unit: MemoryUnit,
) -> Option<ResourceWarning> {
    let key = unit.key();
    let requested = params.get(key)?.as_number()?.as_f64();
    let total = host.total_memory(unit);

    if requested < 0.0 {
        params.insert(key.to_string(), OptionValue::float(total));
        Some(ResourceWarning::NegativeMemory {
            unit,
            requested,
            clamped_to: total,
        })
    } else if requested < unit.floor() {
        Some(ResourceWarning::MemoryBelowFloor { unit, requested })
    } else if requested > total {
        let clamped_to = total * MEMORY_HEADROOM_FRACTION;
        params.insert(key.to_string(), OptionValue::float(clamped_to));
        Some(ResourceWarning::MemoryExceedsHost {
            unit,
            requested,
            clamped_to,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn host(cpus: u64, mem_gb: u64) -> FixedHost {
        FixedHost(HostResources {
            cpu_count: cpus,
            total_memory_bytes: mem_gb * GIB,
        })
    }

    fn params(entries: &[(&str, OptionValue)]) -> ParamMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn negative_cpus_clamp_to_host() {
        let mut p = params(&[("n_cpus", OptionValue::int(-2))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert_eq!(p["n_cpus"], OptionValue::int(4));
        assert_eq!(
            warnings,
            vec![ResourceWarning::NegativeCpus {
                requested: -2.0,
                clamped_to: 4
            }]
        );
    }

    #[test]
    fn excess_cpus_clamp_to_host() {
        let mut p = params(&[("n_cpus", OptionValue::int(100))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert_eq!(p["n_cpus"], OptionValue::int(4));
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], ResourceWarning::CpusExceedHost { .. }));
    }

    #[test]
    fn cpus_within_host_are_untouched() {
        let mut p = params(&[("n_cpus", OptionValue::int(3))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert_eq!(p["n_cpus"], OptionValue::int(3));
        assert!(warnings.is_empty());
    }

    #[test]
    fn excess_memory_clamps_to_ninety_percent_of_total() {
        let mut p = params(&[("mem_gb", OptionValue::int(20))]);
        let warnings = validate(&mut p, &host(4, 16));

        let clamped = p["mem_gb"].as_number().unwrap().as_f64();
        assert!((clamped - 14.4).abs() < 1e-9);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            warnings[0],
            ResourceWarning::MemoryExceedsHost {
                unit: MemoryUnit::Gb,
                ..
            }
        ));
    }

    #[test]
    fn memory_below_floor_warns_without_clamping() {
        let mut p = params(&[("mem_gb", OptionValue::int(4))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert_eq!(p["mem_gb"], OptionValue::int(4));
        assert_eq!(
            warnings,
            vec![ResourceWarning::MemoryBelowFloor {
                unit: MemoryUnit::Gb,
                requested: 4.0
            }]
        );
    }

    #[test]
    fn negative_memory_clamps_to_total() {
        let mut p = params(&[("mem_mb", OptionValue::int(-1))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert_eq!(p["mem_mb"], OptionValue::float(16.0 * 1024.0));
        assert!(!p.contains_key("mem_gb"));
        assert!(matches!(
            warnings[0],
            ResourceWarning::NegativeMemory {
                unit: MemoryUnit::Mb,
                ..
            }
        ));
    }

    #[test]
    fn mem_gb_takes_precedence_over_mem_mb() {
        let mut p = params(&[
            ("mem_gb", OptionValue::int(8)),
            ("mem_mb", OptionValue::int(999_999)),
        ]);
        let warnings = validate(&mut p, &host(4, 16));
        assert!(warnings.is_empty());
        assert_eq!(p["mem_mb"], OptionValue::int(999_999));
    }

    #[test]
    fn mem_mb_checked_when_mem_gb_absent() {
        let mut p = params(&[("mem_mb", OptionValue::int(32 * 1024))]);
        let warnings = validate(&mut p, &host(4, 16));
        let clamped = p["mem_mb"].as_number().unwrap().as_f64();
        assert!((clamped - 16.0 * 1024.0 * 0.9).abs() < 1e-6);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn non_numeric_resource_values_are_ignored() {
        let mut p = params(&[("n_cpus", OptionValue::text("all"))]);
        let warnings = validate(&mut p, &host(4, 16));
        assert!(warnings.is_empty());
        assert_eq!(p["n_cpus"], OptionValue::text("all"));
    }

    struct CountingHost {
        calls: Cell<u32>,
    }

    impl HostProbe for CountingHost {
        fn snapshot(&self) -> io::Result<HostResources> {
            self.calls.set(self.calls.get() + 1);
            Ok(HostResources {
                cpu_count: 2,
                total_memory_bytes: 8 * GIB,
            })
        }
    }

    #[test]
    fn host_is_queried_on_every_validation() {
        let probe = CountingHost {
            calls: Cell::new(0),
        };
        let mut p = params(&[("n_cpus", OptionValue::int(1))]);
        validate(&mut p, &probe);
        validate(&mut p, &probe);
        assert_eq!(probe.calls.get(), 2);
    }

    struct BrokenHost;

    impl HostProbe for BrokenHost {
        fn snapshot(&self) -> io::Result<HostResources> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no /proc"))
        }
    }

    #[test]
    fn unreadable_host_leaves_params_alone() {
        let mut p = params(&[("n_cpus", OptionValue::int(1000))]);
        let warnings = validate(&mut p, &BrokenHost);
        assert!(warnings.is_empty());
        assert_eq!(p["n_cpus"], OptionValue::int(1000));
    }

    #[test]
    fn meminfo_total_is_parsed_in_bytes() {
        let content = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(content), Some(16_318_480 * 1024));
        assert_eq!(parse_meminfo_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn live_host_reports_something() {
        if let Ok(resources) = LiveHost.snapshot() {
            assert!(resources.cpu_count >= 1);
            assert!(resources.total_memory_bytes > 0);
        }
    }
}
