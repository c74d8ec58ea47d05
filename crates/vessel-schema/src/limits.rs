//! Barrier/limit resource counters, CPU parameters, and derived limits.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Sentinel for "no limit".
pub const UNLIMITED: u64 = u64::MAX;

/// Page size used to convert byte-suffixed values for page-denominated counters.
pub const PAGE_SIZE: u64 = 4096;

/// What a counter is measured in; decides which size suffixes apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bytes,
    Pages,
    Count,
}

macro_rules! ub_resources {
    ($($variant:ident => $name:literal, $unit:ident;)*) => {
        /// Kernel resource counters carrying a barrier/limit pair.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum UbResource {
            $($variant,)*
        }

        impl UbResource {
            pub const ALL: &'static [UbResource] = &[$(UbResource::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(UbResource::$variant => $name,)*
                }
            }

            pub fn unit(self) -> Unit {
                match self {
                    $(UbResource::$variant => Unit::$unit,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(UbResource::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

ub_resources! {
    Kmemsize => "KMEMSIZE", Bytes;
    Lockedpages => "LOCKEDPAGES", Pages;
    Privvmpages => "PRIVVMPAGES", Pages;
    Shmpages => "SHMPAGES", Pages;
    Numproc => "NUMPROC", Count;
    Physpages => "PHYSPAGES", Pages;
    Vmguarpages => "VMGUARPAGES", Pages;
    Oomguarpages => "OOMGUARPAGES", Pages;
    Numtcpsock => "NUMTCPSOCK", Count;
    Numflock => "NUMFLOCK", Count;
    Numpty => "NUMPTY", Count;
    Numsiginfo => "NUMSIGINFO", Count;
    Tcpsndbuf => "TCPSNDBUF", Bytes;
    Tcprcvbuf => "TCPRCVBUF", Bytes;
    Othersockbuf => "OTHERSOCKBUF", Bytes;
    Dgramrcvbuf => "DGRAMRCVBUF", Bytes;
    Numothersock => "NUMOTHERSOCK", Count;
    Dcachesize => "DCACHESIZE", Bytes;
    Numfile => "NUMFILE", Count;
    Numiptent => "NUMIPTENT", Count;
    Swappages => "SWAPPAGES", Pages;
}

impl fmt::Display for UbResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parse one size with an optional suffix.
///
/// `K M G T` are binary byte multiples, `P` is pages. Values that overflow
/// saturate to [`UNLIMITED`].
pub fn parse_size(value: &str, unit: Unit) -> Result<u64, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(UNLIMITED);
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("'{value}' is not a number"));
    }
    let n: u64 = match digits.parse() {
        Ok(n) => n,
        Err(_) => return Ok(UNLIMITED),
    };
    let bytes_mult = match suffix {
        "" => return Ok(n),
        "K" | "k" => 1u64 << 10,
        "M" | "m" => 1u64 << 20,
        "G" | "g" => 1u64 << 30,
        "T" | "t" => 1u64 << 40,
        "P" | "p" => {
            return match unit {
                Unit::Pages => Ok(n),
                Unit::Bytes => Ok(n.checked_mul(PAGE_SIZE).unwrap_or(UNLIMITED)),
                Unit::Count => Err(format!("suffix 'P' not allowed in '{value}'")),
            }
        }
        other => return Err(format!("unknown suffix '{other}' in '{value}'")),
    };
    let bytes = n.checked_mul(bytes_mult).unwrap_or(UNLIMITED);
    match unit {
        Unit::Bytes => Ok(bytes),
        Unit::Pages if bytes == UNLIMITED => Ok(UNLIMITED),
        Unit::Pages => Ok(bytes.div_ceil(PAGE_SIZE)),
        Unit::Count => Err(format!("size suffix not allowed in '{value}'")),
    }
}

fn format_value(v: u64) -> String {
    if v == UNLIMITED {
        "unlimited".to_owned()
    } else {
        v.to_string()
    }
}

/// A soft (barrier) and hard (limit) threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierLimit {
    pub barrier: u64,
    pub limit: u64,
}

impl BarrierLimit {
    pub const fn new(barrier: u64, limit: u64) -> Self {
        Self { barrier, limit }
    }

    pub const fn unlimited() -> Self {
        Self::new(UNLIMITED, UNLIMITED)
    }
}

impl fmt::Display for BarrierLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", format_value(self.barrier), format_value(self.limit))
    }
}

/// Parse `BAR:LIM`, or a bare value meaning barrier = limit.
pub fn parse_pair(value: &str, unit: Unit) -> Result<BarrierLimit, String> {
    match value.split_once(':') {
        Some((b, l)) => Ok(BarrierLimit::new(parse_size(b, unit)?, parse_size(l, unit)?)),
        None => {
            let v = parse_size(value, unit)?;
            Ok(BarrierLimit::new(v, v))
        }
    }
}

pub fn validate_pair(name: &str, barrier: u64, limit: u64) -> Result<(), ConfigError> {
    if barrier > limit {
        return Err(ConfigError::invalid(
            name,
            format!(
                "barrier {} exceeds limit {}",
                format_value(barrier),
                format_value(limit)
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    #[serde(default)]
    pub ub: BTreeMap<UbResource, BarrierLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_overcommit: Option<f64>,
}

impl ResourceSet {
    pub fn get(&self, res: UbResource) -> Option<BarrierLimit> {
        self.ub.get(&res).copied()
    }

    pub fn set(&mut self, res: UbResource, value: BarrierLimit) {
        self.ub.insert(res, value);
    }

    pub fn is_empty(&self) -> bool {
        self.ub.is_empty() && self.vm_overcommit.is_none()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (res, bl) in &self.ub {
            validate_pair(res.name(), bl.barrier, bl.limit)?;
        }
        if let Some(oc) = self.vm_overcommit {
            if !(oc.is_finite() && oc >= 1.0) {
                return Err(ConfigError::invalid(
                    "VM_OVERCOMMIT",
                    format!("overcommit factor {oc} must be >= 1"),
                ));
            }
        }
        Ok(())
    }
}

fn sat_add(a: u64, b: u64) -> u64 {
    if a == UNLIMITED || b == UNLIMITED {
        UNLIMITED
    } else {
        a.saturating_add(b)
    }
}

fn scale(v: u64, num: u64, den: u64) -> u64 {
    if v == UNLIMITED {
        return UNLIMITED;
    }
    let r = u128::from(v) * u128::from(num) / u128::from(den);
    u64::try_from(r).unwrap_or(UNLIMITED)
}

/// Fill unset memory counters from `PHYSPAGES` and `SWAPPAGES` limits.
///
/// Runs once on the fully merged set. Returns the counters it filled; an
/// empty result means the simplified inputs were absent.
pub fn compute_derived(res: &mut ResourceSet) -> Vec<UbResource> {
    let (Some(ram), Some(swap)) = (
        res.get(UbResource::Physpages).map(|p| p.limit),
        res.get(UbResource::Swappages).map(|p| p.limit),
    ) else {
        return Vec::new();
    };
    let total = sat_add(ram, swap);
    let privvm = match res.vm_overcommit {
        Some(oc) if total != UNLIMITED => {
            let v = (total as f64 * oc).floor();
            let v = if v >= UNLIMITED as f64 { UNLIMITED } else { v as u64 };
            BarrierLimit::new(v, v)
        }
        _ => BarrierLimit::unlimited(),
    };
    let candidates = [
        (UbResource::Lockedpages, BarrierLimit::new(ram, ram)),
        (UbResource::Oomguarpages, BarrierLimit::new(ram, UNLIMITED)),
        (UbResource::Vmguarpages, BarrierLimit::new(total, UNLIMITED)),
        (UbResource::Privvmpages, privvm),
        (
            UbResource::Kmemsize,
            BarrierLimit::new(scale(ram, PAGE_SIZE, 10), scale(ram, PAGE_SIZE * 11, 100)),
        ),
    ];
    let mut filled = Vec::new();
    for (name, value) in candidates {
        if !res.ub.contains_key(&name) {
            res.ub.insert(name, value);
            filled.push(name);
        }
    }
    filled
}

/// CPU affinity mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuMask {
    All,
    List(BTreeSet<u32>),
}

impl FromStr for CpuMask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "all" {
            return Ok(Self::All);
        }
        let mut cpus = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            let bad = || format!("invalid cpu mask element '{part}'");
            match part.split_once('-') {
                Some((a, b)) => {
                    let a: u32 = a.parse().map_err(|_| bad())?;
                    let b: u32 = b.parse().map_err(|_| bad())?;
                    if a > b || b - a > 4096 {
                        return Err(bad());
                    }
                    cpus.extend(a..=b);
                }
                None => {
                    cpus.insert(part.parse().map_err(|_| bad())?);
                }
            }
        }
        if cpus.is_empty() {
            return Err("empty cpu mask".to_owned());
        }
        Ok(Self::List(cpus))
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpus = match self {
            Self::All => return f.write_str("all"),
            Self::List(c) => c,
        };
        let mut parts = Vec::new();
        let mut iter = cpus.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{start}-{end}"));
            }
        }
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<CpuMask>,
}

pub const CPUUNITS_MIN: u32 = 8;
pub const CPUUNITS_MAX: u32 = 500_000;

impl CpuParams {
    pub fn is_empty(&self) -> bool {
        self.units.is_none() && self.limit.is_none() && self.vcpus.is_none() && self.mask.is_none()
    }

    /// `host_cpus` bounds `CPULIMIT` when `CPUS` is unset.
    pub fn validate(&self, host_cpus: u32) -> Result<(), ConfigError> {
        if let Some(u) = self.units {
            if !(CPUUNITS_MIN..=CPUUNITS_MAX).contains(&u) {
                return Err(ConfigError::invalid(
                    "CPUUNITS",
                    format!("{u} not in {CPUUNITS_MIN}..={CPUUNITS_MAX}"),
                ));
            }
        }
        if self.vcpus == Some(0) {
            return Err(ConfigError::invalid("CPUS", "must be at least 1"));
        }
        if let Some(l) = self.limit {
            let cpus = self.vcpus.unwrap_or(host_cpus).max(1);
            if l > cpus.saturating_mul(100) {
                return Err(ConfigError::invalid(
                    "CPULIMIT",
                    format!("{l}% exceeds {cpus} cpu(s)"),
                ));
            }
        }
        Ok(())
    }
}
