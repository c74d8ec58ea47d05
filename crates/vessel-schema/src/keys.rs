//! Static table of configuration keys and their bindings onto `ContainerSpec`.

use crate::device::{CapabilityParams, DeviceGrant};
use crate::limits::{
    parse_pair, parse_size, validate_pair, BarrierLimit, CpuMask, UbResource, Unit, CPUUNITS_MAX,
    CPUUNITS_MIN, UNLIMITED,
};
use crate::net::{IpEntry, VethDevice};
use crate::ordered_set::{Entry, OrderedSet};
use crate::spec::{ContainerSpec, StorageLayout};
use crate::types::ContainerName;
use crate::ConfigError;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

/// A value must fit inside one double-quoted line of a config file.
pub fn check_value(key: &str, value: &str) -> Result<(), ConfigError> {
    match value.chars().find(|&c| c == '"' || (c.is_control() && c != '\t')) {
        Some(c) => Err(ConfigError::invalid(
            key,
            format!("character {c:?} is not allowed in a value"),
        )),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    VePrivate,
    VeRoot,
    MountOpts,
    VeLayout,
    Ostemplate,
    OriginSample,
    Distribution,
    Ub(UbResource),
    VmOvercommit,
    CpuUnits,
    CpuLimit,
    Cpus,
    CpuMask,
    IoPrio,
    DiskQuota,
    DiskSpace,
    DiskInodes,
    QuotaTime,
    QuotaUgidLimit,
    IpAddress,
    Netif,
    Netfilter,
    Devices,
    Capability,
    Hostname,
    Nameserver,
    SearchDomain,
    Onboot,
    BootOrder,
    Name,
    Description,
}

/// Non-counter keys in file order, with their canonical names.
const KEY_TABLE: &[(&str, ConfigKey)] = &[
    ("VE_PRIVATE", ConfigKey::VePrivate),
    ("VE_ROOT", ConfigKey::VeRoot),
    ("MOUNT_OPTS", ConfigKey::MountOpts),
    ("VE_LAYOUT", ConfigKey::VeLayout),
    ("OSTEMPLATE", ConfigKey::Ostemplate),
    ("ORIGIN_SAMPLE", ConfigKey::OriginSample),
    ("DISTRIBUTION", ConfigKey::Distribution),
    ("VM_OVERCOMMIT", ConfigKey::VmOvercommit),
    ("CPUUNITS", ConfigKey::CpuUnits),
    ("CPULIMIT", ConfigKey::CpuLimit),
    ("CPUS", ConfigKey::Cpus),
    ("CPUMASK", ConfigKey::CpuMask),
    ("IOPRIO", ConfigKey::IoPrio),
    ("DISK_QUOTA", ConfigKey::DiskQuota),
    ("DISKSPACE", ConfigKey::DiskSpace),
    ("DISKINODES", ConfigKey::DiskInodes),
    ("QUOTATIME", ConfigKey::QuotaTime),
    ("QUOTAUGIDLIMIT", ConfigKey::QuotaUgidLimit),
    ("IP_ADDRESS", ConfigKey::IpAddress),
    ("NETIF", ConfigKey::Netif),
    ("NETFILTER", ConfigKey::Netfilter),
    ("DEVICES", ConfigKey::Devices),
    ("CAPABILITY", ConfigKey::Capability),
    ("HOSTNAME", ConfigKey::Hostname),
    ("NAMESERVER", ConfigKey::Nameserver),
    ("SEARCHDOMAIN", ConfigKey::SearchDomain),
    ("ONBOOT", ConfigKey::Onboot),
    ("BOOTORDER", ConfigKey::BootOrder),
    ("NAME", ConfigKey::Name),
    ("DESCRIPTION", ConfigKey::Description),
];

/// Old names still accepted on read; saves always use the canonical name.
const ALIASES: &[(&str, ConfigKey)] = &[
    ("CPU_MASK", ConfigKey::CpuMask),
    ("IPADDR", ConfigKey::IpAddress),
    ("NAMESERVERS", ConfigKey::Nameserver),
    ("SEARCHDOMAINS", ConfigKey::SearchDomain),
];

pub fn lookup_key(name: &str) -> Option<ConfigKey> {
    KEY_TABLE
        .iter()
        .chain(ALIASES)
        .find(|(n, _)| *n == name)
        .map(|(_, k)| *k)
        .or_else(|| UbResource::from_name(name).map(ConfigKey::Ub))
}

fn bad(key: ConfigKey, message: impl Into<String>) -> ConfigError {
    ConfigError::invalid(key.name(), message)
}

fn parse_yes_no(key: ConfigKey, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(bad(key, format!("'{other}' must be yes or no"))),
    }
}

fn yes_no(v: bool) -> String {
    let s = if v { "yes" } else { "no" };
    s.to_owned()
}

fn parse_num<T: FromStr>(key: ConfigKey, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| bad(key, format!("'{value}' is not a valid number")))
}

fn parse_tokens<T: Entry + FromStr<Err = String>>(
    key: ConfigKey,
    value: &str,
    sep: fn(char) -> bool,
) -> Result<OrderedSet<T>, ConfigError> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<T>().map_err(|e| bad(key, e)))
        .collect()
}

fn join<T: Display>(set: &OrderedSet<T>, sep: &str) -> Option<String> {
    if set.is_empty() {
        return None;
    }
    Some(
        set.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(sep),
    )
}

fn validate_hostname(key: ConfigKey, value: &str) -> Result<(), ConfigError> {
    let ok = !value.is_empty()
        && value.len() <= 253
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(bad(key, format!("'{value}' is not a valid hostname")))
    }
}

/// KB-denominated disk limits: bare numbers are 1K blocks, suffixes are bytes.
fn parse_kb_pair(key: ConfigKey, value: &str) -> Result<BarrierLimit, ConfigError> {
    let one = |v: &str| -> Result<u64, ConfigError> {
        let v = v.trim();
        if v.bytes().all(|b| b.is_ascii_digit()) && !v.is_empty() {
            return parse_num(key, v);
        }
        let bytes = parse_size(v, Unit::Bytes).map_err(|e| bad(key, e))?;
        Ok(if bytes == UNLIMITED {
            bytes
        } else {
            bytes.div_ceil(1024)
        })
    };
    let bl = match value.split_once(':') {
        Some((b, l)) => BarrierLimit::new(one(b)?, one(l)?),
        None => {
            let v = one(value)?;
            BarrierLimit::new(v, v)
        }
    };
    validate_pair(key.name(), bl.barrier, bl.limit)?;
    Ok(bl)
}

impl ConfigKey {
    /// Every key in canonical save order.
    pub fn all() -> impl Iterator<Item = ConfigKey> {
        KEY_TABLE
            .iter()
            .take(7)
            .map(|(_, k)| *k)
            .chain(UbResource::ALL.iter().map(|r| ConfigKey::Ub(*r)))
            .chain(KEY_TABLE.iter().skip(7).map(|(_, k)| *k))
    }

    pub fn name(self) -> &'static str {
        if let ConfigKey::Ub(r) = self {
            return r.name();
        }
        KEY_TABLE
            .iter()
            .find(|(_, k)| *k == self)
            .map_or("", |(n, _)| n)
    }

    /// Store one file or command-line value into `spec`.
    pub fn apply(self, spec: &mut ContainerSpec, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        check_value(self.name(), value)?;
        let text = || Some(value.to_owned()).filter(|v| !v.is_empty());
        match self {
            ConfigKey::VePrivate => spec.fs.private = text().map(PathBuf::from),
            ConfigKey::VeRoot => spec.fs.root = text().map(PathBuf::from),
            ConfigKey::MountOpts => spec.fs.mount_opts = text(),
            ConfigKey::VeLayout => {
                spec.fs.layout = Some(value.parse::<StorageLayout>().map_err(|e| bad(self, e))?);
            }
            ConfigKey::Ostemplate => {
                if value.contains('/') {
                    return Err(bad(self, "template name must not contain '/'"));
                }
                spec.template.ostemplate = text();
            }
            ConfigKey::OriginSample => spec.template.origin_sample = text(),
            ConfigKey::Distribution => spec.template.dist = text(),
            ConfigKey::Ub(res) => {
                let bl = parse_pair(value, res.unit()).map_err(|e| bad(self, e))?;
                validate_pair(res.name(), bl.barrier, bl.limit)?;
                spec.res.set(res, bl);
            }
            ConfigKey::VmOvercommit => {
                let oc: f64 = parse_num(self, value)?;
                if !(oc.is_finite() && oc >= 1.0) {
                    return Err(bad(self, format!("{value} must be a number >= 1")));
                }
                spec.res.vm_overcommit = Some(oc);
            }
            ConfigKey::CpuUnits => {
                let u: u32 = parse_num(self, value)?;
                if !(CPUUNITS_MIN..=CPUUNITS_MAX).contains(&u) {
                    return Err(bad(
                        self,
                        format!("{u} not in {CPUUNITS_MIN}..={CPUUNITS_MAX}"),
                    ));
                }
                spec.cpu.units = Some(u);
            }
            ConfigKey::CpuLimit => {
                spec.cpu.limit = Some(parse_num(self, value.trim_end_matches('%'))?);
            }
            ConfigKey::Cpus => {
                if value == "0" || value == "unlimited" {
                    spec.cpu.vcpus = None;
                } else {
                    spec.cpu.vcpus = Some(parse_num(self, value)?);
                }
            }
            ConfigKey::CpuMask => {
                spec.cpu.mask = Some(value.parse::<CpuMask>().map_err(|e| bad(self, e))?);
            }
            ConfigKey::IoPrio => {
                let p: u8 = parse_num(self, value)?;
                if p > 7 {
                    return Err(bad(self, format!("{p} not in 0..=7")));
                }
                spec.ioprio = Some(p);
            }
            ConfigKey::DiskQuota => spec.quota.enabled = Some(parse_yes_no(self, value)?),
            ConfigKey::DiskSpace => spec.quota.diskspace = Some(parse_kb_pair(self, value)?),
            ConfigKey::DiskInodes => {
                let bl = parse_pair(value, Unit::Count).map_err(|e| bad(self, e))?;
                validate_pair(self.name(), bl.barrier, bl.limit)?;
                spec.quota.diskinodes = Some(bl);
            }
            ConfigKey::QuotaTime => spec.quota.quotatime = Some(parse_num(self, value)?),
            ConfigKey::QuotaUgidLimit => spec.quota.ugidlimit = Some(parse_num(self, value)?),
            ConfigKey::IpAddress => {
                spec.net.ip.items = parse_tokens::<IpEntry>(self, value, char::is_whitespace)?;
            }
            ConfigKey::Netif => {
                spec.net.veth.items = parse_tokens::<VethDevice>(self, value, |c| c == ';')?;
            }
            ConfigKey::Netfilter => {
                spec.net.netfilter = Some(value.parse().map_err(|e| bad(self, e))?);
            }
            ConfigKey::Devices => {
                spec.devices.items = parse_tokens::<DeviceGrant>(self, value, char::is_whitespace)?;
            }
            ConfigKey::Capability => {
                let mut caps = CapabilityParams::default();
                for token in value.split_whitespace() {
                    caps.apply_token(token).map_err(|e| bad(self, e))?;
                }
                spec.caps = caps;
            }
            ConfigKey::Hostname => {
                validate_hostname(self, value)?;
                spec.misc.hostname = text();
            }
            ConfigKey::Nameserver => {
                let servers = parse_tokens::<IpEntry>(self, value, char::is_whitespace)?;
                spec.misc.nameserver.items = servers.iter().map(|e| e.addr.to_string()).collect();
            }
            ConfigKey::SearchDomain => {
                spec.misc.searchdomain.items =
                    value.split_whitespace().map(str::to_owned).collect();
            }
            ConfigKey::Onboot => spec.misc.onboot = Some(parse_yes_no(self, value)?),
            ConfigKey::BootOrder => spec.misc.bootorder = Some(parse_num(self, value)?),
            ConfigKey::Name => {
                if value.is_empty() {
                    spec.misc.name = None;
                } else {
                    spec.misc.name = Some(ContainerName::new(value)?.into_inner());
                }
            }
            ConfigKey::Description => spec.misc.description = text(),
        }
        Ok(())
    }

    /// The value this key would be saved with, or `None` when unset.
    pub fn render(self, spec: &ContainerSpec) -> Option<String> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
        match self {
            ConfigKey::VePrivate => path(&spec.fs.private),
            ConfigKey::VeRoot => path(&spec.fs.root),
            ConfigKey::MountOpts => spec.fs.mount_opts.clone(),
            ConfigKey::VeLayout => spec.fs.layout.map(|l| l.to_string()),
            ConfigKey::Ostemplate => spec.template.ostemplate.clone(),
            ConfigKey::OriginSample => spec.template.origin_sample.clone(),
            ConfigKey::Distribution => spec.template.dist.clone(),
            ConfigKey::Ub(res) => spec.res.get(res).map(|bl| bl.to_string()),
            ConfigKey::VmOvercommit => spec.res.vm_overcommit.map(|oc| oc.to_string()),
            ConfigKey::CpuUnits => spec.cpu.units.map(|u| u.to_string()),
            ConfigKey::CpuLimit => spec.cpu.limit.map(|u| u.to_string()),
            ConfigKey::Cpus => spec.cpu.vcpus.map(|u| u.to_string()),
            ConfigKey::CpuMask => spec.cpu.mask.as_ref().map(ToString::to_string),
            ConfigKey::IoPrio => spec.ioprio.map(|p| p.to_string()),
            ConfigKey::DiskQuota => spec.quota.enabled.map(yes_no),
            ConfigKey::DiskSpace => spec.quota.diskspace.map(|bl| bl.to_string()),
            ConfigKey::DiskInodes => spec.quota.diskinodes.map(|bl| bl.to_string()),
            ConfigKey::QuotaTime => spec.quota.quotatime.map(|t| t.to_string()),
            ConfigKey::QuotaUgidLimit => spec.quota.ugidlimit.map(|t| t.to_string()),
            ConfigKey::IpAddress => join(&spec.net.ip.items, " "),
            ConfigKey::Netif => join(&spec.net.veth.items, ";"),
            ConfigKey::Netfilter => spec.net.netfilter.map(|n| n.to_string()),
            ConfigKey::Devices => join(&spec.devices.items, " "),
            ConfigKey::Capability => {
                let tokens = spec.caps.tokens();
                (!tokens.is_empty()).then(|| tokens.join(" "))
            }
            ConfigKey::Hostname => spec.misc.hostname.clone(),
            ConfigKey::Nameserver => join(&spec.misc.nameserver.items, " "),
            ConfigKey::SearchDomain => join(&spec.misc.searchdomain.items, " "),
            ConfigKey::Onboot => spec.misc.onboot.map(yes_no),
            ConfigKey::BootOrder => spec.misc.bootorder.map(|b| b.to_string()),
            ConfigKey::Name => spec.misc.name.clone(),
            ConfigKey::Description => spec.misc.description.clone(),
        }
    }
}
