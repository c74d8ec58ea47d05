//! Network identity entries: IP addresses, veth pairs, netfilter mode.

use crate::ordered_set::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An address with an optional prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub addr: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<u8>,
}

impl IpEntry {
    pub fn new(addr: IpAddr, prefix: Option<u8>) -> Self {
        Self { addr, prefix }
    }

    fn max_prefix(addr: IpAddr) -> u8 {
        if addr.is_ipv4() {
            32
        } else {
            128
        }
    }
}

fn netmask_to_prefix(mask: &str) -> Option<u8> {
    let m: std::net::Ipv4Addr = mask.parse().ok()?;
    let bits = u32::from(m);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return None;
    }
    Some(ones as u8)
}

impl FromStr for IpEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, mask) = match s.split_once('/') {
            Some((a, m)) => (a, Some(m)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("'{s}' is not an IP address"))?;
        let prefix = match mask {
            None => None,
            Some(m) if m.contains('.') && addr.is_ipv4() => {
                Some(netmask_to_prefix(m).ok_or_else(|| format!("invalid netmask in '{s}'"))?)
            }
            Some(m) => {
                let p: u8 = m.parse().map_err(|_| format!("invalid prefix in '{s}'"))?;
                if p > Self::max_prefix(addr) {
                    return Err(format!("prefix /{p} too long in '{s}'"));
                }
                Some(p)
            }
        };
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            Some(p) => write!(f, "{}/{p}", self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl Entry for IpEntry {
    fn same_entry(&self, other: &Self) -> bool {
        self.addr == other.addr
    }

    /// The mask is ignored unless both sides carry one and they differ.
    fn matches(&self, pattern: &Self) -> bool {
        self.addr == pattern.addr
            && match (self.prefix, pattern.prefix) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// A host/guest virtual ethernet pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethDevice {
    pub guest_ifname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ifname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

impl VethDevice {
    pub fn named(guest_ifname: &str) -> Self {
        Self {
            guest_ifname: guest_ifname.to_owned(),
            guest_mac: None,
            host_ifname: None,
            host_mac: None,
            bridge: None,
        }
    }
}

pub fn validate_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn validate_ifname(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 16
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

impl FromStr for VethDevice {
    type Err = String;

    /// Accepts `ifname=eth0,mac=..,host_ifname=..,host_mac=..,bridge=..`
    /// or the positional form `eth0,mac,host_ifname,host_mac,bridge`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        let mut dev = VethDevice::named("");
        if fields.iter().any(|f| f.contains('=')) {
            for f in &fields {
                let (k, v) = f
                    .split_once('=')
                    .ok_or_else(|| format!("malformed veth field '{f}'"))?;
                let v = Some(v.to_owned()).filter(|v| !v.is_empty());
                match k {
                    "ifname" => dev.guest_ifname = v.unwrap_or_default(),
                    "mac" => dev.guest_mac = v,
                    "host_ifname" => dev.host_ifname = v,
                    "host_mac" => dev.host_mac = v,
                    "bridge" => dev.bridge = v,
                    other => return Err(format!("unknown veth field '{other}'")),
                }
            }
        } else {
            if fields.len() > 5 {
                return Err(format!("too many veth fields in '{s}'"));
            }
            let at = |i: usize| {
                fields
                    .get(i)
                    .filter(|v| !v.is_empty())
                    .map(|v| (*v).to_owned())
            };
            dev.guest_ifname = at(0).unwrap_or_default();
            dev.guest_mac = at(1);
            dev.host_ifname = at(2);
            dev.host_mac = at(3);
            dev.bridge = at(4);
        }
        if !validate_ifname(&dev.guest_ifname) {
            return Err(format!("invalid interface name in '{s}'"));
        }
        if let Some(h) = &dev.host_ifname {
            if !validate_ifname(h) {
                return Err(format!("invalid host interface name '{h}'"));
            }
        }
        for mac in [&dev.guest_mac, &dev.host_mac].into_iter().flatten() {
            if !validate_mac(mac) {
                return Err(format!("invalid MAC address '{mac}'"));
            }
        }
        Ok(dev)
    }
}

impl fmt::Display for VethDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ifname={}", self.guest_ifname)?;
        let rest = [
            ("mac", &self.guest_mac),
            ("host_ifname", &self.host_ifname),
            ("host_mac", &self.host_mac),
            ("bridge", &self.bridge),
        ];
        for (k, v) in rest {
            if let Some(v) = v {
                write!(f, ",{k}={v}")?;
            }
        }
        Ok(())
    }
}

impl Entry for VethDevice {
    fn same_entry(&self, other: &Self) -> bool {
        self.guest_ifname == other.guest_ifname
    }
}

/// Which iptables features the container may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Netfilter {
    Disabled,
    Stateless,
    Stateful,
    Full,
}

impl FromStr for Netfilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "stateless" => Ok(Self::Stateless),
            "stateful" => Ok(Self::Stateful),
            "full" => Ok(Self::Full),
            other => Err(format!(
                "unknown netfilter mode '{other}' (expected disabled, stateless, stateful or full)"
            )),
        }
    }
}

impl fmt::Display for Netfilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Stateless => "stateless",
            Self::Stateful => "stateful",
            Self::Full => "full",
        })
    }
}
