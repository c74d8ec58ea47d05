//! Device access grants and capability masks.

use crate::ordered_set::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Char,
    Block,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePerms {
    pub read: bool,
    pub write: bool,
    /// Quota management on the device (block devices only).
    pub quota: bool,
}

impl FromStr for DevicePerms {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut p = Self::default();
        if s == "none" {
            return Ok(p);
        }
        for c in s.chars() {
            match c {
                'r' => p.read = true,
                'w' => p.write = true,
                'q' => p.quota = true,
                other => return Err(format!("unknown device permission '{other}'")),
            }
        }
        Ok(p)
    }
}

impl fmt::Display for DevicePerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !(self.read || self.write || self.quota) {
            return f.write_str("none");
        }
        for (set, c) in [(self.read, 'r'), (self.write, 'w'), (self.quota, 'q')] {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Access to one device node, or to every minor of a major when `minor` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGrant {
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: Option<u32>,
    pub perms: DevicePerms,
}

impl FromStr for DeviceGrant {
    type Err = String;

    /// `c:1:3:rw`, `b:8:all:r`, `c:10:200:none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [kind, major, minor, perms] = parts.as_slice() else {
            return Err(format!("device grant '{s}' must be kind:major:minor:perms"));
        };
        let kind = match *kind {
            "c" => DeviceKind::Char,
            "b" => DeviceKind::Block,
            other => return Err(format!("device kind '{other}' must be 'c' or 'b'")),
        };
        let major: u32 = major
            .parse()
            .map_err(|_| format!("invalid major number in '{s}'"))?;
        let minor = if *minor == "all" {
            None
        } else {
            Some(
                minor
                    .parse()
                    .map_err(|_| format!("invalid minor number in '{s}'"))?,
            )
        };
        let perms: DevicePerms = perms.parse()?;
        if perms.quota && kind == DeviceKind::Char {
            return Err(format!("quota permission is only valid for block devices: '{s}'"));
        }
        Ok(Self {
            kind,
            major,
            minor,
            perms,
        })
    }
}

impl fmt::Display for DeviceGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
        };
        match self.minor {
            Some(m) => write!(f, "{kind}:{}:{m}:{}", self.major, self.perms),
            None => write!(f, "{kind}:{}:all:{}", self.major, self.perms),
        }
    }
}

impl Entry for DeviceGrant {
    fn same_entry(&self, other: &Self) -> bool {
        self.kind == other.kind && self.major == other.major && self.minor == other.minor
    }
}

const CAPABILITY_NAMES: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "LINUX_IMMUTABLE",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_ADMIN",
    "NET_RAW",
    "IPC_LOCK",
    "IPC_OWNER",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_CHROOT",
    "SYS_PTRACE",
    "SYS_PACCT",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_NICE",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "MKNOD",
    "LEASE",
    "AUDIT_WRITE",
    "AUDIT_CONTROL",
    "SETFCAP",
    "MAC_OVERRIDE",
    "MAC_ADMIN",
    "SYSLOG",
    "WAKE_ALARM",
    "BLOCK_SUSPEND",
    "AUDIT_READ",
    "PERFMON",
    "BPF",
    "CHECKPOINT_RESTORE",
];

/// Bit index of a capability name, e.g. `NET_ADMIN` -> 12.
pub fn capability_bit(name: &str) -> Option<u32> {
    let name = match name.get(..4) {
        Some(p) if p.eq_ignore_ascii_case("CAP_") => &name[4..],
        _ => name,
    };
    CAPABILITY_NAMES
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
}

pub fn capability_name(bit: u32) -> Option<&'static str> {
    CAPABILITY_NAMES.get(bit as usize).copied()
}

const fn cap(bit: u32) -> u64 {
    1u64 << bit
}

/// Capabilities granted when neither mask mentions them: everything except
/// host-wide controls (module loading, raw I/O, reboot, clock, tty config,
/// MAC policy, wake alarms, suspend blocking).
pub const DEFAULT_CAPS: u64 = ((1u64 << 41) - 1)
    & !(cap(16) | cap(17) | cap(22) | cap(25) | cap(26) | cap(32) | cap(33) | cap(35) | cap(36));

/// Forced-on and forced-off capability bits layered over [`DEFAULT_CAPS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityParams {
    pub on: u64,
    pub off: u64,
}

impl CapabilityParams {
    pub fn is_empty(&self) -> bool {
        self.on == 0 && self.off == 0
    }

    /// Apply one `NAME:on` / `NAME:off` token.
    pub fn apply_token(&mut self, token: &str) -> Result<(), String> {
        let (name, state) = token
            .split_once(':')
            .ok_or_else(|| format!("capability '{token}' must be NAME:on or NAME:off"))?;
        let bit = capability_bit(name).ok_or_else(|| format!("unknown capability '{name}'"))?;
        match state {
            "on" => {
                self.on |= cap(bit);
                self.off &= !cap(bit);
            }
            "off" => {
                self.off |= cap(bit);
                self.on &= !cap(bit);
            }
            other => return Err(format!("capability state '{other}' must be on or off")),
        }
        Ok(())
    }

    /// `child` overrides `self` bit by bit.
    #[must_use]
    pub fn overlay(&self, child: &Self) -> Self {
        Self {
            on: (self.on & !child.off) | child.on,
            off: (self.off & !child.on) | child.off,
        }
    }

    pub fn effective(&self) -> u64 {
        (DEFAULT_CAPS | self.on) & !self.off
    }

    pub fn tokens(&self) -> Vec<String> {
        (0..CAPABILITY_NAMES.len() as u32)
            .filter_map(|bit| {
                let name = capability_name(bit)?;
                if self.on & cap(bit) != 0 {
                    Some(format!("{name}:on"))
                } else if self.off & cap(bit) != 0 {
                    Some(format!("{name}:off"))
                } else {
                    None
                }
            })
            .collect()
    }
}
