//! The effective per-container configuration.

use crate::device::{CapabilityParams, DeviceGrant};
use crate::global::expand_veid;
use crate::limits::{BarrierLimit, CpuParams, ResourceSet};
use crate::net::{IpEntry, Netfilter, VethDevice};
use crate::ordered_set::Entry;
pub use crate::ordered_set::ListParam;
use crate::types::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Raw key/value lines owned by each extension module, keyed by module name.
pub type ModuleData = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// Plain directory tree bind-mounted onto the root.
    Simfs,
    /// Copy-on-write block image.
    Ploop,
}

impl FromStr for StorageLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simfs" => Ok(Self::Simfs),
            "ploop" => Ok(Self::Ploop),
            other => Err(format!("unknown layout '{other}' (expected simfs or ploop)")),
        }
    }
}

impl fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simfs => "simfs",
            Self::Ploop => "ploop",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsParams {
    pub private: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub mount_opts: Option<String>,
    pub layout: Option<StorageLayout>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParams {
    pub ostemplate: Option<String>,
    pub origin_sample: Option<String>,
    pub dist: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaParams {
    pub enabled: Option<bool>,
    /// Soft and hard limits in 1K blocks.
    pub diskspace: Option<BarrierLimit>,
    pub diskinodes: Option<BarrierLimit>,
    /// Grace period in seconds.
    pub quotatime: Option<u64>,
    /// Second-level (per user/group) quota entries; 0 turns it off.
    pub ugidlimit: Option<u64>,
}

impl QuotaParams {
    pub fn ugid_enabled(&self) -> bool {
        self.ugidlimit.is_some_and(|n| n > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetParams {
    pub ip: ListParam<IpEntry>,
    pub veth: ListParam<VethDevice>,
    pub netfilter: Option<Netfilter>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct UserPassword {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for UserPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPassword")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FromStr for UserPassword {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((u, p)) if !u.is_empty() && !p.is_empty() => Ok(Self {
                user: u.to_owned(),
                password: p.to_owned(),
            }),
            _ => Err("expected user:password".to_owned()),
        }
    }
}

impl Entry for UserPassword {
    fn same_entry(&self, other: &Self) -> bool {
        self.user == other.user
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiscParams {
    pub hostname: Option<String>,
    pub nameserver: ListParam<String>,
    pub searchdomain: ListParam<String>,
    /// Command-line only; never written to disk.
    #[serde(skip)]
    pub userpw: ListParam<UserPassword>,
    pub onboot: Option<bool>,
    pub bootorder: Option<u64>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub fs: FsParams,
    #[serde(default)]
    pub template: TemplateParams,
    #[serde(default)]
    pub res: ResourceSet,
    #[serde(default)]
    pub cpu: CpuParams,
    #[serde(default)]
    pub ioprio: Option<u8>,
    #[serde(default)]
    pub quota: QuotaParams,
    #[serde(default)]
    pub net: NetParams,
    #[serde(default)]
    pub devices: ListParam<DeviceGrant>,
    #[serde(default)]
    pub caps: CapabilityParams,
    #[serde(default)]
    pub misc: MiscParams,
    #[serde(default)]
    pub module_data: ModuleData,
}

impl ContainerSpec {
    pub fn layout(&self) -> StorageLayout {
        self.fs.layout.unwrap_or(StorageLayout::Simfs)
    }

    pub fn private_path(&self) -> Option<&Path> {
        self.fs.private.as_deref()
    }

    pub fn root_path(&self) -> Option<&Path> {
        self.fs.root.as_deref()
    }

    /// Expand `$VEID` in the private and root paths.
    pub fn resolve_paths(&mut self, id: ContainerId) {
        for p in [&mut self.fs.private, &mut self.fs.root].into_iter().flatten() {
            *p = expand_veid(p, id);
        }
    }

    pub fn module_value(&self, module: &str, key: &str) -> Option<&str> {
        self.module_data
            .get(module)
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_defaults_to_simfs() {
        let mut s = ContainerSpec::default();
        assert_eq!(s.layout(), StorageLayout::Simfs);
        s.fs.layout = Some(StorageLayout::Ploop);
        assert_eq!(s.layout(), StorageLayout::Ploop);
    }

    #[test]
    fn resolve_paths_expands_veid() {
        let mut s = ContainerSpec::default();
        s.fs.private = Some(PathBuf::from("/vz/private/$VEID"));
        s.fs.root = Some(PathBuf::from("/vz/root/${VEID}"));
        s.resolve_paths(ContainerId::new(101).unwrap());
        assert_eq!(s.private_path(), Some(Path::new("/vz/private/101")));
        assert_eq!(s.root_path(), Some(Path::new("/vz/root/101")));
    }

    #[test]
    fn user_password_debug_is_redacted() {
        let up: UserPassword = "root:hunter2".parse().unwrap();
        let dbg = format!("{up:?}");
        assert!(dbg.contains("root"));
        assert!(!dbg.contains("hunter2"));
        assert!("root".parse::<UserPassword>().is_err());
        assert!(":x".parse::<UserPassword>().is_err());
    }

    #[test]
    fn userpw_is_not_serialized() {
        let mut s = ContainerSpec::default();
        s.misc.userpw.add("root:secret".parse().unwrap());
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn spec_with_network_lists_survives_json() {
        let mut s = ContainerSpec::default();
        s.net.ip = ListParam::from_items([
            "10.0.0.5/24".parse::<IpEntry>().unwrap(),
            "10.0.0.6".parse::<IpEntry>().unwrap(),
        ]);
        s.net.veth = ListParam::from_items(["eth0,,veth101.0".parse::<VethDevice>().unwrap()]);
        s.net.veth.remove("eth1".parse::<VethDevice>().unwrap());
        s.misc.hostname = Some("web".to_owned());

        let text = serde_json::to_string(&s).unwrap();
        let back: ContainerSpec = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.net.ip.items.len(), 2);
        assert_eq!(back.net.veth.delete.len(), 1);
    }
}
