//! Per-distribution action script tables.
//!
//! `<DIST_DIR>/<dist>.conf` maps action keys to script names under
//! `<DIST_DIR>/scripts/`. A dist name like `ubuntu-22.04-x86_64` falls back
//! to `ubuntu-22.04`, then `ubuntu`, then `default`.

use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vessel_schema::read_assignments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GuestAction {
    AddIp,
    DelIp,
    SetHostname,
    SetDns,
    SetUserpass,
    SetUgidQuota,
    Postcreate,
}

impl GuestAction {
    pub const ALL: [GuestAction; 7] = [
        Self::AddIp,
        Self::DelIp,
        Self::SetHostname,
        Self::SetDns,
        Self::SetUserpass,
        Self::SetUgidQuota,
        Self::Postcreate,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::AddIp => "ADD_IP",
            Self::DelIp => "DEL_IP",
            Self::SetHostname => "SET_HOSTNAME",
            Self::SetDns => "SET_DNS",
            Self::SetUserpass => "SET_USERPASS",
            Self::SetUgidQuota => "SET_UGID_QUOTA",
            Self::Postcreate => "POSTCREATE",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// Failures of informational scripts are logged, not returned.
    pub fn is_informational(self) -> bool {
        matches!(
            self,
            Self::DelIp | Self::SetHostname | Self::SetDns | Self::SetUserpass
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistActions {
    source: Option<PathBuf>,
    scripts: BTreeMap<GuestAction, PathBuf>,
}

fn candidates(dist: Option<&str>) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(mut d) = dist.filter(|d| !d.is_empty()) {
        names.push(d.to_owned());
        while let Some((head, _)) = d.rsplit_once('-') {
            names.push(head.to_owned());
            d = head;
        }
    }
    names.push("default".to_owned());
    names
}

impl DistActions {
    pub fn load(dist_dir: &Path, dist: Option<&str>) -> Result<Self, RuntimeError> {
        for name in candidates(dist) {
            let path = dist_dir.join(format!("{name}.conf"));
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let (assignments, malformed) = read_assignments(&content)?;
            for w in malformed {
                warn!("{}: {w}", path.display());
            }
            let mut scripts = BTreeMap::new();
            for a in assignments {
                match GuestAction::from_key(&a.key) {
                    Some(action) if !a.value.is_empty() => {
                        scripts
                            .entry(action)
                            .or_insert_with(|| dist_dir.join("scripts").join(&a.value));
                    }
                    Some(_) => {}
                    None => debug!("{}:{}: ignoring {}", path.display(), a.line, a.key),
                }
            }
            debug!("using action table {}", path.display());
            return Ok(Self {
                source: Some(path),
                scripts,
            });
        }
        debug!("no action table in {}", dist_dir.display());
        Ok(Self::default())
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn script(&self, action: GuestAction) -> Option<&Path> {
        self.scripts.get(&action).map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_strip_suffixes() {
        assert_eq!(
            candidates(Some("ubuntu-22.04-x86_64")),
            ["ubuntu-22.04-x86_64", "ubuntu-22.04", "ubuntu", "default"]
        );
        assert_eq!(candidates(None), ["default"]);
    }

    #[test]
    fn loads_most_specific_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("default.conf"), "ADD_IP=generic-add_ip.sh\n").unwrap();
        fs::write(
            dir.path().join("debian.conf"),
            "ADD_IP=debian-add_ip.sh\nSET_HOSTNAME=\"debian-set_hostname.sh\"\nFOO=bar\n",
        )
        .unwrap();

        let t = DistActions::load(dir.path(), Some("debian-12-x86_64")).unwrap();
        assert_eq!(t.source(), Some(dir.path().join("debian.conf").as_path()));
        assert_eq!(
            t.script(GuestAction::AddIp),
            Some(dir.path().join("scripts/debian-add_ip.sh").as_path())
        );
        assert!(t.script(GuestAction::SetDns).is_none());

        let t = DistActions::load(dir.path(), Some("gentoo")).unwrap();
        assert_eq!(
            t.script(GuestAction::AddIp),
            Some(dir.path().join("scripts/generic-add_ip.sh").as_path())
        );
    }

    #[test]
    fn missing_tables_yield_empty_actions() {
        let dir = tempfile::tempdir().unwrap();
        let t = DistActions::load(dir.path(), Some("centos")).unwrap();
        assert!(t.source().is_none());
        assert!(t.script(GuestAction::AddIp).is_none());
    }

    #[test]
    fn informational_classification() {
        assert!(!GuestAction::AddIp.is_informational());
        assert!(GuestAction::SetDns.is_informational());
        assert!(!GuestAction::Postcreate.is_informational());
        for a in GuestAction::ALL {
            assert_eq!(GuestAction::from_key(a.key()), Some(a));
        }
    }
}
