//! Container configuration model for Vessel.
//!
//! This crate defines the schema layer: the effective per-container
//! `ContainerSpec`, the static table of line-oriented configuration keys,
//! parsing (`parse_str`, `parse_file`) and diff-based atomic saving (`save`),
//! the three-way layer merge (`merge_three_way`) with add/delete list
//! semantics, and the barrier/limit resource model with derived counters.

pub mod device;
pub mod global;
pub mod keys;
pub mod limits;
pub mod merge;
pub mod net;
pub mod ordered_set;
pub mod parse;
pub mod save;
pub mod spec;
pub mod types;

pub use device::{
    capability_bit, capability_name, CapabilityParams, DeviceGrant, DeviceKind, DevicePerms,
    DEFAULT_CAPS,
};
pub use global::{expand_veid, GlobalConfig, GlobalSettings, DEFAULT_GLOBAL_CONFIG};
pub use keys::{check_value, lookup_key, ConfigKey};
pub use limits::{
    compute_derived, parse_pair, parse_size, validate_pair, BarrierLimit, CpuMask, CpuParams,
    ResourceSet, UbResource, Unit, PAGE_SIZE, UNLIMITED,
};
pub use merge::{apply_overrides, merge_list, merge_scalar, merge_three_way};
pub use net::{IpEntry, Netfilter, VethDevice};
pub use ordered_set::{Entry, OrderedSet};
pub use parse::{
    parse_file, parse_str, read_assignments, Assignment, Claim, KeyClaim, NoClaim, ParseReport,
    ParseWarning,
};
pub use save::{render_lines, save, write_atomic};
pub use spec::{
    ContainerSpec, FsParams, ListParam, MiscParams, ModuleData, NetParams, QuotaParams,
    StorageLayout, TemplateParams, UserPassword,
};
pub use types::{ContainerId, ContainerName};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file not found: {}", .0.display())]
    NoConfig(PathBuf),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("resource exhausted while reading config: {0}")]
    Resource(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Fsync a directory so a preceding `rename()` survives a crash.
pub(crate) fn fsync_dir(dir: &std::path::Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_value_display_names_key() {
        let e = ConfigError::invalid("CPUUNITS", "out of range");
        let msg = e.to_string();
        assert!(msg.contains("CPUUNITS"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn no_config_display_has_path() {
        let e = ConfigError::NoConfig(PathBuf::from("/etc/vessel/conf/101.conf"));
        assert!(e.to_string().contains("101.conf"));
    }
}
