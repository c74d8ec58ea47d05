//! Global (host-wide) configuration file.
//!
//! The same line format as per-container files. Container keys found here
//! form the lowest merge layer; the process-wide keys below configure the
//! tool itself.

use crate::parse::{
    parse_str, read_assignments, read_config, Claim, KeyClaim, ParseReport, ParseWarning,
};
use crate::spec::ContainerSpec;
use crate::types::ContainerId;
use crate::ConfigError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_GLOBAL_CONFIG: &str = "/etc/vessel/vessel.conf";

const SETTINGS_KEYS: &[&str] = &[
    "LOCKDIR",
    "CONF_DIR",
    "TEMPLATE",
    "DEF_OSTEMPLATE",
    "CONFIGFILE",
    "DUMPDIR",
    "DIST_DIR",
    "LOG_LEVEL",
    "LOGGING",
    "LOGFILE",
    "VERBOSE",
    "STOP_TIMEOUT",
    "KERNEL_DRIVER",
];

/// Replace `$VEID` / `${VEID}` with the container id.
pub fn expand_veid(path: &Path, id: ContainerId) -> PathBuf {
    let s = path.to_string_lossy();
    if !s.contains("VEID") {
        return path.to_path_buf();
    }
    let id = id.to_string();
    PathBuf::from(s.replace("${VEID}", &id).replace("$VEID", &id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalSettings {
    pub lockdir: PathBuf,
    pub conf_dir: PathBuf,
    pub template_dir: PathBuf,
    pub def_ostemplate: Option<String>,
    /// Sample applied on create when none is given.
    pub config_sample: Option<String>,
    pub dump_dir: PathBuf,
    pub dist_dir: PathBuf,
    /// 0 error, 1 warn, 2 info, 3 debug.
    pub log_level: u8,
    pub logging: bool,
    pub logfile: Option<PathBuf>,
    pub verbose: bool,
    pub stop_timeout: Duration,
    pub kernel_driver: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            lockdir: PathBuf::from("/vz/lock"),
            conf_dir: PathBuf::from("/etc/vessel/conf"),
            template_dir: PathBuf::from("/vz/template"),
            def_ostemplate: None,
            config_sample: None,
            dump_dir: PathBuf::from("/vz/dump"),
            dist_dir: PathBuf::from("/etc/vessel/dists"),
            log_level: 1,
            logging: false,
            logfile: None,
            verbose: false,
            stop_timeout: Duration::from_secs(120),
            kernel_driver: "cgroup".to_owned(),
        }
    }
}

impl GlobalSettings {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), String> {
        let flag = |v: &str| match v {
            "yes" => Ok(true),
            "no" => Ok(false),
            other => Err(format!("'{other}' must be yes or no")),
        };
        let nonempty = |v: &str| Some(v.to_owned()).filter(|v| !v.is_empty());
        match key {
            "LOCKDIR" => self.lockdir = PathBuf::from(value),
            "CONF_DIR" => self.conf_dir = PathBuf::from(value),
            "TEMPLATE" => self.template_dir = PathBuf::from(value),
            "DEF_OSTEMPLATE" => self.def_ostemplate = nonempty(value),
            "CONFIGFILE" => self.config_sample = nonempty(value),
            "DUMPDIR" => self.dump_dir = PathBuf::from(value),
            "DIST_DIR" => self.dist_dir = PathBuf::from(value),
            "LOG_LEVEL" => {
                let l: u8 = value
                    .parse()
                    .map_err(|_| format!("'{value}' is not a log level"))?;
                self.log_level = l.min(3);
            }
            "LOGGING" => self.logging = flag(value)?,
            "LOGFILE" => self.logfile = nonempty(value).map(PathBuf::from),
            "VERBOSE" => self.verbose = flag(value)?,
            "STOP_TIMEOUT" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("'{value}' is not a number of seconds"))?;
                self.stop_timeout = Duration::from_secs(secs);
            }
            "KERNEL_DRIVER" => self.kernel_driver = value.to_owned(),
            _ => return Err(format!("unknown setting {key}")),
        }
        Ok(())
    }
}

/// Claims the process-wide keys so the container parse does not warn on them.
struct SettingsClaim<'a> {
    inner: &'a dyn KeyClaim,
}

impl KeyClaim for SettingsClaim<'_> {
    fn claim(
        &self,
        spec: &mut ContainerSpec,
        key: &str,
        value: &str,
    ) -> Result<Claim, ConfigError> {
        if SETTINGS_KEYS.contains(&key) {
            return Ok(Claim::Claimed);
        }
        self.inner.claim(spec, key, value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub settings: GlobalSettings,
    /// Lowest layer of the three-way merge.
    pub defaults: ContainerSpec,
}

impl GlobalConfig {
    /// Load the global file. A missing file yields built-in defaults.
    pub fn load(path: &Path, claims: &dyn KeyClaim) -> Result<(Self, ParseReport), ConfigError> {
        let content = match read_config(path) {
            Ok(c) => c,
            Err(ConfigError::NoConfig(p)) => {
                debug!("global config {} not found, using defaults", p.display());
                return Ok((Self::default(), ParseReport::default()));
            }
            Err(e) => return Err(e),
        };
        Self::from_str_with(&content, claims, &path.display().to_string())
    }

    pub fn from_str_with(
        content: &str,
        claims: &dyn KeyClaim,
        source: &str,
    ) -> Result<(Self, ParseReport), ConfigError> {
        let mut defaults = ContainerSpec::default();
        let claim = SettingsClaim { inner: claims };
        let mut report = parse_str(content, &mut defaults, &claim, source)?;

        let mut settings = GlobalSettings::default();
        let (assignments, _) = read_assignments(content)?;
        let mut seen = std::collections::HashSet::new();
        for a in assignments {
            if !SETTINGS_KEYS.contains(&a.key.as_str()) || !seen.insert(a.key.clone()) {
                continue;
            }
            if let Err(message) = settings.apply(&a.key, &a.value) {
                let w = ParseWarning::InvalidValue {
                    line: a.line,
                    key: a.key,
                    message,
                };
                warn!("{source}: {w}");
                report.warnings.push(w);
            }
        }
        Ok((Self { settings, defaults }, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::NoClaim;

    #[test]
    fn expand_veid_both_forms() {
        let id = ContainerId::new(7).unwrap();
        assert_eq!(
            expand_veid(Path::new("/vz/private/$VEID"), id),
            PathBuf::from("/vz/private/7")
        );
        assert_eq!(
            expand_veid(Path::new("/a/${VEID}/b"), id),
            PathBuf::from("/a/7/b")
        );
        assert_eq!(expand_veid(Path::new("/plain"), id), PathBuf::from("/plain"));
    }

    #[test]
    fn missing_global_file_yields_defaults() {
        let (cfg, report) =
            GlobalConfig::load(Path::new("/nonexistent/vessel.conf"), &NoClaim).unwrap();
        assert_eq!(cfg.settings, GlobalSettings::default());
        assert_eq!(cfg.defaults, ContainerSpec::default());
        assert!(report.is_clean());
    }

    #[test]
    fn settings_and_container_defaults_are_split() {
        let content = "LOCKDIR=/run/vessel/lock\nSTOP_TIMEOUT=30\nVE_PRIVATE=\"/vz/private/$VEID\"\nCPUUNITS=1000\nLOG_LEVEL=3\n";
        let (cfg, report) = GlobalConfig::from_str_with(content, &NoClaim, "g").unwrap();
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert_eq!(cfg.settings.lockdir, PathBuf::from("/run/vessel/lock"));
        assert_eq!(cfg.settings.stop_timeout, Duration::from_secs(30));
        assert_eq!(cfg.settings.log_level, 3);
        assert_eq!(cfg.defaults.cpu.units, Some(1000));
        assert_eq!(
            cfg.defaults.fs.private,
            Some(PathBuf::from("/vz/private/$VEID"))
        );
    }

    #[test]
    fn bad_settings_warn_and_keep_defaults() {
        let (cfg, report) =
            GlobalConfig::from_str_with("STOP_TIMEOUT=soon\nLOGGING=maybe\n", &NoClaim, "g")
                .unwrap();
        assert_eq!(cfg.settings.stop_timeout, Duration::from_secs(120));
        assert!(!cfg.settings.logging);
        assert_eq!(report.warnings.len(), 2);
    }
}
