//! Extension modules: pluggable units that own extra config keys and
//! command-line options and hook into storage and start-up.
//!
//! Each module keeps its raw key/value lines in its own slot of
//! [`ContainerSpec::module_data`]; the slot is created on first use and
//! dropped with the spec, so no explicit alloc/free step exists.

use crate::lifecycle::LifecycleState;
use crate::CoreError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use vessel_runtime::{is_mountpoint, run_checked, HELPER_TIMEOUT};
use vessel_schema::{check_value, Claim, ConfigError, ContainerId, ContainerSpec, KeyClaim};

/// A command-line option contributed by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleOption {
    pub name: &'static str,
    pub help: &'static str,
    pub takes_value: bool,
}

/// What a hook sees of the container.
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext<'a> {
    pub id: ContainerId,
    pub spec: &'a ContainerSpec,
    pub root: &'a Path,
    /// For `setup`, the state being entered; for `cleanup`, the one being left.
    pub state: LifecycleState,
}

impl ModuleContext<'_> {
    fn data(&self, module: &str) -> Option<&BTreeMap<String, String>> {
        self.spec.module_data.get(module)
    }
}

pub trait ExtensionModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Config keys this module claims.
    fn config_keys(&self) -> &'static [&'static str];

    fn options(&self) -> &'static [ModuleOption];

    fn parse_config_line(
        &self,
        data: &mut BTreeMap<String, String>,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError>;

    /// `data` is seeded with the persisted values before the first option.
    fn parse_option(
        &self,
        data: &mut BTreeMap<String, String>,
        option: &str,
        value: Option<&str>,
    ) -> Result<(), ConfigError>;

    /// Lines to persist. Empty values are dropped from the file.
    fn store(&self, data: &BTreeMap<String, String>) -> Vec<(String, String)> {
        data.iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Create the private area in place of template expansion.
    /// Returns `false` when the module has nothing to do with it.
    fn materialize(&self, ctx: &ModuleContext<'_>, private: &Path) -> Result<bool, CoreError> {
        let _ = (ctx, private);
        Ok(false)
    }

    fn setup(&self, ctx: &ModuleContext<'_>) -> Result<(), CoreError>;

    fn cleanup(&self, ctx: &ModuleContext<'_>) -> Result<(), CoreError>;
}

/// Modules known to one invocation, in registration order.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn ExtensionModule>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Registry with the modules shipped in this crate.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(BindMountModule));
        reg
    }

    pub fn register(&mut self, module: Box<dyn ExtensionModule>) {
        debug!("registered module {}", module.name());
        self.modules.push(module);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ExtensionModule> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .map(AsRef::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ExtensionModule> {
        self.modules.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn owner_of_option(&self, option: &str) -> Option<&dyn ExtensionModule> {
        self.iter()
            .find(|m| m.options().iter().any(|o| o.name == option))
    }

    /// Whether some module accepts `--<option>`.
    pub fn has_option(&self, option: &str) -> bool {
        self.owner_of_option(option).is_some()
    }

    /// Hand a command-line option to its module. The command layer's slot is
    /// seeded from `persisted` so add/delete options see the current value.
    pub fn apply_option(
        &self,
        persisted: &ContainerSpec,
        cmd: &mut ContainerSpec,
        option: &str,
        value: Option<&str>,
    ) -> Result<(), CoreError> {
        let module = self
            .owner_of_option(option)
            .ok_or_else(|| CoreError::InvalidParameter(format!("unknown option --{option}")))?;
        if let Some(v) = value {
            check_value(option, v)?;
        }
        let slot = cmd
            .module_data
            .entry(module.name().to_owned())
            .or_insert_with(|| {
                persisted
                    .module_data
                    .get(module.name())
                    .cloned()
                    .unwrap_or_default()
            });
        module.parse_option(slot, option, value)?;
        Ok(())
    }

    /// Normalize every module slot to what the module wants persisted.
    pub fn store_all(&self, spec: &mut ContainerSpec) {
        for module in self.iter() {
            if let Some(data) = spec.module_data.get_mut(module.name()) {
                let stored = module.store(data);
                data.clear();
                data.extend(stored);
            }
        }
    }

    /// Ask modules in order to create the private area.
    pub fn materialize(&self, ctx: &ModuleContext<'_>, private: &Path) -> Result<bool, CoreError> {
        for module in self.iter() {
            if module.materialize(ctx, private)? {
                info!("private area of container {} created by {}", ctx.id, module.name());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run every setup hook. If one fails, the modules already set up are
    /// cleaned up in reverse before the error is returned.
    pub fn setup_all(&self, ctx: &ModuleContext<'_>) -> Result<(), CoreError> {
        for (done, module) in self.modules.iter().enumerate() {
            if let Err(e) = module.setup(ctx) {
                for prev in self.modules[..done].iter().rev() {
                    if let Err(ce) = prev.cleanup(ctx) {
                        warn!("module {} cleanup failed: {ce}", prev.name());
                    }
                }
                return Err(module_error(module.as_ref(), e));
            }
        }
        Ok(())
    }

    /// Run every cleanup hook in reverse; failures are logged.
    pub fn cleanup_all(&self, ctx: &ModuleContext<'_>) {
        for module in self.modules.iter().rev() {
            if let Err(e) = module.cleanup(ctx) {
                warn!("module {} cleanup failed: {e}", module.name());
            }
        }
    }

    /// One block per module for `vesselctl modules`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for m in self.iter() {
            out.push_str(&format!("{}: {}\n", m.name(), m.description()));
            for key in m.config_keys() {
                out.push_str(&format!("  config {key}\n"));
            }
            for o in m.options() {
                let arg = if o.takes_value { " <value>" } else { "" };
                out.push_str(&format!("  --{}{arg}\t{}\n", o.name, o.help));
            }
        }
        out
    }
}

fn module_error(module: &dyn ExtensionModule, e: CoreError) -> CoreError {
    match e {
        CoreError::Module { .. } => e,
        other => CoreError::Module {
            module: module.name().to_owned(),
            message: other.to_string(),
        },
    }
}

impl KeyClaim for ModuleRegistry {
    fn claim(
        &self,
        spec: &mut ContainerSpec,
        key: &str,
        value: &str,
    ) -> Result<Claim, ConfigError> {
        let Some(module) = self.iter().find(|m| m.config_keys().contains(&key)) else {
            return Ok(Claim::NotMine);
        };
        check_value(key, value)?;
        let slot = spec.module_data.entry(module.name().to_owned()).or_default();
        module.parse_config_line(slot, key, value)?;
        Ok(Claim::Claimed)
    }
}

const BINDMOUNT_KEY: &str = "BINDMOUNT";

/// One `host:guest[:ro]` entry of `BINDMOUNT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    fn parse(token: &str) -> Result<Self, String> {
        let mut parts = token.split(':');
        let (Some(src), Some(dst)) = (parts.next(), parts.next()) else {
            return Err(format!("'{token}' must be host:guest[:ro]"));
        };
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => return Err(format!("unknown bind mount flag '{other}'")),
        };
        if parts.next().is_some() {
            return Err(format!("'{token}' has too many fields"));
        }
        let source = PathBuf::from(src);
        let target = PathBuf::from(dst);
        if !source.is_absolute() || !target.is_absolute() {
            return Err(format!("'{token}': both paths must be absolute"));
        }
        Ok(Self {
            source,
            target,
            read_only,
        })
    }

    fn render(&self) -> String {
        let mut s = format!("{}:{}", self.source.display(), self.target.display());
        if self.read_only {
            s.push_str(":ro");
        }
        s
    }

    fn target_in(&self, root: &Path) -> PathBuf {
        root.join(self.target.strip_prefix("/").unwrap_or(&self.target))
    }
}

fn parse_bindmounts(value: &str) -> Result<Vec<BindMount>, String> {
    value.split_whitespace().map(BindMount::parse).collect()
}

fn render_bindmounts(mounts: &[BindMount]) -> String {
    mounts
        .iter()
        .map(BindMount::render)
        .collect::<Vec<_>>()
        .join(" ")
}

fn invalid(message: String) -> ConfigError {
    ConfigError::invalid(BINDMOUNT_KEY, message)
}

/// Host directories bind-mounted into the container root while it is mounted.
pub struct BindMountModule;

impl BindMountModule {
    pub const NAME: &'static str = "bindmount";

    fn mounts(ctx: &ModuleContext<'_>) -> Result<Vec<BindMount>, CoreError> {
        let Some(value) = ctx.data(Self::NAME).and_then(|d| d.get(BINDMOUNT_KEY)) else {
            return Ok(Vec::new());
        };
        parse_bindmounts(value).map_err(|m| CoreError::from(invalid(m)))
    }
}

impl ExtensionModule for BindMountModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "bind-mount host directories into the container root"
    }

    fn config_keys(&self) -> &'static [&'static str] {
        &[BINDMOUNT_KEY]
    }

    fn options(&self) -> &'static [ModuleOption] {
        &[
            ModuleOption {
                name: "bindmount_add",
                help: "add a bind mount, host:guest[:ro]",
                takes_value: true,
            },
            ModuleOption {
                name: "bindmount_del",
                help: "remove the bind mount at a guest path, or 'all'",
                takes_value: true,
            },
        ]
    }

    fn parse_config_line(
        &self,
        data: &mut BTreeMap<String, String>,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let mounts = parse_bindmounts(value).map_err(invalid)?;
        data.insert(key.to_owned(), render_bindmounts(&mounts));
        Ok(())
    }

    fn parse_option(
        &self,
        data: &mut BTreeMap<String, String>,
        option: &str,
        value: Option<&str>,
    ) -> Result<(), ConfigError> {
        let value = value.ok_or_else(|| invalid(format!("--{option} needs a value")))?;
        let current = data.get(BINDMOUNT_KEY).map_or("", String::as_str);
        let mut mounts = parse_bindmounts(current).map_err(invalid)?;
        match option {
            "bindmount_add" => {
                for m in parse_bindmounts(value).map_err(invalid)? {
                    mounts.retain(|e| e.target != m.target);
                    mounts.push(m);
                }
            }
            "bindmount_del" if value == "all" => mounts.clear(),
            "bindmount_del" => {
                let target = Path::new(value);
                mounts.retain(|e| e.target != target);
            }
            other => return Err(invalid(format!("unknown option --{other}"))),
        }
        data.insert(BINDMOUNT_KEY.to_owned(), render_bindmounts(&mounts));
        Ok(())
    }

    fn setup(&self, ctx: &ModuleContext<'_>) -> Result<(), CoreError> {
        if ctx.state != LifecycleState::Mounted {
            return Ok(());
        }
        for m in Self::mounts(ctx)? {
            let target = m.target_in(ctx.root);
            fs::create_dir_all(&target)?;
            let mut bind = Command::new("mount");
            bind.arg("--bind").arg(&m.source).arg(&target);
            run_checked(bind, HELPER_TIMEOUT)?;
            if m.read_only {
                let mut ro = Command::new("mount");
                ro.args(["-o", "remount,ro,bind"]).arg(&target);
                run_checked(ro, HELPER_TIMEOUT)?;
            }
            debug!("bind-mounted {} at {}", m.source.display(), target.display());
        }
        Ok(())
    }

    fn cleanup(&self, ctx: &ModuleContext<'_>) -> Result<(), CoreError> {
        if ctx.state != LifecycleState::Mounted {
            return Ok(());
        }
        for m in Self::mounts(ctx)?.iter().rev() {
            let target = m.target_in(ctx.root);
            if !is_mountpoint(&target) {
                continue;
            }
            let mut umount = Command::new("umount");
            umount.arg(&target);
            run_checked(umount, HELPER_TIMEOUT)?;
            debug!("unmounted bind mount {}", target.display());
        }
        Ok(())
    }
}
