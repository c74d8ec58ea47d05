use crate::modules::ModuleRegistry;
use crate::CoreError;
use std::path::Path;
use tracing::{debug, warn};
use vessel_runtime::{
    select_driver, GuestConfigurator, ImageStore, KernelDriver, PlainStore, PloopStore,
    QuotaTool, ScriptConfigurator, VzQuota,
};
use vessel_schema::{ContainerSpec, GlobalConfig, GlobalSettings, StorageLayout};
use vessel_store::{ConfStore, HostLayout};

/// The lower layers the orchestrator drives.
pub struct Collaborators {
    pub driver: Box<dyn KernelDriver>,
    pub plain: Box<dyn ImageStore>,
    pub ploop: Box<dyn ImageStore>,
    pub quota: Box<dyn QuotaTool>,
    pub guest: Box<dyn GuestConfigurator>,
}

impl Collaborators {
    /// Real implementations, with the kernel driver named by `KERNEL_DRIVER`.
    pub fn host(settings: &GlobalSettings) -> Result<Self, CoreError> {
        let driver = select_driver(&settings.kernel_driver)?;
        if !driver.available() {
            warn!("kernel driver '{}' reports itself unavailable", driver.name());
        }
        Ok(Self {
            driver,
            plain: Box::new(PlainStore::new()),
            ploop: Box::new(PloopStore::new()),
            quota: Box::new(VzQuota::new()),
            guest: Box::new(ScriptConfigurator::new()),
        })
    }

    pub fn images(&self, layout: StorageLayout) -> &dyn ImageStore {
        match layout {
            StorageLayout::Simfs => self.plain.as_ref(),
            StorageLayout::Ploop => self.ploop.as_ref(),
        }
    }
}

/// Everything one invocation needs, passed explicitly to every operation.
pub struct Context {
    pub settings: GlobalSettings,
    /// Global layer of the configuration merge.
    pub defaults: ContainerSpec,
    pub layout: HostLayout,
    pub confs: ConfStore,
    pub collaborators: Collaborators,
    pub modules: ModuleRegistry,
    pub skip_lock: bool,
}

impl Context {
    pub fn new(global: GlobalConfig, collaborators: Collaborators, modules: ModuleRegistry) -> Self {
        let layout = HostLayout::from_settings(&global.settings);
        Self {
            settings: global.settings,
            defaults: global.defaults,
            confs: ConfStore::new(layout.clone()),
            layout,
            collaborators,
            modules,
            skip_lock: false,
        }
    }

    /// Read the global file and wire up the host collaborators.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let modules = ModuleRegistry::builtin();
        let (global, report) = GlobalConfig::load(path, &modules)?;
        if !report.is_clean() {
            debug!(
                "{}: {} warning(s) in global config",
                path.display(),
                report.warnings.len()
            );
        }
        let collaborators = Collaborators::host(&global.settings)?;
        Ok(Self::new(global, collaborators, modules))
    }

    #[must_use]
    pub fn with_skip_lock(mut self, skip: bool) -> Self {
        self.skip_lock = skip;
        self
    }

    pub fn images(&self, layout: StorageLayout) -> &dyn ImageStore {
        self.collaborators.images(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_runtime::{Journal, MockDriver, MockGuest, MockImageStore, MockQuota};

    fn mocks() -> Collaborators {
        let journal = Journal::new();
        Collaborators {
            driver: Box::new(MockDriver::with_journal(journal.clone())),
            plain: Box::new(MockImageStore::new("plain", journal.clone())),
            ploop: Box::new(MockImageStore::new("ploop", journal.clone())),
            quota: Box::new(MockQuota::new(journal.clone())),
            guest: Box::new(MockGuest::new(journal)),
        }
    }

    #[test]
    fn images_follow_layout() {
        let c = mocks();
        assert_eq!(c.images(StorageLayout::Simfs).name(), "plain");
        assert_eq!(c.images(StorageLayout::Ploop).name(), "ploop");
    }

    #[test]
    fn load_missing_global_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::load(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(ctx.settings.kernel_driver, "cgroup");
        assert_eq!(ctx.collaborators.driver.name(), "cgroup");
        assert!(!ctx.skip_lock);
    }

    #[test]
    fn unknown_driver_is_a_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vessel.conf");
        std::fs::write(&path, "KERNEL_DRIVER=\"ioctl\"\n").unwrap();
        let err = Context::load(&path).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::SystemError);
    }

    #[test]
    fn layout_comes_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = GlobalConfig::default();
        global.settings.conf_dir = dir.path().join("conf");
        let ctx = Context::new(global, mocks(), ModuleRegistry::builtin());
        assert_eq!(ctx.layout.conf_dir(), dir.path().join("conf"));
        assert_eq!(ctx.modules.len(), 1);
    }
}
