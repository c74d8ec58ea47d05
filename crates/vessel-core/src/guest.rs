//! Pushes guest-visible settings through the distribution action scripts.

use crate::CoreError;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use vessel_runtime::{DistActions, GuestAction, GuestConfigurator, ScriptRequest, HELPER_TIMEOUT};
use vessel_schema::{ContainerId, ContainerSpec, ListParam};

/// Dist name used to pick the action table: `DISTRIBUTION`, else the
/// OS template name.
pub fn dist_name(spec: &ContainerSpec) -> Option<&str> {
    spec.template
        .dist
        .as_deref()
        .or(spec.template.ostemplate.as_deref())
}

pub struct GuestPush<'a> {
    guest: &'a dyn GuestConfigurator,
    actions: &'a DistActions,
    id: ContainerId,
    root: &'a Path,
    init_pid: Option<u32>,
    timeout: Duration,
}

impl<'a> GuestPush<'a> {
    pub fn new(
        guest: &'a dyn GuestConfigurator,
        actions: &'a DistActions,
        id: ContainerId,
        root: &'a Path,
        init_pid: Option<u32>,
    ) -> Self {
        Self {
            guest,
            actions,
            id,
            root,
            init_pid,
            timeout: HELPER_TIMEOUT,
        }
    }

    /// Run the script for `action` if the table has one. Informational
    /// actions only warn on failure.
    pub fn run(&self, action: GuestAction, env: Vec<(String, String)>) -> Result<(), CoreError> {
        let Some(script) = self.actions.script(action) else {
            debug!("no {} script for container {}", action.key(), self.id);
            return Ok(());
        };
        let req = ScriptRequest {
            id: self.id,
            root: self.root,
            script,
            env,
            timeout: self.timeout,
            init_pid: self.init_pid,
        };
        match self.guest.run_action_script(&req) {
            Ok(()) => Ok(()),
            Err(e) if action.is_informational() => {
                warn!("container {}: {} failed: {e}", self.id, action.key());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Push hostname, DNS, passwords and the second-level quota.
    ///
    /// With `only` set, a setting is pushed only when that layer touches it.
    pub fn apply(&self, eff: &ContainerSpec, only: Option<&ContainerSpec>) -> Result<(), CoreError> {
        let wants = |touched: fn(&ContainerSpec) -> bool| only.map_or(true, touched);

        if let Some(hostname) = &eff.misc.hostname {
            if wants(|c| c.misc.hostname.is_some()) {
                self.run(
                    GuestAction::SetHostname,
                    vec![("HOSTNM".to_owned(), hostname.clone())],
                )?;
            }
        }

        let dns_set = !eff.misc.nameserver.items.is_empty() || !eff.misc.searchdomain.items.is_empty();
        if dns_set
            && wants(|c| !c.misc.nameserver.is_untouched() || !c.misc.searchdomain.is_untouched())
        {
            self.run(
                GuestAction::SetDns,
                vec![
                    ("NAMESERVER".to_owned(), join(&eff.misc.nameserver)),
                    ("SEARCHDOMAIN".to_owned(), join(&eff.misc.searchdomain)),
                ],
            )?;
        }

        if !eff.misc.userpw.items.is_empty() && wants(|c| !c.misc.userpw.items.is_empty()) {
            let pairs: Vec<String> = eff
                .misc
                .userpw
                .items
                .iter()
                .map(|u| format!("{}:{}", u.user, u.password))
                .collect();
            self.run(
                GuestAction::SetUserpass,
                vec![("USERPW".to_owned(), pairs.join(" "))],
            )?;
        }

        if eff.quota.ugid_enabled() && wants(|c| c.quota.ugidlimit.is_some()) {
            let limit = eff.quota.ugidlimit.unwrap_or(0);
            self.run(
                GuestAction::SetUgidQuota,
                vec![("UGIDLIMIT".to_owned(), limit.to_string())],
            )?;
        }
        Ok(())
    }
}

fn join(list: &ListParam<String>) -> String {
    list.items.iter().cloned().collect::<Vec<_>>().join(" ")
}
