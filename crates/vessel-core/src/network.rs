//! Network identity changes with rollback.
//!
//! Kernel-side changes go through the `KernelDriver`; the guest learns about
//! them from the distribution's ADD_IP / DEL_IP scripts.

use crate::CoreError;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use vessel_runtime::{
    DistActions, GuestAction, GuestConfigurator, KernelDriver, ScriptRequest, HELPER_TIMEOUT,
};
use vessel_schema::{ContainerId, IpEntry, ListParam, OrderedSet, VethDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpOp {
    Add,
    Delete,
}

/// Applies IP and veth deltas to one container.
pub struct NetworkBinder<'a> {
    driver: &'a dyn KernelDriver,
    guest: &'a dyn GuestConfigurator,
    actions: &'a DistActions,
    id: ContainerId,
    root: &'a Path,
    init_pid: Option<u32>,
    skip_guest: bool,
    ve_state: &'static str,
    timeout: Duration,
}

impl<'a> NetworkBinder<'a> {
    pub fn new(
        driver: &'a dyn KernelDriver,
        guest: &'a dyn GuestConfigurator,
        actions: &'a DistActions,
        id: ContainerId,
        root: &'a Path,
    ) -> Self {
        Self {
            driver,
            guest,
            actions,
            id,
            root,
            init_pid: None,
            skip_guest: false,
            ve_state: "running",
            timeout: HELPER_TIMEOUT,
        }
    }

    /// Run guest scripts inside the namespaces of this init instead of a chroot.
    #[must_use]
    pub fn init_pid(mut self, pid: Option<u32>) -> Self {
        self.init_pid = pid;
        self
    }

    #[must_use]
    pub fn skip_guest(mut self, skip: bool) -> Self {
        self.skip_guest = skip;
        self
    }

    /// Value of `VE_STATE` passed to guest scripts.
    #[must_use]
    pub fn ve_state(mut self, state: &'static str) -> Self {
        self.ve_state = state;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add `ips.items`, or delete `ips.delete` (every bound address when
    /// `delete_all` is set). Returns the addresses that changed.
    ///
    /// A failed add removes the addresses this call already bound, newest
    /// first, before the error is returned.
    pub fn apply_ip_change(
        &self,
        op: IpOp,
        ips: &ListParam<IpEntry>,
    ) -> Result<Vec<IpEntry>, CoreError> {
        match op {
            IpOp::Add => self.add_ips(ips.items.as_slice()),
            IpOp::Delete => self.delete_ips(ips),
        }
    }

    fn add_ips(&self, ips: &[IpEntry]) -> Result<Vec<IpEntry>, CoreError> {
        let mut added: Vec<IpEntry> = Vec::with_capacity(ips.len());
        for ip in ips {
            if let Err(e) = self.driver.add_ip(self.id, ip) {
                self.rollback_ips(&added);
                return Err(e.into());
            }
            debug!("bound {ip} to container {}", self.id);
            added.push(*ip);
        }
        if added.is_empty() {
            return Ok(added);
        }
        if let Err(e) = self.guest_script(GuestAction::AddIp, ip_env(&added, false)) {
            self.rollback_ips(&added);
            return Err(e);
        }
        info!("container {}: added {}", self.id, join_ips(&added));
        Ok(added)
    }

    fn rollback_ips(&self, added: &[IpEntry]) {
        for ip in added.iter().rev() {
            match self.driver.del_ip(self.id, ip) {
                Ok(()) => debug!("rolled back {ip} on container {}", self.id),
                Err(e) => warn!("failed to roll back {ip} on container {}: {e}", self.id),
            }
        }
    }

    fn delete_ips(&self, ips: &ListParam<IpEntry>) -> Result<Vec<IpEntry>, CoreError> {
        let targets = if ips.delete_all {
            self.driver.list_ips(self.id)?
        } else {
            ips.delete.as_slice().to_vec()
        };
        for ip in &targets {
            self.driver.del_ip(self.id, ip)?;
            debug!("unbound {ip} from container {}", self.id);
        }
        if !targets.is_empty() || ips.delete_all {
            self.guest_del_ip(&targets, ips.delete_all);
        }
        Ok(targets)
    }

    /// Tell the guest that addresses are gone. Failures are logged.
    pub fn guest_del_ip(&self, ips: &[IpEntry], all: bool) {
        if let Err(e) = self.guest_script(GuestAction::DelIp, ip_env(ips, all)) {
            warn!("container {}: DEL_IP script failed: {e}", self.id);
        }
    }

    /// Remove the veths in `delta.delete` (all of `existing` when
    /// `delete_all` is set), then create `delta.items`.
    ///
    /// Missing host names and MAC addresses are filled in. If a create fails,
    /// the devices made by this call are removed again and dropped from
    /// `delta.items`.
    pub fn apply_veth_change(
        &self,
        existing: &OrderedSet<VethDevice>,
        delta: &mut ListParam<VethDevice>,
    ) -> Result<(), CoreError> {
        let victims: Vec<&VethDevice> = if delta.delete_all {
            existing.iter().collect()
        } else {
            existing
                .iter()
                .filter(|e| delta.delete.iter().any(|d| e.guest_ifname == d.guest_ifname))
                .collect()
        };
        for dev in victims {
            self.driver.del_veth(self.id, dev)?;
            info!("container {}: removed veth {}", self.id, dev.guest_ifname);
        }

        let wanted: Vec<VethDevice> = delta
            .items
            .iter()
            .enumerate()
            .map(|(n, d)| complete_veth(self.id, d, n))
            .collect();
        let mut created: Vec<VethDevice> = Vec::with_capacity(wanted.len());
        for dev in &wanted {
            if let Err(e) = self.driver.add_veth(self.id, dev) {
                for done in created.iter().rev() {
                    if let Err(ue) = self.driver.del_veth(self.id, done) {
                        warn!("failed to remove veth {}: {ue}", done.guest_ifname);
                    }
                }
                delta.items.retain(|d| {
                    d.guest_ifname != dev.guest_ifname
                        && !created.iter().any(|c| c.guest_ifname == d.guest_ifname)
                });
                return Err(e.into());
            }
            info!("container {}: created veth {}", self.id, dev.guest_ifname);
            created.push(dev.clone());
        }
        delta.items = wanted.into_iter().collect();
        Ok(())
    }

    fn guest_script(
        &self,
        action: GuestAction,
        mut env: Vec<(String, String)>,
    ) -> Result<(), CoreError> {
        if self.skip_guest {
            return Ok(());
        }
        let Some(script) = self.actions.script(action) else {
            debug!("no {} script for container {}", action.key(), self.id);
            return Ok(());
        };
        env.push(("VE_STATE".to_owned(), self.ve_state.to_owned()));
        let req = ScriptRequest {
            id: self.id,
            root: self.root,
            script,
            env,
            timeout: self.timeout,
            init_pid: self.init_pid,
        };
        self.guest.run_action_script(&req)?;
        Ok(())
    }
}

fn join_ips(ips: &[IpEntry]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn ip_env(ips: &[IpEntry], all: bool) -> Vec<(String, String)> {
    let mut env = vec![("IP_ADDR".to_owned(), join_ips(ips))];
    if all {
        env.push(("IPDELALL".to_owned(), "yes".to_owned()));
    }
    env
}

fn device_index(ifname: &str, fallback: usize) -> String {
    let digits: String = ifname
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        fallback.to_string()
    } else {
        digits
    }
}

fn complete_veth(id: ContainerId, dev: &VethDevice, n: usize) -> VethDevice {
    let mut out = dev.clone();
    let host = out
        .host_ifname
        .get_or_insert_with(|| format!("veth{id}.{}", device_index(&dev.guest_ifname, n)))
        .clone();
    out.guest_mac
        .get_or_insert_with(|| generate_mac(id, &dev.guest_ifname, false));
    out.host_mac.get_or_insert_with(|| generate_mac(id, &host, true));
    out
}

/// Stable, locally administered MAC for one side of a veth pair.
pub fn generate_mac(id: ContainerId, ifname: &str, host_side: bool) -> String {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut h = FNV_OFFSET;
    let bytes = id
        .get()
        .to_be_bytes()
        .into_iter()
        .chain(ifname.bytes())
        .chain(std::iter::once(u8::from(host_side)));
    for b in bytes {
        h ^= u32::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    let [_, a, b, c] = h.to_be_bytes();
    format!("00:18:51:{a:02X}:{b:02X}:{c:02X}")
}
