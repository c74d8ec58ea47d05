//! Container parameters shared by `create` and `set`, turned into the
//! command-line layer of the configuration merge.

use clap::Args;
use std::path::PathBuf;
use vessel_core::CoreError;
use vessel_schema::{
    lookup_key, ConfigError, ConfigKey, ContainerSpec, DeviceGrant, IpEntry, ListParam,
    UserPassword, VethDevice,
};

#[derive(Debug, Default, Args)]
pub struct SpecArgs {
    /// OS template name.
    #[arg(long, help_heading = "Storage")]
    pub ostemplate: Option<String>,
    /// Private area path ($VEID is expanded).
    #[arg(long, help_heading = "Storage")]
    pub private: Option<PathBuf>,
    /// Root mount point ($VEID is expanded).
    #[arg(long, help_heading = "Storage")]
    pub root: Option<PathBuf>,
    /// Storage layout: simfs or ploop.
    #[arg(long, help_heading = "Storage")]
    pub layout: Option<String>,
    /// Extra mount options for the root.
    #[arg(long, help_heading = "Storage")]
    pub mount_opts: Option<String>,
    /// Guest distribution for action scripts.
    #[arg(long, help_heading = "Storage")]
    pub distribution: Option<String>,

    /// Disk quota on or off (yes|no).
    #[arg(long, help_heading = "Disk quota")]
    pub diskquota: Option<String>,
    /// Disk space limits, SOFT[:HARD] with K/M/G/T suffixes.
    #[arg(long, help_heading = "Disk quota")]
    pub diskspace: Option<String>,
    /// Inode limits, SOFT[:HARD].
    #[arg(long, help_heading = "Disk quota")]
    pub diskinodes: Option<String>,
    /// Quota grace period in seconds.
    #[arg(long, help_heading = "Disk quota")]
    pub quotatime: Option<String>,
    /// Per-user/group quota entries; 0 turns it off.
    #[arg(long, help_heading = "Disk quota")]
    pub quotaugidlimit: Option<String>,

    /// RAM in pages or with a size suffix.
    #[arg(long, help_heading = "Resources")]
    pub physpages: Option<String>,
    /// Swap in pages or with a size suffix.
    #[arg(long, help_heading = "Resources")]
    pub swappages: Option<String>,
    /// Memory overcommit factor (>= 1).
    #[arg(long, help_heading = "Resources")]
    pub vm_overcommit: Option<String>,
    /// Any resource counter, as NAME=BARRIER[:LIMIT].
    #[arg(long = "ub", value_name = "NAME=VALUE", help_heading = "Resources")]
    pub counters: Vec<String>,
    #[arg(long, help_heading = "Resources")]
    pub cpuunits: Option<String>,
    /// CPU limit in percent of one CPU.
    #[arg(long, help_heading = "Resources")]
    pub cpulimit: Option<String>,
    /// Number of visible CPUs.
    #[arg(long, help_heading = "Resources")]
    pub cpus: Option<String>,
    /// `all` or a list such as 0,2-3.
    #[arg(long, help_heading = "Resources")]
    pub cpumask: Option<String>,
    /// I/O priority, 0..=7.
    #[arg(long, help_heading = "Resources")]
    pub ioprio: Option<String>,

    /// Add an IP address (ADDR[/PREFIX]); repeatable.
    #[arg(long, help_heading = "Network")]
    pub ipadd: Vec<String>,
    /// Remove an IP address, or `all`; repeatable.
    #[arg(long, help_heading = "Network")]
    pub ipdel: Vec<String>,
    /// Add a veth device (IFNAME[,MAC,HOST_IFNAME,HOST_MAC,BRIDGE]).
    #[arg(long, help_heading = "Network")]
    pub netif_add: Vec<String>,
    /// Remove a veth device by guest name, or `all`.
    #[arg(long, help_heading = "Network")]
    pub netif_del: Vec<String>,
    /// disabled, stateless, stateful or full.
    #[arg(long, help_heading = "Network")]
    pub netfilter: Option<String>,
    #[arg(long, help_heading = "Network")]
    pub hostname: Option<String>,
    #[arg(long, help_heading = "Network")]
    pub nameserver: Vec<String>,
    /// Remove a nameserver, or `all`.
    #[arg(long, help_heading = "Network")]
    pub nameserver_del: Vec<String>,
    #[arg(long, help_heading = "Network")]
    pub searchdomain: Vec<String>,
    /// Remove a search domain, or `all`.
    #[arg(long, help_heading = "Network")]
    pub searchdomain_del: Vec<String>,

    /// Device grant KIND:MAJOR:MINOR:PERMS, e.g. c:1:3:rw; repeatable.
    #[arg(long = "devices", help_heading = "Access")]
    pub devices: Vec<String>,
    /// Revoke a device grant (permissions ignored), or `all`.
    #[arg(long = "devices-del", help_heading = "Access")]
    pub devices_del: Vec<String>,
    /// Capability toggle NAME:on|off; repeatable.
    #[arg(long = "capability", help_heading = "Access")]
    pub capabilities: Vec<String>,
    /// Set a guest password, USER:PASSWORD (not saved).
    #[arg(long, help_heading = "Access")]
    pub userpasswd: Vec<String>,

    /// Start on host boot (yes|no).
    #[arg(long, help_heading = "Misc")]
    pub onboot: Option<String>,
    #[arg(long, help_heading = "Misc")]
    pub bootorder: Option<String>,
    /// Register a name usable in place of the ID.
    #[arg(long, help_heading = "Misc")]
    pub name: Option<String>,
    #[arg(long, help_heading = "Misc")]
    pub description: Option<String>,
}

fn token<T>(key: ConfigKey, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| ConfigError::invalid(key.name(), e))
}

/// Fill `list` from add/delete flag values; `all` in `del` clears the list.
fn apply_list<T: vessel_schema::Entry>(
    list: &mut ListParam<T>,
    add: &[String],
    del: &[String],
    parse: impl Fn(&str) -> Result<T, ConfigError>,
) -> Result<(), ConfigError> {
    for d in del {
        if d == "all" {
            list.remove_all();
        } else {
            list.remove(parse(d)?);
        }
    }
    for a in add {
        list.add(parse(a)?);
    }
    Ok(())
}

impl SpecArgs {
    /// The command-line layer these flags describe.
    pub fn to_spec(&self) -> Result<ContainerSpec, CoreError> {
        let mut spec = ContainerSpec::default();
        let scalars = [
            (ConfigKey::Ostemplate, self.ostemplate.as_deref()),
            (ConfigKey::VeLayout, self.layout.as_deref()),
            (ConfigKey::MountOpts, self.mount_opts.as_deref()),
            (ConfigKey::Distribution, self.distribution.as_deref()),
            (ConfigKey::DiskQuota, self.diskquota.as_deref()),
            (ConfigKey::DiskSpace, self.diskspace.as_deref()),
            (ConfigKey::DiskInodes, self.diskinodes.as_deref()),
            (ConfigKey::QuotaTime, self.quotatime.as_deref()),
            (ConfigKey::QuotaUgidLimit, self.quotaugidlimit.as_deref()),
            (ConfigKey::VmOvercommit, self.vm_overcommit.as_deref()),
            (ConfigKey::CpuUnits, self.cpuunits.as_deref()),
            (ConfigKey::CpuLimit, self.cpulimit.as_deref()),
            (ConfigKey::Cpus, self.cpus.as_deref()),
            (ConfigKey::CpuMask, self.cpumask.as_deref()),
            (ConfigKey::IoPrio, self.ioprio.as_deref()),
            (ConfigKey::Netfilter, self.netfilter.as_deref()),
            (ConfigKey::Hostname, self.hostname.as_deref()),
            (ConfigKey::Onboot, self.onboot.as_deref()),
            (ConfigKey::BootOrder, self.bootorder.as_deref()),
            (ConfigKey::Name, self.name.as_deref()),
            (ConfigKey::Description, self.description.as_deref()),
        ];
        for (key, value) in scalars {
            if let Some(v) = value {
                key.apply(&mut spec, v)?;
            }
        }
        spec.fs.private.clone_from(&self.private);
        spec.fs.root.clone_from(&self.root);

        for (name, value) in [("PHYSPAGES", &self.physpages), ("SWAPPAGES", &self.swappages)] {
            if let Some(v) = value {
                counter(&mut spec, name, v)?;
            }
        }
        for c in &self.counters {
            let (name, value) = c.split_once('=').ok_or_else(|| {
                ConfigError::InvalidSyntax(format!("--ub expects NAME=VALUE, got '{c}'"))
            })?;
            counter(&mut spec, &name.to_ascii_uppercase(), value)?;
        }

        apply_list(&mut spec.net.ip, &self.ipadd, &self.ipdel, |v| {
            token::<IpEntry>(ConfigKey::IpAddress, v)
        })?;
        apply_list(&mut spec.net.veth, &self.netif_add, &[], |v| {
            token::<VethDevice>(ConfigKey::Netif, v)
        })?;
        apply_list(&mut spec.net.veth, &[], &self.netif_del, |v| {
            Ok(VethDevice::named(v))
        })?;
        apply_list(
            &mut spec.misc.nameserver,
            &self.nameserver,
            &self.nameserver_del,
            |v| Ok(token::<IpEntry>(ConfigKey::Nameserver, v)?.addr.to_string()),
        )?;
        apply_list(
            &mut spec.misc.searchdomain,
            &self.searchdomain,
            &self.searchdomain_del,
            |v| Ok(v.to_owned()),
        )?;
        apply_list(&mut spec.devices, &self.devices, &self.devices_del, |v| {
            token::<DeviceGrant>(ConfigKey::Devices, v)
        })?;
        apply_list(&mut spec.misc.userpw, &self.userpasswd, &[], |v| {
            v.parse::<UserPassword>()
                .map_err(|e| ConfigError::invalid("userpasswd", e))
        })?;
        for cap in &self.capabilities {
            spec.caps
                .apply_token(cap)
                .map_err(|e| ConfigError::invalid(ConfigKey::Capability.name(), e))?;
        }
        Ok(spec)
    }
}

fn counter(spec: &mut ContainerSpec, name: &str, value: &str) -> Result<(), ConfigError> {
    match lookup_key(name) {
        Some(key @ ConfigKey::Ub(_)) => key.apply(spec, value),
        _ => Err(ConfigError::invalid(name, "not a resource counter")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_schema::{BarrierLimit, StorageLayout, UbResource};

    #[test]
    fn empty_flags_give_empty_layer() {
        assert_eq!(SpecArgs::default().to_spec().unwrap(), ContainerSpec::default());
    }

    #[test]
    fn scalars_go_through_the_key_table() {
        let args = SpecArgs {
            ostemplate: Some("centos-7".to_owned()),
            layout: Some("ploop".to_owned()),
            hostname: Some("web1".to_owned()),
            cpuunits: Some("1000".to_owned()),
            diskspace: Some("1000:2000".to_owned()),
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.template.ostemplate.as_deref(), Some("centos-7"));
        assert_eq!(spec.fs.layout, Some(StorageLayout::Ploop));
        assert_eq!(spec.misc.hostname.as_deref(), Some("web1"));
        assert_eq!(spec.cpu.units, Some(1000));
        assert_eq!(spec.quota.diskspace, Some(BarrierLimit::new(1000, 2000)));
    }

    #[test]
    fn bad_values_are_config_errors() {
        let args = SpecArgs {
            cpuunits: Some("3".to_owned()),
            ..SpecArgs::default()
        };
        let err = args.to_spec().unwrap_err();
        assert_eq!(err.exit_code(), 21);

        let args = SpecArgs {
            counters: vec!["HOSTNAME=x".to_owned()],
            ..SpecArgs::default()
        };
        assert!(args.to_spec().is_err());
    }

    #[test]
    fn address_flags_build_a_delta() {
        let args = SpecArgs {
            ipadd: vec!["10.0.0.2".to_owned(), "10.0.0.3/24".to_owned()],
            ipdel: vec!["10.0.0.9".to_owned()],
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.net.ip.items.len(), 2);
        assert_eq!(spec.net.ip.delete.len(), 1);
        assert!(!spec.net.ip.delete_all);

        let args = SpecArgs {
            ipdel: vec!["all".to_owned()],
            ipadd: vec!["10.0.0.2".to_owned()],
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert!(spec.net.ip.delete_all);
        assert_eq!(spec.net.ip.items.len(), 1);
    }

    #[test]
    fn dns_and_device_lists_take_deletes() {
        let args = SpecArgs {
            nameserver: vec!["1.1.1.1".to_owned()],
            nameserver_del: vec!["8.8.8.8".to_owned()],
            searchdomain_del: vec!["all".to_owned()],
            devices_del: vec!["c:10:200:rw".to_owned()],
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.misc.nameserver.items.as_slice(), ["1.1.1.1".to_owned()]);
        assert_eq!(spec.misc.nameserver.delete.as_slice(), ["8.8.8.8".to_owned()]);
        assert!(spec.misc.searchdomain.delete_all);
        assert_eq!(spec.devices.delete.len(), 1);

        let mut persisted = ContainerSpec::default();
        persisted.misc.nameserver.add("8.8.8.8".to_owned());
        persisted.misc.searchdomain.add("example.com".to_owned());
        persisted.devices.add("c:10:200:r".parse().unwrap());
        vessel_schema::apply_overrides(&mut persisted, &spec);
        assert_eq!(persisted.misc.nameserver.items.as_slice(), ["1.1.1.1".to_owned()]);
        assert!(persisted.misc.searchdomain.items.is_empty());
        assert!(persisted.devices.items.is_empty());
    }

    #[test]
    fn counters_accept_any_resource_name() {
        let args = SpecArgs {
            counters: vec!["numproc=100:120".to_owned()],
            physpages: Some("1024".to_owned()),
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(
            spec.res.get(UbResource::Numproc),
            Some(BarrierLimit::new(100, 120))
        );
        assert!(spec.res.get(UbResource::Physpages).is_some());
    }

    #[test]
    fn capabilities_and_passwords_are_collected() {
        let args = SpecArgs {
            capabilities: vec!["sys_time:on".to_owned()],
            userpasswd: vec!["root:secret".to_owned()],
            ..SpecArgs::default()
        };
        let spec = args.to_spec().unwrap();
        assert!(!spec.caps.is_empty());
        assert_eq!(spec.misc.userpw.items.len(), 1);
    }
}
