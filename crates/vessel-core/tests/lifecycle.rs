use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use vessel_core::{
    Collaborators, ContainerLock, Context, CoreError, CreateOptions, ErrorKind, LifecycleState,
    ModuleRegistry, Orchestrator, SetMode, SetOptions, StartOptions, StopOptions,
};
use vessel_runtime::{FailPoint, Journal, MockDriver, MockGuest, MockImageStore, MockQuota};
use vessel_schema::{BarrierLimit, ContainerId, ContainerSpec, GlobalConfig, IpEntry, StorageLayout};

struct Host {
    _dir: tempfile::TempDir,
    root: PathBuf,
    journal: Journal,
    driver: MockDriver,
    guest: MockGuest,
    orch: Orchestrator,
}

fn id() -> ContainerId {
    ContainerId::new(101).unwrap()
}

fn ip(s: &str) -> IpEntry {
    s.parse().unwrap()
}

fn template_tar_gz() -> Vec<u8> {
    let mut b = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (path, body) in [("etc/hostname", "localhost\n"), ("sbin/init", "#!/bin/sh\n")] {
        let mut h = tar::Header::new_gnu();
        h.set_size(body.len() as u64);
        h.set_mode(0o755);
        h.set_cksum();
        b.append_data(&mut h, path, body.as_bytes()).unwrap();
    }
    b.into_inner().unwrap().finish().unwrap()
}

fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let mut global = GlobalConfig::default();
    let s = &mut global.settings;
    s.lockdir = root.join("lock");
    s.conf_dir = root.join("conf");
    s.template_dir = root.join("template");
    s.dump_dir = root.join("dump");
    s.dist_dir = root.join("dists");
    s.stop_timeout = Duration::from_millis(200);
    global.defaults.fs.private = Some(root.join("private/$VEID"));
    global.defaults.fs.root = Some(root.join("root/$VEID"));

    fs::create_dir_all(root.join("conf")).unwrap();
    fs::create_dir_all(root.join("template/cache")).unwrap();
    fs::write(root.join("template/cache/t1.tar.gz"), template_tar_gz()).unwrap();
    fs::create_dir_all(root.join("dists")).unwrap();
    fs::write(
        root.join("dists/default.conf"),
        "ADD_IP=\"add_ip.sh\"\nDEL_IP=\"del_ip.sh\"\nSET_HOSTNAME=\"set_hostname.sh\"\n\
         POSTCREATE=\"postcreate.sh\"\n",
    )
    .unwrap();

    let journal = Journal::new();
    let driver = MockDriver::with_journal(journal.clone());
    let guest = MockGuest::new(journal.clone());
    let collaborators = Collaborators {
        driver: Box::new(driver.clone()),
        plain: Box::new(MockImageStore::new("plain", journal.clone())),
        ploop: Box::new(MockImageStore::new("ploop", journal.clone())),
        quota: Box::new(MockQuota::new(journal.clone())),
        guest: Box::new(guest.clone()),
    };
    let ctx = Context::new(global, collaborators, ModuleRegistry::builtin());
    Host {
        _dir: dir,
        root,
        journal,
        driver,
        guest,
        orch: Orchestrator::new(ctx),
    }
}

fn create_opts(cmd: ContainerSpec) -> CreateOptions {
    let mut cmd = cmd;
    cmd.template.ostemplate = Some("t1".to_owned());
    CreateOptions {
        cmd,
        ..CreateOptions::default()
    }
}

impl Host {
    fn private(&self) -> PathBuf {
        self.root.join("private/101")
    }

    fn conf(&self) -> PathBuf {
        self.root.join("conf/101.conf")
    }

    fn conf_text(&self) -> String {
        fs::read_to_string(self.conf()).unwrap_or_default()
    }

    fn create(&self) {
        self.orch
            .create(id(), create_opts(ContainerSpec::default()))
            .unwrap();
    }

    fn create_and_start(&self) {
        self.create();
        self.orch.start(id(), StartOptions::default()).unwrap();
    }

    fn state(&self) -> LifecycleState {
        self.orch.status(id()).unwrap().state
    }

    fn count(&self, prefix: &str) -> usize {
        self.journal.matching(prefix).len()
    }
}

// Creation

#[test]
fn create_expands_template_and_persists_ostemplate() {
    let h = host();
    h.create();

    assert!(h.private().join("sbin/init").is_file());
    let status = h.orch.status(id()).unwrap();
    assert_eq!(status.private.as_deref(), Some(h.private().as_path()));
    assert_eq!(status.state, LifecycleState::Created);
    assert!(h.conf_text().contains("OSTEMPLATE=\"t1\""));

    let persisted = h.orch.load_persisted(id()).unwrap();
    assert_eq!(persisted.template.ostemplate.as_deref(), Some("t1"));
    assert_eq!(h.count("guest.postcreate.sh"), 1);
    assert!(!h.orch.status(id()).unwrap().mounted);
}

#[test]
fn create_twice_reports_private_exists() {
    let h = host();
    h.create();
    let err = h
        .orch
        .create(id(), create_opts(ContainerSpec::default()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PrivateExists);
}

#[test]
fn create_with_unknown_template_leaves_nothing_behind() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    cmd.template.ostemplate = Some("missing".to_owned());
    let err = h
        .orch
        .create(
            id(),
            CreateOptions {
                cmd,
                ..CreateOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateError);
    assert!(!h.private().exists());
    assert!(!h.conf().exists());
}

#[test]
fn failed_postcreate_removes_private_area() {
    let h = host();
    h.guest.fail_on(FailPoint::Script("postcreate.sh".to_owned()));
    let err = h
        .orch
        .create(id(), create_opts(ContainerSpec::default()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActionScriptError);
    assert!(!h.private().exists());
    assert!(!h.conf().exists());
    assert_eq!(h.count("plain.umount"), 1);
}

#[test]
fn create_from_sample_records_origin_and_inits_quota() {
    let h = host();
    fs::write(
        h.root.join("conf/ve-basic.conf-sample"),
        "DISKSPACE=\"1000:2000\"\nHOSTNAME=\"sample-host\"\n",
    )
    .unwrap();
    let mut opts = create_opts(ContainerSpec::default());
    opts.sample = Some("basic".to_owned());
    h.orch.create(id(), opts).unwrap();

    let persisted = h.orch.load_persisted(id()).unwrap();
    assert_eq!(persisted.template.origin_sample.as_deref(), Some("basic"));
    assert_eq!(persisted.misc.hostname.as_deref(), Some("sample-host"));
    assert_eq!(h.count("quota.init 101"), 1);
}

#[test]
fn create_with_name_registers_it() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    cmd.misc.name = Some("web".to_owned());
    h.orch.create(id(), create_opts(cmd)).unwrap();
    assert_eq!(h.orch.resolve("web").unwrap(), id());
    assert_eq!(h.orch.resolve("101").unwrap(), id());
    assert_eq!(
        h.orch.resolve("nope").unwrap_err().kind(),
        ErrorKind::NotExist
    );
}

// Start and stop

#[test]
fn start_then_stop_round_trip() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    cmd.net.ip.add(ip("10.0.0.2"));
    h.orch.create(id(), create_opts(cmd)).unwrap();

    h.orch.start(id(), StartOptions::default()).unwrap();
    assert_eq!(h.state(), LifecycleState::Running);
    let c = h.driver.container(id()).unwrap();
    assert_eq!(c.ips, vec![ip("10.0.0.2")]);
    assert!(c.limits.is_some());
    assert!(c.caps.is_some());
    assert_eq!(h.count("guest.add_ip.sh"), 1);

    let err = h.orch.start(id(), StartOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    h.orch.stop(id(), StopOptions::default()).unwrap();
    assert_eq!(h.state(), LifecycleState::Created);
    assert_eq!(h.count("guest.del_ip.sh"), 1);
    assert_eq!(h.count("plain.umount"), 2);

    let err = h.orch.stop(id(), StopOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[test]
fn stop_kills_when_graceful_stop_is_ignored() {
    let h = host();
    h.create_and_start();
    h.driver.ignore_graceful_stop(true);
    h.orch.stop(id(), StopOptions::default()).unwrap();
    assert_eq!(h.count("driver.stop 101 graceful"), 1);
    assert_eq!(h.count("driver.stop 101 kill"), 1);
    assert!(h.driver.container(id()).is_none());
}

#[test]
fn fast_stop_skips_graceful_and_can_keep_storage() {
    let h = host();
    h.create_and_start();
    h.orch
        .stop(
            id(),
            StopOptions {
                fast: true,
                skip_umount: true,
            },
        )
        .unwrap();
    assert_eq!(h.count("driver.stop 101 graceful"), 0);
    assert_eq!(h.state(), LifecycleState::Mounted);
}

#[test]
fn failed_address_during_start_undoes_everything() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    for a in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        cmd.net.ip.add(ip(a));
    }
    h.orch.create(id(), create_opts(cmd)).unwrap();
    h.driver.fail_on(FailPoint::AddIp("10.0.0.3".parse().unwrap()));

    let err = h.orch.start(id(), StartOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkError);
    assert!(h.driver.container(id()).is_none());
    assert_eq!(h.count("driver.del_ip 101"), 2);
    assert_eq!(h.count("driver.abort 101"), 1);
    assert_eq!(h.count("driver.proceed"), 0);
    assert_eq!(h.state(), LifecycleState::Created);
}

#[test]
fn start_without_private_area_fails() {
    let h = host();
    let err = h.orch.start(id(), StartOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExist);
}

#[test]
fn locked_container_is_refused() {
    let h = host();
    h.create();
    let lock_path = h.root.join("lock/101.lck");
    let _held = ContainerLock::acquire(&lock_path, id()).unwrap();
    let err = h.orch.start(id(), StartOptions::default()).unwrap_err();
    assert!(matches!(err, CoreError::Locked { .. }));
    assert_eq!(err.exit_code(), 9);
}

#[test]
fn restart_returns_stop_failure_without_starting() {
    let h = host();
    h.create_and_start();
    h.driver.fail_on(FailPoint::Stop);
    h.journal.clear();

    let err = h
        .orch
        .restart(id(), StopOptions::default(), StartOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);
    assert_eq!(h.count("driver.create"), 0);
    assert_eq!(h.count("plain.mount"), 0);
}

#[test]
fn restart_stops_once_and_starts_once() {
    let h = host();
    h.create_and_start();
    h.journal.clear();
    h.orch
        .restart(id(), StopOptions::default(), StartOptions::default())
        .unwrap();
    let stop = h.journal.position("driver.stop 101").unwrap();
    let create = h.journal.position("driver.create 101").unwrap();
    assert!(stop < create);
    assert_eq!(h.count("driver.create"), 1);
    assert_eq!(h.state(), LifecycleState::Running);
}

// Mount and umount

#[test]
fn mount_and_umount_follow_state() {
    let h = host();
    h.create();
    h.orch.mount(id()).unwrap();
    assert_eq!(h.state(), LifecycleState::Mounted);
    assert_eq!(
        h.orch.mount(id()).unwrap_err().kind(),
        ErrorKind::AlreadyMounted
    );
    h.orch.umount(id()).unwrap();
    assert_eq!(
        h.orch.umount(id()).unwrap_err().kind(),
        ErrorKind::NotMounted
    );
}

// Checkpoint and restore

fn create_with_quota(h: &Host) {
    let mut cmd = ContainerSpec::default();
    cmd.quota.diskspace = Some(BarrierLimit::new(1000, 2000));
    h.orch.create(id(), create_opts(cmd)).unwrap();
}

#[test]
fn start_inflates_quota_during_setup_then_restores_it() {
    let h = host();
    create_with_quota(&h);
    h.journal.clear();
    h.orch.start(id(), StartOptions::default()).unwrap();

    let on = h.journal.position("quota.on 101 2000:4000").unwrap();
    let create = h.journal.position("driver.create 101").unwrap();
    let proceed = h.journal.position("driver.proceed 101").unwrap();
    let restore = h.journal.position("quota.setlimit 101 1000:2000").unwrap();
    assert!(on < create && create < proceed && proceed < restore);
    assert_eq!(h.count("quota.setlimit"), 1);
}

#[test]
fn start_on_mounted_storage_restores_quota_after_failure() {
    let h = host();
    create_with_quota(&h);
    h.orch.mount(id()).unwrap();
    h.journal.clear();
    h.driver.fail_on(FailPoint::Create);

    assert!(h.orch.start(id(), StartOptions::default()).is_err());
    assert_eq!(
        h.journal.matching("quota.setlimit"),
        ["quota.setlimit 101 2000:4000", "quota.setlimit 101 1000:2000"]
    );
    assert_eq!(h.count("plain.umount"), 0);
    assert_eq!(h.state(), LifecycleState::Mounted);
}

#[test]
fn start_with_dump_restores_instead_of_cold_start() {
    let h = host();
    h.create_and_start();
    h.orch.suspend(id()).unwrap();
    let dump = h.root.join("dump/Dump.101");
    assert!(dump.is_file());
    assert_eq!(h.state(), LifecycleState::Suspended);

    h.journal.clear();
    h.orch.start(id(), StartOptions::default()).unwrap();
    assert_eq!(h.count("driver.restore 101 Full"), 1);
    assert_eq!(h.count("driver.create"), 0);
    assert_eq!(h.count("driver.limits"), 0);
    assert_eq!(h.count("driver.add_ip"), 0);
    // The full checkpoint unmounted storage; restore mounts it once.
    assert_eq!(h.count("plain.mount 101"), 1);
    assert_eq!(h.state(), LifecycleState::Running);
    assert!(!dump.exists());
}

#[test]
fn skip_restore_cold_starts_and_keeps_dump() {
    let h = host();
    h.create_and_start();
    h.orch.suspend(id()).unwrap();
    h.journal.clear();
    h.orch
        .start(
            id(),
            StartOptions {
                skip_restore: true,
                ..StartOptions::default()
            },
        )
        .unwrap();
    assert_eq!(h.count("driver.restore"), 0);
    assert_eq!(h.count("driver.create 101"), 1);
    assert!(h.root.join("dump/Dump.101").exists());
}

#[test]
fn failed_restore_unmounts_again() {
    let h = host();
    h.create_and_start();
    h.orch.suspend(id()).unwrap();
    h.driver.fail_on(FailPoint::Restore);
    let err = h.orch.resume(id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestoreError);
    assert!(!h.orch.status(id()).unwrap().mounted);
    assert!(h.root.join("dump/Dump.101").exists());
}

#[test]
fn checkpoint_needs_a_running_container() {
    let h = host();
    h.create();
    assert_eq!(
        h.orch.suspend(id()).unwrap_err().kind(),
        ErrorKind::NotRunning
    );
}

// Set

#[test]
fn set_ipadd_on_stopped_container_replaces_same_address() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    cmd.net.ip.add(ip("10.0.0.1"));
    cmd.net.ip.add(ip("10.0.0.5/32"));
    h.orch.create(id(), create_opts(cmd)).unwrap();

    let mut delta = ContainerSpec::default();
    delta.net.ip.add(ip("10.0.0.5/24"));
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(outcome.saved);
    assert!(!outcome.applied_live);

    let persisted = h.orch.load_persisted(id()).unwrap();
    assert_eq!(
        persisted.net.ip.items.as_slice(),
        [ip("10.0.0.1"), ip("10.0.0.5/24")]
    );
    assert_eq!(h.count("driver.add_ip"), 0);
}

#[test]
fn set_userpasswd_on_stopped_container_mounts_and_pushes() {
    let h = host();
    fs::write(
        h.root.join("dists/default.conf"),
        "SET_USERPASS=\"set_userpass.sh\"\n",
    )
    .unwrap();
    h.create();
    h.journal.clear();

    let mut delta = ContainerSpec::default();
    delta.misc.userpw.add("root:s3cret".parse().unwrap());
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(outcome.passwords_set);
    assert!(!outcome.applied_live);

    assert_eq!(h.count("plain.mount 101"), 1);
    assert_eq!(h.count("guest.set_userpass.sh 101"), 1);
    assert_eq!(h.count("plain.umount"), 1);
    let mount = h.journal.position("plain.mount 101").unwrap();
    let push = h.journal.position("guest.set_userpass.sh 101").unwrap();
    let umount = h.journal.position("plain.umount").unwrap();
    assert!(mount < push && push < umount);
    assert_eq!(h.state(), LifecycleState::Created);

    let runs = h.guest.runs();
    assert!(runs.iter().any(|(name, env)| name == "set_userpass.sh"
        && env.contains(&("USERPW".to_owned(), "root:s3cret".to_owned()))));
    assert!(!h.conf_text().contains("s3cret"));
}

#[test]
fn set_userpasswd_with_skip_guest_pushes_nothing() {
    let h = host();
    fs::write(
        h.root.join("dists/default.conf"),
        "SET_USERPASS=\"set_userpass.sh\"\n",
    )
    .unwrap();
    h.create();
    h.journal.clear();

    let mut delta = ContainerSpec::default();
    delta.misc.userpw.add("root:s3cret".parse().unwrap());
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                skip_guest: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(!outcome.passwords_set);
    assert_eq!(h.count("plain.mount"), 0);
    assert_eq!(h.count("guest."), 0);
}

#[test]
fn set_applies_safe_changes_live() {
    let h = host();
    h.create_and_start();
    let mut delta = ContainerSpec::default();
    delta.misc.hostname = Some("web1".to_owned());
    delta.net.ip.add(ip("10.0.0.9/24"));
    delta.cpu.units = Some(1000);
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(outcome.applied_live);
    assert!(outcome.skipped.is_empty());

    let c = h.driver.container(id()).unwrap();
    assert_eq!(c.ips, vec![ip("10.0.0.9/24")]);
    assert_eq!(c.cpu.and_then(|cpu| cpu.units), Some(1000));
    let runs = h.guest.runs();
    assert!(runs.iter().any(|(name, env)| name == "set_hostname.sh"
        && env.contains(&("HOSTNM".to_owned(), "web1".to_owned()))));
    assert!(h.conf_text().contains("HOSTNAME=\"web1\""));
}

#[test]
fn unsafe_change_with_error_mode_changes_nothing() {
    let h = host();
    h.create_and_start();
    let before = h.driver.container(id()).unwrap().caps;
    let conf_before = h.conf_text();

    let mut delta = ContainerSpec::default();
    delta.caps.apply_token("SYS_TIME:on").unwrap();
    let err = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                mode: Some(SetMode::Error),
                ..SetOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    assert_eq!(h.driver.container(id()).unwrap().caps, before);
    assert_eq!(h.conf_text(), conf_before);
}

#[test]
fn unsafe_change_with_restart_mode_stops_then_starts_once() {
    let h = host();
    h.create_and_start();
    let before = h.driver.container(id()).unwrap().caps;
    h.journal.clear();

    let mut delta = ContainerSpec::default();
    delta.caps.apply_token("SYS_TIME:on").unwrap();
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                mode: Some(SetMode::Restart),
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(outcome.restarted);
    assert_eq!(h.count("driver.stop 101 graceful"), 1);
    assert_eq!(h.count("driver.create 101"), 1);
    assert!(
        h.journal.position("driver.stop 101").unwrap()
            < h.journal.position("driver.create 101").unwrap()
    );
    assert_ne!(h.driver.container(id()).unwrap().caps, before);
    assert!(h.conf_text().contains("CAPABILITY="));
}

#[test]
fn unsafe_change_without_mode_is_skipped_but_saved() {
    let h = host();
    h.create_and_start();
    let before = h.driver.container(id()).unwrap().caps;

    let mut delta = ContainerSpec::default();
    delta.caps.apply_token("SYS_TIME:on").unwrap();
    let outcome = h
        .orch
        .set(
            id(),
            SetOptions {
                cmd: delta,
                save: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert_eq!(outcome.skipped, ["CAPABILITY"]);
    assert!(!outcome.restarted);
    assert!(outcome.saved);
    assert_eq!(h.driver.container(id()).unwrap().caps, before);
}

#[test]
fn set_on_missing_container_is_not_exist() {
    let h = host();
    let err = h.orch.set(id(), SetOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExist);
}

#[test]
fn module_option_is_persisted() {
    let h = host();
    h.create();
    h.orch
        .set(
            id(),
            SetOptions {
                module_options: vec![(
                    "bindmount_add".to_owned(),
                    Some("/srv/data:/data:ro".to_owned()),
                )],
                save: true,
                ..SetOptions::default()
            },
        )
        .unwrap();
    assert!(h.conf_text().contains("BINDMOUNT=\"/srv/data:/data:ro\""));
}

// Destroy

#[test]
fn destroy_refuses_running_container() {
    let h = host();
    h.create_and_start();
    let err = h.orch.destroy(id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    assert!(h.private().join("sbin/init").is_file());
    assert!(h.conf().exists());
}

#[test]
fn destroy_refuses_mounted_container() {
    let h = host();
    h.create();
    h.orch.mount(id()).unwrap();
    let err = h.orch.destroy(id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyMounted);
    assert!(h.private().join("sbin/init").is_file());
    assert!(h.conf().exists());
}

#[test]
fn destroy_removes_private_and_backs_up_config() {
    let h = host();
    h.create();
    h.orch.destroy(id()).unwrap();
    assert!(!h.private().exists());
    assert!(!h.conf().exists());
    assert!(h.root.join("conf/101.conf.destroyed").is_file());
    assert_eq!(h.state(), LifecycleState::NonExistent);
    assert_eq!(h.count("quota.drop 101"), 1);

    let err = h.orch.destroy(id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExist);
}

// Storage conversion and snapshots

#[test]
fn convert_moves_tree_into_image() {
    let h = host();
    h.create();
    assert!(matches!(
        h.orch.snapshot_create(id()),
        Err(CoreError::Unsupported(_))
    ));

    h.orch.convert(id()).unwrap();
    assert!(h.private().join("root.hdd/DiskDescriptor.xml").is_file());
    assert!(!h.private().join("sbin/init").exists());
    assert!(h.root.join("root/101/sbin/init").is_file());
    let persisted = h.orch.load_persisted(id()).unwrap();
    assert_eq!(persisted.fs.layout, Some(StorageLayout::Ploop));
    assert_eq!(h.count("ploop.create_image"), 1);

    let uuid = h.orch.snapshot_create(id()).unwrap();
    let list = h.orch.snapshot_list(id()).unwrap();
    assert_eq!(list.len(), 1);
    assert!(list[0].current);
    h.orch.snapshot_delete(id(), &uuid).unwrap();
    assert!(h.orch.snapshot_list(id()).unwrap().is_empty());

    let err = h.orch.convert(id()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameterValue);
}

#[test]
fn snapshot_switch_refuses_running_container() {
    let h = host();
    let mut cmd = ContainerSpec::default();
    cmd.fs.layout = Some(StorageLayout::Ploop);
    h.orch.create(id(), create_opts(cmd)).unwrap();
    let uuid = h.orch.snapshot_create(id()).unwrap();
    h.orch.start(id(), StartOptions::default()).unwrap();
    let err = h.orch.snapshot_switch(id(), &uuid).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
}

#[test]
fn list_reports_every_configured_container() {
    let h = host();
    h.create();
    let other = ContainerId::new(102).unwrap();
    h.orch
        .create(other, create_opts(ContainerSpec::default()))
        .unwrap();
    h.orch.start(other, StartOptions::default()).unwrap();

    let all = h.orch.list().unwrap();
    let states: Vec<(u32, LifecycleState)> = all.iter().map(|s| (s.id.get(), s.state)).collect();
    assert_eq!(
        states,
        [(101, LifecycleState::Created), (102, LifecycleState::Running)]
    );
    let json = serde_json::to_string(&all[1]).unwrap();
    assert!(json.contains("\"running\""));
}

#[test]
fn exec_requires_running_container() {
    let h = host();
    h.create();
    let argv = vec!["true".to_owned()];
    assert_eq!(
        h.orch.exec(id(), &argv).unwrap_err().kind(),
        ErrorKind::NotRunning
    );
    h.orch.start(id(), StartOptions::default()).unwrap();
    assert_eq!(h.orch.exec(id(), &argv).unwrap(), 0);
    assert_eq!(h.count("driver.exec 101 true"), 1);
}
