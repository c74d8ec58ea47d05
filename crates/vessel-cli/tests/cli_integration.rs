//! CLI subprocess integration tests.
//!
//! These tests invoke the `vesselctl` binary as a subprocess against a
//! throwaway host layout with the mock kernel driver, and verify exit codes,
//! stdout content and JSON output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Host {
    dir: tempfile::TempDir,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("conf")).unwrap();
        fs::create_dir_all(root.join("template/cache")).unwrap();
        write_template(&root.join("template/cache/t1.tar"));
        fs::write(
            root.join("vessel.conf"),
            format!(
                "KERNEL_DRIVER=\"mock\"\n\
                 LOCKDIR=\"{r}/lock\"\n\
                 CONF_DIR=\"{r}/conf\"\n\
                 TEMPLATE=\"{r}/template\"\n\
                 DUMPDIR=\"{r}/dump\"\n\
                 DIST_DIR=\"{r}/dists\"\n\
                 VE_PRIVATE=\"{r}/private/$VEID\"\n\
                 VE_ROOT=\"{r}/root/$VEID\"\n",
                r = root.display()
            ),
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn run(&self, args: &[&str]) -> Output {
        vesselctl()
            .arg("--config-file")
            .arg(self.path("vessel.conf"))
            .args(args)
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let mut full = vec!["--json"];
        full.extend_from_slice(args);
        let out = self.run(&full);
        assert!(out.status.success(), "{}", stderr(&out));
        serde_json::from_slice(&out.stdout).unwrap()
    }
}

fn vesselctl() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vesselctl"));
    cmd.env("VESSEL_SKIP_PREREQS", "1").env_remove("VESSEL_CONF");
    cmd
}

fn write_template(path: &Path) {
    let mut b = tar::Builder::new(fs::File::create(path).unwrap());
    for (name, body) in [("etc/hostname", "localhost\n"), ("sbin/init", "#!/bin/sh\n")] {
        let mut h = tar::Header::new_gnu();
        h.set_size(body.len() as u64);
        h.set_mode(0o755);
        h.set_cksum();
        b.append_data(&mut h, name, body.as_bytes()).unwrap();
    }
    b.finish().unwrap();
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = vesselctl().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("vesselctl"));
}

#[test]
fn cli_help_lists_commands() {
    let output = vesselctl().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for cmd in ["create", "destroy", "chkpnt", "snapshot-list", "convert"] {
        assert!(text.contains(cmd), "help must list '{cmd}'");
    }
}

#[test]
fn cli_syntax_errors_exit_20() {
    for args in [
        vec!["frobnicate"],
        vec!["start"],
        vec!["chkpnt", "101", "--suspend", "--dump"],
        vec!["set", "101", "--setmode", "later"],
    ] {
        let output = vesselctl().args(&args).output().unwrap();
        assert_eq!(output.status.code(), Some(20), "args {args:?}");
    }
}

#[test]
fn cli_completions_bash() {
    let output = vesselctl().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("vesselctl"));
}

#[test]
fn cli_man_pages_written() {
    let dir = tempfile::tempdir().unwrap();
    let output = vesselctl()
        .arg("man-pages")
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(dir.path().join("vesselctl.1").exists());
    assert!(dir.path().join("vesselctl-start.1").exists());
}

#[test]
fn cli_status_of_unknown_container() {
    let host = Host::new();
    let out = host.run(&["status", "101"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(stdout(&out).starts_with("CTID 101 deleted unmounted down"));

    let v = host.json(&["status", "101"]);
    assert_eq!(v["state"], "nonexistent");
    assert_eq!(v["exists"], false);
}

#[test]
fn cli_unknown_name_is_not_exist() {
    let host = Host::new();
    let out = host.run(&["status", "nosuchname"]);
    assert_eq!(out.status.code(), Some(11), "{}", stderr(&out));
}

#[test]
fn cli_list_empty_json() {
    let host = Host::new();
    assert_eq!(host.json(&["list"]), serde_json::json!([]));
}

#[test]
fn cli_modules_json_lists_bindmount() {
    let host = Host::new();
    let v = host.json(&["modules"]);
    let names: Vec<_> = v
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_owned())
        .collect();
    assert!(names.contains(&"bindmount".to_owned()));
}

#[test]
fn cli_bad_parameter_value_exits_21() {
    let host = Host::new();
    let out = host.run(&["set", "101", "--cpuunits", "3", "--save"]);
    assert_eq!(out.status.code(), Some(21), "{}", stderr(&out));
}

#[test]
fn cli_exec_on_stopped_container_exits_31() {
    let host = Host::new();
    let out = host.run(&["exec", "101", "--", "true"]);
    assert_eq!(out.status.code(), Some(31), "{}", stderr(&out));
}

#[test]
fn cli_set_on_missing_container_exits_11() {
    let host = Host::new();
    let out = host.run(&["set", "101", "--hostname", "web", "--save"]);
    assert_eq!(out.status.code(), Some(11), "{}", stderr(&out));
}

#[test]
fn cli_create_with_unknown_template_exits_47() {
    let host = Host::new();
    let out = host.run(&["create", "101", "--ostemplate", "nope"]);
    assert_eq!(out.status.code(), Some(47), "{}", stderr(&out));
    assert!(!host.path("private/101").exists());
    assert!(!host.path("conf/101.conf").exists());
}

#[test]
fn cli_create_set_destroy_round_trip() {
    let host = Host::new();

    let out = host.run(&["create", "101", "--ostemplate", "t1"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(host.path("private/101/etc/hostname").exists());
    let conf = fs::read_to_string(host.path("conf/101.conf")).unwrap();
    assert!(conf.contains("OSTEMPLATE=\"t1\""), "{conf}");

    let again = host.run(&["create", "101", "--ostemplate", "t1"]);
    assert_eq!(again.status.code(), Some(44), "{}", stderr(&again));

    let out = host.run(&["set", "101", "--hostname", "web1", "--name", "web", "--save"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let conf = fs::read_to_string(host.path("conf/101.conf")).unwrap();
    assert!(conf.contains("HOSTNAME=\"web1\""), "{conf}");

    let v = host.json(&["status", "web"]);
    assert_eq!(v["id"], 101);
    assert_eq!(v["exists"], true);
    assert_eq!(v["hostname"], "web1");

    let list = host.json(&["list"]);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let out = host.run(&["destroy", "101"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(!host.path("private/101").exists());
    assert!(!host.path("conf/101.conf").exists());
}

#[test]
fn cli_nameserver_can_be_added_and_removed() {
    let host = Host::new();
    let out = host.run(&["create", "101", "--ostemplate", "t1"]);
    assert!(out.status.success(), "{}", stderr(&out));

    let out = host.run(&["set", "101", "--nameserver", "8.8.8.8", "--save"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let conf = fs::read_to_string(host.path("conf/101.conf")).unwrap();
    assert!(conf.contains("NAMESERVER=\"8.8.8.8\""), "{conf}");

    let out = host.run(&["set", "101", "--nameserver-del", "8.8.8.8", "--save"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let conf = fs::read_to_string(host.path("conf/101.conf")).unwrap();
    assert!(!conf.contains("NAMESERVER="), "{conf}");
}

#[test]
fn cli_description_with_line_break_is_rejected() {
    let host = Host::new();
    let out = host.run(&["create", "101", "--ostemplate", "t1"]);
    assert!(out.status.success(), "{}", stderr(&out));

    let out = host.run(&["set", "101", "--description", "web\nONBOOT=\"yes", "--save"]);
    assert_eq!(out.status.code(), Some(21), "{}", stderr(&out));
    let conf = fs::read_to_string(host.path("conf/101.conf")).unwrap();
    assert!(!conf.contains("ONBOOT"), "{conf}");
}
