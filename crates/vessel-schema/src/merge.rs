//! Three-way layer merge: global < persisted < command line.
//!
//! Scalars take the most specific layer that sets them. Lists differ by
//! layer: a persisted list replaces the global one when non-empty, while the
//! command-line layer is a delta (add set, delete set, delete-all flag).

use crate::ordered_set::{Entry, ListParam};
use crate::spec::ContainerSpec;

pub fn merge_scalar<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(v) = src {
        *dst = Some(v.clone());
    }
}

/// Apply a command-line delta to a base list: `(base \ delete) ∪ add`,
/// or just `add` when `delete_all` is set.
pub fn merge_list<T: Entry>(base: &ListParam<T>, delta: &ListParam<T>) -> ListParam<T> {
    let mut items = if delta.delete_all {
        Default::default()
    } else {
        base.items.difference(&delta.delete)
    };
    items.extend(delta.items.iter().cloned());
    ListParam {
        items,
        ..ListParam::default()
    }
}

fn replace_list<T: Entry>(dst: &mut ListParam<T>, src: &ListParam<T>) {
    if !src.items.is_empty() {
        dst.items = src.items.clone();
    }
}

#[derive(Clone, Copy)]
enum ListMode {
    Replace,
    Delta,
}

fn list<T: Entry>(dst: &mut ListParam<T>, src: &ListParam<T>, mode: ListMode) {
    match mode {
        ListMode::Replace => replace_list(dst, src),
        ListMode::Delta => *dst = merge_list(dst, src),
    }
}

fn layer(dst: &mut ContainerSpec, src: &ContainerSpec, mode: ListMode) {
    merge_scalar(&mut dst.fs.private, &src.fs.private);
    merge_scalar(&mut dst.fs.root, &src.fs.root);
    merge_scalar(&mut dst.fs.mount_opts, &src.fs.mount_opts);
    merge_scalar(&mut dst.fs.layout, &src.fs.layout);

    merge_scalar(&mut dst.template.ostemplate, &src.template.ostemplate);
    merge_scalar(&mut dst.template.origin_sample, &src.template.origin_sample);
    merge_scalar(&mut dst.template.dist, &src.template.dist);

    for (res, bl) in &src.res.ub {
        dst.res.ub.insert(*res, *bl);
    }
    merge_scalar(&mut dst.res.vm_overcommit, &src.res.vm_overcommit);

    merge_scalar(&mut dst.cpu.units, &src.cpu.units);
    merge_scalar(&mut dst.cpu.limit, &src.cpu.limit);
    merge_scalar(&mut dst.cpu.vcpus, &src.cpu.vcpus);
    merge_scalar(&mut dst.cpu.mask, &src.cpu.mask);
    merge_scalar(&mut dst.ioprio, &src.ioprio);

    merge_scalar(&mut dst.quota.enabled, &src.quota.enabled);
    merge_scalar(&mut dst.quota.diskspace, &src.quota.diskspace);
    merge_scalar(&mut dst.quota.diskinodes, &src.quota.diskinodes);
    merge_scalar(&mut dst.quota.quotatime, &src.quota.quotatime);
    merge_scalar(&mut dst.quota.ugidlimit, &src.quota.ugidlimit);

    list(&mut dst.net.ip, &src.net.ip, mode);
    list(&mut dst.net.veth, &src.net.veth, mode);
    merge_scalar(&mut dst.net.netfilter, &src.net.netfilter);
    list(&mut dst.devices, &src.devices, mode);
    dst.caps = dst.caps.overlay(&src.caps);

    merge_scalar(&mut dst.misc.hostname, &src.misc.hostname);
    list(&mut dst.misc.nameserver, &src.misc.nameserver, mode);
    list(&mut dst.misc.searchdomain, &src.misc.searchdomain, mode);
    list(&mut dst.misc.userpw, &src.misc.userpw, mode);
    merge_scalar(&mut dst.misc.onboot, &src.misc.onboot);
    merge_scalar(&mut dst.misc.bootorder, &src.misc.bootorder);
    merge_scalar(&mut dst.misc.name, &src.misc.name);
    merge_scalar(&mut dst.misc.description, &src.misc.description);

    for (module, values) in &src.module_data {
        let slot = dst.module_data.entry(module.clone()).or_default();
        for (k, v) in values {
            slot.insert(k.clone(), v.clone());
        }
    }
}

/// Apply a command-line layer onto `dst` in place.
///
/// Used both for the effective view and to compute the next persisted view
/// before a save.
pub fn apply_overrides(dst: &mut ContainerSpec, cmd: &ContainerSpec) {
    layer(dst, cmd, ListMode::Delta);
}

/// Merge the three layers into one effective spec.
///
/// Derived counters are not computed here; callers run
/// [`crate::limits::compute_derived`] once on the result.
pub fn merge_three_way(
    global: &ContainerSpec,
    persisted: &ContainerSpec,
    cmd: &ContainerSpec,
) -> ContainerSpec {
    let mut out = global.clone();
    layer(&mut out, persisted, ListMode::Replace);
    apply_overrides(&mut out, cmd);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{BarrierLimit, UbResource};
    use crate::net::IpEntry;
    use crate::ordered_set::OrderedSet;
    use std::path::PathBuf;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    fn list_of(v: &[&str]) -> ListParam<String> {
        ListParam::from_items(strs(v))
    }

    fn delta(add: &[&str], del: &[&str], all: bool) -> ListParam<String> {
        ListParam {
            items: strs(add).into_iter().collect(),
            delete: strs(del).into_iter().collect::<OrderedSet<_>>(),
            delete_all: all,
        }
    }

    fn items(l: &ListParam<String>) -> Vec<String> {
        l.items.iter().cloned().collect()
    }

    fn sample_layers() -> (ContainerSpec, ContainerSpec) {
        let mut global = ContainerSpec::default();
        global.fs.private = Some(PathBuf::from("/vz/private/$VEID"));
        global.cpu.units = Some(1000);
        global.misc.nameserver = list_of(&["8.8.8.8"]);
        global.res.set(UbResource::Numproc, BarrierLimit::new(100, 100));

        let mut persisted = ContainerSpec::default();
        persisted.cpu.units = Some(2000);
        persisted.misc.hostname = Some("web".to_owned());
        persisted.net.ip = ListParam::from_items(["10.0.0.1".parse::<IpEntry>().unwrap()]);
        persisted
            .res
            .set(UbResource::Numfile, BarrierLimit::new(500, 500));
        (global, persisted)
    }

    #[test]
    fn empty_command_layer_is_a_noop() {
        let (global, persisted) = sample_layers();
        let merged = merge_three_way(&global, &persisted, &ContainerSpec::default());

        let mut expected = global.clone();
        layer(&mut expected, &persisted, ListMode::Replace);
        assert_eq!(merged, expected);
        assert_eq!(merged.cpu.units, Some(2000));
        assert_eq!(merged.misc.hostname.as_deref(), Some("web"));
        assert_eq!(merged.fs.private, global.fs.private);
        assert_eq!(items(&merged.misc.nameserver), strs(&["8.8.8.8"]));
        assert_eq!(merged.res.ub.len(), 2);
    }

    #[test]
    fn command_scalars_win() {
        let (global, persisted) = sample_layers();
        let mut cmd = ContainerSpec::default();
        cmd.cpu.units = Some(3000);
        let merged = merge_three_way(&global, &persisted, &cmd);
        assert_eq!(merged.cpu.units, Some(3000));
    }

    #[test]
    fn persisted_list_replaces_global_list() {
        let (global, mut persisted) = sample_layers();
        persisted.misc.nameserver = list_of(&["1.1.1.1"]);
        let merged = merge_three_way(&global, &persisted, &ContainerSpec::default());
        assert_eq!(items(&merged.misc.nameserver), strs(&["1.1.1.1"]));
    }

    #[test]
    fn list_delta_is_difference_then_union() {
        let cases: &[(&[&str], &[&str], &[&str], &[&str])] = &[
            (&["a", "b", "c"], &["d"], &["b"], &["a", "c", "d"]),
            (&["a", "b"], &["b", "e"], &[], &["a", "b", "e"]),
            (&["a"], &["a"], &["a"], &["a"]),
            (&[], &["x", "y"], &["z"], &["x", "y"]),
            (&["a", "b"], &[], &["a", "b"], &[]),
        ];
        for (base, add, del, want) in cases {
            let out = merge_list(&list_of(base), &delta(add, del, false));
            assert_eq!(items(&out), strs(want), "base={base:?} add={add:?} del={del:?}");
            assert!(out.delete.is_empty());
        }
    }

    #[test]
    fn delete_all_yields_exactly_the_add_set() {
        for base in [&["a", "b"][..], &[][..], &["q"][..]] {
            let out = merge_list(&list_of(base), &delta(&["n", "m"], &["a"], true));
            assert_eq!(items(&out), strs(&["n", "m"]));
        }
    }

    #[test]
    fn re_adding_an_ip_with_new_mask_replaces_in_place() {
        let base = ListParam::from_items(
            ["10.0.0.1", "10.0.0.5/16", "10.0.0.9"]
                .iter()
                .map(|s| s.parse::<IpEntry>().unwrap()),
        );
        let mut d = ListParam::default();
        d.add("10.0.0.5/24".parse::<IpEntry>().unwrap());
        let out = merge_list(&base, &d);
        let rendered: Vec<String> = out.items.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["10.0.0.1", "10.0.0.5/24", "10.0.0.9"]);
    }

    #[test]
    fn ip_delete_without_mask_matches_any_mask() {
        let base = ListParam::from_items(["10.0.0.5/24".parse::<IpEntry>().unwrap()]);
        let mut d = ListParam::default();
        d.remove("10.0.0.5".parse::<IpEntry>().unwrap());
        assert!(merge_list(&base, &d).items.is_empty());

        let mut d2 = ListParam::default();
        d2.remove("10.0.0.5/16".parse::<IpEntry>().unwrap());
        assert_eq!(merge_list(&base, &d2).items.len(), 1);
    }

    #[test]
    fn apply_overrides_computes_next_persisted_view() {
        let (_, mut persisted) = sample_layers();
        let mut cmd = ContainerSpec::default();
        cmd.net.ip.add("10.0.0.2/24".parse().unwrap());
        cmd.caps.apply_token("NET_ADMIN:on").unwrap();
        apply_overrides(&mut persisted, &cmd);
        let ips: Vec<String> = persisted.net.ip.items.iter().map(ToString::to_string).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2/24"]);
        assert_eq!(persisted.caps.tokens(), vec!["NET_ADMIN:on"]);
    }

    #[test]
    fn module_data_overlays_per_key() {
        let mut a = ContainerSpec::default();
        a.module_data
            .entry("m".to_owned())
            .or_default()
            .insert("K1".to_owned(), "1".to_owned());
        let mut b = ContainerSpec::default();
        b.module_data
            .entry("m".to_owned())
            .or_default()
            .insert("K2".to_owned(), "2".to_owned());
        apply_overrides(&mut a, &b);
        assert_eq!(a.module_value("m", "K1"), Some("1"));
        assert_eq!(a.module_value("m", "K2"), Some("2"));
    }
}
