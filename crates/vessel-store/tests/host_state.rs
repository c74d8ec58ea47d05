use std::fs;
use vessel_schema::{ContainerId, ContainerSpec, NoClaim};
use vessel_store::{expand_template, remove_tree_async, ConfStore, HostLayout};

fn template_tar() -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    for (path, body) in [("etc/hostname", "localhost\n"), ("sbin/init", "#!/bin/sh\n")] {
        let mut h = tar::Header::new_gnu();
        h.set_size(body.len() as u64);
        h.set_mode(0o755);
        h.set_cksum();
        b.append_data(&mut h, path, body.as_bytes()).unwrap();
    }
    b.into_inner().unwrap()
}

#[test]
fn create_then_destroy_host_state() {
    let root = tempfile::tempdir().unwrap();
    let layout = HostLayout::under(root.path());
    layout.initialize().unwrap();
    let confs = ConfStore::new(layout.clone());
    let id = ContainerId::new(101).unwrap();

    let cache = layout.template_dir().join("cache");
    fs::create_dir_all(&cache).unwrap();
    fs::write(cache.join("mini.tar"), template_tar()).unwrap();
    let archive = layout.template_archive("mini").unwrap();

    let private = root.path().join("private/101");
    expand_template(&archive, &private).unwrap();
    assert!(private.join("sbin/init").is_file());

    let mut spec = ContainerSpec::default();
    spec.fs.private = Some(private.clone());
    spec.template.ostemplate = Some("mini".to_owned());
    confs.save(id, &spec, &ContainerSpec::default()).unwrap();
    confs.set_name(id, "mini-box").unwrap();
    assert_eq!(confs.resolve("mini-box").unwrap(), Some(id));
    assert_eq!(confs.list().unwrap(), vec![id]);

    let (loaded, _) = confs.load(id, &NoClaim).unwrap();
    assert_eq!(loaded.private_path(), Some(private.as_path()));

    remove_tree_async(&private).unwrap();
    assert!(!private.exists());
    confs.backup(id).unwrap();
    assert!(!confs.exists(id));
    assert!(confs.list().unwrap().is_empty());
    assert_eq!(confs.resolve("mini-box").unwrap(), None);
}
