use criterion::{criterion_group, criterion_main, Criterion};
use std::fmt::Write;
use vessel_schema::{
    compute_derived, merge_three_way, parse_str, ContainerSpec, IpEntry, NoClaim,
};

fn sample_config(ips: usize) -> String {
    let mut s = String::from(
        "VE_PRIVATE=\"/vz/private/101\"\nVE_ROOT=\"/vz/root/101\"\nOSTEMPLATE=\"debian-12\"\n\
         PHYSPAGES=\"0:262144\"\nSWAPPAGES=\"0:65536\"\nNUMPROC=\"400:400\"\nCPUUNITS=\"1000\"\n\
         HOSTNAME=\"bench.example.com\"\nNAMESERVER=\"8.8.8.8 1.1.1.1\"\n",
    );
    s.push_str("IP_ADDRESS=\"");
    for i in 0..ips {
        let _ = write!(s, "10.{}.{}.{} ", (i >> 16) & 255, (i >> 8) & 255, i & 255);
    }
    s.push_str("\"\n");
    s
}

fn bench_parse(c: &mut Criterion) {
    let content = sample_config(256);
    c.bench_function("parse_config_256ips", |b| {
        b.iter(|| {
            let mut spec = ContainerSpec::default();
            parse_str(&content, &mut spec, &NoClaim, "bench").unwrap();
            spec
        });
    });
}

fn bench_merge(c: &mut Criterion) {
    let mut global = ContainerSpec::default();
    parse_str(
        "CPUUNITS=\"1000\"\nNAMESERVER=\"9.9.9.9\"\n",
        &mut global,
        &NoClaim,
        "g",
    )
    .unwrap();
    let mut persisted = ContainerSpec::default();
    parse_str(&sample_config(256), &mut persisted, &NoClaim, "p").unwrap();
    let mut cmd = ContainerSpec::default();
    for i in 0..32u8 {
        cmd.net.ip.add(format!("192.168.0.{i}/24").parse::<IpEntry>().unwrap());
        cmd.net.ip.remove(format!("10.0.0.{i}").parse::<IpEntry>().unwrap());
    }

    c.bench_function("merge_three_way_256ips_32delta", |b| {
        b.iter(|| {
            let mut merged = merge_three_way(&global, &persisted, &cmd);
            compute_derived(&mut merged.res);
            merged
        });
    });
}

criterion_group!(benches, bench_parse, bench_merge);
criterion_main!(benches);
