//! Benchmark for cluster name handling
//!
//! A scan parses every image and snapshot name in the pool, so parsing
//! has to stay cheap for pools with thousands of entries.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rbd_sr::domain::ports::ImageEntry;
use rbd_sr::naming::new_volume_uuid;
use rbd_sr::repository::scan::volumes_from_listing;
use rbd_sr::Namespace;

fn bench_parse_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("naming");
    group.throughput(Throughput::Elements(1));

    let ns = Namespace::new("xen-").unwrap();
    let parent = new_volume_uuid();
    let snap = new_volume_uuid();
    let image = ns.image_name(&parent);
    let spec = ns.snapshot_spec(&parent, &snap);

    group.bench_function("parse_image_name", |b| {
        b.iter(|| ns.parse_image_name(black_box(&image)));
    });

    group.bench_function("parse_snapshot_spec", |b| {
        b.iter(|| ns.parse_spec(black_box(&spec)));
    });

    group.bench_function("reject_foreign_name", |b| {
        b.iter(|| ns.parse_spec(black_box("other-vdi-not-a-uuid@snap")));
    });

    group.finish();
}

fn bench_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("listing");
    group.throughput(Throughput::Elements(1000));

    // 500 images with one snapshot each
    let ns = Namespace::new("xen-").unwrap();
    let mut entries = Vec::new();
    for _ in 0..500 {
        let image = ns.image_name(&new_volume_uuid());
        entries.push(ImageEntry {
            image: image.clone(),
            snapshot: None,
            size: 1 << 30,
            protected: false,
            parent: None,
        });
        entries.push(ImageEntry {
            image,
            snapshot: Some(ns.snapshot_name(&new_volume_uuid())),
            size: 1 << 30,
            protected: true,
            parent: None,
        });
    }

    group.bench_function("volumes_from_1000_entries", |b| {
        b.iter(|| volumes_from_listing(&ns, "rbd", black_box(&entries)));
    });

    group.finish();
}

criterion_group!(benches, bench_parse_names, bench_listing);
criterion_main!(benches);
