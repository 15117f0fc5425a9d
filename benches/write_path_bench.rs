// benches/write_path_bench.rs

//! Microbenchmarks for the hot pieces of the write path: TLog entry
//! encoding, cluster hashing, and metadata batch application.

use criterion::{Criterion, criterion_group, criterion_main};
use peridot::core::metadata::{MetaDataStore, PagedMetaDataStore};
use peridot::core::tlog::TLogEntry;
use peridot::core::types::{ClusterAddress, ClusterHash, ClusterLocation, ScoName};
use std::hint::black_box;

fn bench_tlog_encode(c: &mut Criterion) {
    let entry = TLogEntry::Cluster {
        addr: ClusterAddress(123456),
        loc: ClusterLocation::new(ScoName::new(42, 0), 17),
        hash: ClusterHash(0xfeedface_deadbeef),
    };
    c.bench_function("tlog_entry_encode_decode", |b| {
        b.iter(|| {
            let buf = black_box(entry).encode();
            TLogEntry::decode(black_box(&buf)).unwrap()
        })
    });
}

fn bench_cluster_hash(c: &mut Criterion) {
    let payload = vec![0xabu8; 4096];
    c.bench_function("cluster_hash_4k", |b| {
        b.iter(|| ClusterHash::of(black_box(&payload)))
    });
}

fn bench_metadata_multi_set(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("metadata_multi_set_64", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = PagedMetaDataStore::new(256, 8);
                let batch: Vec<_> = (0..64u64)
                    .map(|i| {
                        (
                            ClusterAddress(i),
                            ClusterLocation::new(ScoName::new(1, 0), i as u16),
                            ClusterHash(i as u128),
                        )
                    })
                    .collect();
                store.multi_set(&batch).await.unwrap();
            })
        })
    });
}

criterion_group!(
    benches,
    bench_tlog_encode,
    bench_cluster_hash,
    bench_metadata_multi_set
);
criterion_main!(benches);
