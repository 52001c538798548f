use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use seekdb::{Db, DbOptions, ReadOptions, WriteOptions};

fn options() -> DbOptions {
    DbOptions {
        memtable_shards: 16,
        memtable_bytes: 4 * 1024 * 1024,
        l0_compaction_trigger: 4,
    }
}

fn key(i: u32) -> Bytes {
    // Fixed-width keys ensure stable ordering.
    Bytes::from(format!("k{:08}", i))
}

fn value(i: u32) -> Bytes {
    Bytes::from(format!("v{:08}", i))
}

fn open_temp_db() -> (TempDir, Db) {
    let dir = TempDir::new().expect("tempdir");
    let db = Db::open(dir.path(), options()).expect("open");
    (dir, db)
}

fn preload(db: &Db, n: u32) {
    for i in 0..n {
        db.put(key(i), value(i), WriteOptions { sync: false })
            .expect("put");
    }
}

/// Deletes every third key and blankets a slice of the keyspace with range
/// tombstones so the seeks have deletions to climb over.
fn punch_holes(db: &Db, n: u32) {
    for i in (0..n).step_by(3) {
        db.delete(key(i), WriteOptions { sync: false })
            .expect("delete");
    }
    db.delete_range(key(n / 4), key(n / 2), WriteOptions { sync: false })
        .expect("delete_range");
}

fn bench_seek_memtable(c: &mut Criterion) {
    c.bench_function("seek/memtable/50k", |b| {
        b.iter_batched(
            || {
                let (dir, db) = open_temp_db();
                preload(&db, 50_000);
                punch_holes(&db, 50_000);
                (dir, db)
            },
            |(_dir, db)| {
                let mut rng = StdRng::seed_from_u64(0x5eed);
                for _ in 0..1_000 {
                    let target = key(rng.gen_range(0..50_000));
                    let _ = db
                        .get_smallest_at_or_after(ReadOptions::default(), &target)
                        .expect("seek");
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_seek_levels(c: &mut Criterion) {
    c.bench_function("seek/l0+l1/50k", |b| {
        b.iter_batched(
            || {
                let (dir, db) = open_temp_db();
                preload(&db, 40_000);
                db.compact().expect("compact");
                preload(&db, 10_000);
                punch_holes(&db, 10_000);
                db.flush().expect("flush");
                (dir, db)
            },
            |(_dir, db)| {
                let mut rng = StdRng::seed_from_u64(0xdead_beef);
                for _ in 0..1_000 {
                    let target = key(rng.gen_range(0..50_000));
                    let _ = db
                        .get_smallest_at_or_after(ReadOptions::default(), &target)
                        .expect("seek");
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_scan_via_seek(c: &mut Criterion) {
    c.bench_function("seek/full-walk/10k", |b| {
        b.iter_batched(
            || {
                let (dir, db) = open_temp_db();
                preload(&db, 10_000);
                punch_holes(&db, 10_000);
                (dir, db)
            },
            |(_dir, db)| {
                let mut cursor: Vec<u8> = Vec::new();
                while let Some(found) = db
                    .get_smallest_at_or_after(ReadOptions::default(), &cursor)
                    .expect("seek")
                {
                    cursor = found.to_vec();
                    cursor.push(0);
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn benches(c: &mut Criterion) {
    bench_seek_memtable(c);
    bench_seek_levels(c);
    bench_scan_via_seek(c);
}

criterion_group!(seekdb_benches, benches);
criterion_main!(seekdb_benches);
