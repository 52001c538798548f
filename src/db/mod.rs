mod options;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;

use crate::compaction::{CompactionOptions, CompactionPicker};
use crate::memtable::MemTableManager;
use crate::seek;
use crate::version::VersionSet;

pub use options::{DbOptions, ReadOptions, WriteOptions};

pub type Value = bytes::Bytes;

/// Handle to a pinned read point.
///
/// The handle carries the seqno it pinned; the database only remembers how
/// many handles pin each seqno. Release every snapshot you create, or the
/// pin holds compaction back for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    seqno: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DbMetrics {
    pub latest_seqno: u64,
    pub min_pinned_seqno: u64,
    pub immutable_memtables: usize,
    pub levels: BTreeMap<u8, crate::compaction::LevelMetrics>,
}

#[derive(Debug, Clone)]
pub(crate) struct LookupResult {
    pub seqno: u64,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    /// A merge operand appended to the key's history.
    Merge,
    Del,
    /// Range deletion tombstone. The key is the inclusive start, the value
    /// the exclusive end.
    RangeDel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub kind: OpKind,
    pub key: bytes::Bytes,
    pub value: bytes::Bytes,
}

impl Op {
    pub fn put(key: impl Into<bytes::Bytes>, value: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn merge(key: impl Into<bytes::Bytes>, operand: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Merge,
            key: key.into(),
            value: operand.into(),
        }
    }

    pub fn delete(key: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::Del,
            key: key.into(),
            value: bytes::Bytes::new(),
        }
    }

    /// Delete all keys in `[start, end)`.
    pub fn delete_range(start: impl Into<bytes::Bytes>, end: impl Into<bytes::Bytes>) -> Self {
        Self {
            kind: OpKind::RangeDel,
            key: start.into(),
            value: end.into(),
        }
    }
}

/// Database handle.
///
/// Writes go to memtables and become durable on `flush` (or `sync`
/// writes). Point reads fuse the memtables with the level tree,
/// newest-wins. The ordered read path answers "smallest live key at or
/// after a target" without merging the whole tree.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

struct DbInner {
    options: DbOptions,
    memtables: Arc<MemTableManager>,
    versions: Arc<VersionSet>,
    /// Next seqno to hand out to a write batch.
    next_seqno: AtomicU64,
    /// Highest seqno whose batch has fully landed in the memtables.
    visible_seqno: AtomicU64,
    /// seqno -> number of outstanding snapshots pinned at it. The first
    /// key is the compaction retention floor.
    pinned_read_seqnos: Mutex<BTreeMap<u64, usize>>,
    flush_lock: Mutex<()>,
}

impl DbInner {
    fn latest_seqno(&self) -> u64 {
        self.visible_seqno.load(Ordering::Relaxed)
    }

    /// Oldest seqno a reader may still be pinned at. With no snapshots
    /// outstanding this is the newest write, so compaction may collapse
    /// every superseded version.
    fn min_pinned_seqno(&self) -> u64 {
        self.pinned_read_seqnos
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.latest_seqno())
    }

    fn resolve_read_seqno(&self, snapshot: Option<SnapshotId>) -> anyhow::Result<u64> {
        match snapshot {
            None => Ok(self.latest_seqno()),
            Some(snapshot) => {
                anyhow::ensure!(
                    self.pinned_read_seqnos
                        .lock()
                        .contains_key(&snapshot.seqno),
                    "snapshot is no longer pinned"
                );
                Ok(snapshot.seqno)
            }
        }
    }
}

impl Db {
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| format!("create dir {dir:?}"))?;

        let versions = Arc::new(VersionSet::recover(&dir).context("recover versionset")?);
        let memtables = Arc::new(MemTableManager::new(options.memtable_shards));

        let latest = versions.latest_seqno();
        log::debug!("opened db at {dir:?}, latest_seqno={latest}");

        Ok(Self {
            inner: Arc::new(DbInner {
                options,
                memtables,
                versions,
                next_seqno: AtomicU64::new(latest.saturating_add(1)),
                visible_seqno: AtomicU64::new(latest),
                pinned_read_seqnos: Mutex::new(BTreeMap::new()),
                flush_lock: Mutex::new(()),
            }),
        })
    }

    pub fn put(
        &self,
        key: impl Into<bytes::Bytes>,
        value: impl Into<bytes::Bytes>,
        opts: WriteOptions,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::put(key, value)], opts)
    }

    pub fn merge(
        &self,
        key: impl Into<bytes::Bytes>,
        operand: impl Into<bytes::Bytes>,
        opts: WriteOptions,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::merge(key, operand)], opts)
    }

    pub fn delete(&self, key: impl Into<bytes::Bytes>, opts: WriteOptions) -> anyhow::Result<()> {
        self.write_batch(vec![Op::delete(key)], opts)
    }

    pub fn delete_range(
        &self,
        start: impl Into<bytes::Bytes>,
        end: impl Into<bytes::Bytes>,
        opts: WriteOptions,
    ) -> anyhow::Result<()> {
        self.write_batch(vec![Op::delete_range(start, end)], opts)
    }

    pub fn write_batch(&self, ops: Vec<Op>, opts: WriteOptions) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        for op in &ops {
            if op.kind == OpKind::RangeDel && op.key >= op.value {
                anyhow::bail!("delete-range requires start < end");
            }
        }

        let seqno_base = self
            .inner
            .next_seqno
            .fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.inner.memtables.apply_batch(seqno_base, &ops)?;
        self.inner
            .visible_seqno
            .fetch_max(seqno_base + ops.len() as u64 - 1, Ordering::Relaxed);

        if self.inner.memtables.mutable_approximate_bytes() >= self.inner.options.memtable_bytes {
            self.inner.memtables.rotate_memtable();
        }

        if opts.sync {
            self.flush()?;
        }
        Ok(())
    }

    pub fn create_snapshot(&self) -> SnapshotId {
        let seqno = self.inner.latest_seqno();
        *self
            .inner
            .pinned_read_seqnos
            .lock()
            .entry(seqno)
            .or_insert(0) += 1;
        SnapshotId { seqno }
    }

    pub fn release_snapshot(&self, snapshot: SnapshotId) {
        let mut pinned = self.inner.pinned_read_seqnos.lock();
        if let Some(count) = pinned.get_mut(&snapshot.seqno) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&snapshot.seqno);
            }
        }
    }

    pub fn get(&self, key: impl AsRef<[u8]>, opts: ReadOptions) -> anyhow::Result<Option<Value>> {
        let snapshot = self.inner.resolve_read_seqno(opts.snapshot)?;

        let mask_range_deletions = !opts.ignore_range_deletions;
        let mem = self
            .inner
            .memtables
            .get(key.as_ref(), snapshot, mask_range_deletions)
            .context("memtable get")?;
        let sst = self
            .inner
            .versions
            .get(key.as_ref(), snapshot, mask_range_deletions)
            .context("sst get")?
            .map(|(seqno, value)| LookupResult { seqno, value });

        let chosen = match (mem, sst) {
            (Some(a), Some(b)) => {
                if a.seqno >= b.seqno {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        Ok(chosen.and_then(|r| r.value))
    }

    /// Smallest live user key, if the database holds any.
    pub fn get_smallest(&self, opts: ReadOptions) -> anyhow::Result<Option<bytes::Bytes>> {
        self.get_smallest_at_or_after(opts, &[] as &[u8])
    }

    /// Smallest live user key at or after `target`.
    ///
    /// Point deletions and range tombstones from newer levels mask older
    /// data exactly as a point read would see it. Snapshot reads and
    /// `ignore_range_deletions` are not supported here.
    pub fn get_smallest_at_or_after(
        &self,
        opts: ReadOptions,
        target: impl AsRef<[u8]>,
    ) -> anyhow::Result<Option<bytes::Bytes>> {
        anyhow::ensure!(
            opts.snapshot.is_none(),
            "get_smallest does not support snapshot reads"
        );
        anyhow::ensure!(
            !opts.ignore_range_deletions,
            "get_smallest always honors range deletions"
        );

        let snapshot_seqno = u64::MAX;
        let mut levels = Vec::new();

        for snap in self.inner.memtables.level_snapshots(snapshot_seqno) {
            levels.push(seek::LevelInput {
                points: seek::PointCursor::Mem(seek::MemCursor::new(snap.entries)),
                tombstones: Some(snap.tombstones),
            });
        }
        for input in self.inner.versions.seek_level_inputs(snapshot_seqno)? {
            levels.push(seek::LevelInput {
                points: seek::PointCursor::Run(seek::RunCursor::new(input.readers)),
                tombstones: input.tombstones,
            });
        }

        log::trace!(
            "get_smallest_at_or_after target={:?} levels={}",
            target.as_ref(),
            levels.len()
        );
        seek::get_smallest_at_or_after(target.as_ref(), levels, seek::SeekDiagnostics::default())
    }

    /// Rotates the mutable memtable and persists every frozen table to L0,
    /// oldest first.
    pub fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.inner.flush_lock.lock();

        if self.inner.memtables.mutable_approximate_bytes() > 0 {
            self.inner.memtables.rotate_memtable();
        }

        while let Some(mem) = self.inner.memtables.oldest_immutable() {
            let entries = mem.to_sorted_entries();
            self.inner
                .versions
                .flush_to_l0(&entries)
                .context("flush memtable to l0")?;
            self.inner.memtables.drop_oldest_immutable();
        }
        Ok(())
    }

    /// Flushes, then folds L0 into the sorted run at L1.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.flush()?;
        self.inner
            .versions
            .compact_l0_to_l1(self.inner.min_pinned_seqno())?;
        Ok(())
    }

    /// Runs a compaction when the picker says L0 is worth folding down.
    pub fn compact_if_needed(&self) -> anyhow::Result<bool> {
        let compaction_options = CompactionOptions {
            l0_file_trigger: self.inner.options.l0_compaction_trigger,
            ..CompactionOptions::default()
        };
        let metrics = self.inner.versions.level_metrics();
        let pick = CompactionPicker::pick_highest_score(&metrics, &compaction_options);
        if CompactionPicker::should_compact(&metrics, &compaction_options)
            && pick.map(|p| p.level) == Some(0)
        {
            self.compact()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn metrics(&self) -> DbMetrics {
        DbMetrics {
            latest_seqno: self.inner.latest_seqno(),
            min_pinned_seqno: self.inner.min_pinned_seqno(),
            immutable_memtables: self.inner.memtables.immutable_count(),
            levels: self.inner.versions.level_metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write() -> WriteOptions {
        WriteOptions { sync: false }
    }

    #[test]
    fn snapshot_pins_count_per_seqno() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let db = Db::open(dir.path(), DbOptions::default())?;

        db.put(&b"a"[..], &b"1"[..], write())?;
        let first = db.create_snapshot();
        let second = db.create_snapshot();
        assert_eq!(first, second);
        assert_eq!(db.inner.min_pinned_seqno(), 1);

        db.put(&b"b"[..], &b"2"[..], write())?;
        assert_eq!(db.inner.latest_seqno(), 2);

        // One release keeps the floor; the second lifts it to the newest
        // write.
        db.release_snapshot(first);
        assert_eq!(db.inner.min_pinned_seqno(), 1);
        db.release_snapshot(second);
        assert_eq!(db.inner.min_pinned_seqno(), 2);
        Ok(())
    }

    #[test]
    fn released_snapshot_is_rejected_by_reads() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let db = Db::open(dir.path(), DbOptions::default())?;

        db.put(&b"k"[..], &b"v"[..], write())?;
        let snap = db.create_snapshot();
        db.release_snapshot(snap);

        let err = db
            .get(
                b"k",
                ReadOptions {
                    snapshot: Some(snap),
                    ignore_range_deletions: false,
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("no longer pinned"));
        Ok(())
    }

    #[test]
    fn pinned_snapshot_defers_tombstone_compaction() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let db = Db::open(dir.path(), DbOptions::default())?;

        db.put(&b"a"[..], &b"1"[..], write())?;
        db.flush()?;
        let snap = db.create_snapshot();
        db.delete_range(&b"a"[..], &b"z"[..], write())?;

        // The tombstone sits above the pin, so its file must stay in L0.
        db.compact()?;
        assert!(db.metrics().levels.contains_key(&0));
        assert_eq!(
            db.get(
                b"a",
                ReadOptions {
                    snapshot: Some(snap),
                    ignore_range_deletions: false,
                },
            )?,
            Some(Value::from("1"))
        );
        assert_eq!(db.get(b"a", ReadOptions::default())?, None);

        db.release_snapshot(snap);
        db.compact()?;
        assert!(!db.metrics().levels.contains_key(&0));
        Ok(())
    }
}
