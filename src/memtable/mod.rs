use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::db::{LookupResult, Op, OpKind, Value};
use crate::internal_key::{InternalKey, KeyKind};
use crate::range_tombstone::{self, RangeTombstone};

/// One log level of in-memory data: its point entries in internal-key order
/// and its fragmented range tombstones.
#[derive(Debug)]
pub(crate) struct MemLevelSnapshot {
    pub entries: Vec<(InternalKey, Bytes)>,
    pub tombstones: Vec<RangeTombstone>,
}

#[derive(Debug)]
pub(crate) struct MemTableManager {
    shard_count: usize,
    mutable: RwLock<Arc<MemTable>>,
    immutables: Mutex<VecDeque<Arc<MemTable>>>,
}

#[derive(Debug)]
pub(crate) struct MemTable {
    shards: Vec<MemTableShard>,
    approximate_bytes: AtomicU64,
    range_tombstone_count: AtomicU64,
}

#[derive(Debug)]
struct MemTableShard {
    map: SkipMap<InternalKey, Bytes>,
}

#[derive(Debug, Clone)]
struct InternalEntry {
    key: InternalKey,
    value: Bytes,
}

impl MemTableManager {
    pub fn new(shards: usize) -> Self {
        let shard_count = shards.max(1);
        Self {
            shard_count,
            mutable: RwLock::new(Arc::new(MemTable::new(shard_count))),
            immutables: Mutex::new(VecDeque::new()),
        }
    }

    /// Freezes the mutable table and starts a fresh one. The frozen table
    /// joins the immutable list as its newest member.
    pub(crate) fn rotate_memtable(&self) -> Arc<MemTable> {
        let mut guard = self.mutable.write();
        let old = std::mem::replace(&mut *guard, Arc::new(MemTable::new(self.shard_count)));
        self.immutables.lock().push_front(old.clone());
        old
    }

    pub(crate) fn oldest_immutable(&self) -> Option<Arc<MemTable>> {
        self.immutables.lock().back().cloned()
    }

    pub(crate) fn drop_oldest_immutable(&self) {
        self.immutables.lock().pop_back();
    }

    pub(crate) fn mutable_approximate_bytes(&self) -> u64 {
        self.mutable.read().approximate_bytes()
    }

    pub(crate) fn immutable_count(&self) -> usize {
        self.immutables.lock().len()
    }

    pub fn apply_batch(&self, seqno_base: u64, ops: &[Op]) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let table = self.mutable.read().clone();
        table.apply_batch(self.shard_count, seqno_base, ops);
        Ok(())
    }

    /// Returns:
    /// - `Ok(None)` if key not present
    /// - `Ok(Some(None))` if tombstone present
    /// - `Ok(Some(Some(value)))` if value present
    pub fn get(
        &self,
        key: &[u8],
        snapshot_seqno: u64,
        mask_range_deletions: bool,
    ) -> anyhow::Result<Option<LookupResult>> {
        let mut candidate: Option<(u64, Option<Value>)> = None;

        let mutable = self.mutable.read().clone();
        let mut has_range_tombstones = mutable.has_range_tombstones();
        if let Some((seqno, v)) = mutable.get(key, snapshot_seqno) {
            candidate = Some((seqno, v));
        }

        for mem in self.immutables.lock().iter() {
            has_range_tombstones |= mem.has_range_tombstones();
            if let Some((seqno, v)) = mem.get(key, snapshot_seqno) {
                match &candidate {
                    Some((best_seq, _)) if *best_seq >= seqno => {}
                    _ => candidate = Some((seqno, v)),
                }
            }
        }

        let tombstone_seq = if has_range_tombstones && mask_range_deletions {
            self.range_tombstones(snapshot_seqno)
                .iter()
                .filter(|t| t.covers(key, snapshot_seqno))
                .map(|t| t.seqno)
                .max()
        } else {
            None
        };

        let result = match (candidate, tombstone_seq) {
            (Some((seq, value)), Some(tseq)) => {
                if tseq >= seq {
                    LookupResult {
                        seqno: tseq,
                        value: None,
                    }
                } else {
                    LookupResult { seqno: seq, value }
                }
            }
            (Some((seq, value)), None) => LookupResult { seqno: seq, value },
            (None, Some(tseq)) => LookupResult {
                seqno: tseq,
                value: None,
            },
            (None, None) => return Ok(None),
        };

        Ok(Some(result))
    }

    pub fn range_tombstones(&self, snapshot_seqno: u64) -> Vec<RangeTombstone> {
        let mut out = Vec::new();

        let mutable = self.mutable.read().clone();
        mutable.collect_range_tombstones(snapshot_seqno, &mut out);

        for mem in self.immutables.lock().iter() {
            mem.collect_range_tombstones(snapshot_seqno, &mut out);
        }

        out.sort_by(|a, b| b.seqno.cmp(&a.seqno));
        out
    }

    /// Snapshots every in-memory level for the ordered read path, newest
    /// first: the mutable table, then immutables newest to oldest.
    /// Empty levels are omitted.
    pub(crate) fn level_snapshots(&self, snapshot_seqno: u64) -> Vec<MemLevelSnapshot> {
        let mut tables = vec![self.mutable.read().clone()];
        tables.extend(self.immutables.lock().iter().cloned());

        tables
            .iter()
            .filter_map(|mem| {
                let snapshot = mem.level_snapshot(snapshot_seqno);
                (!snapshot.entries.is_empty() || !snapshot.tombstones.is_empty()).then_some(snapshot)
            })
            .collect()
    }
}

impl MemTable {
    fn new(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count)
                .map(|_| MemTableShard {
                    map: SkipMap::new(),
                })
                .collect(),
            approximate_bytes: AtomicU64::new(0),
            range_tombstone_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(AtomicOrdering::Relaxed)
    }

    fn has_range_tombstones(&self) -> bool {
        self.range_tombstone_count.load(AtomicOrdering::Relaxed) > 0
    }

    pub(crate) fn to_sorted_entries(&self) -> Vec<(InternalKey, Bytes)> {
        let mut out: Vec<(InternalKey, Bytes)> = Vec::new();
        for shard in &self.shards {
            for entry in shard.map.iter() {
                out.push((entry.key().clone(), entry.value().clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn level_snapshot(&self, snapshot_seqno: u64) -> MemLevelSnapshot {
        let entries: Vec<(InternalKey, Bytes)> = self
            .to_sorted_entries()
            .into_iter()
            .filter(|(key, _)| key.seqno <= snapshot_seqno)
            .collect();

        let mut raw = Vec::new();
        self.collect_range_tombstones(snapshot_seqno, &mut raw);

        MemLevelSnapshot {
            entries,
            tombstones: range_tombstone::fragment(raw),
        }
    }

    fn apply_batch(&self, shard_count: usize, seqno_base: u64, ops: &[Op]) {
        // Fast path: small foreground batches are latency-sensitive.
        // Avoid Rayon scheduling overhead and insert directly.
        if ops.len() <= 64 {
            for (idx, op) in ops.iter().enumerate() {
                let seqno = seqno_base + idx as u64;
                let entry = encode_op(op, seqno);
                let shard = shard_for_key(shard_count, entry.key.user_key.as_ref());
                if matches!(entry.key.kind, KeyKind::RangeDel) {
                    self.range_tombstone_count
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
                self.shards[shard]
                    .map
                    .insert(entry.key.clone(), entry.value.clone());
                let bytes = entry.key.user_key.len() as u64 + entry.value.len() as u64 + 16;
                self.approximate_bytes
                    .fetch_add(bytes, AtomicOrdering::Relaxed);
            }
            return;
        }

        let mut per_shard: Vec<Vec<InternalEntry>> = (0..shard_count).map(|_| Vec::new()).collect();
        for (idx, op) in ops.iter().enumerate() {
            let seqno = seqno_base + idx as u64;
            let entry = encode_op(op, seqno);
            let shard = shard_for_key(shard_count, entry.key.user_key.as_ref());
            per_shard[shard].push(entry);
        }

        let approx = &self.approximate_bytes;
        let range_tombstone_count = &self.range_tombstone_count;
        self.shards
            .par_iter()
            .enumerate()
            .for_each(|(shard_idx, shard)| {
                let local = &per_shard[shard_idx];
                for entry in local {
                    shard.map.insert(entry.key.clone(), entry.value.clone());
                    if matches!(entry.key.kind, KeyKind::RangeDel) {
                        range_tombstone_count.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    let bytes = entry.key.user_key.len() as u64 + entry.value.len() as u64 + 16;
                    approx.fetch_add(bytes, AtomicOrdering::Relaxed);
                }
            });
    }

    fn get(&self, user_key: &[u8], snapshot_seqno: u64) -> Option<(u64, Option<Value>)> {
        let shard = shard_for_key(self.shards.len(), user_key);
        let start = InternalKey::seek_sentinel(Bytes::copy_from_slice(user_key));
        let end = InternalKey::new(Bytes::copy_from_slice(user_key), 0, KeyKind::RangeDel);
        for entry in self.shards[shard].map.range(start..=end) {
            let ikey = entry.key();
            if ikey.seqno > snapshot_seqno {
                continue;
            }
            return match ikey.kind {
                KeyKind::Put | KeyKind::Merge => Some((ikey.seqno, Some(entry.value().clone()))),
                KeyKind::Del => Some((ikey.seqno, None)),
                _ => continue,
            };
        }
        None
    }

    fn collect_range_tombstones(&self, snapshot_seqno: u64, out: &mut Vec<RangeTombstone>) {
        for shard in &self.shards {
            for entry in shard.map.iter() {
                let ikey = entry.key();
                if ikey.seqno > snapshot_seqno {
                    continue;
                }
                if ikey.kind != KeyKind::RangeDel {
                    continue;
                }
                out.push(RangeTombstone {
                    start_key: ikey.user_key.clone(),
                    end_key: entry.value().clone(),
                    seqno: ikey.seqno,
                });
            }
        }
    }
}

fn encode_op(op: &Op, seqno: u64) -> InternalEntry {
    let (kind, value) = match op.kind {
        OpKind::Put => (KeyKind::Put, op.value.clone()),
        OpKind::Merge => (KeyKind::Merge, op.value.clone()),
        OpKind::Del => (KeyKind::Del, Bytes::new()),
        OpKind::RangeDel => (KeyKind::RangeDel, op.value.clone()),
    };
    InternalEntry {
        key: InternalKey::new(op.key.clone(), seqno, kind),
        value,
    }
}

fn shard_for_key(shard_count: usize, user_key: &[u8]) -> usize {
    use std::hash::Hasher;
    let mut hasher = ahash::AHasher::default();
    hasher.write(user_key);
    (hasher.finish() as usize) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn newest_version_wins_within_a_table() {
        let mems = MemTableManager::new(4);
        mems.apply_batch(1, &[Op::put(b("k"), b("v1"))]).unwrap();
        mems.apply_batch(2, &[Op::put(b("k"), b("v2"))]).unwrap();

        let got = mems.get(b"k", u64::MAX, true).unwrap().unwrap();
        assert_eq!(got.value, Some(b("v2")));

        mems.apply_batch(3, &[Op::delete(b("k"))]).unwrap();
        let got = mems.get(b"k", u64::MAX, true).unwrap().unwrap();
        assert_eq!(got.value, None);
    }

    #[test]
    fn rotation_keeps_immutables_readable() {
        let mems = MemTableManager::new(2);
        mems.apply_batch(1, &[Op::put(b("a"), b("1"))]).unwrap();
        mems.rotate_memtable();
        mems.apply_batch(2, &[Op::put(b("b"), b("2"))]).unwrap();

        assert_eq!(
            mems.get(b"a", u64::MAX, true).unwrap().unwrap().value,
            Some(b("1"))
        );
        assert_eq!(
            mems.get(b"b", u64::MAX, true).unwrap().unwrap().value,
            Some(b("2"))
        );
        assert_eq!(mems.immutable_count(), 1);
    }

    #[test]
    fn level_snapshots_are_newest_first_and_fragmented() {
        let mems = MemTableManager::new(2);
        mems.apply_batch(1, &[Op::put(b("a"), b("old"))]).unwrap();
        mems.apply_batch(2, &[Op::delete_range(b("b"), b("f"))])
            .unwrap();
        mems.apply_batch(3, &[Op::delete_range(b("d"), b("h"))])
            .unwrap();
        mems.rotate_memtable();
        mems.apply_batch(4, &[Op::put(b("a"), b("new"))]).unwrap();

        let levels = mems.level_snapshots(u64::MAX);
        assert_eq!(levels.len(), 2);

        // Mutable level first.
        assert_eq!(levels[0].entries.len(), 1);
        assert_eq!(levels[0].entries[0].0.seqno, 4);
        assert!(levels[0].tombstones.is_empty());

        // The frozen level carries the fragmented tombstones.
        let spans: Vec<(&[u8], &[u8], u64)> = levels[1]
            .tombstones
            .iter()
            .map(|t| (t.start_key.as_ref(), t.end_key.as_ref(), t.seqno))
            .collect();
        assert_eq!(
            spans,
            vec![
                (&b"b"[..], &b"d"[..], 2),
                (&b"d"[..], &b"h"[..], 3),
            ]
        );
    }

    #[test]
    fn range_tombstone_masks_older_put_in_get() {
        let mems = MemTableManager::new(2);
        mems.apply_batch(1, &[Op::put(b("c"), b("x"))]).unwrap();
        mems.apply_batch(2, &[Op::delete_range(b("a"), b("m"))])
            .unwrap();

        assert_eq!(mems.get(b"c", u64::MAX, true).unwrap().unwrap().value, None);
        // The older snapshot still sees the put.
        assert_eq!(mems.get(b"c", 1, true).unwrap().unwrap().value, Some(b("x")));
    }
}
