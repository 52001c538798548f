use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::compaction::LevelMetrics;
use crate::db::Value;
use crate::internal_key::{InternalKey, KeyKind};
use crate::range_tombstone::{self, RangeTombstone};
use crate::sst::{parse_sst_file_name, sst_file_name, SstBuilder, SstProperties, SstReader};

const SST_DIR: &str = "sst";
const SST_BLOCK_SIZE: usize = 64 * 1024;

/// One live SST file in the level tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFile {
    pub file_id: u64,
    pub level: u8,
    pub smallest_user_key: Bytes,
    pub largest_user_key: Bytes,
    pub max_seqno: u64,
    pub size_bytes: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Default)]
struct Levels {
    /// level -> files. L0 is sorted by file id (newest last) and may
    /// overlap; levels >= 1 are non-overlapping, sorted by smallest key.
    files: BTreeMap<u8, Vec<AddFile>>,
}

impl Levels {
    fn level(&self, level: u8) -> &[AddFile] {
        self.files.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    fn push(&mut self, add: AddFile) {
        let level = add.level;
        let files = self.files.entry(level).or_default();
        files.push(add);
        if level == 0 {
            files.sort_by_key(|f| f.file_id);
        } else {
            files.sort_by(|a, b| a.smallest_user_key.cmp(&b.smallest_user_key));
        }
    }
}

/// Per-level inputs for the ordered read path.
///
/// An L0 input is one file plus its fragmented tombstones; a sorted-level
/// input is the whole run with no tombstones (compaction applies them on
/// the way down).
pub(crate) struct SeekLevelInput {
    pub readers: Vec<SstReader>,
    pub tombstones: Option<Vec<RangeTombstone>>,
}

/// The on-disk level tree.
///
/// There is no manifest: each SST's properties block records its level and
/// tombstones, so `recover` rebuilds the tree by scanning the sst directory.
#[derive(Debug)]
pub struct VersionSet {
    sst_dir: PathBuf,
    next_file_id: AtomicU64,
    levels: RwLock<Levels>,
}

impl VersionSet {
    pub fn recover(dir: &Path) -> anyhow::Result<Self> {
        let sst_dir = dir.join(SST_DIR);
        std::fs::create_dir_all(&sst_dir)
            .with_context(|| format!("create sst dir {}", sst_dir.display()))?;

        let mut levels = Levels::default();
        let mut max_file_id = 0u64;
        for entry in std::fs::read_dir(&sst_dir).context("scan sst dir")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((level, file_id)) = parse_sst_file_name(name) else {
                continue;
            };

            let path = entry.path();
            let reader = SstReader::open(&path)
                .with_context(|| format!("open sst {}", path.display()))?;
            let props = reader.properties();
            if props.level != level {
                anyhow::bail!(
                    "sst {} claims level {} but is named for level {}",
                    path.display(),
                    props.level,
                    level
                );
            }

            max_file_id = max_file_id.max(file_id);
            levels.push(AddFile {
                file_id,
                level,
                smallest_user_key: props.smallest_user_key.clone(),
                largest_user_key: props.largest_user_key.clone(),
                max_seqno: props.max_seqno,
                size_bytes: entry.metadata()?.len(),
                entries: props.entries,
            });
        }

        Ok(Self {
            sst_dir,
            next_file_id: AtomicU64::new(max_file_id.saturating_add(1).max(1)),
            levels: RwLock::new(levels),
        })
    }

    pub(crate) fn allocate_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn latest_seqno(&self) -> u64 {
        let guard = self.levels.read();
        guard
            .files
            .values()
            .flatten()
            .map(|f| f.max_seqno)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn is_level_empty(&self, level: u8) -> bool {
        self.levels.read().level(level).is_empty()
    }

    pub(crate) fn num_non_empty_levels(&self) -> u8 {
        let guard = self.levels.read();
        guard
            .files
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(level, _)| level.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn files_snapshot(&self) -> Vec<AddFile> {
        let guard = self.levels.read();
        guard.files.values().flatten().cloned().collect()
    }

    pub(crate) fn level_metrics(&self) -> BTreeMap<u8, LevelMetrics> {
        let guard = self.levels.read();
        guard
            .files
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(level, files)| {
                (
                    *level,
                    LevelMetrics {
                        bytes: files.iter().map(|f| f.size_bytes).sum(),
                        file_count: files.len(),
                    },
                )
            })
            .collect()
    }

    pub(crate) fn sst_path(&self, level: u8, file_id: u64) -> PathBuf {
        self.sst_dir.join(sst_file_name(level, file_id))
    }

    fn open_reader(&self, file: &AddFile) -> anyhow::Result<SstReader> {
        let path = self.sst_path(file.level, file.file_id);
        SstReader::open(&path).with_context(|| format!("open sst {}", path.display()))
    }

    /// Persists one frozen memtable's entries as a new L0 file.
    /// Returns `None` when the table had nothing to write.
    pub(crate) fn flush_to_l0(
        &self,
        entries: &[(InternalKey, Bytes)],
    ) -> anyhow::Result<Option<AddFile>> {
        if entries.is_empty() {
            return Ok(None);
        }

        let file_id = self.allocate_file_id();
        let mut builder = SstBuilder::create(&self.sst_dir, 0, file_id, SST_BLOCK_SIZE)
            .context("create l0 sst")?;
        for (key, value) in entries {
            builder.add(key, value).context("append l0 entry")?;
        }
        let props = builder.finish().context("finish l0 sst")?;

        let add = self.install_sst(file_id, &props)?;
        log::debug!(
            "flushed l0 file_id={file_id} entries={} max_seqno={}",
            props.entries,
            props.max_seqno
        );
        Ok(Some(add))
    }

    pub(crate) fn install_sst(
        &self,
        file_id: u64,
        props: &SstProperties,
    ) -> anyhow::Result<AddFile> {
        let path = self.sst_path(props.level, file_id);
        let add = AddFile {
            file_id,
            level: props.level,
            smallest_user_key: props.smallest_user_key.clone(),
            largest_user_key: props.largest_user_key.clone(),
            max_seqno: props.max_seqno,
            size_bytes: std::fs::metadata(&path)
                .with_context(|| format!("stat sst {}", path.display()))?
                .len(),
            entries: props.entries,
        };
        self.levels.write().push(add.clone());
        Ok(add)
    }

    /// Newest visible version of `key` across all levels, masked by the
    /// tree's range tombstones.
    pub(crate) fn get(
        &self,
        key: &[u8],
        snapshot_seqno: u64,
        mask_range_deletions: bool,
    ) -> anyhow::Result<Option<(u64, Option<Value>)>> {
        let levels = self.levels.read().clone();

        let mut candidate: Option<(u64, Option<Value>)> = None;

        // L0: searched newest-first; may overlap.
        for add in levels.level(0).iter().rev() {
            if key < add.smallest_user_key.as_ref() || key > add.largest_user_key.as_ref() {
                continue;
            }
            let reader = self.open_reader(add)?;
            if let Some((seqno, v)) = reader.get(key, snapshot_seqno)? {
                match &candidate {
                    Some((best_seq, _)) if *best_seq >= seqno => {}
                    _ => candidate = Some((seqno, v)),
                }
            }
        }

        // Sorted levels: non-overlapping; binary search by key range.
        for (level, files) in levels.files.iter() {
            if *level == 0 {
                continue;
            }
            if let Some(add) = find_file_for_key(files, key) {
                let reader = self.open_reader(add)?;
                if let Some((seqno, v)) = reader.get(key, snapshot_seqno)? {
                    match &candidate {
                        Some((best_seq, _)) if *best_seq >= seqno => {}
                        _ => candidate = Some((seqno, v)),
                    }
                }
            }
        }

        let tombstone_seq = if mask_range_deletions {
            self.range_tombstones(snapshot_seqno)?
                .iter()
                .filter(|t| t.covers(key, snapshot_seqno))
                .map(|t| t.seqno)
                .max()
        } else {
            None
        };

        Ok(match (candidate, tombstone_seq) {
            (Some((seq, value)), Some(tseq)) => {
                if tseq >= seq {
                    Some((tseq, None))
                } else {
                    Some((seq, value))
                }
            }
            (Some((seq, value)), None) => Some((seq, value)),
            (None, Some(tseq)) => Some((tseq, None)),
            (None, None) => None,
        })
    }

    pub(crate) fn range_tombstones(
        &self,
        snapshot_seqno: u64,
    ) -> anyhow::Result<Vec<RangeTombstone>> {
        let files = self.files_snapshot();
        let mut out = Vec::new();
        for file in &files {
            let reader = self.open_reader(file)?;
            out.extend(reader.range_tombstones(snapshot_seqno));
        }
        out.sort_by(|a, b| b.seqno.cmp(&a.seqno));
        Ok(out)
    }

    /// Builds the on-disk level inputs for the ordered read path, newest
    /// first: each L0 file on its own (newest to oldest), then every
    /// non-empty sorted level as a single run.
    pub(crate) fn seek_level_inputs(
        &self,
        snapshot_seqno: u64,
    ) -> anyhow::Result<Vec<SeekLevelInput>> {
        let levels = self.levels.read().clone();
        let mut out = Vec::new();

        if !self.is_level_empty(0) {
            for add in levels.level(0).iter().rev() {
                let reader = self.open_reader(add)?;
                let tombstones =
                    range_tombstone::fragment(reader.range_tombstones(snapshot_seqno));
                out.push(SeekLevelInput {
                    readers: vec![reader],
                    tombstones: Some(tombstones),
                });
            }
        }

        for level in 1..self.num_non_empty_levels() {
            if self.is_level_empty(level) {
                continue;
            }
            let mut readers = Vec::new();
            for add in levels.level(level) {
                readers.push(self.open_reader(add)?);
            }
            out.push(SeekLevelInput {
                readers,
                tombstones: None,
            });
        }

        Ok(out)
    }

    /// Compacts a prefix of L0 (oldest first) together with all of L1 into
    /// a fresh L1 run.
    ///
    /// Range tombstones are applied and dropped on the way down, keeping
    /// sorted levels tombstone-free. A tombstone newer than the minimum
    /// pinned snapshot cannot be applied for every reader yet, so its file
    /// (and every newer L0 file, to preserve level age order) stays in L0
    /// for a later pass. Returns the number of L0 files compacted.
    pub fn compact_l0_to_l1(&self, min_pinned_seqno: u64) -> anyhow::Result<usize> {
        let levels = self.levels.read().clone();
        let l0 = levels.level(0);
        if l0.is_empty() {
            return Ok(0);
        }

        let mut inputs_l0: Vec<AddFile> = Vec::new();
        for add in l0 {
            let reader = self.open_reader(add)?;
            let deferred = reader
                .range_tombstones(u64::MAX)
                .iter()
                .any(|t| t.seqno > min_pinned_seqno);
            if deferred {
                break;
            }
            inputs_l0.push(add.clone());
        }
        if inputs_l0.is_empty() {
            log::debug!("compaction deferred: pinned snapshot below newest range tombstone");
            return Ok(0);
        }

        let inputs_l1: Vec<AddFile> = levels.level(1).to_vec();

        let mut entries: Vec<(InternalKey, Bytes)> = Vec::new();
        let mut tombstones: Vec<RangeTombstone> = Vec::new();
        for add in inputs_l0.iter().chain(inputs_l1.iter()) {
            let reader = self.open_reader(add)?;
            tombstones.extend(reader.range_tombstones(u64::MAX));
            let mut iter = reader.iter(u64::MAX);
            iter.seek_to_first();
            while let Some(next) = iter.next() {
                let (key, value) = next.context("read compaction input")?;
                entries.push((key, value));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        // Apply every collected tombstone: all have seqno <= min_pinned, so
        // each covered older version is dead for every possible reader.
        entries.retain(|(key, _)| match key.kind {
            KeyKind::RangeDel => false,
            _ => !tombstones
                .iter()
                .any(|t| key.seqno < t.seqno && t.covers(key.user_key.as_ref(), u64::MAX)),
        });

        let mut out_entries: Vec<(InternalKey, Bytes)> = Vec::with_capacity(entries.len());
        let mut idx = 0usize;
        while idx < entries.len() {
            let user_key = entries[idx].0.user_key.clone();
            let mut group = Vec::new();
            while idx < entries.len() && entries[idx].0.user_key == user_key {
                group.push(entries[idx].clone());
                idx += 1;
            }
            out_entries.extend(compact_user_key_entries(group, min_pinned_seqno));
        }

        if out_entries.is_empty() {
            self.apply_compaction_edit(&inputs_l0, &inputs_l1, None)?;
            return Ok(inputs_l0.len());
        }

        let out_file_id = self.allocate_file_id();
        let mut builder = SstBuilder::create(&self.sst_dir, 1, out_file_id, SST_BLOCK_SIZE)
            .context("create l1 sst")?;
        for (key, value) in &out_entries {
            builder.add(key, value).context("append l1 entry")?;
        }
        let props = builder.finish().context("finish l1 sst")?;

        self.apply_compaction_edit(&inputs_l0, &inputs_l1, Some((out_file_id, props)))?;
        log::debug!(
            "compacted {} l0 + {} l1 files into file_id={out_file_id} ({} entries)",
            inputs_l0.len(),
            inputs_l1.len(),
            out_entries.len()
        );
        Ok(inputs_l0.len())
    }

    fn apply_compaction_edit(
        &self,
        removed_l0: &[AddFile],
        removed_l1: &[AddFile],
        installed: Option<(u64, SstProperties)>,
    ) -> anyhow::Result<()> {
        {
            let mut guard = self.levels.write();
            if let Some(files) = guard.files.get_mut(&0) {
                files.retain(|f| !removed_l0.iter().any(|r| r.file_id == f.file_id));
            }
            if let Some(files) = guard.files.get_mut(&1) {
                files.retain(|f| !removed_l1.iter().any(|r| r.file_id == f.file_id));
            }
        }
        if let Some((file_id, props)) = installed {
            self.install_sst(file_id, &props)?;
        }

        for removed in removed_l0.iter().chain(removed_l1.iter()) {
            let path = self.sst_path(removed.level, removed.file_id);
            if let Err(err) = std::fs::remove_file(&path) {
                log::debug!("leaving obsolete sst {}: {err}", path.display());
            }
        }
        Ok(())
    }
}

fn find_file_for_key<'a>(files: &'a [AddFile], key: &[u8]) -> Option<&'a AddFile> {
    let mut lo = 0usize;
    let mut hi = files.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let f = &files[mid];
        if key < f.smallest_user_key.as_ref() {
            hi = mid;
        } else if key > f.largest_user_key.as_ref() {
            lo = mid + 1;
        } else {
            return Some(f);
        }
    }
    None
}

/// Retention for one user key's versions (newest first): everything at or
/// above the pinned floor stays, plus one representative below it. The
/// representative is dropped entirely when it is a tombstone, because the
/// output run is the bottom of the tree.
fn compact_user_key_entries(
    entries: Vec<(InternalKey, Bytes)>,
    min_pinned_seqno: u64,
) -> Vec<(InternalKey, Bytes)> {
    let mut out = Vec::new();
    let mut kept_one_below_min = false;

    for (ikey, value) in entries {
        match ikey.kind {
            KeyKind::Put | KeyKind::Merge | KeyKind::Del => {
                if ikey.seqno >= min_pinned_seqno {
                    out.push((ikey, value));
                    continue;
                }

                if kept_one_below_min {
                    continue;
                }

                kept_one_below_min = true;
                if ikey.kind != KeyKind::Del {
                    out.push((ikey, value));
                }
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, seqno: u64, kind: KeyKind, value: &str) -> (InternalKey, Bytes) {
        (
            InternalKey::new(Bytes::copy_from_slice(key.as_bytes()), seqno, kind),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    #[test]
    fn retention_keeps_one_version_below_the_floor() {
        let got = compact_user_key_entries(
            vec![
                entry("k", 9, KeyKind::Put, "v9"),
                entry("k", 5, KeyKind::Put, "v5"),
                entry("k", 2, KeyKind::Put, "v2"),
            ],
            6,
        );
        let seqnos: Vec<u64> = got.iter().map(|(k, _)| k.seqno).collect();
        assert_eq!(seqnos, vec![9, 5]);
    }

    #[test]
    fn retention_drops_bottommost_tombstone() {
        let got = compact_user_key_entries(
            vec![
                entry("k", 5, KeyKind::Del, ""),
                entry("k", 2, KeyKind::Put, "v2"),
            ],
            // Floor above every version: the delete is the sole
            // representative and vanishes with the value it shadows.
            9,
        );
        assert!(got.is_empty());
    }

    #[test]
    fn flush_then_recover_rebuilds_levels() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let versions = VersionSet::recover(dir.path())?;
        let entries = vec![
            entry("a", 1, KeyKind::Put, "1"),
            entry("b", 2, KeyKind::Put, "2"),
        ];
        versions.flush_to_l0(&entries)?.expect("wrote a file");
        assert!(!versions.is_level_empty(0));
        assert_eq!(versions.num_non_empty_levels(), 1);

        let reopened = VersionSet::recover(dir.path())?;
        assert!(!reopened.is_level_empty(0));
        assert_eq!(reopened.latest_seqno(), 2);
        assert_eq!(
            reopened.get(b"b", u64::MAX, true)?,
            Some((2, Some(Bytes::copy_from_slice(b"2"))))
        );
        Ok(())
    }

    #[test]
    fn compaction_applies_range_tombstones_and_clears_l0() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let versions = VersionSet::recover(dir.path())?;

        versions.flush_to_l0(&[
            entry("a", 1, KeyKind::Put, "1"),
            entry("b", 2, KeyKind::Put, "2"),
            entry("c", 3, KeyKind::Put, "3"),
        ])?;
        versions.flush_to_l0(&[entry("b", 4, KeyKind::RangeDel, "d")])?;

        let compacted = versions.compact_l0_to_l1(u64::MAX)?;
        assert_eq!(compacted, 2);
        assert!(versions.is_level_empty(0));
        assert!(!versions.is_level_empty(1));

        assert_eq!(
            versions.get(b"a", u64::MAX, true)?,
            Some((1, Some(Bytes::copy_from_slice(b"1"))))
        );
        assert_eq!(versions.get(b"b", u64::MAX, true)?, None);
        assert_eq!(versions.get(b"c", u64::MAX, true)?, None);
        assert!(versions.range_tombstones(u64::MAX)?.is_empty());
        Ok(())
    }

    #[test]
    fn compaction_defers_tombstones_above_pinned_snapshot() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let versions = VersionSet::recover(dir.path())?;

        versions.flush_to_l0(&[entry("a", 1, KeyKind::Put, "1")])?;
        versions.flush_to_l0(&[entry("a", 5, KeyKind::RangeDel, "z")])?;

        // A snapshot pinned before the tombstone: only the older file moves.
        let compacted = versions.compact_l0_to_l1(2)?;
        assert_eq!(compacted, 1);
        assert!(!versions.is_level_empty(0));
        assert!(!versions.is_level_empty(1));
        assert_eq!(versions.range_tombstones(u64::MAX)?.len(), 1);
        Ok(())
    }
}
