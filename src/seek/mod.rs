//! The ordered read path: smallest live user key at or after a target.
//!
//! The tree is processed newest level first (mutable memtable, immutable
//! memtables, L0 files, then each sorted level). Every level is folded
//! against two pieces of query-wide state:
//!
//! - the candidate smallest key (CSK) found so far, which bounds every
//!   later level's iterators from above (exclusive), and
//! - a global deletion list absorbing the point and range deletions seen in
//!   newer levels, which older levels' keys must clear before they may
//!   become the candidate.
//!
//! A level either commits a better (smaller) candidate and stops early, or
//! runs out of entries below the bound while donating its deletions to the
//! list. The candidate only ever tightens, so the final value is the
//! smallest key at or after the target that is live at the newest level
//! that writes it.

mod del_list;
mod fold;
mod iter;

use anyhow::Context;
use bytes::Bytes;

use crate::range_tombstone::RangeTombstone;

pub(crate) use fold::SeekDiagnostics;
pub(crate) use iter::{MemCursor, PointCursor, RunCursor, UpperBound};

use fold::{process_log_level, GlobalContext, LevelContext};
use iter::{TombstonesIter, ValuesIter};

/// One level's inputs, already ordered newest-first by the caller.
/// `tombstones` is `None` for sorted levels, which cannot carry any.
pub(crate) struct LevelInput {
    pub points: PointCursor,
    pub tombstones: Option<Vec<RangeTombstone>>,
}

/// Runs the query over the given level stack. `Ok(None)` means no live key
/// at or after `target` exists.
pub(crate) fn get_smallest_at_or_after(
    target: &[u8],
    levels: Vec<LevelInput>,
    diagnostics: SeekDiagnostics,
) -> anyhow::Result<Option<Bytes>> {
    let mut gc = GlobalContext::new(Bytes::copy_from_slice(target), diagnostics);

    for (idx, level) in levels.into_iter().enumerate() {
        let bound = UpperBound::new(gc.csk.clone());
        let values = ValuesIter::new(level.points, bound.clone());
        let tombstones = match level.tombstones {
            Some(fragments) => TombstonesIter::new(fragments, bound),
            None => TombstonesIter::none(bound),
        };

        let mut lc = LevelContext::new(values, tombstones);
        process_log_level(&mut gc, &mut lc)
            .with_context(|| format!("seek fold, level index {idx}"))?;
    }

    if let Some(csk) = &gc.csk {
        debug_assert!(target <= csk.as_ref());
    }
    Ok(gc.csk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal_key::{InternalKey, KeyKind};
    use crate::sst::{sst_file_name, SstBuilder, SstReader};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn mem_level(mut entries: Vec<(InternalKey, Bytes)>, raw_ts: Vec<RangeTombstone>) -> LevelInput {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        LevelInput {
            points: PointCursor::Mem(MemCursor::new(entries)),
            tombstones: Some(crate::range_tombstone::fragment(raw_ts)),
        }
    }

    #[test]
    fn empty_stack_finds_nothing() -> anyhow::Result<()> {
        assert_eq!(
            get_smallest_at_or_after(b"", Vec::new(), SeekDiagnostics::default())?,
            None
        );
        Ok(())
    }

    #[test]
    fn sorted_run_level_over_sst_files() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;

        // Two non-overlapping files forming one sorted run.
        let mut builder = SstBuilder::create(dir.path(), 1, 1, 64)?;
        builder.add(&InternalKey::new(b("a"), 1, KeyKind::Put), b"1")?;
        builder.add(&InternalKey::new(b("d"), 1, KeyKind::Put), b"2")?;
        builder.finish()?;

        let mut builder = SstBuilder::create(dir.path(), 1, 2, 64)?;
        builder.add(&InternalKey::new(b("m"), 1, KeyKind::Put), b"3")?;
        builder.add(&InternalKey::new(b("q"), 1, KeyKind::Put), b"4")?;
        builder.finish()?;

        let open = |id: u64| SstReader::open(dir.path().join(sst_file_name(1, id)));

        let run = |target: &[u8]| -> anyhow::Result<Option<Bytes>> {
            let level = LevelInput {
                points: PointCursor::Run(RunCursor::new(vec![open(1)?, open(2)?])),
                tombstones: None,
            };
            get_smallest_at_or_after(target, vec![level], SeekDiagnostics::default())
        };

        assert_eq!(run(b"")?, Some(b("a")));
        assert_eq!(run(b"b")?, Some(b("d")));
        assert_eq!(run(b"e")?, Some(b("m")));
        assert_eq!(run(b"m")?, Some(b("m")));
        assert_eq!(run(b"r")?, None);
        Ok(())
    }

    #[test]
    fn memtable_shadows_sst_run() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;

        let mut builder = SstBuilder::create(dir.path(), 1, 1, 64)?;
        builder.add(&InternalKey::new(b("b"), 1, KeyKind::Put), b"old")?;
        builder.add(&InternalKey::new(b("e"), 1, KeyKind::Put), b"old")?;
        builder.finish()?;

        // Newer in-memory level deletes `b`.
        let mem = mem_level(
            vec![(InternalKey::new(b("b"), 8, KeyKind::Del), Bytes::new())],
            Vec::new(),
        );
        let sorted = LevelInput {
            points: PointCursor::Run(RunCursor::new(vec![SstReader::open(
                dir.path().join(sst_file_name(1, 1)),
            )?])),
            tombstones: None,
        };

        assert_eq!(
            get_smallest_at_or_after(b"", vec![mem, sorted], SeekDiagnostics::default())?,
            Some(b("e"))
        );
        Ok(())
    }
}
