use bytes::Bytes;

use crate::internal_key::{InternalKey, ValueCategory};
use crate::range_tombstone::RangeTombstone;
use crate::seek::del_list::{DelElement, GlobalDelList};
use crate::seek::iter::{TombstonesIter, ValuesIter};

/// Where one interval (or key) sits relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelativePos {
    Before,
    Overlap,
    After,
}

pub(crate) fn del_elem_vs_user_key(elem: &DelElement, user_key: &[u8]) -> RelativePos {
    if elem.is_before(user_key) {
        RelativePos::Before
    } else if elem.covers(user_key) {
        RelativePos::Overlap
    } else {
        RelativePos::After
    }
}

pub(crate) fn range_ts_vs_user_key(ts: &RangeTombstone, user_key: &[u8]) -> RelativePos {
    if ts.end_key.as_ref() <= user_key {
        RelativePos::Before
    } else if ts.start_key.as_ref() > user_key {
        RelativePos::After
    } else {
        RelativePos::Overlap
    }
}

pub(crate) fn del_elem_vs_range_ts(elem: &DelElement, ts: &RangeTombstone) -> RelativePos {
    if elem.is_before(ts.start_key.as_ref()) {
        RelativePos::Before
    } else if elem.start_key() >= &ts.end_key {
        RelativePos::After
    } else {
        RelativePos::Overlap
    }
}

/// Per-query switches for the engine's self-checks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeekDiagnostics {
    /// Assert that every fold iteration advances at least one cursor.
    pub validate_progress: bool,
}

impl Default for SeekDiagnostics {
    fn default() -> Self {
        Self {
            validate_progress: cfg!(debug_assertions),
        }
    }
}

/// Query-wide state threaded through every level.
pub(crate) struct GlobalContext {
    pub target: Bytes,
    /// Current candidate smallest key; `None` until the first commit. Only
    /// ever tightens (moves down) once set.
    pub csk: Option<Bytes>,
    pub del_list: GlobalDelList,
    pub diagnostics: SeekDiagnostics,
}

impl GlobalContext {
    pub fn new(target: impl Into<Bytes>, diagnostics: SeekDiagnostics) -> Self {
        Self {
            target: target.into(),
            csk: None,
            del_list: GlobalDelList::new(),
            diagnostics,
        }
    }
}

/// State scoped to one level's fold.
pub(crate) struct LevelContext {
    pub values: ValuesIter,
    pub tombstones: TombstonesIter,
    pub new_csk_found: bool,
}

impl LevelContext {
    pub fn new(values: ValuesIter, tombstones: TombstonesIter) -> Self {
        Self {
            values,
            tombstones,
            new_csk_found: false,
        }
    }
}

/// Commits `user_key` as the new candidate: every structure bounded by the
/// candidate tightens, and the level is done.
fn update_csk(gc: &mut GlobalContext, lc: &mut LevelContext, user_key: &Bytes) {
    log::trace!(
        "csk {} -> {:?}",
        gc.csk
            .as_ref()
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| "none".to_string()),
        user_key
    );

    gc.csk = Some(user_key.clone());
    gc.del_list.trim(user_key);
    lc.tombstones.set_upper_bound(user_key.clone());
    // The values iterator is already positioned exactly on the new
    // candidate; its bound is not worth tightening.
    lc.new_csk_found = true;
}

/// Resolves the values iterator's current key against the deletion list.
/// Returns whether a new candidate was committed.
fn process_value_vs_del_list(
    gc: &mut GlobalContext,
    lc: &mut LevelContext,
    key: &InternalKey,
    category: ValueCategory,
) -> anyhow::Result<bool> {
    let user_key = &key.user_key;

    let rel = if gc.del_list.valid() {
        del_elem_vs_user_key(gc.del_list.current(), user_key.as_ref())
    } else {
        RelativePos::After
    };

    match rel {
        RelativePos::Before => {
            gc.del_list.seek_forward(user_key.as_ref());
        }
        RelativePos::After => match category {
            ValueCategory::Value | ValueCategory::MergeValue => {
                update_csk(gc, lc, user_key);
            }
            ValueCategory::DelKey => {
                gc.del_list
                    .insert_before_and_set_on_inserted(DelElement::key(user_key.clone()));
                lc.values.next()?;
            }
            ValueCategory::Other => unreachable!("other kinds are skipped before this point"),
        },
        RelativePos::Overlap => {
            // A newer level already deleted this key. A covering range lets
            // the cursor leapfrog the whole span.
            if gc.del_list.current().is_range() {
                let skip_to = gc.del_list.current().range_end().clone();
                lc.values.seek(skip_to.as_ref())?;
            } else {
                lc.values.next()?;
            }
        }
    }

    Ok(lc.new_csk_found)
}

/// Folds the tombstone iterator's current tombstone into the deletion list.
fn process_range_ts_vs_del_list(
    gc: &mut GlobalContext,
    lc: &mut LevelContext,
    ts: &RangeTombstone,
) -> anyhow::Result<()> {
    debug_assert!(lc.tombstones.valid());

    if !gc.del_list.valid() {
        // Nothing at or after the tombstone in the list.
        gc.del_list
            .insert_before(DelElement::range(ts.start_key.clone(), ts.end_key.clone()));
        lc.tombstones.next();
        return Ok(());
    }

    let elem = gc.del_list.current().clone();
    match del_elem_vs_range_ts(&elem, ts) {
        RelativePos::Before => {
            gc.del_list.seek_forward(ts.start_key.as_ref());
        }
        RelativePos::After => {
            gc.del_list
                .insert_before(DelElement::range(ts.start_key.clone(), ts.end_key.clone()));
            lc.tombstones.next();
        }
        RelativePos::Overlap => {
            let elem_starts_at_or_before = elem.start_key() <= &ts.start_key;
            let elem_ends_before = elem.range_end() < &ts.end_key;

            if elem_starts_at_or_before {
                if elem_ends_before {
                    // Extend the element to the tombstone's end.
                    gc.del_list.replace_with(DelElement::range(
                        elem.start_key().clone(),
                        ts.end_key.clone(),
                    ));
                    gc.del_list.seek_forward(ts.end_key.as_ref());
                } else {
                    // The element already contains the tombstone.
                    lc.tombstones.next();
                }
            } else if elem_ends_before {
                // The tombstone contains the element.
                gc.del_list.replace_with(DelElement::range(
                    ts.start_key.clone(),
                    ts.end_key.clone(),
                ));
                gc.del_list.seek_forward(ts.end_key.as_ref());
            } else {
                // The element starts inside the tombstone but outlasts it.
                gc.del_list.replace_with(DelElement::range(
                    ts.start_key.clone(),
                    elem.range_end().clone(),
                ));
                lc.tombstones.seek(elem.range_end().as_ref());
            }
        }
    }

    Ok(())
}

/// Guard against a stuck fold: every iteration must move at least one of
/// the three cursors, or terminate the level via a committed candidate.
struct ProgressValidator {
    enabled: bool,
    initialized: bool,
    prev_value: Option<InternalKey>,
    prev_ts: Option<RangeTombstone>,
    prev_del: Option<DelElement>,
}

impl ProgressValidator {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            initialized: false,
            prev_value: None,
            prev_ts: None,
            prev_del: None,
        }
    }

    fn observe(&mut self, gc: &GlobalContext, lc: &LevelContext) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let value = lc.values.valid().then(|| lc.values.key().clone());
        let ts = lc.tombstones.valid().then(|| lc.tombstones.tombstone());
        let del = gc.del_list.valid().then(|| gc.del_list.current().clone());

        if self.initialized
            && value == self.prev_value
            && ts == self.prev_ts
            && del == self.prev_del
        {
            anyhow::bail!(
                "seek made no progress: value={value:?} tombstone={ts:?} deletion={del:?}"
            );
        }

        self.initialized = true;
        self.prev_value = value;
        self.prev_ts = ts;
        self.prev_del = del;
        Ok(())
    }
}

/// Folds one level into the query state: either commits a better candidate
/// smallest key, or exhausts the level while absorbing its deletions into
/// the global list.
pub(crate) fn process_log_level(
    gc: &mut GlobalContext,
    lc: &mut LevelContext,
) -> anyhow::Result<()> {
    if gc.target.is_empty() {
        gc.del_list.seek_to_first();
        lc.values.seek_to_first()?;
        lc.tombstones.seek_to_first();
    } else {
        gc.del_list.seek(gc.target.as_ref());
        lc.values.seek(gc.target.as_ref())?;
        lc.tombstones.seek(gc.target.as_ref());
    }

    let mut progress = ProgressValidator::new(gc.diagnostics.validate_progress);

    while !lc.new_csk_found && (lc.values.valid() || lc.tombstones.valid()) {
        progress.observe(gc, lc)?;

        if !lc.values.valid() {
            // Only tombstones remain in this level.
            let ts = lc.tombstones.tombstone();
            process_range_ts_vs_del_list(gc, lc, &ts)?;
            continue;
        }

        let key = lc.values.key().clone();
        let category = key.kind.value_category();
        if category == ValueCategory::Other {
            lc.values.next()?;
            continue;
        }

        if !lc.tombstones.valid() {
            process_value_vs_del_list(gc, lc, &key, category)?;
            continue;
        }

        let ts = lc.tombstones.tombstone();
        match range_ts_vs_user_key(&ts, key.user_key.as_ref()) {
            RelativePos::Before => {
                process_range_ts_vs_del_list(gc, lc, &ts)?;
            }
            RelativePos::After => {
                process_value_vs_del_list(gc, lc, &key, category)?;
            }
            RelativePos::Overlap => {
                if category == ValueCategory::DelKey {
                    // The point delete is subsumed by the tombstone.
                    lc.values.next()?;
                    continue;
                }

                debug_assert!(ts.seqno != key.seqno);
                if ts.seqno < key.seqno {
                    // The tombstone is older than the value: the value is
                    // live. If it becomes the candidate, the tombstone may
                    // still matter below the new bound, so record whatever
                    // of it survives the tightened clamp.
                    let found = process_value_vs_del_list(gc, lc, &key, category)?;
                    if found && lc.tombstones.valid() {
                        let clamped = lc.tombstones.tombstone();
                        process_range_ts_vs_del_list(gc, lc, &clamped)?;
                    }
                } else {
                    // The tombstone is newer: the value is shadowed.
                    lc.values.next()?;
                }
            }
        }
    }

    log::trace!(
        "level done, candidate {}",
        if lc.new_csk_found { "improved" } else { "unchanged" }
    );
    Ok(())
}
