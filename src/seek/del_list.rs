use bytes::Bytes;

/// One effective deletion carried across levels: either a single user key
/// or a half-open range `[start, end)`.
///
/// Elements carry no seqno. By the time one lands in the deletion list it
/// came from a level newer than everything still to be processed, so it
/// supersedes any older occurrence of the same keys outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DelElement {
    Key(Bytes),
    Range { start: Bytes, end: Bytes },
}

impl DelElement {
    pub fn key(key: Bytes) -> Self {
        DelElement::Key(key)
    }

    pub fn range(start: Bytes, end: Bytes) -> Self {
        debug_assert!(start < end);
        DelElement::Range { start, end }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, DelElement::Range { .. })
    }

    pub fn start_key(&self) -> &Bytes {
        match self {
            DelElement::Key(key) => key,
            DelElement::Range { start, .. } => start,
        }
    }

    /// Exclusive end for ranges; the key itself for point deletes.
    pub fn range_end(&self) -> &Bytes {
        match self {
            DelElement::Key(key) => key,
            DelElement::Range { end, .. } => end,
        }
    }

    pub fn covers(&self, key: &[u8]) -> bool {
        match self {
            DelElement::Key(k) => k.as_ref() == key,
            DelElement::Range { start, end } => start.as_ref() <= key && key < end.as_ref(),
        }
    }

    /// Entirely before `key`: the element cannot cover it or anything after.
    pub fn is_before(&self, key: &[u8]) -> bool {
        match self {
            DelElement::Key(k) => k.as_ref() < key,
            DelElement::Range { end, .. } => end.as_ref() <= key,
        }
    }
}

/// Whether `a` (which starts at or before `b`) can be folded into one
/// element with `b`. A range abutting a following point delete cannot:
/// `[a, b)` then `{b}` has no half-open union.
fn mergeable(a: &DelElement, b: &DelElement) -> bool {
    if a.covers(b.start_key()) {
        return true;
    }
    a.is_range() && b.is_range() && a.range_end() == b.start_key()
}

fn merge(a: &DelElement, b: &DelElement) -> DelElement {
    match (a, b) {
        (DelElement::Key(x), DelElement::Key(y)) if x == y => DelElement::Key(x.clone()),
        _ => DelElement::Range {
            start: a.start_key().min(b.start_key()).clone(),
            end: a.range_end().max(b.range_end()).clone(),
        },
    }
}

/// Ordered, eagerly-coalesced deletions accumulated from already-processed
/// (newer) levels of one query.
///
/// The list owns its single cursor; mutators go through the cursor's
/// position and leave it on a well-defined neighbor, so there is no
/// iterator type to keep in sync with the storage.
#[derive(Debug, Default)]
pub(crate) struct GlobalDelList {
    elems: Vec<DelElement>,
    /// `elems.len()` means past-the-end (invalid).
    cursor: usize,
    upper_bound: Option<Bytes>,
}

impl GlobalDelList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn valid(&self) -> bool {
        self.cursor < self.elems.len()
    }

    pub fn current(&self) -> &DelElement {
        &self.elems[self.cursor]
    }

    pub fn seek_to_first(&mut self) {
        self.cursor = 0;
    }

    /// Positions the cursor on the first element that contains or is after
    /// `target`, searching the whole list.
    pub fn seek(&mut self, target: &[u8]) {
        self.cursor = self.elems.partition_point(|e| e.is_before(target));
    }

    /// Like `seek`, but never moves the cursor backwards: the search starts
    /// at the current position (or the beginning when invalid).
    pub fn seek_forward(&mut self, target: &[u8]) {
        let base = if self.valid() { self.cursor } else { 0 };
        self.cursor = base + self.elems[base..].partition_point(|e| e.is_before(target));
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.cursor += 1;
    }

    /// Inserts `elem` immediately before the cursor. The cursor keeps
    /// pointing at the element it pointed at (or stays past-the-end).
    ///
    /// `elem` must sort before the pointed element; neighbors that touch or
    /// overlap the insertion are folded in on the spot.
    pub fn insert_before(&mut self, elem: DelElement) {
        let idx = self.cursor;
        self.elems.insert(idx, elem);
        self.cursor = idx + 1;
        self.coalesce_at(idx);
        self.debug_check();
    }

    /// As `insert_before`, but the cursor ends on the inserted (possibly
    /// coalesced) element.
    pub fn insert_before_and_set_on_inserted(&mut self, elem: DelElement) {
        let idx = self.cursor;
        self.elems.insert(idx, elem);
        self.cursor = idx + 1;
        let at = self.coalesce_at(idx);
        self.cursor = at;
        self.debug_check();
    }

    /// Replaces the pointed element. The cursor stays on the resulting
    /// coalesced element.
    pub fn replace_with(&mut self, elem: DelElement) {
        debug_assert!(self.valid());
        self.elems[self.cursor] = elem;
        let at = self.coalesce_at(self.cursor);
        self.cursor = at;
        self.debug_check();
    }

    /// Drops every element starting at or beyond `bound` and truncates an
    /// element straddling it. Called whenever the candidate key tightens.
    pub fn trim(&mut self, bound: &Bytes) {
        let cut = self
            .elems
            .partition_point(|e| e.start_key().as_ref() < bound.as_ref());
        self.elems.truncate(cut);

        if let Some(DelElement::Range { end, .. }) = self.elems.last_mut() {
            if end.as_ref() > bound.as_ref() {
                *end = bound.clone();
            }
        }

        self.upper_bound = Some(bound.clone());
        self.cursor = self.cursor.min(self.elems.len());
        self.debug_check();
    }

    /// Folds `elems[idx]` into touching/overlapping neighbors and returns
    /// the merged element's index; the cursor is kept on the element it
    /// logically pointed at.
    fn coalesce_at(&mut self, mut idx: usize) -> usize {
        while idx > 0 && mergeable(&self.elems[idx - 1], &self.elems[idx]) {
            self.elems[idx - 1] = merge(&self.elems[idx - 1], &self.elems[idx]);
            self.elems.remove(idx);
            if self.cursor >= idx {
                self.cursor -= 1;
            }
            idx -= 1;
        }
        while idx + 1 < self.elems.len() && mergeable(&self.elems[idx], &self.elems[idx + 1]) {
            self.elems[idx] = merge(&self.elems[idx], &self.elems[idx + 1]);
            self.elems.remove(idx + 1);
            if self.cursor > idx {
                self.cursor -= 1;
            }
        }
        idx
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self) {
        for pair in self.elems.windows(2) {
            assert!(
                pair[0].start_key() < pair[1].start_key(),
                "deletion list out of order: {pair:?}"
            );
            assert!(
                !mergeable(&pair[0], &pair[1]),
                "deletion list left mergeable neighbors: {pair:?}"
            );
        }
        if let (Some(bound), Some(last)) = (&self.upper_bound, self.elems.last()) {
            assert!(
                last.is_before(bound.as_ref()),
                "deletion list extends past its upper bound"
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check(&self) {}
}
