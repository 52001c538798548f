use bytes::Bytes;

use crate::internal_key::InternalKey;
use crate::range_tombstone::RangeTombstone;
use crate::sst::SstReader;

/// Exclusive upper bound shared by the level cursors. `None` is unbounded.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpperBound(Option<Bytes>);

impl UpperBound {
    pub fn new(bound: Option<Bytes>) -> Self {
        Self(bound)
    }

    pub fn set(&mut self, bound: Bytes) {
        self.0 = Some(bound);
    }

    pub fn admits(&self, user_key: &[u8]) -> bool {
        match &self.0 {
            None => true,
            Some(bound) => user_key < bound.as_ref(),
        }
    }

    pub fn clamp_end(&self, end_key: &Bytes) -> Bytes {
        match &self.0 {
            Some(bound) if bound < end_key => bound.clone(),
            _ => end_key.clone(),
        }
    }
}

/// Raw per-level point cursor. The set is closed: a level is either a
/// materialized memtable snapshot or a run of SST files.
pub(crate) enum PointCursor {
    Mem(MemCursor),
    Run(RunCursor),
}

impl PointCursor {
    fn seek_to_first(&mut self) -> anyhow::Result<()> {
        match self {
            PointCursor::Mem(c) => {
                c.seek_to_first();
                Ok(())
            }
            PointCursor::Run(c) => c.seek_to_first(),
        }
    }

    fn seek(&mut self, user_key: &[u8]) -> anyhow::Result<()> {
        match self {
            PointCursor::Mem(c) => {
                c.seek(user_key);
                Ok(())
            }
            PointCursor::Run(c) => c.seek(user_key),
        }
    }

    fn next(&mut self) -> anyhow::Result<()> {
        match self {
            PointCursor::Mem(c) => {
                c.next();
                Ok(())
            }
            PointCursor::Run(c) => c.next(),
        }
    }

    fn entry(&self) -> Option<(&InternalKey, &Bytes)> {
        match self {
            PointCursor::Mem(c) => c.entry(),
            PointCursor::Run(c) => c.entry(),
        }
    }
}

/// Cursor over a memtable level's sorted entries.
pub(crate) struct MemCursor {
    entries: Vec<(InternalKey, Bytes)>,
    pos: usize,
}

impl MemCursor {
    pub fn new(entries: Vec<(InternalKey, Bytes)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));
        let pos = entries.len();
        Self { entries, pos }
    }

    fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    fn seek(&mut self, user_key: &[u8]) {
        let target = InternalKey::seek_sentinel(Bytes::copy_from_slice(user_key));
        self.pos = self.entries.partition_point(|(k, _)| *k < target);
    }

    fn next(&mut self) {
        debug_assert!(self.pos < self.entries.len());
        self.pos += 1;
    }

    fn entry(&self) -> Option<(&InternalKey, &Bytes)> {
        self.entries.get(self.pos).map(|(k, v)| (k, v))
    }
}

/// Streaming cursor over a run of SST files: a single L0 file, or a sorted
/// level's non-overlapping files in key order. Blocks are decoded lazily
/// and decode/checksum failures surface from the positioning calls.
pub(crate) struct RunCursor {
    readers: Vec<SstReader>,
    file_idx: usize,
    block_idx: usize,
    entries: Vec<(InternalKey, Bytes)>,
    pos: usize,
}

impl RunCursor {
    pub fn new(readers: Vec<SstReader>) -> Self {
        let file_idx = readers.len();
        Self {
            readers,
            file_idx,
            block_idx: 0,
            entries: Vec::new(),
            pos: 0,
        }
    }

    fn seek_to_first(&mut self) -> anyhow::Result<()> {
        self.file_idx = 0;
        self.block_idx = 0;
        self.entries.clear();
        self.pos = 0;
        self.settle()
    }

    fn seek(&mut self, user_key: &[u8]) -> anyhow::Result<()> {
        let target = InternalKey::seek_sentinel(Bytes::copy_from_slice(user_key));

        // Files in a run are ordered, so the first file whose largest key
        // admits the target is the only candidate start.
        self.file_idx = self
            .readers
            .partition_point(|r| r.properties().largest_user_key.as_ref() < user_key);
        self.entries.clear();
        self.pos = 0;
        self.block_idx = 0;

        if let Some(reader) = self.readers.get(self.file_idx) {
            self.block_idx = reader.block_lower_bound(&target);
            if self.block_idx < reader.block_count() {
                self.entries = reader.block_entries(self.block_idx)?;
                self.block_idx += 1;
                self.pos = match self.entries.binary_search_by(|(k, _)| k.cmp(&target)) {
                    Ok(i) | Err(i) => i,
                };
            }
        }
        self.settle()
    }

    fn next(&mut self) -> anyhow::Result<()> {
        debug_assert!(self.pos < self.entries.len());
        self.pos += 1;
        self.settle()
    }

    /// Restores the invariant that the cursor either sits on an entry or is
    /// exhausted, rolling over blocks and files as needed.
    fn settle(&mut self) -> anyhow::Result<()> {
        while self.pos >= self.entries.len() {
            let Some(reader) = self.readers.get(self.file_idx) else {
                return Ok(());
            };
            if self.block_idx >= reader.block_count() {
                self.file_idx += 1;
                self.block_idx = 0;
                continue;
            }
            self.entries = reader.block_entries(self.block_idx)?;
            self.block_idx += 1;
            self.pos = 0;
        }
        Ok(())
    }

    fn entry(&self) -> Option<(&InternalKey, &Bytes)> {
        if self.file_idx >= self.readers.len() {
            return None;
        }
        self.entries.get(self.pos).map(|(k, v)| (k, v))
    }
}

/// A level's point-entry iterator, clamped by an exclusive upper bound.
///
/// Positioning calls return the underlying storage error, if any; the
/// wrapper stays invalid afterwards.
pub(crate) struct ValuesIter {
    cursor: PointCursor,
    upper_bound: UpperBound,
    valid: bool,
}

impl ValuesIter {
    pub fn new(cursor: PointCursor, upper_bound: UpperBound) -> Self {
        Self {
            cursor,
            upper_bound,
            valid: false,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn seek_to_first(&mut self) -> anyhow::Result<()> {
        self.cursor.seek_to_first()?;
        self.update_validity();
        Ok(())
    }

    /// Positions at the first internal key whose user key is >= `user_key`,
    /// entering that key's versions newest-first.
    pub fn seek(&mut self, user_key: &[u8]) -> anyhow::Result<()> {
        self.cursor.seek(user_key)?;
        self.update_validity();
        Ok(())
    }

    pub fn next(&mut self) -> anyhow::Result<()> {
        debug_assert!(self.valid);
        self.cursor.next()?;
        self.update_validity();
        Ok(())
    }

    pub fn key(&self) -> &InternalKey {
        debug_assert!(self.valid);
        self.cursor.entry().expect("valid cursor has an entry").0
    }

    #[allow(dead_code)]
    pub fn value(&self) -> &Bytes {
        debug_assert!(self.valid);
        self.cursor.entry().expect("valid cursor has an entry").1
    }

    fn update_validity(&mut self) {
        self.valid = match self.cursor.entry() {
            // The bound is the candidate key itself, so it is exclusive.
            Some((key, _)) => self.upper_bound.admits(key.user_key.as_ref()),
            None => false,
        };
    }
}

/// A level's fragmented range-tombstone iterator, clamped by an exclusive
/// upper bound. Sorted levels have no tombstones and use `none()`, which is
/// invalid at every position.
pub(crate) struct TombstonesIter {
    fragments: Vec<RangeTombstone>,
    pos: usize,
    upper_bound: UpperBound,
    valid: bool,
}

impl TombstonesIter {
    pub fn new(fragments: Vec<RangeTombstone>, upper_bound: UpperBound) -> Self {
        debug_assert!(fragments
            .windows(2)
            .all(|w| w[0].end_key <= w[1].start_key));
        let pos = fragments.len();
        Self {
            fragments,
            pos,
            upper_bound,
            valid: false,
        }
    }

    pub fn none(upper_bound: UpperBound) -> Self {
        Self::new(Vec::new(), upper_bound)
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn seek_to_first(&mut self) {
        self.pos = 0;
        self.update_validity();
    }

    /// Positions at the first tombstone that covers `user_key` or starts
    /// after it.
    pub fn seek(&mut self, user_key: &[u8]) {
        self.pos = self
            .fragments
            .partition_point(|t| t.end_key.as_ref() <= user_key);
        self.update_validity();
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        self.pos += 1;
        self.update_validity();
    }

    /// The current tombstone, its end clamped to the upper bound.
    pub fn tombstone(&self) -> RangeTombstone {
        debug_assert!(self.valid);
        let current = &self.fragments[self.pos];
        RangeTombstone {
            start_key: current.start_key.clone(),
            end_key: self.upper_bound.clamp_end(&current.end_key),
            seqno: current.seqno,
        }
    }

    pub fn set_upper_bound(&mut self, bound: Bytes) {
        self.upper_bound.set(bound);
        self.update_validity();
    }

    fn update_validity(&mut self) {
        self.valid = match self.fragments.get(self.pos) {
            // A tombstone starting at the bound cannot cover anything the
            // query may still return.
            Some(t) => self.upper_bound.admits(t.start_key.as_ref()),
            None => false,
        };
    }
}
