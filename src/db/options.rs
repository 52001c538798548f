#[derive(Debug, Clone)]
pub struct DbOptions {
    pub memtable_shards: usize,
    /// Rotate the mutable memtable once it grows past this.
    pub memtable_bytes: u64,
    /// L0 file count that makes `compact_if_needed` act.
    pub l0_compaction_trigger: usize,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            memtable_shards: 16,
            memtable_bytes: 8 * 1024 * 1024,
            l0_compaction_trigger: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Persist the write to L0 before acknowledging. Without it, writes
    /// live in memtables until the next `flush`.
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub snapshot: Option<crate::db::SnapshotId>,
    /// Skip range-tombstone masking in point reads. Not accepted by the
    /// ordered read path.
    pub ignore_range_deletions: bool,
}
