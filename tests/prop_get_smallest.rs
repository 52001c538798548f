use std::collections::BTreeMap;

use bytes::Bytes;
use proptest::prelude::*;

use seekdb::{Db, DbOptions, Op, ReadOptions, WriteOptions};

#[derive(Debug, Clone)]
enum MiniOp {
    Put { key: u8, value: u8 },
    Merge { key: u8, value: u8 },
    Del { key: u8 },
    RangeDel { start: u8, end: u8 },
}

#[derive(Debug, Clone)]
enum Step {
    Batch(Vec<MiniOp>),
    Flush,
    Compact,
}

const KEY_SPACE: u8 = 10;

fn options() -> DbOptions {
    DbOptions {
        memtable_shards: 4,
        memtable_bytes: 2 * 1024,
        l0_compaction_trigger: 4,
    }
}

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + (key % KEY_SPACE)]
}

/// Exclusive range end; may sit one past the last key of the space.
fn end_key_bytes(end: u8) -> Vec<u8> {
    vec![b'a' + end.min(KEY_SPACE)]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

#[derive(Debug, Default)]
struct RefModel {
    /// Per key: (seqno, value) versions, appended in write order.
    versions: BTreeMap<Vec<u8>, Vec<(u64, Option<Vec<u8>>)>>,
    /// (start, end, seqno) range tombstones.
    tombstones: Vec<(Vec<u8>, Vec<u8>, u64)>,
}

impl RefModel {
    fn apply(&mut self, seqno: u64, op: &MiniOp) {
        match op {
            MiniOp::Put { key, value } | MiniOp::Merge { key, value } => {
                self.versions
                    .entry(key_bytes(*key))
                    .or_default()
                    .push((seqno, Some(value_bytes(*value))));
            }
            MiniOp::Del { key } => {
                self.versions
                    .entry(key_bytes(*key))
                    .or_default()
                    .push((seqno, None));
            }
            MiniOp::RangeDel { start, end } => {
                self.tombstones
                    .push((key_bytes(*start), end_key_bytes(*end), seqno));
            }
        }
    }

    fn covered(&self, key: &[u8], version_seqno: u64) -> bool {
        self.tombstones
            .iter()
            .any(|(start, end, seqno)| {
                *seqno > version_seqno && start.as_slice() <= key && key < end.as_slice()
            })
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let versions = self.versions.get(key)?;
        let (seqno, value) = versions.last()?;
        if self.covered(key, *seqno) {
            return None;
        }
        value.clone()
    }

    fn is_live(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn smallest_at_or_after(&self, target: &[u8]) -> Option<Vec<u8>> {
        self.versions
            .range(target.to_vec()..)
            .map(|(key, _)| key)
            .find(|key| self.is_live(key))
            .cloned()
    }
}

fn check_against_model(db: &Db, model: &RefModel) -> Result<(), TestCaseError> {
    // Every point read agrees.
    for k in 0..KEY_SPACE {
        let key = key_bytes(k);
        let got = db.get(&key, ReadOptions::default()).unwrap();
        prop_assert_eq!(
            got.map(|b| b.to_vec()),
            model.get(&key),
            "get({:?})",
            String::from_utf8_lossy(&key)
        );
    }

    // Every seek target agrees, including the open one.
    let mut targets: Vec<Vec<u8>> = vec![Vec::new()];
    targets.extend((0..=KEY_SPACE).map(end_key_bytes));
    for target in targets {
        let got = db
            .get_smallest_at_or_after(ReadOptions::default(), &target)
            .unwrap();
        prop_assert_eq!(
            got.clone().map(|b| b.to_vec()),
            model.smallest_at_or_after(&target),
            "seek({:?})",
            String::from_utf8_lossy(&target)
        );
        if let Some(found) = got {
            prop_assert!(target.as_slice() <= found.as_ref());
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    #[test]
    fn seek_matches_reference_model(steps in prop::collection::vec(step_strategy(), 1..60)) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Db::open(dir.path(), options()).unwrap();

        let mut model = RefModel::default();
        let mut seqno = 0u64;

        for step in &steps {
            match step {
                Step::Batch(batch) => {
                    let mut ops = Vec::new();
                    for op in batch {
                        match op {
                            MiniOp::Put { key, value } => {
                                ops.push(Op::put(key_bytes(*key), value_bytes(*value)));
                            }
                            MiniOp::Merge { key, value } => {
                                ops.push(Op::merge(key_bytes(*key), value_bytes(*value)));
                            }
                            MiniOp::Del { key } => {
                                ops.push(Op::delete(key_bytes(*key)));
                            }
                            MiniOp::RangeDel { start, end } => {
                                ops.push(Op::delete_range(
                                    key_bytes(*start),
                                    end_key_bytes(*end),
                                ));
                            }
                        }
                    }

                    db.write_batch(ops, WriteOptions { sync: false }).unwrap();
                    for op in batch {
                        seqno += 1;
                        model.apply(seqno, op);
                    }
                }
                Step::Flush => db.flush().unwrap(),
                Step::Compact => db.compact().unwrap(),
            }

            check_against_model(&db, &model)?;
        }

        // The tree survives a reopen with the in-memory tail flushed.
        db.flush().unwrap();
        drop(db);
        let db = Db::open(dir.path(), options()).unwrap();
        check_against_model(&db, &model)?;

        // And the walk over live keys equals the model's live keyspace.
        let live: Vec<Bytes> = {
            let mut out = Vec::new();
            let mut cursor: Vec<u8> = Vec::new();
            while let Some(found) = db
                .get_smallest_at_or_after(ReadOptions::default(), &cursor)
                .unwrap()
            {
                out.push(found.clone());
                cursor = found.to_vec();
                cursor.push(0);
            }
            out
        };
        let expected: Vec<Bytes> = (0..KEY_SPACE)
            .map(key_bytes)
            .filter(|k| model.is_live(k))
            .map(Bytes::from)
            .collect();
        prop_assert_eq!(live, expected);
    }
}

fn step_strategy() -> impl Strategy<Value = Step> {
    let mini_op = prop_oneof![
        4 => (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| MiniOp::Put { key, value }),
        1 => (0u8..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| MiniOp::Merge { key, value }),
        2 => (0u8..KEY_SPACE).prop_map(|key| MiniOp::Del { key }),
        2 => (0u8..KEY_SPACE, 1u8..KEY_SPACE).prop_map(|(start, span)| MiniOp::RangeDel {
            start,
            end: (start + span).min(KEY_SPACE),
        }),
    ];

    prop_oneof![
        6 => prop::collection::vec(mini_op, 1..6).prop_map(Step::Batch),
        1 => Just(Step::Flush),
        1 => Just(Step::Compact),
    ]
}
