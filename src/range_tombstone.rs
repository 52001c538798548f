use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Deletes user keys in `[start_key, end_key)` written at seqno <= `seqno`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub seqno: u64,
}

impl RangeTombstone {
    pub fn new(start_key: Bytes, end_key: Bytes, seqno: u64) -> Self {
        Self {
            start_key,
            end_key,
            seqno,
        }
    }

    pub fn covers(&self, key: &[u8], snapshot_seqno: u64) -> bool {
        self.seqno <= snapshot_seqno
            && self.start_key.as_ref() <= key
            && key < self.end_key.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.start_key.as_ref() < self.end_key.as_ref()
    }
}

/// Fragments one level's raw tombstones into non-overlapping ascending spans.
///
/// Input tombstones may overlap arbitrarily. The output is split at every
/// start/end boundary, each span carrying the maximum seqno of the
/// tombstones covering it; contiguous spans with equal seqno are re-joined.
pub fn fragment(mut tombstones: Vec<RangeTombstone>) -> Vec<RangeTombstone> {
    tombstones.retain(RangeTombstone::is_valid);
    if tombstones.len() <= 1 {
        return tombstones;
    }

    let mut bounds: Vec<Bytes> = Vec::with_capacity(tombstones.len() * 2);
    for t in &tombstones {
        bounds.push(t.start_key.clone());
        bounds.push(t.end_key.clone());
    }
    bounds.sort();
    bounds.dedup();

    let mut out: Vec<RangeTombstone> = Vec::new();
    for window in bounds.windows(2) {
        let (lo, hi) = (&window[0], &window[1]);
        let seqno = tombstones
            .iter()
            .filter(|t| t.start_key <= *lo && *lo < t.end_key)
            .map(|t| t.seqno)
            .max();
        let Some(seqno) = seqno else { continue };

        match out.last_mut() {
            Some(last) if last.end_key == *lo && last.seqno == seqno => {
                last.end_key = hi.clone();
            }
            _ => out.push(RangeTombstone::new(lo.clone(), hi.clone(), seqno)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(start: &str, end: &str, seqno: u64) -> RangeTombstone {
        RangeTombstone::new(
            Bytes::copy_from_slice(start.as_bytes()),
            Bytes::copy_from_slice(end.as_bytes()),
            seqno,
        )
    }

    #[test]
    fn covers_is_half_open() {
        let t = ts("b", "d", 5);
        assert!(!t.covers(b"a", u64::MAX));
        assert!(t.covers(b"b", u64::MAX));
        assert!(t.covers(b"c", u64::MAX));
        assert!(!t.covers(b"d", u64::MAX));
        assert!(!t.covers(b"c", 4));
    }

    #[test]
    fn fragment_keeps_disjoint_tombstones() {
        let got = fragment(vec![ts("a", "b", 3), ts("c", "d", 7)]);
        assert_eq!(got, vec![ts("a", "b", 3), ts("c", "d", 7)]);
    }

    #[test]
    fn fragment_splits_overlap_at_boundaries() {
        // [a, e)@2 overlapped by [c, g)@9: the shared span takes the max.
        let got = fragment(vec![ts("a", "e", 2), ts("c", "g", 9)]);
        assert_eq!(got, vec![ts("a", "c", 2), ts("c", "g", 9)]);
    }

    #[test]
    fn fragment_rejoins_equal_seqno_spans() {
        // A tombstone fully inside another at a lower seqno disappears.
        let got = fragment(vec![ts("a", "z", 8), ts("m", "p", 3)]);
        assert_eq!(got, vec![ts("a", "z", 8)]);
    }

    #[test]
    fn fragment_nested_higher_seqno_splits_three_ways() {
        let got = fragment(vec![ts("a", "z", 3), ts("m", "p", 8)]);
        assert_eq!(got, vec![ts("a", "m", 3), ts("m", "p", 8), ts("p", "z", 3)]);
    }

    #[test]
    fn fragment_drops_empty_ranges() {
        assert!(fragment(vec![ts("c", "c", 1), ts("d", "a", 2)]).is_empty());
    }
}
