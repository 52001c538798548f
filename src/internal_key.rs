use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Operation recorded under an internal key.
///
/// `Meta` is a seek sentinel only: it sorts before every real kind at the
/// same `(user_key, seqno)` and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Meta,
    Put,
    Merge,
    Del,
    RangeDel,
}

/// What an entry means to a reader, derived from its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCategory {
    /// A live value.
    Value,
    /// A live merge operand.
    MergeValue,
    /// A point deletion.
    DelKey,
    /// Anything a point read skips (range-del markers, sentinels).
    Other,
}

impl KeyKind {
    pub fn value_category(self) -> ValueCategory {
        match self {
            KeyKind::Put => ValueCategory::Value,
            KeyKind::Merge => ValueCategory::MergeValue,
            KeyKind::Del => ValueCategory::DelKey,
            KeyKind::RangeDel | KeyKind::Meta => ValueCategory::Other,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KeyKind::Meta),
            1 => Some(KeyKind::Put),
            2 => Some(KeyKind::Merge),
            3 => Some(KeyKind::Del),
            4 => Some(KeyKind::RangeDel),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            KeyKind::Meta => 0,
            KeyKind::Put => 1,
            KeyKind::Merge => 2,
            KeyKind::Del => 3,
            KeyKind::RangeDel => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated internal key")]
    Truncated,

    #[error("unknown key kind tag {0}")]
    UnknownKind(u8),
}

/// `(user_key, seqno, kind)`.
///
/// Total order: ascending user key, then *descending* seqno, then kind.
/// For one user key the newest version sorts first, so a seek to
/// `(key, u64::MAX, Meta)` lands on that key's newest entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seqno: u64,
    pub kind: KeyKind,
}

impl InternalKey {
    pub fn new(user_key: Bytes, seqno: u64, kind: KeyKind) -> Self {
        Self {
            user_key,
            seqno,
            kind,
        }
    }

    /// Sentinel that sorts at or before every entry of `user_key`.
    pub fn seek_sentinel(user_key: impl Into<Bytes>) -> Self {
        Self::new(user_key.into(), u64::MAX, KeyKind::Meta)
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let key_len: u32 = self.user_key.len().try_into().expect("user key too large");
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.push(self.kind.tag());
    }

    /// Decodes one internal key, returning it and the bytes consumed.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), DecodeError> {
        if input.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let key_len = u32::from_le_bytes(input[0..4].try_into().unwrap()) as usize;
        let total = 4 + key_len + 8 + 1;
        if input.len() < total {
            return Err(DecodeError::Truncated);
        }
        let user_key = Bytes::copy_from_slice(&input[4..(4 + key_len)]);
        let seqno = u64::from_le_bytes(input[(4 + key_len)..(4 + key_len + 8)].try_into().unwrap());
        let tag = input[total - 1];
        let kind = KeyKind::from_tag(tag).ok_or(DecodeError::UnknownKind(tag))?;
        Ok((
            Self {
                user_key,
                seqno,
                kind,
            },
            total,
        ))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seqno.cmp(&self.seqno))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(key: &str, seqno: u64, kind: KeyKind) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(key.as_bytes()), seqno, kind)
    }

    #[test]
    fn order_is_user_asc_seqno_desc() {
        let mut keys = vec![
            ikey("b", 1, KeyKind::Put),
            ikey("a", 1, KeyKind::Put),
            ikey("a", 9, KeyKind::Del),
            ikey("a", 5, KeyKind::Put),
        ];
        keys.sort();
        let flat: Vec<(&[u8], u64)> = keys
            .iter()
            .map(|k| (k.user_key.as_ref(), k.seqno))
            .collect();
        assert_eq!(
            flat,
            vec![
                (&b"a"[..], 9),
                (&b"a"[..], 5),
                (&b"a"[..], 1),
                (&b"b"[..], 1),
            ]
        );
    }

    #[test]
    fn seek_sentinel_sorts_first_for_its_key() {
        let sentinel = InternalKey::seek_sentinel(&b"k"[..]);
        assert!(sentinel < ikey("k", u64::MAX, KeyKind::Put));
        assert!(sentinel < ikey("k", 0, KeyKind::Del));
        assert!(sentinel > ikey("j", 0, KeyKind::Del));
    }

    #[test]
    fn codec_round_trip() {
        let key = ikey("hello", 42, KeyKind::RangeDel);
        let mut buf = Vec::new();
        key.encode_into(&mut buf);
        buf.extend_from_slice(b"trailing");
        let (decoded, used) = InternalKey::decode(&buf).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(used, buf.len() - b"trailing".len());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            InternalKey::decode(&[1, 0]),
            Err(DecodeError::Truncated)
        ));

        let mut buf = Vec::new();
        ikey("k", 1, KeyKind::Put).encode_into(&mut buf);
        let tag_at = buf.len() - 1;
        buf[tag_at] = 0xff;
        assert!(matches!(
            InternalKey::decode(&buf),
            Err(DecodeError::UnknownKind(0xff))
        ));
    }
}
