use std::{fmt, mem};

use serde::{Deserialize, Serialize};

/// One data-movement request: read `length` bytes at `source_offset` of the
/// peer's region `region_key` into the local region of the same key at
/// `target_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub region_key: String,
    pub target_offset: u64,
    pub source_offset: u64,
    pub length: u64,
}

impl Assignment {
    pub fn new(
        region_key: impl Into<String>,
        target_offset: u64,
        source_offset: u64,
        length: u64,
    ) -> Self {
        Self {
            region_key: region_key.into(),
            target_offset,
            source_offset,
            length,
        }
    }

    /// Split into contiguous pieces of at most `max` bytes each, in order.
    ///
    /// A zero-length assignment yields itself.
    pub fn split(&self, max: u64) -> Vec<Assignment> {
        self.pieces(max).collect()
    }

    /// Lazy form of [`split`](Self::split).
    pub fn pieces(&self, max: u64) -> impl Iterator<Item = Assignment> + '_ {
        let max = max.max(1);
        let mut done = 0;
        let mut empty = self.length == 0;
        std::iter::from_fn(move || {
            if done >= self.length && !mem::take(&mut empty) {
                return None;
            }
            let length = max.min(self.length - done);
            let piece = Assignment {
                region_key: self.region_key.clone(),
                target_offset: self.target_offset + done,
                source_offset: self.source_offset + done,
                length,
            };
            done += length;
            Some(piece)
        })
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Assignment (region_key: {}, target_offset: {}, source_offset: {}, length: {})",
            self.region_key, self.target_offset, self.source_offset, self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let a = Assignment::new("kv", 8, 16, 32);
        assert_eq!(
            a.to_string(),
            "Assignment (region_key: kv, target_offset: 8, source_offset: 16, length: 32)"
        );
    }

    #[test]
    fn split_covers_range_in_order() {
        let a = Assignment::new("kv", 100, 1000, 10);
        let pieces = a.split(4);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], Assignment::new("kv", 100, 1000, 4));
        assert_eq!(pieces[1], Assignment::new("kv", 104, 1004, 4));
        assert_eq!(pieces[2], Assignment::new("kv", 108, 1008, 2));

        assert_eq!(a.split(10), vec![a.clone()]);
        assert_eq!(a.split(1 << 30), vec![a]);

        let empty = Assignment::new("kv", 0, 0, 0);
        assert_eq!(empty.split(4), vec![empty.clone()]);
    }

    #[test]
    fn pieces_are_lazy() {
        let a = Assignment::new("kv", 0, 0, u64::MAX);
        let mut pieces = a.pieces(1);
        assert_eq!(pieces.next(), Some(Assignment::new("kv", 0, 0, 1)));
        assert_eq!(pieces.nth(1), Some(Assignment::new("kv", 2, 2, 1)));
    }
}
