/// Commit position of one partition claim.
///
/// Holds the offset of the next message to read and only ever moves forward,
/// so an offset is committed at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    partition: i32,
    next_offset: Option<i64>,
}

impl PartitionCursor {
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            next_offset: None,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn next_offset(&self) -> Option<i64> {
        self.next_offset
    }

    /// Whether `offset` has not been passed yet.
    pub fn is_pending(&self, offset: i64) -> bool {
        self.next_offset.map_or(true, |next| offset >= next)
    }

    /// Move past `offset`. Returns the new commit position, or `None` when the
    /// cursor is already at or beyond it.
    pub fn advance(&mut self, offset: i64) -> Option<i64> {
        if !self.is_pending(offset) {
            return None;
        }
        let next = offset + 1;
        self.next_offset = Some(next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_moves_forward() {
        let mut cursor = PartitionCursor::new(3);
        assert_eq!(cursor.next_offset(), None);
        assert_eq!(cursor.advance(41), Some(42));
        assert_eq!(cursor.advance(42), Some(43));
        assert_eq!(cursor.next_offset(), Some(43));
        assert_eq!(cursor.partition(), 3);
    }

    #[test]
    fn test_redelivered_offset_not_advanced_twice() {
        let mut cursor = PartitionCursor::new(0);
        assert_eq!(cursor.advance(5), Some(6));
        assert_eq!(cursor.advance(5), None);
        assert_eq!(cursor.advance(2), None);
        assert!(!cursor.is_pending(5));
        assert!(cursor.is_pending(6));
    }

    #[test]
    fn test_gaps_are_allowed() {
        let mut cursor = PartitionCursor::new(0);
        cursor.advance(1);
        assert_eq!(cursor.advance(10), Some(11));
    }
}
