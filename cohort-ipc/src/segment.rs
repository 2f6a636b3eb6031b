//! Named shared memory segments

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

/// Table of named, reference-counted byte regions visible to every rank of a
/// transport that shares an address space.
///
/// Readers obtain cheap `Bytes` clones, so removing a segment from the table
/// never invalidates views already handed out.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: RwLock<HashMap<String, Bytes>>,
}

impl SegmentTable {
    /// Create an empty segment table
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a segment, replacing any previous segment of the same name
    pub fn publish(&self, name: impl Into<String>, data: Bytes) {
        self.segments.write().insert(name.into(), data);
    }

    /// Look up a segment by name
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.segments.read().get(name).cloned()
    }

    /// Withdraw a segment
    pub fn remove(&self, name: &str) -> Option<Bytes> {
        self.segments.write().remove(name)
    }

    /// Number of published segments
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    /// Check if no segments are published
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_get_remove() {
        let table = SegmentTable::new();
        assert!(table.is_empty());

        table.publish("cohort:snap:pos", Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(table.len(), 1);

        let view = table.get("cohort:snap:pos").unwrap();
        assert_eq!(&view[..], &[1, 2, 3, 4]);

        let removed = table.remove("cohort:snap:pos").unwrap();
        assert!(table.get("cohort:snap:pos").is_none());
        // views outlive withdrawal
        assert_eq!(view, removed);
    }
}
