//! Quality-tagged value cache.
//!
//! Holds the most recent reading of every tag a device's poll jobs have
//! touched. Entries are replaced wholesale, so a reader always observes a
//! value together with the quality produced by the same poll attempt.
//! Entries are never deleted; they live for the lifetime of the bridge.

use crate::address::tag_id;
use fieldbridge_common::{Quality, TagReading};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared tag cache, written by poll jobs and read by consumers.
#[derive(Debug, Clone, Default)]
pub struct ValueCache {
    inner: Arc<RwLock<HashMap<String, TagReading>>>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the current reading for a tag.
    ///
    /// Returns [`Quality::BadDataUnavailable`] for tags that have never been
    /// polled.
    pub fn read(&self, tag: &str) -> TagReading {
        self.lock_read()
            .get(tag)
            .copied()
            .unwrap_or_else(TagReading::unavailable)
    }

    /// Unconditionally overwrite a tag's reading (last writer wins).
    pub fn write(&self, tag: String, reading: TagReading) {
        self.lock_write().insert(tag, reading);
    }

    /// Mark every address in `[start, start+count)` under `root` with the
    /// given quality, dropping previously cached values.
    ///
    /// Used when a whole-range poll attempt fails: no partial Good/Bad mix
    /// is ever recorded for one tick.
    pub fn mark_range(&self, root: &str, start: u16, count: u16, quality: Quality) {
        let mut map = self.lock_write();
        for offset in 0..count {
            map.insert(tag_id(root, start + offset), TagReading::bad(quality));
        }
    }

    /// Mark every cached tag with the given quality.
    ///
    /// Coarse invalidation used when the shared socket reports an error,
    /// independent of per-range poll tracking.
    pub fn mark_all(&self, quality: Quality) {
        let mut map = self.lock_write();
        for reading in map.values_mut() {
            *reading = TagReading::bad(quality);
        }
    }

    /// Number of tags ever polled.
    pub fn len(&self) -> usize {
        self.lock_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_read().is_empty()
    }

    // A poisoned lock still guards a structurally valid map; recover the
    // guard instead of propagating a panic into poll jobs.
    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TagReading>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TagReading>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldbridge_common::TagValue;

    #[test]
    fn test_unpolled_tag_is_unavailable() {
        let cache = ValueCache::new();
        let reading = cache.read("holding100");
        assert_eq!(reading.quality, Quality::BadDataUnavailable);
        assert_eq!(reading.value, None);
    }

    #[test]
    fn test_write_then_read() {
        let cache = ValueCache::new();
        cache.write("holding100".to_string(), TagReading::good(7u16));

        let reading = cache.read("holding100");
        assert_eq!(reading.value, Some(TagValue::Integer(7)));
        assert!(reading.quality.is_good());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ValueCache::new();
        cache.write("coil5".to_string(), TagReading::good(true));
        cache.write("coil5".to_string(), TagReading::good(false));

        assert_eq!(cache.read("coil5").value, Some(TagValue::Boolean(false)));
    }

    #[test]
    fn test_mark_range_overwrites_values() {
        let cache = ValueCache::new();
        cache.write("holding100".to_string(), TagReading::good(7u16));
        cache.write("holding101".to_string(), TagReading::good(8u16));

        cache.mark_range("holding", 100, 3, Quality::BadCommunicationError);

        for addr in 100..103 {
            let reading = cache.read(&format!("holding{}", addr));
            assert_eq!(reading.quality, Quality::BadCommunicationError);
            // Staleness must be visible: the old value is gone.
            assert_eq!(reading.value, None);
        }
    }

    #[test]
    fn test_mark_range_does_not_touch_other_roots() {
        let cache = ValueCache::new();
        cache.write("input100".to_string(), TagReading::good(1u16));

        cache.mark_range("holding", 100, 1, Quality::BadNotConnected);

        assert!(cache.read("input100").quality.is_good());
        assert_eq!(cache.read("holding100").quality, Quality::BadNotConnected);
    }

    #[test]
    fn test_mark_all() {
        let cache = ValueCache::new();
        cache.write("holding100".to_string(), TagReading::good(7u16));
        cache.write("coil5".to_string(), TagReading::good(true));

        cache.mark_all(Quality::Bad);

        assert_eq!(cache.read("holding100").quality, Quality::Bad);
        assert_eq!(cache.read("coil5").quality, Quality::Bad);
        // Tags never polled stay unavailable, not Bad.
        assert_eq!(cache.read("input0").quality, Quality::BadDataUnavailable);
    }

    #[test]
    fn test_len() {
        let cache = ValueCache::new();
        assert!(cache.is_empty());
        cache.mark_range("holding", 0, 4, Quality::BadNotConnected);
        assert_eq!(cache.len(), 4);
    }
}
