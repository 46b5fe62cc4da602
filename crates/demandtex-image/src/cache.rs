//! Shared image sources keyed by path.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::source::{create_image_source, ImageSource};

/// Aggregate statistics over the cached sources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Number of cached sources
    pub num_image_sources: usize,
    /// Tiles read from all sources
    pub num_tiles_read: u64,
    /// Bytes read from all sources
    pub num_bytes_read: u64,
}

/// Cache of image sources, so each path is decoded at most once.
#[derive(Default)]
pub struct ImageSourceCache {
    sources: Mutex<HashMap<String, Arc<dyn ImageSource>>>,
}

impl ImageSourceCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the source for `path`, creating it on first use.
    pub fn get(&self, path: &str) -> Result<Arc<dyn ImageSource>> {
        let mut sources = self.sources.lock();
        if let Some(source) = sources.get(path) {
            return Ok(Arc::clone(source));
        }

        let source = create_image_source(path, Path::new(""))?;
        sources.insert(path.to_string(), Arc::clone(&source));
        tracing::debug!(path, "Cached image source");
        Ok(source)
    }

    /// Find the source for `path` without creating it.
    pub fn find(&self, path: &str) -> Option<Arc<dyn ImageSource>> {
        self.sources.lock().get(path).cloned()
    }

    /// Register `source` for `path`, replacing any previous entry.
    pub fn set(&self, path: &str, source: Arc<dyn ImageSource>) {
        self.sources.lock().insert(path.to_string(), source);
    }

    /// Aggregate statistics.
    pub fn statistics(&self) -> CacheStatistics {
        let sources = self.sources.lock();
        sources.values().fold(
            CacheStatistics {
                num_image_sources: sources.len(),
                ..CacheStatistics::default()
            },
            |mut stats, source| {
                stats.num_tiles_read += source.num_tiles_read();
                stats.num_bytes_read += source.num_bytes_read();
                stats
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkerboard::CheckerBoardImage;

    #[test]
    fn find_missing() {
        let cache = ImageSourceCache::new();
        assert!(cache.find("missing-file.foo").is_none());
        assert!(cache.get("missing-file.foo").is_err());
    }

    #[test]
    fn get_returns_shared_source() {
        let cache = ImageSourceCache::new();
        let first = cache.get("checkerboard").unwrap();
        let second = cache.get("checkerboard").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &cache.find("checkerboard").unwrap()));
        assert_eq!(cache.statistics().num_image_sources, 1);
    }

    #[test]
    fn set_overrides_creation() {
        let cache = ImageSourceCache::new();
        let adapted: Arc<dyn ImageSource> = Arc::new(CheckerBoardImage::new(64, 64, 2, false, true));
        cache.set("level0.jpg", Arc::clone(&adapted));
        assert!(Arc::ptr_eq(&adapted, &cache.get("level0.jpg").unwrap()));
    }

    #[test]
    fn statistics_sum_reads() {
        let cache = ImageSourceCache::new();
        let source = cache.get("checkerboard").unwrap();
        source.open().unwrap();
        let mut tile = vec![0u8; 64 * 64 * 16];
        assert!(source.read_tile(&mut tile, 0, 1, 1, 64, 64).unwrap());

        let stats = cache.statistics();
        assert_eq!(stats.num_tiles_read, 1);
        assert_eq!(stats.num_bytes_read, 64 * 64 * 16);
    }
}
