//! Decoded tile cache.
//!
//! This module provides an LRU cache for decoded tiles, so a tile shared by
//! neighbouring region reads is decoded only once.
//!
//! # Cache Key
//!
//! Tiles are cached by a composite key:
//! - Pyramid level
//! - Optical path
//! - Focal plane
//! - Tile column
//! - Tile row
//!
//! One cache belongs to one slide, so the key carries no slide identifier.
//!
//! # Single Flight
//!
//! Concurrent requests for a key that is not cached collapse into a single
//! load. The first caller spawns the load as a detached task and registers a
//! `watch` channel; later callers subscribe to it. Every caller observes the
//! same result, success or error. Errors are never cached.
//!
//! # Eviction
//!
//! Capacity is a tile count or a byte budget. Least-recently-used entries
//! are evicted after each insertion until the cache fits; the newest entry
//! is always kept.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::TileError;
use crate::format::{FocalPlane, OpticalPath, SlideWarning, WarningKind};

/// Smallest tile-count capacity accepted.
pub const MIN_CACHE_TILES: usize = 16;

/// Smallest byte capacity accepted: 4 MiB.
pub const MIN_CACHE_BYTES: usize = 4 * 1024 * 1024;

// =============================================================================
// Cache Key and Value
// =============================================================================

/// Cache key for decoded tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Pyramid level (0 = highest resolution)
    pub level: usize,
    pub optical_path: OpticalPath,
    pub focal_plane: FocalPlane,
    /// Tile column (0-indexed from left)
    pub column: u32,
    /// Tile row (0-indexed from top)
    pub row: u32,
}

impl TileKey {
    pub fn new(
        level: usize,
        optical_path: OpticalPath,
        focal_plane: FocalPlane,
        column: u32,
        row: u32,
    ) -> Self {
        Self {
            level,
            optical_path,
            focal_plane,
            column,
            row,
        }
    }
}

/// Raw samples of one decoded tile, row-major and interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTile {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub samples_per_pixel: u16,
    pub bytes_per_sample: usize,
}

impl DecodedTile {
    /// A tile with every sample set to `value`.
    ///
    /// 16-bit values are written little-endian.
    pub fn filled(
        width: u32,
        height: u32,
        samples_per_pixel: u16,
        bytes_per_sample: usize,
        value: u16,
    ) -> Self {
        let samples = width as usize * height as usize * samples_per_pixel as usize;
        Self {
            data: Bytes::from(fill_samples(samples, bytes_per_sample, value)),
            width,
            height,
            samples_per_pixel,
            bytes_per_sample,
        }
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.samples_per_pixel as usize * self.bytes_per_sample
    }

    /// Bytes of one row.
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A buffer of `samples` samples, each set to `value`.
pub(crate) fn fill_samples(samples: usize, bytes_per_sample: usize, value: u16) -> Vec<u8> {
    match bytes_per_sample {
        1 => vec![value as u8; samples],
        _ => {
            let mut sample = vec![0u8; bytes_per_sample];
            sample[..2].copy_from_slice(&value.to_le_bytes());
            sample.repeat(samples)
        }
    }
}

// =============================================================================
// Capacity and Stats
// =============================================================================

/// Cache capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCapacity {
    /// Maximum number of tiles
    Tiles(usize),
    /// Maximum total decoded bytes
    Bytes(usize),
}

impl CacheCapacity {
    /// Raise a capacity below the minimum to the minimum.
    ///
    /// Returns the clamped capacity and whether clamping happened.
    pub fn clamped(self) -> (Self, bool) {
        match self {
            CacheCapacity::Tiles(n) if n < MIN_CACHE_TILES => {
                (CacheCapacity::Tiles(MIN_CACHE_TILES), true)
            }
            CacheCapacity::Bytes(n) if n < MIN_CACHE_BYTES => {
                (CacheCapacity::Bytes(MIN_CACHE_BYTES), true)
            }
            other => (other, false),
        }
    }

    fn exceeded(self, entries: usize, bytes: usize) -> bool {
        match self {
            CacheCapacity::Tiles(n) => entries > n,
            CacheCapacity::Bytes(n) => bytes > n,
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Loads started (at most one per key at a time)
    pub decodes: u64,
    pub evictions: u64,
}

// =============================================================================
// Tile Cache
// =============================================================================

type TileResult = Result<Arc<DecodedTile>, TileError>;

struct LruState {
    entries: LruCache<TileKey, Arc<DecodedTile>>,
    bytes: usize,
}

struct Inner {
    lru: Mutex<LruState>,
    in_flight: Mutex<HashMap<TileKey, watch::Receiver<Option<TileResult>>>>,
    capacity: CacheCapacity,
    /// Set under the `lru` lock; a closed cache accepts no entries
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    decodes: AtomicU64,
    evictions: AtomicU64,
}

impl Inner {
    async fn put(&self, key: TileKey, tile: Arc<DecodedTile>) {
        let mut state = self.lru.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let size = tile.len();

        if let Some(old) = state.entries.put(key, tile) {
            state.bytes = state.bytes.saturating_sub(old.len());
        }
        state.bytes += size;

        let mut evicted = 0u64;
        while state.entries.len() > 1 && self.capacity.exceeded(state.entries.len(), state.bytes)
        {
            match state.entries.pop_lru() {
                Some((_, old)) => {
                    state.bytes = state.bytes.saturating_sub(old.len());
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(
                evicted,
                entries = state.entries.len(),
                bytes = state.bytes,
                "Evicted tiles"
            );
        }
    }

    async fn lookup(&self, key: &TileKey) -> Option<Arc<DecodedTile>> {
        self.lru.lock().await.entries.get(key).cloned()
    }
}

/// LRU cache for decoded tiles with single-flight loading.
///
/// Cloning is cheap; clones share the same entries.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use wsi_mosaic::format::{FocalPlane, OpticalPath};
/// use wsi_mosaic::tile::{CacheCapacity, DecodedTile, TileCache, TileKey};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = TileCache::new(CacheCapacity::Tiles(64));
///     let key = TileKey::new(0, OpticalPath::default(), FocalPlane::default(), 1, 2);
///
///     let tile = cache
///         .get_or_decode(key.clone(), || async {
///             Ok(Arc::new(DecodedTile::filled(4, 4, 1, 1, 0)))
///         })
///         .await
///         .unwrap();
///
///     assert_eq!(tile.len(), 16);
///     assert!(cache.contains(&key).await);
/// }
/// ```
#[derive(Clone)]
pub struct TileCache {
    inner: Arc<Inner>,
    capacity_warning: Option<SlideWarning>,
}

impl TileCache {
    /// Create a cache. Capacities below the minimum are clamped with a
    /// warning.
    pub fn new(capacity: CacheCapacity) -> Self {
        let (clamped, was_clamped) = capacity.clamped();
        let capacity_warning = was_clamped.then(|| {
            let warning = SlideWarning::new(
                WarningKind::CacheCapacityMisconfiguration,
                format!("cache capacity {capacity:?} is too small, using {clamped:?}"),
            );
            warn!(kind = warning.kind.name(), "{}", warning.message);
            warning
        });

        Self {
            inner: Arc::new(Inner {
                lru: Mutex::new(LruState {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                }),
                in_flight: Mutex::new(HashMap::new()),
                capacity: clamped,
                closed: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                decodes: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            capacity_warning,
        }
    }

    /// Get a cached tile or load it.
    ///
    /// `loader` is only invoked when this call starts the load. The load
    /// runs as a detached task, so dropping this future (for example on
    /// cancellation) does not abort it and its result still populates the
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns the loader's error, shared with every caller waiting on the
    /// same key, or `TileError::Aborted` if the load task died.
    pub async fn get_or_decode<F, Fut>(&self, key: TileKey, loader: F) -> TileResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TileResult> + Send + 'static,
    {
        if let Some(tile) = self.get(&key).await {
            return Ok(tile);
        }

        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().await;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);

            if let Some(rx) = in_flight.get(&key).cloned() {
                rx
            } else {
                // The previous load may have finished since the first lookup
                if let Some(tile) = self.inner.lookup(&key).await {
                    return Ok(tile);
                }

                let (tx, rx) = watch::channel(None);
                in_flight.insert(key.clone(), rx.clone());
                self.inner.decodes.fetch_add(1, Ordering::Relaxed);

                let load = tokio::spawn(loader());
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let result = match load.await {
                        Ok(result) => result,
                        Err(err) => Err(TileError::Aborted(err.to_string())),
                    };
                    match &result {
                        Ok(tile) => inner.put(key.clone(), Arc::clone(tile)).await,
                        Err(err) => warn!(
                            level = key.level,
                            column = key.column,
                            row = key.row,
                            error = %err,
                            "Tile load failed"
                        ),
                    }
                    inner.in_flight.lock().await.remove(&key);
                    tx.send_replace(Some(result));
                });
                rx
            }
        };

        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TileError::Aborted("tile load task ended without a result".to_string()))?
            .clone();
        result.unwrap_or_else(|| {
            Err(TileError::Aborted(
                "tile load produced no result".to_string(),
            ))
        })
    }

    /// Get a tile without loading it. Marks the entry as recently used.
    pub async fn get(&self, key: &TileKey) -> Option<Arc<DecodedTile>> {
        let tile = self.inner.lookup(key).await;
        if tile.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        }
        tile
    }

    /// Check if a tile is cached without updating LRU order.
    pub async fn contains(&self, key: &TileKey) -> bool {
        self.inner.lru.lock().await.entries.contains(key)
    }

    /// Store a tile, evicting least-recently-used entries over capacity.
    pub async fn put(&self, key: TileKey, tile: Arc<DecodedTile>) {
        self.inner.put(key, tile).await;
    }

    /// Drop every cached tile. Loads in flight still complete.
    pub async fn clear(&self) {
        let mut state = self.inner.lru.lock().await;
        state.entries.clear();
        state.bytes = 0;
    }

    /// Drop every cached tile and stop accepting new ones.
    ///
    /// Loads in flight still complete and reach their waiters, but their
    /// tiles are discarded.
    pub async fn close(&self) {
        let mut state = self.inner.lru.lock().await;
        self.inner.closed.store(true, Ordering::Release);
        state.entries.clear();
        state.bytes = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        self.inner.lru.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total decoded bytes held.
    pub async fn size(&self) -> usize {
        self.inner.lru.lock().await.bytes
    }

    /// Effective capacity after clamping.
    pub fn capacity(&self) -> CacheCapacity {
        self.inner.capacity
    }

    /// Warning recorded if the requested capacity was clamped.
    pub fn capacity_warning(&self) -> Option<&SlideWarning> {
        self.capacity_warning.as_ref()
    }

    pub async fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let state = self.inner.lru.lock().await;
            (state.entries.len(), state.bytes)
        };
        CacheStats {
            entries,
            bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            decodes: self.inner.decodes.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
