//! Per-inode cache of the file's extent map.
//!
//! An ordered map from file offset to extent key, kept non-overlapping under
//! concurrent appends, overwrites, reallocation and truncation. Readers plan
//! their requests under a shared lock; every mutation happens under the
//! write lock, so a planner never observes a half-applied insert.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::extent_key::ExtentKey;
use crate::meta::ExtentSnapshot;

/// One planned sub-request: a maximal byte range served by a single extent
/// key, or a hole.
#[derive(Debug, Clone)]
pub struct ExtentRequest {
    /// File-absolute offset of the range.
    pub file_offset: u64,
    /// Length of the range.
    pub size: usize,
    /// Key covering the range, or `None` for a hole.
    pub key: Option<ExtentKey>,
    /// The caller's bytes for this range (empty for read planning).
    pub data: Bytes,
}

#[derive(Debug)]
struct CacheInner {
    generation: u64,
    size: u64,
    refresh_time: Instant,
    initialized: bool,
    root: BTreeMap<u64, ExtentKey>,
}

/// The cache proper. Shared between a streamer (mutations) and concurrent
/// readers (planning).
#[derive(Debug)]
pub struct ExtentCache {
    inode: u64,
    inner: RwLock<CacheInner>,
}

impl ExtentCache {
    /// Empty, uninitialized cache for `inode`.
    pub fn new(inode: u64) -> Self {
        ExtentCache {
            inode,
            inner: RwLock::new(CacheInner {
                generation: 0,
                size: 0,
                refresh_time: Instant::now(),
                initialized: false,
                root: BTreeMap::new(),
            }),
        }
    }

    /// Inode this cache belongs to.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Whether the authoritative map has been loaded at least once.
    pub fn initialized(&self) -> bool {
        self.inner.read().initialized
    }

    /// Cached logical file size.
    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Number of keys currently cached.
    pub fn key_count(&self) -> usize {
        self.inner.read().root.len()
    }

    /// Whether the last refresh happened within `window`.
    pub fn refreshed_within(&self, window: Duration) -> bool {
        self.inner.read().refresh_time.elapsed() <= window
    }

    /// Grow the cached size without touching keys (sparse extension).
    pub fn extend_size(&self, size: u64) {
        let mut inner = self.inner.write();
        if size > inner.size {
            inner.size = size;
        }
    }

    /// Clamp the local view after a truncate acknowledged by the meta
    /// service: drop keys past `new_size` and clip the straddler.
    pub fn truncate(&self, new_size: u64) {
        let mut inner = self.inner.write();
        inner.root.retain(|&off, _| off < new_size);
        if let Some((_, key)) = inner.root.iter_mut().next_back() {
            if key.end() > new_size {
                key.size = (new_size - key.file_offset) as u32;
            }
        }
        inner.size = new_size;
    }

    /// Place `ek`, clipping or splitting whatever it shadows so the map
    /// stays non-overlapping. `sync` bumps the generation, marking the key
    /// as acknowledged by the meta service.
    pub fn insert(&self, ek: ExtentKey, sync: bool) {
        let mut inner = self.inner.write();
        insert_key(&mut inner.root, ek);
        if sync {
            inner.generation += 1;
        }
        if ek.end() > inner.size {
            inner.size = ek.end();
        }
    }

    /// The key whose range ends exactly at `offset`, if any. An append at
    /// `offset` may continue that key's extent.
    pub fn pre(&self, offset: u64) -> Option<ExtentKey> {
        let inner = self.inner.read();
        inner
            .root
            .range(..offset)
            .next_back()
            .map(|(_, k)| *k)
            .filter(|k| k.end() == offset)
    }

    /// Key covering `offset`, if any.
    pub fn lookup(&self, offset: u64) -> Option<ExtentKey> {
        let inner = self.inner.read();
        inner
            .root
            .range(..=offset)
            .next_back()
            .map(|(_, k)| *k)
            .filter(|k| offset < k.end())
    }

    /// Split `[offset, offset + size)` into per-key sub-requests and holes.
    /// Adjacent ranges served by the same key are not merged. Returns the
    /// requests and the cached file size.
    pub fn prepare_requests(
        &self,
        offset: u64,
        size: usize,
        data: Option<&Bytes>,
    ) -> (Vec<ExtentRequest>, u64) {
        let end = offset + size as u64;
        let inner = self.inner.read();
        let mut requests = Vec::new();
        let mut cursor = offset;

        let slice = |from: u64, len: usize| -> Bytes {
            match data {
                Some(d) => {
                    let start = (from - offset) as usize;
                    d.slice(start..start + len)
                }
                None => Bytes::new(),
            }
        };

        // Also consider the key that starts before `offset` but reaches into
        // the range.
        let first = inner
            .root
            .range(..offset)
            .next_back()
            .filter(|(_, k)| k.end() > offset)
            .map(|(off, _)| *off);
        let scan_from = first.unwrap_or(offset);

        for (_, key) in inner.root.range(scan_from..end) {
            if key.end() <= cursor {
                continue;
            }
            if key.file_offset > cursor {
                let hole_end = key.file_offset.min(end);
                let len = (hole_end - cursor) as usize;
                requests.push(ExtentRequest {
                    file_offset: cursor,
                    size: len,
                    key: None,
                    data: slice(cursor, len),
                });
                cursor = hole_end;
                if cursor >= end {
                    break;
                }
            }
            let covered_end = key.end().min(end);
            let len = (covered_end - cursor) as usize;
            requests.push(ExtentRequest {
                file_offset: cursor,
                size: len,
                key: Some(*key),
                data: slice(cursor, len),
            });
            cursor = covered_end;
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            let len = (end - cursor) as usize;
            requests.push(ExtentRequest {
                file_offset: cursor,
                size: len,
                key: None,
                data: slice(cursor, len),
            });
        }
        (requests, inner.size)
    }

    /// Replace the map with an authoritative snapshot.
    ///
    /// Stale snapshots (generation at or below ours) are discarded unless
    /// `force` is set. Temporary keys in the old map mark appends the meta
    /// service has not acknowledged yet; they are carried into the new map
    /// in both paths so concurrent readers never see them vanish.
    pub fn refresh(&self, snapshot: ExtentSnapshot, force: bool) -> bool {
        let mut inner = self.inner.write();
        inner.refresh_time = Instant::now();
        if !force && inner.initialized && snapshot.generation <= inner.generation {
            return false;
        }

        let carried: Vec<ExtentKey> = inner
            .root
            .values()
            .filter(|k| k.is_temporary())
            .copied()
            .collect();

        let mut root = BTreeMap::new();
        let mut size = snapshot.size;
        for key in snapshot.extents {
            size = size.max(key.end());
            root.insert(key.file_offset, key);
        }
        for key in carried {
            size = size.max(key.end());
            insert_key(&mut root, key);
        }

        inner.generation = snapshot.generation;
        inner.size = size.max(inner.size);
        inner.root = root;
        inner.initialized = true;
        true
    }

    /// Copy of the ordered key list, for flush bookkeeping and tests.
    pub fn keys(&self) -> Vec<ExtentKey> {
        self.inner.read().root.values().copied().collect()
    }
}

/// Insert preserving non-overlap: fully shadowed keys are removed, partial
/// overlaps are clipped, and a key straddling both ends of `ek` is split.
fn insert_key(root: &mut BTreeMap<u64, ExtentKey>, ek: ExtentKey) {
    let start = ek.file_offset;
    let end = ek.end();

    if let Some((&off, &prev)) = root.range(..start).next_back() {
        if prev.end() > start {
            let mut head = prev;
            head.size = (start - head.file_offset) as u32;
            root.insert(off, head);
            if prev.end() > end {
                let mut tail = prev;
                tail.extent_offset = prev.extent_offset_at(end);
                tail.file_offset = end;
                tail.size = (prev.end() - end) as u32;
                root.insert(end, tail);
            }
        }
    }

    let shadowed: Vec<u64> = root.range(start..end).map(|(&off, _)| off).collect();
    for off in shadowed {
        let old = root.remove(&off).unwrap_or(ek);
        if old.end() > end {
            let mut tail = old;
            tail.extent_offset = old.extent_offset_at(end);
            tail.file_offset = end;
            tail.size = (old.end() - end) as u32;
            root.insert(end, tail);
        }
    }

    root.insert(start, ek);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file_offset: u64, size: u32, extent_id: u64) -> ExtentKey {
        ExtentKey {
            file_offset,
            partition_id: 1,
            extent_id,
            extent_offset: 0,
            size,
            crc: 0,
        }
    }

    fn ranges(cache: &ExtentCache, offset: u64, size: usize) -> Vec<(u64, usize, bool)> {
        let (reqs, _) = cache.prepare_requests(offset, size, None);
        reqs.iter()
            .map(|r| (r.file_offset, r.size, r.key.is_some()))
            .collect()
    }

    #[test]
    fn planning_covers_range_exactly() {
        let cache = ExtentCache::new(1);
        cache.insert(key(0, 100, 10), false);
        cache.insert(key(200, 100, 11), false);

        let plan = ranges(&cache, 0, 400);
        assert_eq!(
            plan,
            vec![
                (0, 100, true),
                (100, 100, false),
                (200, 100, true),
                (300, 100, false),
            ]
        );

        // No overlap, no gap: the plan reassembles the requested range.
        let mut cursor = 0;
        for (off, len, _) in plan {
            assert_eq!(off, cursor);
            cursor = off + len as u64;
        }
        assert_eq!(cursor, 400);
    }

    #[test]
    fn planning_clips_to_partial_keys() {
        let cache = ExtentCache::new(1);
        cache.insert(key(50, 100, 10), false);
        assert_eq!(
            ranges(&cache, 80, 40),
            vec![(80, 40, true)],
            "range inside a key is one covered request"
        );
        assert_eq!(
            ranges(&cache, 0, 60),
            vec![(0, 50, false), (50, 10, true)]
        );
        assert_eq!(
            ranges(&cache, 140, 40),
            vec![(140, 10, true), (150, 30, false)]
        );
    }

    #[test]
    fn planning_slices_write_data() {
        let cache = ExtentCache::new(1);
        cache.insert(key(10, 10, 10), false);
        let data = Bytes::from(vec![7u8; 30]);
        let (reqs, _) = cache.prepare_requests(0, 30, Some(&data));
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].data.len(), 10);
        assert_eq!(reqs[1].data.len(), 10);
        assert_eq!(reqs[2].data.len(), 10);
    }

    #[test]
    fn insert_shadows_and_splits() {
        let cache = ExtentCache::new(1);
        cache.insert(key(0, 300, 10), false);
        // Replace the middle third.
        cache.insert(key(100, 100, 20), false);

        let keys = cache.keys();
        assert_eq!(keys.len(), 3);
        assert_eq!((keys[0].file_offset, keys[0].size, keys[0].extent_id), (0, 100, 10));
        assert_eq!((keys[1].file_offset, keys[1].size, keys[1].extent_id), (100, 100, 20));
        assert_eq!((keys[2].file_offset, keys[2].size, keys[2].extent_id), (200, 100, 10));
        // The tail's extent offset advances past the replaced range.
        assert_eq!(keys[2].extent_offset, 200);
    }

    #[test]
    fn insert_removes_fully_shadowed() {
        let cache = ExtentCache::new(1);
        cache.insert(key(100, 50, 10), false);
        cache.insert(key(0, 300, 20), false);
        let keys = cache.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].extent_id, 20);
    }

    #[test]
    fn size_tracks_largest_end() {
        let cache = ExtentCache::new(1);
        cache.insert(key(0, 100, 10), false);
        assert_eq!(cache.size(), 100);
        cache.insert(key(1000, 24, 11), false);
        assert_eq!(cache.size(), 1024);
        cache.extend_size(4096);
        assert_eq!(cache.size(), 4096);
        cache.extend_size(10);
        assert_eq!(cache.size(), 4096);
    }

    #[test]
    fn pre_finds_contiguous_predecessor() {
        let cache = ExtentCache::new(1);
        cache.insert(key(0, 100, 10), false);
        assert_eq!(cache.pre(100).map(|k| k.extent_id), Some(10));
        assert!(cache.pre(50).is_none());
        assert!(cache.pre(101).is_none());
    }

    #[test]
    fn stale_refresh_is_discarded() {
        let cache = ExtentCache::new(1);
        assert!(cache.refresh(
            ExtentSnapshot {
                generation: 5,
                size: 100,
                extents: vec![key(0, 100, 10)],
            },
            false,
        ));
        assert_eq!(cache.generation(), 5);

        let stale = ExtentSnapshot {
            generation: 5,
            size: 0,
            extents: vec![],
        };
        assert!(!cache.refresh(stale.clone(), false));
        assert_eq!(cache.key_count(), 1, "cache unchanged by stale refresh");

        assert!(cache.refresh(stale, true), "force overrides the guard");
        assert_eq!(cache.key_count(), 0);
    }

    #[test]
    fn refresh_carries_temporary_keys() {
        let cache = ExtentCache::new(1);
        cache.refresh(
            ExtentSnapshot {
                generation: 1,
                size: 0,
                extents: vec![],
            },
            false,
        );

        let mut temp = key(0, 64, 0);
        temp.partition_id = 0;
        cache.insert(temp, false);

        cache.refresh(
            ExtentSnapshot {
                generation: 2,
                size: 0,
                extents: vec![],
            },
            false,
        );
        assert_eq!(cache.key_count(), 1, "in-flight append survives refresh");

        // A forced refresh keeps it too.
        cache.refresh(
            ExtentSnapshot {
                generation: 2,
                size: 0,
                extents: vec![],
            },
            true,
        );
        assert_eq!(cache.key_count(), 1);
    }

    #[test]
    fn truncate_drops_and_clips() {
        let cache = ExtentCache::new(1);
        cache.insert(key(0, 100, 10), false);
        cache.insert(key(100, 100, 11), false);
        cache.insert(key(200, 100, 12), false);

        cache.truncate(150);
        let keys = cache.keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].size, 50);
        assert_eq!(cache.size(), 150);
    }
}
