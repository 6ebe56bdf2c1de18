//! Client-side write buffering.
//!
//! Two structures back the buffered-write mode. [`PendingPackets`] holds
//! append data that has not been handed to a handler yet, as a range map
//! over kernel offsets whose entries never cross a block boundary.
//! [`OverwriteBuffer`] queues in-place overwrites bound for already-durable
//! extents; entries targeting the same extent merge when their ranges touch.
//!
//! Invariants for [`PendingPackets`]: entries are disjoint, each at most one
//! block long and contained in a single block-aligned bucket, and their
//! union is exactly the byte region buffered and not yet sent. Getting the
//! merge rules wrong here corrupts user data, hence the test battery below.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::extent_key::ExtentKey;
use crate::proto::BLOCK_SIZE;

fn bucket_of(offset: u64) -> u64 {
    offset / BLOCK_SIZE as u64
}

/// Range map of buffered append bytes, keyed by kernel offset.
#[derive(Debug, Default)]
pub struct PendingPackets {
    entries: BTreeMap<u64, Vec<u8>>,
}

impl PendingPackets {
    /// Empty buffer.
    pub fn new() -> Self {
        PendingPackets::default()
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total buffered bytes.
    pub fn buffered_bytes(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Buffer `data` at `offset`, splitting at block boundaries and merging
    /// with any entry it overlaps or touches inside the same bucket.
    pub fn insert(&mut self, offset: u64, data: &[u8]) {
        let mut cursor = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let bucket_end = (bucket_of(cursor) + 1) * BLOCK_SIZE as u64;
            let take = remaining.len().min((bucket_end - cursor) as usize);
            let (chunk, rest) = remaining.split_at(take);
            self.insert_within_bucket(cursor, chunk);
            cursor += take as u64;
            remaining = rest;
        }
    }

    fn insert_within_bucket(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        let bucket = bucket_of(offset);

        // Collect every entry in this bucket whose range overlaps or is
        // adjacent to the incoming chunk.
        let mut merged_start = offset;
        let mut merged_end = end;
        let mut absorb: Vec<u64> = Vec::new();
        let bucket_start = bucket * BLOCK_SIZE as u64;
        for (&start, buf) in self.entries.range(bucket_start..bucket_start + BLOCK_SIZE as u64) {
            let entry_end = start + buf.len() as u64;
            if entry_end < offset || start > end {
                continue;
            }
            merged_start = merged_start.min(start);
            merged_end = merged_end.max(entry_end);
            absorb.push(start);
        }

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for start in absorb {
            if let Some(buf) = self.entries.remove(&start) {
                let at = (start - merged_start) as usize;
                merged[at..at + buf.len()].copy_from_slice(&buf);
            }
        }
        // Incoming bytes win over previously buffered ones.
        let at = (offset - merged_start) as usize;
        merged[at..at + data.len()].copy_from_slice(data);
        self.entries.insert(merged_start, merged);
    }

    /// Overlay `data` onto already-buffered bytes if `[offset, offset+len)`
    /// is fully covered. Returns false (buffer untouched) otherwise.
    pub fn try_overwrite(&mut self, offset: u64, data: &[u8]) -> bool {
        if !self.is_covered(offset, data.len()) {
            return false;
        }
        let end = offset + data.len() as u64;
        for (&start, buf) in self.entries.range_mut(..end) {
            let entry_end = start + buf.len() as u64;
            if entry_end <= offset {
                continue;
            }
            let from = offset.max(start);
            let to = end.min(entry_end);
            let src = &data[(from - offset) as usize..(to - offset) as usize];
            buf[(from - start) as usize..(to - start) as usize].copy_from_slice(src);
        }
        true
    }

    /// Whether `[offset, offset + len)` is entirely buffered.
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        self.is_covered(offset, len)
    }

    fn is_covered(&self, offset: u64, len: usize) -> bool {
        let end = offset + len as u64;
        let mut cursor = offset;
        for (&start, buf) in self.entries.range(..end) {
            let entry_end = start + buf.len() as u64;
            if entry_end <= cursor {
                continue;
            }
            if start > cursor {
                return false;
            }
            cursor = cursor.max(entry_end);
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }

    /// Take everything, in kernel-offset order.
    pub fn drain(&mut self) -> Vec<(u64, Bytes)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(off, buf)| (off, Bytes::from(buf)))
            .collect()
    }
}

/// One buffered in-place overwrite bound for a durable extent.
#[derive(Debug, Clone)]
pub struct OverwriteEntry {
    /// The extent key the overwrite targets.
    pub key: ExtentKey,
    /// File-absolute offset of the overwrite.
    pub file_offset: u64,
    /// Replacement bytes.
    pub data: Vec<u8>,
}

impl OverwriteEntry {
    fn end(&self) -> u64 {
        self.file_offset + self.data.len() as u64
    }
}

/// Queue of buffered overwrites, merged per target extent.
#[derive(Debug, Default)]
pub struct OverwriteBuffer {
    entries: Vec<OverwriteEntry>,
}

impl OverwriteBuffer {
    /// Empty queue.
    pub fn new() -> Self {
        OverwriteBuffer::default()
    }

    /// Number of queued entries after merging.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an overwrite of `[file_offset, file_offset + data.len())`.
    /// An entry for the same extent whose range overlaps or touches the new
    /// one absorbs it: the new bytes overlay the old, extending the entry
    /// at either end as needed.
    pub fn push(&mut self, key: ExtentKey, file_offset: u64, data: &[u8]) {
        let end = file_offset + data.len() as u64;
        for entry in &mut self.entries {
            if entry.key.partition_id != key.partition_id || entry.key.extent_id != key.extent_id {
                continue;
            }
            if end < entry.file_offset || file_offset > entry.end() {
                continue;
            }
            let merged_start = entry.file_offset.min(file_offset);
            let merged_end = entry.end().max(end);
            let mut merged = vec![0u8; (merged_end - merged_start) as usize];
            let at = (entry.file_offset - merged_start) as usize;
            merged[at..at + entry.data.len()].copy_from_slice(&entry.data);
            let at = (file_offset - merged_start) as usize;
            merged[at..at + data.len()].copy_from_slice(data);
            entry.file_offset = merged_start;
            entry.data = merged;
            return;
        }
        self.entries.push(OverwriteEntry {
            key,
            file_offset,
            data: data.to_vec(),
        });
    }

    /// Take every queued entry, oldest first.
    pub fn drain(&mut self) -> Vec<OverwriteEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Partition ids the queued entries target; the wrapper sweeps these
    /// against the master view to catch removed partitions.
    pub fn partitions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.iter().map(|e| e.key.partition_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Pull out every entry targeting `partition_id` so the caller can
    /// re-route them.
    pub fn remove_partition(&mut self, partition_id: u64) -> Vec<OverwriteEntry> {
        let (gone, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.key.partition_id == partition_id);
        self.entries = keep;
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = BLOCK_SIZE as u64;

    fn contents(p: &mut PendingPackets) -> Vec<(u64, Vec<u8>)> {
        p.drain()
            .into_iter()
            .map(|(off, b)| (off, b.to_vec()))
            .collect()
    }

    #[test]
    fn sequential_writes_coalesce() {
        let mut p = PendingPackets::new();
        p.insert(0, &[1; 32]);
        p.insert(32, &[2; 32]);
        assert_eq!(p.len(), 1);
        let got = contents(&mut p);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[0].1.len(), 64);
        assert_eq!(&got[0].1[..32], &[1; 32]);
        assert_eq!(&got[0].1[32..], &[2; 32]);
    }

    #[test]
    fn front_insert_extends_entry_backwards() {
        let mut p = PendingPackets::new();
        p.insert(64, &[1; 32]);
        p.insert(0, &[2; 64]);
        assert_eq!(p.len(), 1);
        let got = contents(&mut p);
        assert_eq!(got[0], (0, {
            let mut v = vec![2u8; 64];
            v.extend_from_slice(&[1; 32]);
            v
        }));
    }

    #[test]
    fn overlap_overlays_newest_bytes() {
        let mut p = PendingPackets::new();
        p.insert(0, &[1; 64]);
        p.insert(32, &[2; 64]);
        let got = contents(&mut p);
        assert_eq!(got[0].1.len(), 96);
        assert_eq!(&got[0].1[..32], &[1; 32]);
        assert_eq!(&got[0].1[32..], &[2; 64]);
    }

    #[test]
    fn disjoint_writes_stay_separate() {
        let mut p = PendingPackets::new();
        p.insert(0, &[1; 16]);
        p.insert(1024, &[2; 16]);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn writes_never_cross_block_boundary() {
        let mut p = PendingPackets::new();
        p.insert(BS - 16, &[3; 48]);
        assert_eq!(p.len(), 2);
        let got = contents(&mut p);
        assert_eq!(got[0], (BS - 16, vec![3; 16]));
        assert_eq!(got[1], (BS, vec![3; 32]));
    }

    #[test]
    fn entries_in_different_buckets_do_not_merge() {
        let mut p = PendingPackets::new();
        p.insert(BS - 8, &[1; 8]);
        p.insert(BS, &[2; 8]);
        // Touching at the boundary, but in different buckets.
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn try_overwrite_requires_full_coverage() {
        let mut p = PendingPackets::new();
        p.insert(0, &[1; 64]);
        assert!(p.try_overwrite(16, &[9; 16]));
        assert!(!p.try_overwrite(48, &[9; 32]), "tail not buffered");
        let got = contents(&mut p);
        assert_eq!(&got[0].1[..16], &[1; 16]);
        assert_eq!(&got[0].1[16..32], &[9; 16]);
        assert_eq!(&got[0].1[32..], &[1; 32]);
    }

    #[test]
    fn try_overwrite_spans_coalesced_entries() {
        let mut p = PendingPackets::new();
        p.insert(0, &[1; 16]);
        p.insert(64, &[1; 16]);
        // Hole between the entries: not covered.
        assert!(!p.try_overwrite(8, &[9; 64]));
        assert_eq!(p.buffered_bytes(), 32, "failed overwrite changes nothing");
    }

    #[test]
    fn drain_is_ordered_and_empties() {
        let mut p = PendingPackets::new();
        p.insert(1024, &[2; 8]);
        p.insert(0, &[1; 8]);
        let got = p.drain();
        assert_eq!(got[0].0, 0);
        assert_eq!(got[1].0, 1024);
        assert!(p.is_empty());
    }

    fn ek(partition_id: u64, extent_id: u64) -> ExtentKey {
        ExtentKey {
            file_offset: 0,
            partition_id,
            extent_id,
            extent_offset: 0,
            size: 4096,
            crc: 0,
        }
    }

    #[test]
    fn overwrites_merge_per_extent() {
        let mut q = OverwriteBuffer::new();
        q.push(ek(1, 10), 0, &[1; 32]);
        q.push(ek(1, 10), 32, &[2; 32]);
        q.push(ek(2, 20), 0, &[3; 32]);
        assert_eq!(q.len(), 2);

        let drained = q.drain();
        assert_eq!(drained[0].data.len(), 64);
        assert_eq!(&drained[0].data[32..], &[2; 32]);
        assert_eq!(drained[1].key.partition_id, 2);
    }

    #[test]
    fn overwrite_front_extension() {
        let mut q = OverwriteBuffer::new();
        q.push(ek(1, 10), 64, &[1; 32]);
        q.push(ek(1, 10), 32, &[2; 32]);
        assert_eq!(q.len(), 1);
        let e = &q.drain()[0];
        assert_eq!(e.file_offset, 32);
        assert_eq!(e.data.len(), 64);
    }

    #[test]
    fn overwrite_overlay_wins() {
        let mut q = OverwriteBuffer::new();
        q.push(ek(1, 10), 0, &[1; 64]);
        q.push(ek(1, 10), 16, &[2; 16]);
        let e = &q.drain()[0];
        assert_eq!(&e.data[..16], &[1; 16]);
        assert_eq!(&e.data[16..32], &[2; 16]);
        assert_eq!(&e.data[32..], &[1; 32]);
    }

    #[test]
    fn partition_sweep() {
        let mut q = OverwriteBuffer::new();
        q.push(ek(1, 10), 0, &[1; 8]);
        q.push(ek(2, 20), 0, &[2; 8]);
        q.push(ek(2, 21), 100, &[3; 8]);
        assert_eq!(q.partitions(), vec![1, 2]);

        let gone = q.remove_partition(2);
        assert_eq!(gone.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.partitions(), vec![1]);
    }
}
