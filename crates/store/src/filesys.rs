// SPDX-FileCopyrightText: © 2025 VoiceDeck Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cluster filesystem backing a stream collection.
//!
//! A collection image is a single file divided into fixed 8 KiB clusters.
//! Variable-length data is stored as chains: for every cluster, a
//! per-group successor table (the supercluster) records the next cluster
//! number, `1` for the last cluster of a chain, or `0` for a free cluster.
//! The sentinel `1` is unambiguous because cluster 1 holds the superblock
//! and can never appear inside a chain.
//!
//! On-disk layout: supercluster table *g* sits at byte offset
//! `g * (SUPERCLUSTER_SIZE + CLUSTER_SIZE)` and is followed by its group's
//! 2048 clusters. Table entries are big-endian u32.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use voicedeck_core::{Result, VoiceError};

/// Size of one cluster in bytes.
pub const CLUSTER_SIZE: u32 = 8192;
/// Clusters covered by one supercluster table.
pub const CLUSTERS_PER_SUPER: u32 = CLUSTER_SIZE / 4;
/// Bytes of cluster data covered by one supercluster table.
pub const SUPERCLUSTER_SIZE: u64 = CLUSTER_SIZE as u64 * CLUSTERS_PER_SUPER as u64;
/// Cluster holding filesystem metadata.
pub const SUPERBLOCK_CLUSTER: u32 = 1;
/// Cluster holding the stream-collection index.
pub const INDEX_CLUSTER: u32 = 2;

/// Successor-table sentinel for the last cluster of a chain.
const CHAIN_END: u32 = 1;

const SUPERBLOCK_MAGIC: [u8; 8] = *b"vdfs\x00\x00\x00\x01";

/// A logical read/write position inside a cluster chain.
///
/// `offset == CLUSTER_SIZE` means the cursor sits past the end of the
/// chain's last cluster; the next operation follows the link first (and a
/// write extends the chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCursor {
    pub cluster: u32,
    pub offset: u32,
}

impl ChainCursor {
    pub const fn new(cluster: u32) -> Self {
        Self { cluster, offset: 0 }
    }

    /// Absolute byte position, used by packet descriptors as a stable
    /// back-reference.
    pub const fn byte_offset(self) -> u64 {
        self.cluster as u64 * CLUSTER_SIZE as u64 + self.offset as u64
    }
}

struct Supercluster {
    free_clusters: u32,
    clusters: Vec<u32>,
}

impl Supercluster {
    fn empty() -> Self {
        Self { free_clusters: CLUSTERS_PER_SUPER, clusters: vec![0; CLUSTERS_PER_SUPER as usize] }
    }

    fn load(backing: &mut File, index: u32) -> Result<Self> {
        let mut raw = vec![0u8; CLUSTER_SIZE as usize];
        backing.seek(SeekFrom::Start(table_offset(index)))?;
        backing.read_exact(&mut raw).map_err(|_| {
            VoiceError::Storage(format!("truncated supercluster table {index}"))
        })?;
        let clusters: Vec<u32> =
            raw.chunks_exact(4).map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]])).collect();
        #[allow(clippy::cast_possible_truncation)]
        let free_clusters = clusters.iter().filter(|&&c| c == 0).count() as u32;
        Ok(Self { free_clusters, clusters })
    }

    fn save(&self, backing: &mut File, index: u32) -> Result<()> {
        let mut raw = Vec::with_capacity(CLUSTER_SIZE as usize);
        for &c in &self.clusters {
            raw.extend_from_slice(&c.to_be_bytes());
        }
        backing.seek(SeekFrom::Start(table_offset(index)))?;
        backing.write_all(&raw)?;
        Ok(())
    }
}

const fn table_offset(index: u32) -> u64 {
    index as u64 * (SUPERCLUSTER_SIZE + CLUSTER_SIZE as u64)
}

const fn cluster_offset(cluster: u32) -> u64 {
    let group = cluster / CLUSTERS_PER_SUPER;
    let slot = cluster % CLUSTERS_PER_SUPER;
    table_offset(group) + CLUSTER_SIZE as u64 * (1 + slot as u64)
}

/// A cluster filesystem over one backing file.
pub struct ClusterFs {
    backing: File,
    supercluster_count: u32,
    superclusters: BTreeMap<u32, Supercluster>,
}

impl ClusterFs {
    /// Create a new or open an existing filesystem backed by `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a bad superblock magic, or a truncated
    /// supercluster table.
    pub fn open(path: &Path) -> Result<Self> {
        let mut backing =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let file_len = backing.metadata()?.len();
        if file_len == 0 {
            let mut table = Supercluster::empty();
            for reserved in [0, SUPERBLOCK_CLUSTER, INDEX_CLUSTER] {
                table.clusters[reserved as usize] = CHAIN_END;
                table.free_clusters -= 1;
            }
            table.save(&mut backing, 0)?;
            let mut superblock = vec![0u8; CLUSTER_SIZE as usize];
            superblock[..SUPERBLOCK_MAGIC.len()].copy_from_slice(&SUPERBLOCK_MAGIC);
            for reserved in [0, SUPERBLOCK_CLUSTER, INDEX_CLUSTER] {
                backing.seek(SeekFrom::Start(cluster_offset(reserved)))?;
                if reserved == SUPERBLOCK_CLUSTER {
                    backing.write_all(&superblock)?;
                } else {
                    backing.write_all(&vec![0u8; CLUSTER_SIZE as usize])?;
                }
            }
            let mut superclusters = BTreeMap::new();
            superclusters.insert(0, table);
            return Ok(Self { backing, supercluster_count: 1, superclusters });
        }

        let mut magic = [0u8; 8];
        backing.seek(SeekFrom::Start(cluster_offset(SUPERBLOCK_CLUSTER)))?;
        backing
            .read_exact(&mut magic)
            .map_err(|_| VoiceError::Storage("truncated superblock".to_string()))?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(VoiceError::Storage("bad superblock magic".to_string()));
        }
        let group_span = SUPERCLUSTER_SIZE + CLUSTER_SIZE as u64;
        #[allow(clippy::cast_possible_truncation)]
        let supercluster_count = file_len.div_ceil(group_span) as u32;
        let mut superclusters = BTreeMap::new();
        for index in 0..supercluster_count {
            superclusters.insert(index, Supercluster::load(&mut backing, index)?);
        }
        Ok(Self { backing, supercluster_count, superclusters })
    }

    fn entry(&self, cluster: u32) -> Result<u32> {
        let group = cluster / CLUSTERS_PER_SUPER;
        self.superclusters
            .get(&group)
            .map(|sc| sc.clusters[(cluster % CLUSTERS_PER_SUPER) as usize])
            .ok_or_else(|| VoiceError::Storage(format!("cluster {cluster} out of range")))
    }

    fn set_entry(&mut self, cluster: u32, value: u32) -> Result<()> {
        let group = cluster / CLUSTERS_PER_SUPER;
        let table = self
            .superclusters
            .get_mut(&group)
            .ok_or_else(|| VoiceError::Storage(format!("cluster {cluster} out of range")))?;
        let slot = (cluster % CLUSTERS_PER_SUPER) as usize;
        let old = table.clusters[slot];
        table.clusters[slot] = value;
        if old == 0 && value != 0 {
            table.free_clusters -= 1;
        } else if old != 0 && value == 0 {
            table.free_clusters += 1;
        }
        let table = &self.superclusters[&group];
        table.save(&mut self.backing, group)
    }

    /// Successor of `cluster`, or `None` at the end of its chain.
    fn successor(&self, cluster: u32) -> Result<Option<u32>> {
        match self.entry(cluster)? {
            CHAIN_END => Ok(None),
            0 => Err(VoiceError::Storage(format!("chain runs into free cluster after {cluster}"))),
            next => Ok(Some(next)),
        }
    }

    /// Allocate a fresh cluster: first free slot in table order, contents
    /// zeroed, successor entry set to end-of-chain.
    ///
    /// # Errors
    ///
    /// Fails only on I/O errors; a full group simply grows the file by one
    /// more supercluster.
    pub fn allocate_cluster(&mut self) -> Result<u32> {
        let mut group = 0u32;
        loop {
            if group == self.supercluster_count {
                let table = Supercluster::empty();
                table.save(&mut self.backing, group)?;
                self.superclusters.insert(group, table);
                self.supercluster_count += 1;
            }
            let table = &self.superclusters[&group];
            if table.free_clusters == 0 {
                group += 1;
                continue;
            }
            let slot = table
                .clusters
                .iter()
                .position(|&c| c == 0)
                .ok_or_else(|| VoiceError::Storage("free count out of sync".to_string()))?;
            #[allow(clippy::cast_possible_truncation)]
            let cluster = group * CLUSTERS_PER_SUPER + slot as u32;
            self.set_entry(cluster, CHAIN_END)?;
            self.backing.seek(SeekFrom::Start(cluster_offset(cluster)))?;
            self.backing.write_all(&vec![0u8; CLUSTER_SIZE as usize])?;
            return Ok(cluster);
        }
    }

    /// Release every cluster reachable from `head`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the chain runs into a free cluster.
    pub fn free_cluster_chain(&mut self, head: u32) -> Result<()> {
        let mut cluster = head;
        loop {
            let next = self.entry(cluster)?;
            if next == 0 {
                return Err(VoiceError::Storage(format!(
                    "freeing already-free cluster {cluster}"
                )));
            }
            self.set_entry(cluster, 0)?;
            if next == CHAIN_END {
                return Ok(());
            }
            cluster = next;
        }
    }

    /// When the cursor sits at a cluster boundary, move it onto the
    /// successor if one exists. At end of chain the offset stays at
    /// `CLUSTER_SIZE`.
    fn normalize(&self, cur: &mut ChainCursor) -> Result<bool> {
        if cur.offset < CLUSTER_SIZE {
            return Ok(true);
        }
        match self.successor(cur.cluster)? {
            Some(next) => {
                cur.cluster = next;
                cur.offset = 0;
                Ok(true)
            },
            None => {
                cur.offset = CLUSTER_SIZE;
                Ok(false)
            },
        }
    }

    /// Advance the cursor up to `length` bytes, following chain links.
    /// Returns the number of bytes actually skipped; at end of chain the
    /// cursor is left with `offset == CLUSTER_SIZE`.
    ///
    /// # Errors
    ///
    /// Fails on chain corruption.
    pub fn skip_data(&mut self, cur: &mut ChainCursor, length: u32) -> Result<u32> {
        let mut remaining = length;
        while remaining > 0 {
            if !self.normalize(cur)? {
                return Ok(length - remaining);
            }
            let take = (CLUSTER_SIZE - cur.offset).min(remaining);
            cur.offset += take;
            remaining -= take;
            self.normalize(cur)?;
        }
        Ok(length)
    }

    /// Like [`Self::skip_data`] but copies the bytes into `data`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or chain corruption.
    pub fn read_data(&mut self, cur: &mut ChainCursor, data: &mut [u8]) -> Result<usize> {
        let mut filled = 0usize;
        while filled < data.len() {
            if !self.normalize(cur)? {
                return Ok(filled);
            }
            let take = ((CLUSTER_SIZE - cur.offset) as usize).min(data.len() - filled);
            self.backing
                .seek(SeekFrom::Start(cluster_offset(cur.cluster) + u64::from(cur.offset)))?;
            self.backing.read_exact(&mut data[filled..filled + take]).map_err(|_| {
                VoiceError::Storage(format!("short read in cluster {}", cur.cluster))
            })?;
            #[allow(clippy::cast_possible_truncation)]
            {
                cur.offset += take as u32;
            }
            filled += take;
            self.normalize(cur)?;
        }
        Ok(filled)
    }

    /// Write `data` at the cursor, extending the chain one cluster at a
    /// time as needed (the new cluster is linked before it is written).
    /// Returns the location of the first byte written, so callers can
    /// record back-references. A write that exactly fills the last cluster
    /// leaves `offset == CLUSTER_SIZE` without allocating.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or chain corruption.
    pub fn write_data(&mut self, cur: &mut ChainCursor, data: &[u8]) -> Result<ChainCursor> {
        let mut first: Option<ChainCursor> = None;
        let mut written = 0usize;
        while written < data.len() {
            if cur.offset >= CLUSTER_SIZE && !self.normalize(cur)? {
                let fresh = self.allocate_cluster()?;
                self.set_entry(cur.cluster, fresh)?;
                cur.cluster = fresh;
                cur.offset = 0;
            }
            let take = ((CLUSTER_SIZE - cur.offset) as usize).min(data.len() - written);
            self.backing
                .seek(SeekFrom::Start(cluster_offset(cur.cluster) + u64::from(cur.offset)))?;
            self.backing.write_all(&data[written..written + take])?;
            if first.is_none() {
                first = Some(*cur);
            }
            #[allow(clippy::cast_possible_truncation)]
            {
                cur.offset += take as u32;
            }
            written += take;
            if cur.offset == CLUSTER_SIZE {
                self.normalize(cur)?;
            }
        }
        Ok(first.unwrap_or(*cur))
    }
}

impl std::fmt::Debug for ClusterFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterFs")
            .field("supercluster_count", &self.supercluster_count)
            .finish_non_exhaustive()
    }
}

/// Shared, thread-safe handle to a cluster filesystem. Clones share one
/// mutex-guarded filesystem, so every operation is serialised.
#[derive(Debug, Clone)]
pub struct FsHandle(Arc<Mutex<ClusterFs>>);

impl FsHandle {
    /// # Errors
    ///
    /// See [`ClusterFs::open`].
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(ClusterFs::open(path)?))))
    }

    fn with<T>(&self, f: impl FnOnce(&mut ClusterFs) -> Result<T>) -> Result<T> {
        // Mutex poisoning is a fatal error - standard pattern in Rust
        #[allow(clippy::unwrap_used)]
        f(&mut self.0.lock().unwrap())
    }

    /// # Errors
    ///
    /// See [`ClusterFs::allocate_cluster`].
    pub fn allocate_cluster(&self) -> Result<u32> {
        self.with(ClusterFs::allocate_cluster)
    }

    /// # Errors
    ///
    /// See [`ClusterFs::free_cluster_chain`].
    pub fn free_cluster_chain(&self, head: u32) -> Result<()> {
        self.with(|fs| fs.free_cluster_chain(head))
    }

    /// # Errors
    ///
    /// See [`ClusterFs::skip_data`].
    pub fn skip_data(&self, cur: &mut ChainCursor, length: u32) -> Result<u32> {
        self.with(|fs| fs.skip_data(cur, length))
    }

    /// # Errors
    ///
    /// See [`ClusterFs::read_data`].
    pub fn read_data(&self, cur: &mut ChainCursor, data: &mut [u8]) -> Result<usize> {
        self.with(|fs| fs.read_data(cur, data))
    }

    /// # Errors
    ///
    /// See [`ClusterFs::write_data`].
    pub fn write_data(&self, cur: &mut ChainCursor, data: &[u8]) -> Result<ChainCursor> {
        self.with(|fs| fs.write_data(cur, data))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fresh_fs() -> (tempfile::TempDir, FsHandle) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsHandle::open(&dir.path().join("collection.vdfs")).unwrap();
        (dir, fs)
    }

    #[test]
    fn test_first_allocation_in_empty_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.vdfs");
        let fs = FsHandle::open(&path).unwrap();
        let cluster = fs.allocate_cluster().unwrap();
        assert_eq!(cluster, 3, "clusters 0-2 are reserved");
        // One supercluster table plus clusters 0..=3.
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, u64::from(CLUSTER_SIZE) * 5);
    }

    #[test]
    fn test_allocations_are_sequential_and_reusable() {
        let (_dir, fs) = fresh_fs();
        let a = fs.allocate_cluster().unwrap();
        let b = fs.allocate_cluster().unwrap();
        assert_eq!((a, b), (3, 4));
        fs.free_cluster_chain(a).unwrap();
        let c = fs.allocate_cluster().unwrap();
        assert_eq!(c, a, "freed cluster is reused first");
    }

    #[test]
    fn test_write_then_read_within_one_cluster() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        let loc = fs.write_data(&mut cur, b"hello cluster").unwrap();
        assert_eq!(loc, ChainCursor::new(head));

        let mut rd = ChainCursor::new(head);
        let mut buf = [0u8; 13];
        let n = fs.read_data(&mut rd, &mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"hello cluster");
    }

    #[test]
    fn test_write_extends_chain_across_clusters() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        let data: Vec<u8> = (0..CLUSTER_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        fs.write_data(&mut cur, &data).unwrap();
        assert_eq!(cur.offset, 100);
        assert_ne!(cur.cluster, head);

        let mut rd = ChainCursor::new(head);
        let mut buf = vec![0u8; data.len()];
        assert_eq!(fs.read_data(&mut rd, &mut buf).unwrap(), data.len());
        assert_eq!(buf, data);

        // Reading past the end stops at the chain's last cluster: the
        // third cluster still has its zero tail addressable.
        let mut extra = vec![0u8; CLUSTER_SIZE as usize];
        let short = fs.read_data(&mut rd, &mut extra).unwrap();
        assert_eq!(short, (CLUSTER_SIZE - 100) as usize);
        assert_eq!(rd.offset, CLUSTER_SIZE);
    }

    #[test]
    fn test_exact_fill_leaves_cursor_at_cluster_end() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        fs.write_data(&mut cur, &vec![7u8; CLUSTER_SIZE as usize]).unwrap();
        assert_eq!(cur.cluster, head);
        assert_eq!(cur.offset, CLUSTER_SIZE);

        // The next write follows up with a fresh cluster.
        fs.write_data(&mut cur, b"more").unwrap();
        assert_ne!(cur.cluster, head);
        assert_eq!(cur.offset, 4);
    }

    #[test]
    fn test_skip_follows_links_and_reports_shortfall() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        fs.write_data(&mut cur, &vec![0u8; CLUSTER_SIZE as usize + 10]).unwrap();

        let mut sk = ChainCursor::new(head);
        assert_eq!(fs.skip_data(&mut sk, CLUSTER_SIZE + 4).unwrap(), CLUSTER_SIZE + 4);
        assert_eq!(sk.offset, 4);

        // Chain holds two full clusters of addressable bytes.
        let mut sk = ChainCursor::new(head);
        let skipped = fs.skip_data(&mut sk, CLUSTER_SIZE * 3).unwrap();
        assert_eq!(skipped, CLUSTER_SIZE * 2);
        assert_eq!(sk.offset, CLUSTER_SIZE);
    }

    #[test]
    fn test_cursor_past_end_follows_new_link_first() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        fs.write_data(&mut cur, &vec![1u8; CLUSTER_SIZE as usize]).unwrap();
        // Cursor parked at the boundary; another writer extends the chain.
        assert_eq!(cur.offset, CLUSTER_SIZE);
        let mut other = ChainCursor { cluster: head, offset: CLUSTER_SIZE };
        fs.write_data(&mut other, b"ext").unwrap();
        // The parked cursor now reads through the link.
        let mut buf = [0u8; 3];
        assert_eq!(fs.read_data(&mut cur, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"ext");
    }

    #[test]
    fn test_free_chain_releases_every_cluster() {
        let (_dir, fs) = fresh_fs();
        let head = fs.allocate_cluster().unwrap();
        let mut cur = ChainCursor::new(head);
        fs.write_data(&mut cur, &vec![0u8; (CLUSTER_SIZE * 3) as usize]).unwrap();
        fs.free_cluster_chain(head).unwrap();
        // All three clusters come back in order.
        assert_eq!(fs.allocate_cluster().unwrap(), 3);
        assert_eq!(fs.allocate_cluster().unwrap(), 4);
        assert_eq!(fs.allocate_cluster().unwrap(), 5);
    }

    #[test]
    fn test_reopen_preserves_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.vdfs");
        {
            let fs = FsHandle::open(&path).unwrap();
            let head = fs.allocate_cluster().unwrap();
            let mut cur = ChainCursor::new(head);
            fs.write_data(&mut cur, b"persistent").unwrap();
        }
        let fs = FsHandle::open(&path).unwrap();
        let mut cur = ChainCursor::new(3);
        let mut buf = [0u8; 10];
        assert_eq!(fs.read_data(&mut cur, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"persistent");
        // Cluster 3 is still taken.
        assert_eq!(fs.allocate_cluster().unwrap(), 4);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.vdfs");
        std::fs::write(&path, vec![0xAAu8; (CLUSTER_SIZE * 4) as usize]).unwrap();
        assert!(FsHandle::open(&path).is_err());
    }

    #[test]
    fn test_index_cluster_chain_is_extendable() {
        let (_dir, fs) = fresh_fs();
        // Cluster 2 is pre-allocated as a one-cluster chain; writing past
        // its end extends it like any other chain.
        let mut cur = ChainCursor::new(INDEX_CLUSTER);
        fs.write_data(&mut cur, &vec![9u8; CLUSTER_SIZE as usize + 16]).unwrap();
        let mut rd = ChainCursor::new(INDEX_CLUSTER);
        assert_eq!(fs.skip_data(&mut rd, CLUSTER_SIZE * 4).unwrap(), CLUSTER_SIZE * 2);
    }
}
