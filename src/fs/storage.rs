//! This module implements the block store
//! backing every file. It owns a single
//! contiguous data region split into
//! fixed-size blocks and the bitmap
//! tracking which of them are in use.

use super::{FSError, Result};
use tracing::{trace, warn};

#[derive(Debug, Clone)]
pub struct BlockStore {
    block_size: usize,
    block_count: usize,
    blocks_free: usize,
    /// One flag per block, `true` means used.
    bitmap: Vec<bool>,
    data: Vec<u8>,
}

impl BlockStore {
    pub const MIN_BLOCK_SIZE: usize = 512;
    pub const MAX_BLOCK_SIZE: usize = 65536;

    /// Returns the size of the data region for the given geometry.
    pub fn check_geometry(block_size: usize, block_count: usize) -> Result<usize> {
        if !(Self::MIN_BLOCK_SIZE..=Self::MAX_BLOCK_SIZE).contains(&block_size)
            || block_size % Self::MIN_BLOCK_SIZE != 0
        {
            return Err(FSError::InvalidBlockSize(block_size));
        }
        if block_count == 0 {
            return Err(FSError::InvalidBlockCount(block_count));
        }
        block_size
            .checked_mul(block_count)
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or(FSError::InvalidBlockCount(block_count))
    }

    /// Creates an empty store of `block_count` zeroed blocks.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        let region = Self::check_geometry(block_size, block_count)?;
        Ok(Self {
            block_size,
            block_count,
            blocks_free: block_count,
            bitmap: vec![false; block_count],
            data: vec![0; region],
        })
    }

    /// Rebuilds a store from a bitmap and the full data region,
    /// as read back from a snapshot.
    pub(crate) fn from_parts(block_size: usize, bitmap: Vec<bool>, data: Vec<u8>) -> Result<Self> {
        let block_count = bitmap.len();
        let region = Self::check_geometry(block_size, block_count)?;
        if data.len() != region {
            return Err(FSError::Corrupted(format!(
                "data region is {} bytes, expected {region}",
                data.len(),
            )));
        }
        Ok(Self {
            block_size,
            block_count,
            blocks_free: bitmap.iter().filter(|used| !**used).count(),
            bitmap,
            data,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Total bytes addressable by the store.
    pub fn capacity(&self) -> u64 {
        (self.block_size * self.block_count) as u64
    }

    pub fn free_count(&self) -> usize {
        self.blocks_free
    }

    pub fn used_count(&self) -> usize {
        self.block_count - self.blocks_free
    }

    pub fn bitmap(&self) -> &[bool] {
        &self.bitmap
    }

    pub fn is_allocated(&self, block: usize) -> bool {
        self.bitmap.get(block).copied().unwrap_or(false)
    }

    /// Marks the first free block as used and returns its index.
    pub fn allocate_block(&mut self) -> Result<usize> {
        let Some(block) = self.bitmap.iter().position(|used| !used) else {
            return Err(FSError::OutOfSpace {
                required: 1,
                free: 0,
            });
        };
        self.bitmap[block] = true;
        self.blocks_free -= 1;
        trace!("Allocated block {block}");
        Ok(block)
    }

    /// Returns `block` to the free pool. Freeing a block
    /// that is already free does nothing.
    pub fn free_block(&mut self, block: usize) {
        assert!(block < self.block_count, "block number out of range");
        if !self.bitmap[block] {
            warn!("Block {block} freed twice, ignoring");
            return;
        }
        self.bitmap[block] = false;
        self.blocks_free += 1;
        trace!("Freed block {block}");
    }

    /// Writes `bytes` at the start of `block`, zero-filling the rest of it.
    pub fn write_block(&mut self, block: usize, bytes: &[u8]) {
        assert!(block < self.block_count, "block number out of range");
        assert!(bytes.len() <= self.block_size, "data larger than a block");
        let offset = block * self.block_size;
        let target = &mut self.data[offset..offset + self.block_size];
        target[..bytes.len()].copy_from_slice(bytes);
        target[bytes.len()..].fill(0);
    }

    pub fn read_block(&self, block: usize) -> &[u8] {
        assert!(block < self.block_count, "block number out of range");
        let offset = block * self.block_size;
        &self.data[offset..offset + self.block_size]
    }
}

#[test]
fn test_rejects_bad_geometry() {
    assert!(matches!(
        BlockStore::new(100, 8),
        Err(FSError::InvalidBlockSize(100))
    ));
    assert!(matches!(
        BlockStore::new(1000, 8),
        Err(FSError::InvalidBlockSize(1000))
    ));
    assert!(matches!(
        BlockStore::new(512, 0),
        Err(FSError::InvalidBlockCount(0))
    ));
    assert!(matches!(
        BlockStore::new(2 * BlockStore::MAX_BLOCK_SIZE, 1),
        Err(FSError::InvalidBlockSize(131072))
    ));
    assert!(matches!(
        BlockStore::new(0xFFFF_FE00, 1),
        Err(FSError::InvalidBlockSize(0xFFFF_FE00))
    ));
    assert!(matches!(
        BlockStore::check_geometry(BlockStore::MAX_BLOCK_SIZE, usize::MAX / 2),
        Err(FSError::InvalidBlockCount(_))
    ));
    assert_eq!(BlockStore::check_geometry(4096, 8).unwrap(), 32768);
}

#[test]
fn test_first_fit_reuses_freed_blocks() {
    let mut store = BlockStore::new(512, 4).unwrap();
    assert_eq!(store.allocate_block().unwrap(), 0);
    assert_eq!(store.allocate_block().unwrap(), 1);
    assert_eq!(store.allocate_block().unwrap(), 2);
    store.free_block(1);
    assert_eq!(store.free_count(), 2);
    assert_eq!(store.allocate_block().unwrap(), 1);
    assert_eq!(store.allocate_block().unwrap(), 3);
    assert!(matches!(
        store.allocate_block(),
        Err(FSError::OutOfSpace { .. })
    ));
    assert_eq!(store.free_count(), 0);
}

#[test]
fn test_double_free_is_ignored() {
    let mut store = BlockStore::new(512, 2).unwrap();
    let block = store.allocate_block().unwrap();
    store.free_block(block);
    store.free_block(block);
    assert_eq!(store.free_count(), 2);
    assert_eq!(
        store.bitmap().iter().filter(|used| !**used).count(),
        store.free_count()
    );
}

#[test]
fn test_short_write_zero_fills() {
    let mut store = BlockStore::new(512, 1).unwrap();
    store.write_block(0, &[0xAA; 512]);
    store.write_block(0, b"abc");
    let block = store.read_block(0);
    assert_eq!(&block[..3], b"abc");
    assert!(block[3..].iter().all(|b| *b == 0));
}
