use super::storage::BlockStore;
use super::{FSError, Result};
use std::time::SystemTime;
use tracing::debug;

/// Number of blocks needed to hold `len` bytes.
pub fn blocks_for(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size)
}

/// Per-file metadata. The block list is ordered:
/// entry `i` holds bytes `[i * block_size, (i + 1) * block_size)`.
#[derive(Debug, Clone)]
pub struct Inode {
    size: u64,
    blocks: Vec<usize>,
    created_at: SystemTime,
    modified_at: SystemTime,
    accessed_at: SystemTime,
}

impl Default for Inode {
    fn default() -> Self {
        Self::new()
    }
}

impl Inode {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            blocks: Vec::new(),
            created_at: now,
            modified_at: now,
            accessed_at: now,
        }
    }

    pub(crate) fn from_parts(
        size: u64,
        blocks: Vec<usize>,
        created_at: SystemTime,
        modified_at: SystemTime,
        accessed_at: SystemTime,
    ) -> Self {
        Self {
            size,
            blocks,
            created_at,
            modified_at,
            accessed_at,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocks(&self) -> &[usize] {
        &self.blocks
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn modified_at(&self) -> SystemTime {
        self.modified_at
    }

    pub fn accessed_at(&self) -> SystemTime {
        self.accessed_at
    }

    /// Replaces the whole content with `data` and returns the
    /// previous size.
    ///
    /// New blocks are allocated and filled before the old ones
    /// are released, so a failed write leaves both the file and
    /// the store exactly as they were.
    pub fn write(&mut self, data: &[u8], store: &mut BlockStore) -> Result<u64> {
        let required = blocks_for(data.len(), store.block_size());
        let free = store.free_count();
        if required > free {
            debug!("Write of {} bytes needs {required} blocks, {free} free", data.len());
            return Err(FSError::OutOfSpace { required, free });
        }
        let mut staged = Vec::with_capacity(required);
        for chunk in data.chunks(store.block_size()) {
            match store.allocate_block() {
                Ok(block) => {
                    store.write_block(block, chunk);
                    staged.push(block);
                }
                Err(err) => {
                    for block in staged {
                        store.free_block(block);
                    }
                    return Err(err);
                }
            }
        }
        for block in std::mem::replace(&mut self.blocks, staged) {
            store.free_block(block);
        }
        let previous = std::mem::replace(&mut self.size, data.len() as u64);
        let now = SystemTime::now();
        self.modified_at = now;
        self.accessed_at = now;
        Ok(previous)
    }

    /// Returns exactly `size` bytes of content.
    pub fn read(&mut self, store: &BlockStore) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.blocks.len() * store.block_size());
        for block in &self.blocks {
            data.extend_from_slice(store.read_block(*block));
        }
        data.truncate(self.size as usize);
        self.accessed_at = SystemTime::now();
        data
    }

    /// Releases every block and returns the size the file had.
    pub fn clear(&mut self, store: &mut BlockStore) -> u64 {
        for block in self.blocks.drain(..) {
            store.free_block(block);
        }
        let now = SystemTime::now();
        self.created_at = now;
        self.modified_at = now;
        self.accessed_at = now;
        std::mem::take(&mut self.size)
    }
}

/// A named file, owned by its parent directory.
#[derive(Debug, Clone)]
pub struct FileNode {
    name: String,
    inode: Inode,
}

impl FileNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inode: Inode::new(),
        }
    }

    pub(crate) fn from_parts(name: String, inode: Inode) -> Self {
        Self { name, inode }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn write(&mut self, data: &[u8], store: &mut BlockStore) -> Result<u64> {
        self.inode.write(data, store)
    }

    pub fn read(&mut self, store: &BlockStore) -> Vec<u8> {
        self.inode.read(store)
    }

    pub fn clear(&mut self, store: &mut BlockStore) -> u64 {
        self.inode.clear(store)
    }
}

#[test]
fn test_write_read_exact_length() {
    let mut store = BlockStore::new(512, 8).unwrap();
    let mut file = FileNode::new("a.txt");
    let data: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(file.write(&data, &mut store).unwrap(), 0);
    assert_eq!(file.inode().blocks().len(), 3);
    assert_eq!(file.inode().size(), 1300);
    assert_eq!(file.read(&store), data);
}

#[test]
fn test_empty_write_takes_no_blocks() {
    let mut store = BlockStore::new(512, 2).unwrap();
    let mut file = FileNode::new("empty");
    file.write(b"", &mut store).unwrap();
    assert!(file.inode().blocks().is_empty());
    assert_eq!(store.free_count(), 2);
    assert!(file.read(&store).is_empty());
}

#[test]
fn test_rewrite_releases_old_blocks() {
    let mut store = BlockStore::new(512, 4).unwrap();
    let mut file = FileNode::new("f");
    file.write(&[1; 1024], &mut store).unwrap();
    assert_eq!(store.free_count(), 2);
    assert_eq!(file.write(b"short", &mut store).unwrap(), 1024);
    assert_eq!(store.free_count(), 3);
    assert_eq!(file.read(&store), b"short");
}

#[test]
fn test_failed_write_keeps_old_content() {
    let mut store = BlockStore::new(512, 3).unwrap();
    let mut file = FileNode::new("f");
    file.write(&[7; 1024], &mut store).unwrap();
    let bitmap = store.bitmap().to_vec();
    let err = file.write(&[8; 1024], &mut store).unwrap_err();
    assert!(matches!(
        err,
        FSError::OutOfSpace {
            required: 2,
            free: 1
        }
    ));
    assert_eq!(store.bitmap(), &bitmap[..]);
    assert_eq!(file.read(&store), vec![7; 1024]);
}

#[test]
fn test_clear_returns_size() {
    let mut store = BlockStore::new(512, 2).unwrap();
    let mut file = FileNode::new("f");
    file.write(b"hello", &mut store).unwrap();
    assert_eq!(file.clear(&mut store), 5);
    assert_eq!(file.inode().size(), 0);
    assert!(file.inode().blocks().is_empty());
    assert_eq!(store.free_count(), 2);
}
