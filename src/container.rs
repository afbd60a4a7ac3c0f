mod header;

pub use header::ContainerFileHeader;

use crate::fs::inode::{FileNode, Inode};
use crate::fs::storage::BlockStore;
use crate::fs::tree::{DirId, Tree};
use crate::fs::FileSystem;
use eyre::{ensure, eyre, Context, Result};
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};

#[derive(Serialize, Deserialize, Debug)]
struct FileRecord {
    name: String,
    size: u64,
    blocks: Vec<u64>,
    created_at: SystemTime,
    modified_at: SystemTime,
    accessed_at: SystemTime,
}

/// One directory of the tree. Records are kept in pre-order, so
/// `parent` always indexes an earlier record. The root comes first
/// and its `parent` is ignored.
#[derive(Serialize, Deserialize, Debug)]
struct DirRecord {
    parent: u32,
    name: String,
    files: Vec<FileRecord>,
}

/// The directory tree as stored after the block data.
#[derive(Serialize, Deserialize, Debug)]
struct TreeRecord {
    directories: Vec<DirRecord>,
    /// Index of the current directory in `directories`.
    cursor: u32,
}

fn file_record(file: &FileNode) -> FileRecord {
    let inode = file.inode();
    FileRecord {
        name: file.name().to_owned(),
        size: inode.size(),
        blocks: inode.blocks().iter().map(|b| *b as u64).collect(),
        created_at: inode.created_at(),
        modified_at: inode.modified_at(),
        accessed_at: inode.accessed_at(),
    }
}

fn tree_record(tree: &Tree, current: DirId) -> TreeRecord {
    let mut directories = Vec::new();
    let mut cursor = 0;
    let mut stack = vec![(Tree::ROOT, 0)];
    while let Some((id, parent)) = stack.pop() {
        let index = directories.len() as u32;
        if id == current {
            cursor = index;
        }
        let dir = &tree[id];
        directories.push(DirRecord {
            parent,
            name: dir.name().to_owned(),
            files: dir.files().iter().map(file_record).collect(),
        });
        stack.extend(dir.subdirectories().iter().rev().map(|child| (*child, index)));
    }
    TreeRecord {
        directories,
        cursor,
    }
}

fn restore_files(tree: &mut Tree, id: DirId, files: Vec<FileRecord>) {
    for file in files {
        let inode = Inode::from_parts(
            file.size,
            file.blocks.into_iter().map(|b| b as usize).collect(),
            file.created_at,
            file.modified_at,
            file.accessed_at,
        );
        tree[id].add_file(FileNode::from_parts(file.name, inode));
    }
}

/// Rebuilds the arena from the flat record list and returns it
/// together with the current directory.
fn restore_tree(record: TreeRecord) -> Result<(Tree, DirId)> {
    let mut directories = record.directories.into_iter();
    let root = directories
        .next()
        .ok_or_else(|| eyre!("Snapshot holds no root directory"))?;
    ensure!(
        root.name == Tree::ROOT_NAME,
        "Root directory is named {:?}",
        root.name
    );
    let mut tree = Tree::new();
    restore_files(&mut tree, Tree::ROOT, root.files);
    let mut ids = vec![Tree::ROOT];
    for dir in directories {
        let parent = *ids.get(dir.parent as usize).ok_or_else(|| {
            eyre!(
                "Directory {:?} refers to parent {} before it is defined",
                dir.name,
                dir.parent
            )
        })?;
        let id = tree.add_subdirectory(parent, dir.name);
        restore_files(&mut tree, id, dir.files);
        ids.push(id);
    }
    let current = *ids
        .get(record.cursor as usize)
        .ok_or_else(|| eyre!("Current directory does not exist in the snapshot"))?;
    Ok((tree, current))
}

/// Name of the sibling file a snapshot is written to before it
/// replaces `path`.
fn staging_path(path: &Path) -> Result<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| eyre!("Snapshot path {path:?} has no file name"))?
        .to_os_string();
    name.push(".partial");
    Ok(path.with_file_name(name))
}

fn write_and_replace(staging: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(staging)
        .with_context(|| format!("Couldn't create snapshot file {staging:?}"))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(staging, path).wrap_err("Failed to replace snapshot")?;
    Ok(())
}

fn pack_bitmap(bitmap: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bitmap.len().div_ceil(8)];
    for (block, used) in bitmap.iter().enumerate() {
        if *used {
            packed[block / 8] |= 1 << (block % 8);
        }
    }
    packed
}

fn unpack_bitmap(packed: &[u8], block_count: usize) -> Vec<bool> {
    (0..block_count)
        .map(|block| packed[block / 8] & (1 << (block % 8)) != 0)
        .collect()
}

/// Whole-state snapshot of a [`FileSystem`].
///
/// The file starts with a [`ContainerFileHeader`], followed by the
/// block bitmap, the content of every used block in ascending order
/// and finally the bincode-encoded directory tree.
#[derive(Debug)]
pub struct ContainerFile;

impl ContainerFile {
    pub fn encode(fs: &FileSystem) -> Result<Vec<u8>> {
        let store = fs.store();
        let mut payload = pack_bitmap(store.bitmap());
        let mut used_blocks = 0u64;
        for (block, used) in store.bitmap().iter().enumerate() {
            if *used {
                payload.extend_from_slice(store.read_block(block));
                used_blocks += 1;
            }
        }
        let tree = tree_record(fs.tree(), fs.current());
        bincode::serialize_into(&mut payload, &tree)
            .wrap_err("Failed to encode directory tree")?;
        let header = ContainerFileHeader::new(
            store.block_size() as u32,
            store.block_count() as u64,
            fs.used_size(),
            used_blocks,
            &payload,
        );
        let mut bytes = header.pack()?.to_vec();
        bytes.extend_from_slice(&payload);
        trace!(
            "Encoded snapshot: {} bytes, {used_blocks} used blocks",
            bytes.len()
        );
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<FileSystem> {
        ensure!(
            bytes.len() >= ContainerFileHeader::SIZE,
            "Snapshot is too small to hold a header: {} bytes",
            bytes.len()
        );
        let (header, payload) = bytes.split_at(ContainerFileHeader::SIZE);
        let header = ContainerFileHeader::unpack_from_slice(header)?;
        header.validate(payload)?;

        let block_size = header.block_size as usize;
        let block_count = usize::try_from(header.block_count)
            .wrap_err("Block count does not fit in memory")?;
        let region = BlockStore::check_geometry(block_size, block_count)?;
        let bitmap_len = block_count.div_ceil(8);
        let required = usize::try_from(header.used_blocks)
            .ok()
            .and_then(|used| used.checked_mul(block_size))
            .and_then(|data_len| data_len.checked_add(bitmap_len))
            .ok_or_else(|| eyre!("Header declares {} used blocks", header.used_blocks))?;
        ensure!(
            payload.len() >= required,
            "Snapshot is truncated: required at least {} bytes, is {} bytes",
            required,
            payload.len()
        );
        let data_len = required - bitmap_len;
        let (bitmap, rest) = payload.split_at(bitmap_len);
        let (mut used_data, tree) = rest.split_at(data_len);

        let bitmap = unpack_bitmap(bitmap, block_count);
        let used = bitmap.iter().filter(|used| **used).count();
        ensure!(
            used as u64 == header.used_blocks,
            "Bitmap marks {} blocks used, header says {}",
            used,
            header.used_blocks
        );
        let mut data = vec![0; region];
        for (block, _) in bitmap.iter().enumerate().filter(|(_, used)| **used) {
            let (content, rest) = used_data.split_at(block_size);
            data[block * block_size..(block + 1) * block_size].copy_from_slice(content);
            used_data = rest;
        }
        let store = BlockStore::from_parts(block_size, bitmap, data)?;

        let record: TreeRecord =
            bincode::deserialize(tree).wrap_err("Failed to decode directory tree")?;
        let (tree, current) = restore_tree(record)?;
        let fs = FileSystem::from_parts(store, tree, current, header.used_size)?;
        Ok(fs)
    }

    pub fn save(fs: &FileSystem, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!("Saving snapshot to {path:?}");
        let bytes = Self::encode(fs)?;
        // write to a sibling file first so a failed save keeps the old snapshot
        let staging = staging_path(path)?;
        let written = write_and_replace(&staging, path, &bytes);
        if written.is_err() {
            let _ = std::fs::remove_file(&staging);
        }
        written
    }

    pub fn load(path: impl AsRef<Path>) -> Result<FileSystem> {
        let path = path.as_ref();
        debug!("Loading snapshot from {path:?}");
        let bytes =
            std::fs::read(path).with_context(|| format!("Couldn't read snapshot {path:?}"))?;
        Self::decode(&bytes).wrap_err("Snapshot is not valid... Maybe it is corrupt?")
    }
}

#[cfg(test)]
fn sample_fs() -> FileSystem {
    use crate::fs::Config;
    let mut fs = FileSystem::new(Config {
        block_size: 512,
        block_count: 16,
        ..Config::default()
    })
    .unwrap();
    fs.create_file("a.txt").unwrap();
    fs.write_file("a.txt", b"hello").unwrap();
    fs.make_directory("docs").unwrap();
    fs.make_directory("music").unwrap();
    fs.change_directory("music").unwrap();
    fs.create_file("song").unwrap();
    fs.write_file("song", &[9; 1500]).unwrap();
    fs.create_file("empty").unwrap();
    fs
}

#[test]
fn test_snapshot_round_trip() {
    let mut fs = sample_fs();
    let bytes = ContainerFile::encode(&fs).unwrap();
    let mut restored = ContainerFile::decode(&bytes).unwrap();
    assert_eq!(restored.current_path(), "/music");
    assert_eq!(restored.space_usage(), fs.space_usage());
    assert_eq!(restored.store().bitmap(), fs.store().bitmap());
    assert_eq!(restored.read_file("song").unwrap(), vec![9; 1500]);
    assert_eq!(restored.file_size("empty").unwrap(), 0);
    assert_eq!(
        restored.file_mtime("song").unwrap(),
        fs.file_mtime("song").unwrap()
    );
    restored.change_directory("..").unwrap();
    assert_eq!(restored.read_file("a.txt").unwrap(), b"hello");
    fs.change_directory("..").unwrap();
    assert_eq!(restored.list_directory(), fs.list_directory());
}

#[test]
fn test_decode_rejects_corruption() {
    let fs = sample_fs();
    let bytes = ContainerFile::encode(&fs).unwrap();

    assert!(ContainerFile::decode(&bytes[..10]).is_err());
    assert!(ContainerFile::decode(&bytes[..bytes.len() - 1]).is_err());

    let mut flipped = bytes.clone();
    let last = flipped.len() - 1;
    flipped[last] ^= 0xFF;
    assert!(ContainerFile::decode(&flipped).is_err());

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(ContainerFile::decode(&bad_magic).is_err());
}

#[test]
fn test_decode_rejects_inconsistent_accounting() {
    let fs = sample_fs();
    let bytes = ContainerFile::encode(&fs).unwrap();
    let (header, payload) = bytes.split_at(ContainerFileHeader::SIZE);
    let mut header = ContainerFileHeader::unpack_from_slice(header).unwrap();
    header.used_size += 1;
    let mut forged = header.pack().unwrap().to_vec();
    forged.extend_from_slice(payload);
    let err = ContainerFile::decode(&forged).unwrap_err();
    assert!(format!("{err:?}").contains("used size"));
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.snapshot");
    let fs = sample_fs();
    fs.save_to_disk(&path).unwrap();
    assert!(!dir.path().join("fs.snapshot.partial").exists());
    let loaded = FileSystem::load_from_disk(&path).unwrap();
    assert_eq!(loaded.space_usage(), fs.space_usage());
    assert!(FileSystem::load_from_disk(dir.path().join("missing")).is_err());
}

#[test]
fn test_deep_tree_round_trip() {
    use crate::fs::Config;
    const DEPTH: usize = 20_000;
    let mut fs = FileSystem::new(Config {
        block_size: 512,
        block_count: 1,
        ..Config::default()
    })
    .unwrap();
    for _ in 0..DEPTH {
        fs.make_directory("x").unwrap();
        fs.change_directory("x").unwrap();
    }
    fs.create_file("leaf").unwrap();
    fs.write_file("leaf", b"bottom").unwrap();
    fs.verify().unwrap();

    let bytes = ContainerFile::encode(&fs).unwrap();
    let mut restored = ContainerFile::decode(&bytes).unwrap();
    assert_eq!(restored.tree().directories().count(), DEPTH + 1);
    assert_eq!(restored.current_path(), fs.current_path());
    assert_eq!(restored.read_file("leaf").unwrap(), b"bottom");
    assert_eq!(restored.space_usage(), fs.space_usage());
}

#[test]
fn test_decode_keeps_sibling_order() {
    let mut fs = sample_fs();
    fs.change_directory("/").unwrap();
    fs.make_directory("zeta").unwrap();
    fs.change_directory("docs").unwrap();
    fs.make_directory("inner").unwrap();
    let bytes = ContainerFile::encode(&fs).unwrap();
    let mut restored = ContainerFile::decode(&bytes).unwrap();
    assert_eq!(restored.current_path(), "/docs");
    restored.change_directory("inner").unwrap();
    restored.change_directory("/").unwrap();
    fs.change_directory("/").unwrap();
    assert_eq!(restored.list_directory(), fs.list_directory());
}

#[test]
fn test_decode_rejects_oversized_geometry() {
    // checksums match, only the geometry is absurd
    for block_size in [0xFFFF_FE00, 2 * 65536] {
        let header = ContainerFileHeader::new(block_size, 1, 0, 0, &[0]);
        let mut forged = header.pack().unwrap().to_vec();
        forged.push(0);
        assert!(ContainerFile::decode(&forged).is_err());
    }
    let header = ContainerFileHeader::new(512, 4, 0, u64::MAX, &[0]);
    let mut forged = header.pack().unwrap().to_vec();
    forged.push(0);
    assert!(ContainerFile::decode(&forged).is_err());
}

#[test]
fn test_staging_file_is_per_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snap = staging_path(&dir.path().join("a.snap")).unwrap();
    let img = staging_path(&dir.path().join("a.img")).unwrap();
    assert_ne!(snap, img);
    assert_eq!(snap, dir.path().join("a.snap.partial"));
}

#[test]
fn test_failed_save_removes_staging_file() {
    let dir = tempfile::tempdir().unwrap();
    // a non-empty directory cannot be replaced by the snapshot
    let path = dir.path().join("taken");
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("inner"), b"x").unwrap();
    let fs = sample_fs();
    assert!(fs.save_to_disk(&path).is_err());
    assert!(!dir.path().join("taken.partial").exists());
    assert!(path.is_dir());
}
