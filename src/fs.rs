use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace};

pub mod inode;
pub mod storage;
pub mod tree;

use inode::{blocks_for, FileNode};
use storage::BlockStore;
use tree::{DirId, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("File"),
            NodeKind::Directory => f.write_str("Directory"),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FSError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: NodeKind, name: String },
    #[error("{kind} '{name}' not found")]
    NotFound { kind: NodeKind, name: String },
    #[error("Not enough space for operation: {required} blocks required, {free} free")]
    OutOfSpace { required: usize, free: usize },
    #[error("The new name is empty")]
    EmptyName,
    #[error("The new name is the same as the old one")]
    SameName,
    #[error("'{0}' is not a valid name")]
    InvalidName(String),
    #[error("{kind} '{name}' already exists")]
    NameCollision { kind: NodeKind, name: String },
    #[error("The root directory cannot be removed")]
    RootDirectory,
    #[error("The block size {0} is not valid (must be a multiple of 512 between 512 and 65536)")]
    InvalidBlockSize(usize),
    #[error("The block count {0} is not valid (must be at least 1 and fit in memory)")]
    InvalidBlockCount(usize),
    #[error("The filesystem is inconsistent: {0}")]
    Corrupted(String),
}

impl FSError {
    /// Status code reported by renames: 1 not found, 2 same name,
    /// 3 name collision, 4 empty or invalid name.
    pub fn rename_code(&self) -> u8 {
        match self {
            FSError::SameName => 2,
            FSError::NameCollision { .. } => 3,
            FSError::EmptyName | FSError::InvalidName(_) => 4,
            _ => 1,
        }
    }
}

type Result<T> = std::result::Result<T, FSError>;

/// Where directory names are looked up when they are not
/// a child of the current directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupScope {
    /// Fall back to a depth-first search of the whole tree.
    #[default]
    Global,
    /// Only the children of the current directory.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub block_size: usize,
    pub block_count: usize,
    pub lookup: LookupScope,
}

impl Config {
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;
    pub const DEFAULT_BLOCK_COUNT: usize = 10240;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            block_count: Self::DEFAULT_BLOCK_COUNT,
            lookup: LookupScope::default(),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Directory {
        name: String,
        items: usize,
    },
    File {
        name: String,
        size: u64,
        modified: SystemTime,
    },
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Directory { name, .. } | Entry::File { name, .. } => name,
        }
    }
}

fn check_new_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FSError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn check_rename(old: &str, new: &str) -> Result<()> {
    if new.is_empty() {
        return Err(FSError::EmptyName);
    }
    if new == old {
        return Err(FSError::SameName);
    }
    if new == "." || new == ".." || new.contains('/') {
        return Err(FSError::InvalidName(new.to_owned()));
    }
    Ok(())
}

/// The file system engine: a directory tree over a block store,
/// with a cursor for relative operations.
#[derive(Debug, Clone)]
pub struct FileSystem {
    store: BlockStore,
    tree: Tree,
    current: DirId,
    used_size: u64,
    lookup: LookupScope,
}

impl FileSystem {
    pub fn new(config: Config) -> Result<Self> {
        let store = BlockStore::new(config.block_size, config.block_count)?;
        debug!(
            "Created filesystem with {} blocks of {} bytes",
            config.block_count, config.block_size
        );
        Ok(Self {
            store,
            tree: Tree::new(),
            current: Tree::ROOT,
            used_size: 0,
            lookup: config.lookup,
        })
    }

    pub(crate) fn from_parts(
        store: BlockStore,
        tree: Tree,
        current: DirId,
        used_size: u64,
    ) -> Result<Self> {
        let fs = Self {
            store,
            tree,
            current,
            used_size,
            lookup: LookupScope::default(),
        };
        fs.verify()?;
        Ok(fs)
    }

    pub fn with_lookup_scope(mut self, lookup: LookupScope) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn lookup_scope(&self) -> LookupScope {
        self.lookup
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn current(&self) -> DirId {
        self.current
    }

    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    /// `(total bytes, used bytes)`.
    pub fn space_usage(&self) -> (u64, u64) {
        (self.store.capacity(), self.used_size)
    }

    pub fn current_name(&self) -> &str {
        self.tree[self.current].name()
    }

    pub fn current_path(&self) -> String {
        self.tree.path(self.current)
    }

    fn resolve_directory(&self, name: &str) -> Option<DirId> {
        if let Some(id) = self.tree.get_subdirectory(self.current, name) {
            return Some(id);
        }
        match self.lookup {
            LookupScope::Global => self.tree.find(Tree::ROOT, name),
            LookupScope::Local => None,
        }
    }

    fn file(&self, name: &str) -> Result<&FileNode> {
        self.tree[self.current]
            .get_file(name)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::File,
                name: name.to_owned(),
            })
    }

    /// Moves the cursor. `..` goes to the parent (staying put at the
    /// root) and `/` to the root. Any other name is looked up among
    /// the current children first, then according to the lookup scope.
    /// The cursor is left alone when nothing matches.
    pub fn change_directory(&mut self, name: &str) -> Result<()> {
        let target = match name {
            ".." => Some(self.tree[self.current].parent().unwrap_or(Tree::ROOT)),
            Tree::ROOT_NAME => Some(Tree::ROOT),
            _ => self.resolve_directory(name),
        };
        let Some(target) = target else {
            return Err(FSError::NotFound {
                kind: NodeKind::Directory,
                name: name.to_owned(),
            });
        };
        self.current = target;
        trace!("Changed directory to {}", self.current_path());
        Ok(())
    }

    pub fn create_file(&mut self, name: &str) -> Result<()> {
        check_new_name(name)?;
        let dir = &mut self.tree[self.current];
        if dir.get_file(name).is_some() {
            return Err(FSError::AlreadyExists {
                kind: NodeKind::File,
                name: name.to_owned(),
            });
        }
        dir.add_file(FileNode::new(name));
        debug!("Created file {name:?}");
        Ok(())
    }

    pub fn make_directory(&mut self, name: &str) -> Result<()> {
        check_new_name(name)?;
        if self.tree.get_subdirectory(self.current, name).is_some() {
            return Err(FSError::AlreadyExists {
                kind: NodeKind::Directory,
                name: name.to_owned(),
            });
        }
        self.tree.add_subdirectory(self.current, name);
        debug!("Created directory {name:?}");
        Ok(())
    }

    pub fn delete_file(&mut self, name: &str) -> Result<()> {
        let released = self.tree[self.current]
            .remove_file(name, &mut self.store)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::File,
                name: name.to_owned(),
            })?;
        self.used_size -= released;
        debug!("Deleted file {name:?} ({released} bytes)");
        Ok(())
    }

    /// Removes a directory and everything below it. If the cursor
    /// was inside it, it moves to the removed directory's parent.
    pub fn remove_directory(&mut self, name: &str) -> Result<()> {
        let not_found = || FSError::NotFound {
            kind: NodeKind::Directory,
            name: name.to_owned(),
        };
        let dir = self.resolve_directory(name).ok_or_else(not_found)?;
        let Some(parent) = self.tree[dir].parent() else {
            return Err(FSError::RootDirectory);
        };
        if self.tree.is_ancestor(dir, self.current) {
            self.current = parent;
        }
        let released = self
            .tree
            .remove_subdirectory(parent, dir, &mut self.store)
            .ok_or_else(not_found)?;
        self.used_size -= released;
        debug!("Removed directory {name:?} ({released} bytes)");
        Ok(())
    }

    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let store = &self.store;
        let file = self.tree[self.current]
            .get_file_mut(name)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::File,
                name: name.to_owned(),
            })?;
        Ok(file.read(store))
    }

    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let file = self.tree[self.current]
            .get_file_mut(name)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::File,
                name: name.to_owned(),
            })?;
        let previous = file.write(data, &mut self.store)?;
        self.used_size = self.used_size - previous + data.len() as u64;
        debug!("Wrote {} bytes to {name:?}", data.len());
        Ok(())
    }

    pub fn rename_file(&mut self, old: &str, new: &str) -> Result<()> {
        check_rename(old, new)?;
        let dir = &mut self.tree[self.current];
        if dir.get_file(new).is_some() {
            return Err(FSError::NameCollision {
                kind: NodeKind::File,
                name: new.to_owned(),
            });
        }
        let file = dir.get_file_mut(old).ok_or_else(|| FSError::NotFound {
            kind: NodeKind::File,
            name: old.to_owned(),
        })?;
        file.rename(new);
        debug!("Renamed file {old:?} to {new:?}");
        Ok(())
    }

    pub fn rename_directory(&mut self, old: &str, new: &str) -> Result<()> {
        check_rename(old, new)?;
        if self.tree.get_subdirectory(self.current, new).is_some() {
            return Err(FSError::NameCollision {
                kind: NodeKind::Directory,
                name: new.to_owned(),
            });
        }
        let dir = self
            .tree
            .get_subdirectory(self.current, old)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::Directory,
                name: old.to_owned(),
            })?;
        self.tree.rename(dir, new);
        debug!("Renamed directory {old:?} to {new:?}");
        Ok(())
    }

    /// Drops every file and directory, leaving an empty root.
    pub fn format(&mut self) {
        let root = &mut self.tree[Tree::ROOT];
        let names: Vec<String> = root.files().iter().map(|f| f.name().to_owned()).collect();
        let mut released = 0;
        for name in names {
            released += root.remove_file(&name, &mut self.store).unwrap_or(0);
        }
        released += self
            .tree
            .remove_all_subdirectories(Tree::ROOT, &mut self.store);
        self.used_size -= released;
        self.current = Tree::ROOT;
        debug!("Formatted filesystem, released {released} bytes");
    }

    pub fn list_directory(&self) -> Vec<Entry> {
        let dir = &self.tree[self.current];
        let directories = dir.subdirectories().iter().map(|id| {
            let child = &self.tree[*id];
            Entry::Directory {
                name: child.name().to_owned(),
                items: child.item_count(),
            }
        });
        let files = dir.files().iter().map(|file| Entry::File {
            name: file.name().to_owned(),
            size: file.inode().size(),
            modified: file.inode().modified_at(),
        });
        directories.chain(files).collect()
    }

    /// Number of entries in the named child directory.
    pub fn dir_item_count(&self, name: &str) -> Result<usize> {
        let id = self
            .tree
            .get_subdirectory(self.current, name)
            .ok_or_else(|| FSError::NotFound {
                kind: NodeKind::Directory,
                name: name.to_owned(),
            })?;
        Ok(self.tree[id].item_count())
    }

    pub fn file_size(&self, name: &str) -> Result<u64> {
        Ok(self.file(name)?.inode().size())
    }

    pub fn file_mtime(&self, name: &str) -> Result<SystemTime> {
        Ok(self.file(name)?.inode().modified_at())
    }

    pub fn save_to_disk(&self, path: impl AsRef<Path>) -> eyre::Result<()> {
        crate::container::ContainerFile::save(self, path)
    }

    pub fn load_from_disk(path: impl AsRef<Path>) -> eyre::Result<Self> {
        crate::container::ContainerFile::load(path)
    }

    /// Checks every structural and accounting invariant.
    pub fn verify(&self) -> Result<()> {
        let corrupted = |msg: String| -> Result<()> { Err(FSError::Corrupted(msg)) };
        let block_size = self.store.block_size();
        let mut owned = HashSet::new();
        let mut total_size = 0u64;
        for (id, dir) in self.tree.directories() {
            match dir.parent() {
                None if id != Tree::ROOT => {
                    return corrupted(format!("directory {:?} has no parent", dir.name()));
                }
                Some(parent) => {
                    if !self.tree.is_live(parent)
                        || !self.tree[parent].subdirectories().contains(&id)
                    {
                        return corrupted(format!(
                            "directory {:?} is not listed by its parent",
                            dir.name()
                        ));
                    }
                }
                None => {}
            }
            let mut names = HashSet::new();
            for child in dir.subdirectories() {
                if !self.tree.is_live(*child) || self.tree[*child].parent() != Some(id) {
                    return corrupted(format!("broken child link under {:?}", dir.name()));
                }
                if !names.insert(self.tree[*child].name()) {
                    let name = self.tree[*child].name();
                    return corrupted(format!("duplicate directory {name:?}"));
                }
            }
            let mut names = HashSet::new();
            for file in dir.files() {
                if !names.insert(file.name()) {
                    return corrupted(format!("duplicate file {:?}", file.name()));
                }
                let inode = file.inode();
                if inode.blocks().len() != blocks_for(inode.size() as usize, block_size) {
                    return corrupted(format!(
                        "file {:?} has {} blocks for {} bytes",
                        file.name(),
                        inode.blocks().len(),
                        inode.size()
                    ));
                }
                for block in inode.blocks() {
                    if !self.store.is_allocated(*block) {
                        return corrupted(format!("block {block} is in use but marked free"));
                    }
                    if !owned.insert(*block) {
                        return corrupted(format!("block {block} is owned twice"));
                    }
                }
                total_size += inode.size();
            }
        }
        if owned.len() != self.store.used_count() {
            return corrupted(format!(
                "{} blocks marked used, {} owned by files",
                self.store.used_count(),
                owned.len()
            ));
        }
        if total_size != self.used_size {
            return corrupted(format!(
                "used size is {}, files hold {total_size} bytes",
                self.used_size
            ));
        }
        if !self.tree.is_live(self.current) || !self.tree.is_ancestor(Tree::ROOT, self.current) {
            return corrupted("current directory is not reachable".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
fn small_fs(block_count: usize) -> FileSystem {
    FileSystem::new(Config {
        block_size: 512,
        block_count,
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn test_hello_round_trip() {
    let mut fs = FileSystem::new(Config::default()).unwrap();
    fs.create_file("a.txt").unwrap();
    fs.write_file("a.txt", b"hello").unwrap();
    assert_eq!(fs.space_usage(), (10240 * 4096, 5));
    assert_eq!(fs.read_file("a.txt").unwrap(), b"hello");
    fs.delete_file("a.txt").unwrap();
    assert_eq!(fs.space_usage().1, 0);
    assert_eq!(fs.store().free_count(), 10240);
}

#[test]
fn test_directory_navigation() {
    let mut fs = small_fs(4);
    fs.make_directory("docs").unwrap();
    fs.change_directory("docs").unwrap();
    assert_eq!(fs.current_path(), "/docs");
    assert_eq!(fs.current_name(), "docs");
    fs.make_directory("drafts").unwrap();
    fs.change_directory("drafts").unwrap();
    assert_eq!(fs.current_path(), "/docs/drafts");
    fs.change_directory("/").unwrap();
    assert_eq!(fs.current_path(), "/");
    fs.change_directory("docs").unwrap();
    fs.change_directory("..").unwrap();
    assert_eq!(fs.current_path(), "/");
    // parent of root is root
    fs.change_directory("..").unwrap();
    assert_eq!(fs.current_path(), "/");
}

#[test]
fn test_change_directory_falls_back_to_whole_tree() {
    let mut fs = small_fs(4);
    fs.make_directory("a").unwrap();
    fs.make_directory("b").unwrap();
    fs.change_directory("a").unwrap();
    fs.make_directory("deep").unwrap();
    fs.change_directory("/").unwrap();
    fs.change_directory("b").unwrap();
    fs.change_directory("deep").unwrap();
    assert_eq!(fs.current_path(), "/a/deep");

    let err = fs.change_directory("nowhere").unwrap_err();
    assert!(matches!(err, FSError::NotFound { kind: NodeKind::Directory, .. }));
    assert_eq!(fs.current_path(), "/a/deep");
}

#[test]
fn test_local_scope_skips_fallback() {
    let mut fs = small_fs(4).with_lookup_scope(LookupScope::Local);
    fs.make_directory("a").unwrap();
    fs.make_directory("b").unwrap();
    fs.change_directory("a").unwrap();
    fs.make_directory("deep").unwrap();
    fs.change_directory("..").unwrap();
    fs.change_directory("b").unwrap();
    assert!(fs.change_directory("deep").is_err());
    assert!(fs.remove_directory("deep").is_err());
    assert_eq!(fs.current_path(), "/b");
}

#[test]
fn test_uniqueness() {
    let mut fs = small_fs(4);
    fs.create_file("x").unwrap();
    assert!(matches!(
        fs.create_file("x"),
        Err(FSError::AlreadyExists { kind: NodeKind::File, .. })
    ));
    fs.make_directory("x").unwrap();
    assert!(matches!(
        fs.make_directory("x"),
        Err(FSError::AlreadyExists { kind: NodeKind::Directory, .. })
    ));
    for bad in ["", ".", "..", "a/b"] {
        assert!(matches!(fs.create_file(bad), Err(FSError::InvalidName(_))));
        assert!(matches!(fs.make_directory(bad), Err(FSError::InvalidName(_))));
    }
    // same names are fine in another directory
    fs.change_directory("x").unwrap();
    fs.create_file("x").unwrap();
    fs.make_directory("x").unwrap();
}

#[test]
fn test_rename_codes() {
    let mut fs = small_fs(4);
    fs.create_file("a.txt").unwrap();
    fs.create_file("b.txt").unwrap();
    assert_eq!(fs.rename_file("a.txt", "a.txt").unwrap_err().rename_code(), 2);
    assert_eq!(fs.rename_file("missing", "x").unwrap_err().rename_code(), 1);
    assert_eq!(fs.rename_file("a.txt", "b.txt").unwrap_err().rename_code(), 3);
    assert_eq!(fs.rename_file("a.txt", "").unwrap_err().rename_code(), 4);
    // collisions are reported before a missing source
    assert_eq!(fs.rename_file("missing", "b.txt").unwrap_err().rename_code(), 3);
    fs.rename_file("a.txt", "c.txt").unwrap();
    assert!(fs.file_size("c.txt").is_ok());
    assert!(fs.file_size("a.txt").is_err());

    fs.make_directory("d1").unwrap();
    fs.make_directory("d2").unwrap();
    assert_eq!(fs.rename_directory("d1", "d1").unwrap_err().rename_code(), 2);
    assert_eq!(fs.rename_directory("d1", "d2").unwrap_err().rename_code(), 3);
    assert_eq!(fs.rename_directory("nope", "d3").unwrap_err().rename_code(), 1);
    assert_eq!(fs.rename_directory("d1", "").unwrap_err().rename_code(), 4);
    fs.rename_directory("d1", "d3").unwrap();
    fs.change_directory("d3").unwrap();
    assert_eq!(fs.current_path(), "/d3");
}

#[test]
fn test_out_of_space_leaves_state_untouched() {
    let mut fs = small_fs(4);
    fs.create_file("big").unwrap();
    fs.write_file("big", &[1; 4 * 512]).unwrap();
    assert_eq!(fs.store().free_count(), 0);
    fs.create_file("one").unwrap();
    let bitmap = fs.store().bitmap().to_vec();
    let err = fs.write_file("one", b"x").unwrap_err();
    assert!(matches!(err, FSError::OutOfSpace { required: 1, free: 0 }));
    assert_eq!(fs.used_size(), 4 * 512);
    assert_eq!(fs.store().bitmap(), &bitmap[..]);
    // empty content needs no block
    fs.write_file("one", b"").unwrap();
    fs.verify().unwrap();
}

#[test]
fn test_missing_files() {
    let mut fs = small_fs(4);
    assert!(matches!(fs.read_file("nope"), Err(FSError::NotFound { .. })));
    assert!(matches!(fs.write_file("nope", b"x"), Err(FSError::NotFound { .. })));
    assert!(matches!(fs.delete_file("nope"), Err(FSError::NotFound { .. })));
    assert!(matches!(fs.remove_directory("nope"), Err(FSError::NotFound { .. })));
    assert!(fs.file_mtime("nope").is_err());
    assert!(fs.dir_item_count("nope").is_err());
}

#[test]
fn test_remove_directory_recursively() {
    let mut fs = small_fs(16);
    fs.make_directory("a").unwrap();
    fs.change_directory("a").unwrap();
    fs.create_file("f").unwrap();
    fs.write_file("f", &[3; 700]).unwrap();
    fs.make_directory("b").unwrap();
    fs.change_directory("b").unwrap();
    fs.create_file("g").unwrap();
    fs.write_file("g", &[4; 100]).unwrap();
    fs.change_directory("/").unwrap();
    assert_eq!(fs.dir_item_count("a").unwrap(), 2);
    assert_eq!(fs.used_size(), 800);

    fs.remove_directory("a").unwrap();
    assert_eq!(fs.used_size(), 0);
    assert_eq!(fs.store().free_count(), 16);
    assert!(fs.list_directory().is_empty());
    fs.verify().unwrap();
}

#[test]
fn test_remove_directory_moves_cursor_out() {
    let mut fs = small_fs(4);
    fs.make_directory("a").unwrap();
    fs.change_directory("a").unwrap();
    fs.make_directory("b").unwrap();
    fs.change_directory("b").unwrap();
    // found through the whole-tree fallback
    fs.remove_directory("a").unwrap();
    assert_eq!(fs.current_path(), "/");
    assert!(matches!(fs.remove_directory("/"), Err(FSError::RootDirectory)));
    fs.verify().unwrap();
}

#[test]
fn test_format_empties_everything() {
    let mut fs = small_fs(8);
    fs.create_file("top").unwrap();
    fs.write_file("top", b"data").unwrap();
    fs.make_directory("d").unwrap();
    fs.change_directory("d").unwrap();
    fs.create_file("inner").unwrap();
    fs.write_file("inner", &[0; 1000]).unwrap();
    fs.format();
    assert_eq!(fs.current_path(), "/");
    assert_eq!(fs.space_usage(), (8 * 512, 0));
    assert_eq!(fs.store().free_count(), 8);
    assert!(fs.list_directory().is_empty());
    assert_eq!(fs.tree().directories().count(), 1);
    fs.verify().unwrap();
}

#[test]
fn test_listing_and_metadata() {
    let mut fs = small_fs(8);
    fs.create_file("notes").unwrap();
    fs.write_file("notes", b"abc").unwrap();
    fs.make_directory("sub").unwrap();
    let listing = fs.list_directory();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0], Entry::Directory { name: "sub".into(), items: 0 });
    assert!(matches!(&listing[1], Entry::File { name, size: 3, .. } if name == "notes"));
    assert_eq!(fs.file_size("notes").unwrap(), 3);
    let before = fs.file_mtime("notes").unwrap();
    fs.write_file("notes", b"abcd").unwrap();
    assert!(fs.file_mtime("notes").unwrap() >= before);
}

#[test]
fn test_random_operations_conserve_space() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut fs = small_fs(64);
    let files = ["a", "b", "c", "d", "e"];
    let dirs = ["x", "y", "z"];
    // content of every file, keyed by its directory
    let mut expected: HashMap<(DirId, &str), Vec<u8>> = HashMap::new();
    for _ in 0..2000 {
        let file = files[rng.gen_range(0..files.len())];
        let dir = dirs[rng.gen_range(0..dirs.len())];
        let here = fs.current();
        match rng.gen_range(0..12) {
            0 => {
                if fs.create_file(file).is_ok() {
                    expected.insert((here, file), Vec::new());
                }
            }
            1..=3 => {
                let len = rng.gen_range(0..4000);
                let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                match fs.write_file(file, &data) {
                    Ok(()) => {
                        expected.insert((here, file), data);
                    }
                    Err(FSError::NotFound { .. }) => {
                        assert!(!expected.contains_key(&(here, file)))
                    }
                    Err(FSError::OutOfSpace { .. }) => {}
                    Err(err) => panic!("unexpected error {err}"),
                }
            }
            4 => {
                if fs.delete_file(file).is_ok() {
                    expected.remove(&(here, file));
                }
            }
            5 => {
                let new = files[rng.gen_range(0..files.len())];
                if fs.rename_file(file, new).is_ok() {
                    let data = expected.remove(&(here, file)).unwrap();
                    expected.insert((here, new), data);
                }
            }
            6 | 7 => {
                let _ = fs.make_directory(dir);
            }
            8 => {
                let target = match rng.gen_range(0..4) {
                    0 => "..",
                    1 => "/",
                    _ => dir,
                };
                let _ = fs.change_directory(target);
            }
            9 => {
                if fs.remove_directory(dir).is_ok() {
                    expected.retain(|(id, _), _| fs.tree().is_live(*id));
                }
            }
            10 => {
                let new = dirs[rng.gen_range(0..dirs.len())];
                let _ = fs.rename_directory(dir, new);
            }
            _ => {
                if rng.gen_ratio(1, 8) {
                    fs.format();
                    expected.clear();
                    assert_eq!(fs.current_path(), "/");
                }
            }
        }
        fs.verify().unwrap();
        let total: u64 = expected.values().map(|data| data.len() as u64).sum();
        assert_eq!(fs.used_size(), total);
        let stored = fs
            .tree()
            .directories()
            .map(|(_, dir)| dir.files().len())
            .sum::<usize>();
        assert_eq!(stored, expected.len());
        for ((id, name), data) in &expected {
            let file = fs.tree()[*id].get_file(name).unwrap();
            assert_eq!(file.inode().size(), data.len() as u64);
        }
    }
    for ((id, name), data) in &expected {
        let mut inode = fs.tree()[*id].get_file(name).unwrap().inode().clone();
        let path = fs.tree().path(*id);
        assert_eq!(inode.read(fs.store()), *data, "{path}/{name}");
    }
}
