//! The directory tree. Directories live in an arena and refer
//! to each other through [`DirId`] handles, so a child can point
//! back at its parent without shared ownership.

use super::inode::FileNode;
use super::storage::BlockStore;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(usize);

#[derive(Debug, Clone)]
pub struct DirectoryNode {
    name: String,
    parent: Option<DirId>,
    files: Vec<FileNode>,
    subdirectories: Vec<DirId>,
}

impl DirectoryNode {
    fn new(name: String, parent: Option<DirId>) -> Self {
        Self {
            name,
            parent,
            files: Vec::new(),
            subdirectories: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<DirId> {
        self.parent
    }

    pub fn files(&self) -> &[FileNode] {
        &self.files
    }

    pub fn subdirectories(&self) -> &[DirId] {
        &self.subdirectories
    }

    pub fn item_count(&self) -> usize {
        self.files.len() + self.subdirectories.len()
    }

    pub fn add_file(&mut self, file: FileNode) {
        self.files.push(file);
    }

    pub fn get_file(&self, name: &str) -> Option<&FileNode> {
        self.files.iter().find(|file| file.name() == name)
    }

    pub fn get_file_mut(&mut self, name: &str) -> Option<&mut FileNode> {
        self.files.iter_mut().find(|file| file.name() == name)
    }

    /// Clears the named file and detaches it. Returns the number
    /// of bytes it held, or `None` if there is no such file.
    pub fn remove_file(&mut self, name: &str, store: &mut BlockStore) -> Option<u64> {
        let index = self.files.iter().position(|file| file.name() == name)?;
        let mut file = self.files.remove(index);
        Some(file.clear(store))
    }

    fn clear_files(&mut self, store: &mut BlockStore) -> u64 {
        let mut released = 0;
        for mut file in self.files.drain(..) {
            released += file.clear(store);
        }
        released
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Option<DirectoryNode>>,
    free_slots: Vec<usize>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<DirId> for Tree {
    type Output = DirectoryNode;

    fn index(&self, id: DirId) -> &DirectoryNode {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale directory handle {id:?}"),
        }
    }
}

impl std::ops::IndexMut<DirId> for Tree {
    fn index_mut(&mut self, id: DirId) -> &mut DirectoryNode {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale directory handle {id:?}"),
        }
    }
}

impl Tree {
    pub const ROOT: DirId = DirId(0);
    pub const ROOT_NAME: &'static str = "/";

    pub fn new() -> Self {
        Self {
            nodes: vec![Some(DirectoryNode::new(Self::ROOT_NAME.to_owned(), None))],
            free_slots: Vec::new(),
        }
    }

    pub fn root(&self) -> &DirectoryNode {
        &self[Self::ROOT]
    }

    pub fn is_live(&self, id: DirId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    /// Every live directory, root first.
    pub fn directories(&self) -> impl Iterator<Item = (DirId, &DirectoryNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|node| (DirId(slot), node)))
    }

    /// Creates an empty directory called `name` under `parent`.
    /// Name uniqueness is the caller's business.
    pub fn add_subdirectory(&mut self, parent: DirId, name: impl Into<String>) -> DirId {
        let node = DirectoryNode::new(name.into(), Some(parent));
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                DirId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                DirId(self.nodes.len() - 1)
            }
        };
        self[parent].subdirectories.push(id);
        id
    }

    pub(crate) fn rename(&mut self, id: DirId, name: impl Into<String>) {
        self[id].name = name.into();
    }

    pub fn get_subdirectory(&self, dir: DirId, name: &str) -> Option<DirId> {
        self[dir]
            .subdirectories
            .iter()
            .copied()
            .find(|child| self[*child].name == name)
    }

    /// Depth-first pre-order search for a directory called `name`,
    /// starting with `from` itself.
    pub fn find(&self, from: DirId, name: &str) -> Option<DirId> {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let node = &self[id];
            if node.name == name {
                return Some(id);
            }
            stack.extend(node.subdirectories.iter().rev());
        }
        None
    }

    /// Whether `node` is `ancestor` or lies below it.
    pub fn is_ancestor(&self, ancestor: DirId, node: DirId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self[id].parent;
        }
        false
    }

    /// Absolute path of `id`, `/` for the root.
    pub fn path(&self, id: DirId) -> String {
        let mut names = Vec::new();
        let mut cursor = id;
        while let Some(parent) = self[cursor].parent {
            names.push(self[cursor].name.as_str());
            cursor = parent;
        }
        if names.is_empty() {
            return Self::ROOT_NAME.to_owned();
        }
        names.iter().rev().fold(String::new(), |mut path, name| {
            path.push('/');
            path.push_str(name);
            path
        })
    }

    /// Detaches `dir` from `parent` and releases everything below it.
    /// Returns the number of file bytes released, or `None` if `dir`
    /// is not a child of `parent`.
    pub fn remove_subdirectory(
        &mut self,
        parent: DirId,
        dir: DirId,
        store: &mut BlockStore,
    ) -> Option<u64> {
        let siblings = &mut self[parent].subdirectories;
        let index = siblings.iter().position(|child| *child == dir)?;
        siblings.remove(index);
        Some(self.release(dir, store))
    }

    /// Releases every child directory of `dir`.
    pub fn remove_all_subdirectories(&mut self, dir: DirId, store: &mut BlockStore) -> u64 {
        let children = std::mem::take(&mut self[dir].subdirectories);
        children
            .into_iter()
            .map(|child| self.release(child, store))
            .sum()
    }

    /// Clears all files of `dir` and of its descendants in pre-order
    /// and frees their arena slots.
    fn release(&mut self, dir: DirId, store: &mut BlockStore) -> u64 {
        let mut released = 0;
        let mut stack = vec![dir];
        while let Some(id) = stack.pop() {
            let Some(mut node) = self.nodes[id.0].take() else {
                continue;
            };
            trace!("Releasing directory {:?}", node.name);
            released += node.clear_files(store);
            node.parent = None;
            stack.extend(node.subdirectories.drain(..).rev());
            self.free_slots.push(id.0);
        }
        released
    }
}

#[test]
fn test_path_and_parents() {
    let mut tree = Tree::new();
    let docs = tree.add_subdirectory(Tree::ROOT, "docs");
    let notes = tree.add_subdirectory(docs, "notes");
    assert_eq!(tree.path(Tree::ROOT), "/");
    assert_eq!(tree.path(docs), "/docs");
    assert_eq!(tree.path(notes), "/docs/notes");
    assert_eq!(tree[notes].parent(), Some(docs));
    assert!(tree.is_ancestor(docs, notes));
    assert!(!tree.is_ancestor(notes, docs));
}

#[test]
fn test_find_is_preorder() {
    let mut tree = Tree::new();
    let a = tree.add_subdirectory(Tree::ROOT, "a");
    let deep = tree.add_subdirectory(a, "x");
    let b = tree.add_subdirectory(Tree::ROOT, "b");
    tree.add_subdirectory(b, "x");
    assert_eq!(tree.find(Tree::ROOT, "x"), Some(deep));
    assert_eq!(tree.find(Tree::ROOT, "/"), Some(Tree::ROOT));
    assert_eq!(tree.find(b, "a"), None);
}

#[test]
fn test_remove_subdirectory_releases_descendants() {
    let mut store = BlockStore::new(512, 8).unwrap();
    let mut tree = Tree::new();
    let a = tree.add_subdirectory(Tree::ROOT, "a");
    let b = tree.add_subdirectory(a, "b");
    for (dir, name) in [(a, "one"), (b, "two")] {
        let mut file = FileNode::new(name);
        file.write(&[1; 600], &mut store).unwrap();
        tree[dir].add_file(file);
    }
    assert_eq!(store.free_count(), 4);
    assert_eq!(tree.remove_subdirectory(Tree::ROOT, a, &mut store), Some(1200));
    assert_eq!(store.free_count(), 8);
    assert!(!tree.is_live(a));
    assert!(!tree.is_live(b));
    assert!(tree.root().subdirectories().is_empty());
    // freed slots are reused
    let c = tree.add_subdirectory(Tree::ROOT, "c");
    assert!(c == a || c == b);
    assert_eq!(tree[c].parent(), Some(Tree::ROOT));
}
