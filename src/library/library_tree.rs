//! In-memory music library tree.
//!
//! Nodes live in an arena and reference each other by index; ownership of
//! the whole tree is the arena itself, so replacing a tree is dropping the
//! old arena. Directories carry an `is_enqueued` flag that is the logical OR
//! of `is_enqueued` over their descendants.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::debug;

use crate::media_file_discovery::is_supported_audio_file;

pub type NodeIndex = usize;

/// Sibling ordering applied while building or resorting the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySort {
    /// Natural-locale name ordering (default).
    Natural,
    /// Directories newest-first, files alphabetic.
    FoldersByAge,
}

impl LibrarySort {
    pub fn toggled(self) -> LibrarySort {
        match self {
            LibrarySort::Natural => LibrarySort::FoldersByAge,
            LibrarySort::FoldersByAge => LibrarySort::Natural,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LibraryNode {
    pub name: String,
    pub full_path: PathBuf,
    pub is_directory: bool,
    pub is_enqueued: bool,
    pub parent: Option<NodeIndex>,
    pub first_child: Option<NodeIndex>,
    pub next_sibling: Option<NodeIndex>,
}

/// Arena-owned directory tree rooted at the music root.
pub struct LibraryTree {
    arena: Vec<LibraryNode>,
    root: Option<NodeIndex>,
}

impl LibraryTree {
    pub fn empty() -> LibraryTree {
        LibraryTree {
            arena: Vec::new(),
            root: None,
        }
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn root(&self) -> Option<NodeIndex> {
        self.root
    }

    pub fn node(&self, index: NodeIndex) -> &LibraryNode {
        &self.arena[index]
    }

    pub(crate) fn push_node(&mut self, node: LibraryNode) -> NodeIndex {
        self.arena.push(node);
        self.arena.len() - 1
    }

    pub(crate) fn set_root(&mut self, root: Option<NodeIndex>) {
        self.root = root;
    }

    pub(crate) fn link_children(&mut self, parent: NodeIndex, children: &[NodeIndex]) {
        self.arena[parent].first_child = children.first().copied();
        for pair in children.windows(2) {
            self.arena[pair[0]].next_sibling = Some(pair[1]);
        }
        if let Some(last) = children.last() {
            self.arena[*last].next_sibling = None;
        }
        for child in children {
            self.arena[*child].parent = Some(parent);
        }
    }

    pub fn children(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        let mut cursor = self.arena[index].first_child;
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.arena[child].next_sibling;
        }
        out
    }

    /// Depth-first search for the node owning `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<NodeIndex> {
        self.arena.iter().position(|node| node.full_path == path)
    }

    /// First node whose name contains `query`, case-insensitively.
    /// Directories win over files at equal positions because they come
    /// first in arena order under their parent.
    pub fn search_by_name(&self, query: &str) -> Option<NodeIndex> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.arena
            .iter()
            .position(|node| node.parent.is_some() && node.name.to_lowercase().contains(&needle))
    }

    /// Audio leaves under `index` in sibling order (the node itself when it
    /// is a leaf).
    pub fn leaf_paths_under(&self, index: NodeIndex) -> Vec<PathBuf> {
        let mut leaves = Vec::new();
        self.collect_leaves(index, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, index: NodeIndex, out: &mut Vec<PathBuf>) {
        let node = &self.arena[index];
        if !node.is_directory {
            out.push(node.full_path.clone());
            return;
        }
        for child in self.children(index) {
            self.collect_leaves(child, out);
        }
    }

    /// Marks the leaf owning `path` enqueued and propagates the flag to its
    /// ancestors. The absolute root is never marked. Returns `false` when the
    /// path is not in the tree.
    pub fn mark_enqueued(&mut self, path: &Path) -> bool {
        let Some(index) = self.find_by_path(path) else {
            return false;
        };
        self.arena[index].is_enqueued = true;
        let mut cursor = self.arena[index].parent;
        while let Some(parent) = cursor {
            if self.arena[parent].parent.is_none() {
                break;
            }
            self.arena[parent].is_enqueued = true;
            cursor = self.arena[parent].parent;
        }
        true
    }

    /// Clears the leaf owning `path` and recomputes ancestor flags by
    /// reduction over children. Returns `false` when the path is unknown.
    pub fn mark_dequeued(&mut self, path: &Path) -> bool {
        let Some(index) = self.find_by_path(path) else {
            return false;
        };
        self.arena[index].is_enqueued = false;
        let mut cursor = self.arena[index].parent;
        while let Some(parent) = cursor {
            let any_child_enqueued = self
                .children(parent)
                .iter()
                .any(|child| self.arena[*child].is_enqueued);
            if any_child_enqueued {
                break;
            }
            self.arena[parent].is_enqueued = false;
            cursor = self.arena[parent].parent;
        }
        true
    }

    /// Copies `is_enqueued` flags from `old` using `full_path` as the key.
    ///
    /// Used when a rescan replaces the live tree so queue markers survive.
    pub fn copy_is_enqueued_from(&mut self, old: &LibraryTree) {
        for node in &old.arena {
            if node.is_enqueued && !node.is_directory {
                self.mark_enqueued(&node.full_path);
            }
        }
    }

    /// Enqueued-flag reduction check used by tests: a directory is enqueued
    /// exactly when some descendant leaf is.
    #[cfg(test)]
    pub fn directory_flags_consistent(&self) -> bool {
        self.arena.iter().enumerate().all(|(index, node)| {
            if !node.is_directory || node.parent.is_none() {
                return true;
            }
            let has_enqueued_leaf = self
                .leaf_paths_under(index)
                .iter()
                .any(|leaf| match self.find_by_path(leaf) {
                    Some(leaf_index) => self.arena[leaf_index].is_enqueued,
                    None => false,
                });
            node.is_enqueued == has_enqueued_leaf
        })
    }

    /// Depth-order traversal as `(depth, name, is_directory, full_path)`,
    /// the shape serialized into the cache file.
    pub fn depth_order(&self) -> Vec<(usize, String, bool, PathBuf)> {
        let mut out = Vec::with_capacity(self.arena.len());
        if let Some(root) = self.root {
            self.depth_order_from(root, 0, &mut out);
        }
        out
    }

    fn depth_order_from(
        &self,
        index: NodeIndex,
        depth: usize,
        out: &mut Vec<(usize, String, bool, PathBuf)>,
    ) {
        let node = &self.arena[index];
        out.push((depth, node.name.clone(), node.is_directory, node.full_path.clone()));
        for child in self.children(index) {
            self.depth_order_from(child, depth + 1, out);
        }
    }

    /// Walks the music root and builds a fresh tree. Directories with no
    /// audio beneath them are pruned. Fails when the root is unreadable.
    pub fn build_from_disk(root_path: &Path, sort: LibrarySort) -> Result<LibraryTree, String> {
        if !root_path.is_dir() {
            return Err(format!("{} is not a directory", root_path.display()));
        }

        let mut tree = LibraryTree::empty();
        let root_name = root_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| root_path.to_string_lossy().to_string());
        let root = tree.push_node(LibraryNode {
            name: root_name,
            full_path: root_path.to_path_buf(),
            is_directory: true,
            is_enqueued: false,
            parent: None,
            first_child: None,
            next_sibling: None,
        });
        tree.set_root(Some(root));
        tree.scan_directory_into(root, root_path, sort)?;
        debug!(
            "LibraryTree: built {} entries from {}",
            tree.len(),
            root_path.display()
        );
        Ok(tree)
    }

    fn scan_directory_into(
        &mut self,
        parent: NodeIndex,
        directory: &Path,
        sort: LibrarySort,
    ) -> Result<(), String> {
        let entries = std::fs::read_dir(directory)
            .map_err(|err| format!("Failed to read {}: {}", directory.display(), err))?;

        let mut subdirectories = Vec::new();
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                subdirectories.push(path);
            } else if is_supported_audio_file(&path) {
                files.push(path);
            }
        }
        sort_sibling_paths(&mut subdirectories, &mut files, sort);

        let mut children = Vec::new();
        for subdirectory in subdirectories {
            let name = entry_name(&subdirectory);
            let child = self.push_node(LibraryNode {
                name,
                full_path: subdirectory.clone(),
                is_directory: true,
                is_enqueued: false,
                parent: Some(parent),
                first_child: None,
                next_sibling: None,
            });
            // Unreadable subtrees are skipped rather than failing the scan.
            if self.scan_directory_into(child, &subdirectory, sort).is_err() {
                self.arena.truncate(child);
                continue;
            }
            if self.arena[child].first_child.is_none() {
                self.arena.truncate(child);
                continue;
            }
            children.push(child);
        }
        for file in files {
            let name = entry_name(&file);
            let child = self.push_node(LibraryNode {
                name,
                full_path: file,
                is_directory: false,
                is_enqueued: false,
                parent: Some(parent),
                first_child: None,
                next_sibling: None,
            });
            children.push(child);
        }

        self.link_children(parent, &children);
        Ok(())
    }

    /// Re-sorts every directory's children under the given ordering.
    pub fn resort(&mut self, sort: LibrarySort) {
        let directories: Vec<NodeIndex> = (0..self.arena.len())
            .filter(|index| self.arena[*index].is_directory)
            .collect();
        for directory in directories {
            let mut children = self.children(directory);
            children.sort_by(|left, right| {
                let left_node = &self.arena[*left];
                let right_node = &self.arena[*right];
                compare_siblings(
                    (left_node.is_directory, &left_node.name, &left_node.full_path),
                    (
                        right_node.is_directory,
                        &right_node.name,
                        &right_node.full_path,
                    ),
                    sort,
                )
            });
            self.link_children(directory, &children);
        }
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn directory_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn sort_sibling_paths(subdirectories: &mut [PathBuf], files: &mut [PathBuf], sort: LibrarySort) {
    match sort {
        LibrarySort::Natural => {
            subdirectories.sort_by(|left, right| {
                alphanumeric_sort::compare_str(&entry_name(left), &entry_name(right))
            });
            files.sort_by(|left, right| {
                alphanumeric_sort::compare_str(&entry_name(left), &entry_name(right))
            });
        }
        LibrarySort::FoldersByAge => {
            subdirectories.sort_by_key(|path| std::cmp::Reverse(directory_mtime(path)));
            files.sort_by(|left, right| entry_name(left).cmp(&entry_name(right)));
        }
    }
}

fn compare_siblings(
    left: (bool, &String, &PathBuf),
    right: (bool, &String, &PathBuf),
    sort: LibrarySort,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let (left_is_dir, left_name, left_path) = left;
    let (right_is_dir, right_name, right_path) = right;

    // Directories sort before files in both modes.
    match (left_is_dir, right_is_dir) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    match sort {
        LibrarySort::Natural => alphanumeric_sort::compare_str(left_name, right_name),
        LibrarySort::FoldersByAge => {
            if left_is_dir {
                directory_mtime(right_path).cmp(&directory_mtime(left_path))
            } else {
                left_name.cmp(right_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LibrarySort, LibraryTree};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_directory(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        let dir =
            std::env::temp_dir().join(format!("kew_{}_{}_{}", test_name, std::process::id(), nanos));
        std::fs::create_dir_all(&dir).expect("test directory should be created");
        dir
    }

    fn build_fixture_library(test_name: &str) -> (PathBuf, LibraryTree) {
        let root = unique_temp_directory(test_name);
        let album_a = root.join("Album A");
        let album_b = root.join("Album B");
        std::fs::create_dir_all(&album_a).expect("album dir should be created");
        std::fs::create_dir_all(&album_b).expect("album dir should be created");
        std::fs::create_dir_all(root.join("empty")).expect("empty dir should be created");
        std::fs::write(album_a.join("01 one.flac"), b"").expect("fixture should be writable");
        std::fs::write(album_a.join("02 two.flac"), b"").expect("fixture should be writable");
        std::fs::write(album_b.join("song.mp3"), b"").expect("fixture should be writable");
        std::fs::write(root.join("cover.jpg"), b"").expect("fixture should be writable");

        let tree = LibraryTree::build_from_disk(&root, LibrarySort::Natural)
            .expect("library should build");
        (root, tree)
    }

    #[test]
    fn test_build_prunes_empty_directories_and_non_audio_files() {
        let (root, tree) = build_fixture_library("tree_build");

        assert!(tree.find_by_path(&root.join("empty")).is_none());
        assert!(tree.find_by_path(&root.join("cover.jpg")).is_none());
        assert!(tree.find_by_path(&root.join("Album A/01 one.flac")).is_some());
        // Root, two album dirs, three leaves.
        assert_eq!(tree.len(), 6);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_mark_enqueued_propagates_to_ancestors_but_not_root() {
        let (root, mut tree) = build_fixture_library("tree_mark");
        let leaf = root.join("Album A/01 one.flac");

        assert!(tree.mark_enqueued(&leaf));
        let album = tree.find_by_path(&root.join("Album A")).unwrap();
        assert!(tree.node(album).is_enqueued);
        let tree_root = tree.root().unwrap();
        assert!(!tree.node(tree_root).is_enqueued);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_enqueue_then_dequeue_restores_prior_flags() {
        let (root, mut tree) = build_fixture_library("tree_roundtrip");
        let leaf_one = root.join("Album A/01 one.flac");
        let leaf_two = root.join("Album A/02 two.flac");

        tree.mark_enqueued(&leaf_one);
        tree.mark_enqueued(&leaf_two);
        tree.mark_dequeued(&leaf_one);

        let album = tree.find_by_path(&root.join("Album A")).unwrap();
        assert!(tree.node(album).is_enqueued, "sibling still enqueued");
        assert!(tree.directory_flags_consistent());

        tree.mark_dequeued(&leaf_two);
        assert!(!tree.node(album).is_enqueued);
        assert!(tree.directory_flags_consistent());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_copy_is_enqueued_preserves_flags_across_trees() {
        let (root, mut old_tree) = build_fixture_library("tree_copy");
        let leaf = root.join("Album B/song.mp3");
        old_tree.mark_enqueued(&leaf);

        let mut new_tree = LibraryTree::build_from_disk(&root, LibrarySort::Natural)
            .expect("library should rebuild");
        new_tree.copy_is_enqueued_from(&old_tree);

        let index = new_tree.find_by_path(&leaf).unwrap();
        assert!(new_tree.node(index).is_enqueued);
        assert!(new_tree.directory_flags_consistent());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_leaf_paths_under_directory_follow_sibling_order() {
        let (root, tree) = build_fixture_library("tree_leaves");
        let album = tree.find_by_path(&root.join("Album A")).unwrap();
        let leaves = tree.leaf_paths_under(album);
        assert_eq!(
            leaves,
            vec![
                root.join("Album A/01 one.flac"),
                root.join("Album A/02 two.flac"),
            ]
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_resort_orders_naturally_by_numeric_value() {
        let root = unique_temp_directory("tree_natural");
        let album = root.join("Album");
        std::fs::create_dir_all(&album).expect("album dir should be created");
        std::fs::write(album.join("2 b.flac"), b"").expect("fixture should be writable");
        std::fs::write(album.join("10 c.flac"), b"").expect("fixture should be writable");
        std::fs::write(album.join("1 a.flac"), b"").expect("fixture should be writable");

        let tree = LibraryTree::build_from_disk(&root, LibrarySort::Natural)
            .expect("library should build");
        let album_index = tree.find_by_path(&album).unwrap();
        let names: Vec<String> = tree
            .children(album_index)
            .iter()
            .map(|child| tree.node(*child).name.clone())
            .collect();
        assert_eq!(names, vec!["1 a.flac", "2 b.flac", "10 c.flac"]);

        let _ = std::fs::remove_dir_all(&root);
    }
}
