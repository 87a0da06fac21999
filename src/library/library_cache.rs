//! Flat on-disk cache of the library tree.
//!
//! One record per node in depth order:
//! `depth <TAB> is_directory <TAB> name_len <TAB> name <TAB> path_len <TAB> full_path`.
//! The depth field defines the parent-child relationship on reload. Any
//! malformed record abandons the cache; callers fall back to a full scan.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::library::library_tree::{LibraryNode, LibraryTree, NodeIndex};

/// Serializes the tree to `path`. Errors are reported, not fatal.
pub fn save_tree(path: &Path, tree: &LibraryTree) -> Result<(), String> {
    let mut content = String::new();
    for (depth, name, is_directory, full_path) in tree.depth_order() {
        let path_text = full_path.to_string_lossy();
        content.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            depth,
            if is_directory { 1 } else { 0 },
            name.len(),
            name,
            path_text.len(),
            path_text,
        ));
    }
    std::fs::write(path, content)
        .map_err(|err| format!("Failed to write library cache {}: {}", path.display(), err))
}

fn parse_record(line: &str) -> Option<(usize, bool, String, PathBuf)> {
    let mut fields = line.splitn(6, '\t');
    let depth = fields.next()?.parse::<usize>().ok()?;
    let is_directory = match fields.next()? {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    let name_len = fields.next()?.parse::<usize>().ok()?;
    let name = fields.next()?;
    if name.len() != name_len {
        return None;
    }
    let path_len = fields.next()?.parse::<usize>().ok()?;
    let path_text = fields.next()?;
    if path_text.len() != path_len {
        return None;
    }
    Some((depth, is_directory, name.to_string(), PathBuf::from(path_text)))
}

/// Reconstructs a tree from the cache file.
///
/// Returns `None` when the file is missing or any record is malformed, so
/// the caller schedules a full rescan instead of erroring.
pub fn load_tree(path: &Path) -> Option<LibraryTree> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut tree = LibraryTree::empty();
    // Stack of (depth, node, children-so-far) along the current spine.
    let mut spine: Vec<(usize, NodeIndex, Vec<NodeIndex>)> = Vec::new();

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((depth, is_directory, name, full_path)) = parse_record(line) else {
            warn!("Library cache {} is corrupt, rescanning", path.display());
            return None;
        };

        while spine.last().is_some_and(|(spine_depth, _, _)| *spine_depth >= depth) {
            let (_, finished, children) = spine.pop().expect("spine entry should exist");
            tree.link_children(finished, &children);
        }
        if depth > 0 && spine.is_empty() {
            warn!("Library cache {} has a dangling record, rescanning", path.display());
            return None;
        }
        if depth != spine.len() {
            warn!("Library cache {} has inconsistent depths, rescanning", path.display());
            return None;
        }

        let index = tree.push_node(LibraryNode {
            name,
            full_path,
            is_directory,
            is_enqueued: false,
            parent: None,
            first_child: None,
            next_sibling: None,
        });
        if depth == 0 {
            if tree.root().is_some() {
                warn!("Library cache {} has multiple roots, rescanning", path.display());
                return None;
            }
            tree.set_root(Some(index));
        } else if let Some((_, _, children)) = spine.last_mut() {
            children.push(index);
        }
        if is_directory {
            spine.push((depth, index, Vec::new()));
        }
    }

    while let Some((_, finished, children)) = spine.pop() {
        tree.link_children(finished, &children);
    }

    if tree.root().is_none() {
        return None;
    }
    debug!(
        "Library cache {} reconstructed {} entries",
        path.display(),
        tree.len()
    );
    Some(tree)
}

#[cfg(test)]
mod tests {
    use super::{load_tree, save_tree};
    use crate::library::library_tree::{LibrarySort, LibraryTree};
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
        let album = root.join("Album");
        let nested = album.join("Disc 1");
        std::fs::create_dir_all(&nested).expect("dirs should be created");
        std::fs::write(album.join("a.flac"), b"").expect("fixture should be writable");
        std::fs::write(nested.join("b.mp3"), b"").expect("fixture should be writable");

        let tree = LibraryTree::build_from_disk(&root, LibrarySort::Natural)
            .expect("library should build");
        (root, tree)
    }

    #[test]
    fn test_save_then_load_yields_isomorphic_tree() {
        let (root, tree) = build_fixture_library("cache_roundtrip");
        let cache_path = root.join("library.cache");

        save_tree(&cache_path, &tree).expect("cache should save");
        let reloaded = load_tree(&cache_path).expect("cache should load");

        assert_eq!(tree.depth_order(), reloaded.depth_order());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_corrupt_record_abandons_cache() {
        let (root, tree) = build_fixture_library("cache_corrupt");
        let cache_path = root.join("library.cache");
        save_tree(&cache_path, &tree).expect("cache should save");

        let mut content =
            std::fs::read_to_string(&cache_path).expect("cache should be readable");
        content.push_str("not\ta\tvalid\trecord\n");
        std::fs::write(&cache_path, content).expect("cache should be writable");

        assert!(load_tree(&cache_path).is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_length_mismatch_is_treated_as_corruption() {
        let (root, _tree) = build_fixture_library("cache_length");
        let cache_path = root.join("library.cache");
        std::fs::write(&cache_path, "0\t1\t99\tMusic\t6\t/music\n")
            .expect("cache should be writable");

        assert!(load_tree(&cache_path).is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_cache_file_returns_none() {
        let root = unique_temp_directory("cache_missing");
        assert!(load_tree(&root.join("library.cache")).is_none());
        let _ = std::fs::remove_dir_all(&root);
    }
}
