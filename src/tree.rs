//! File-tree description and the parallel workspace walker.
//!
//! A walk produces a [`FileTree`] rooted at the workspace directory with
//! every path stored relative to that root. The wire codec in this module
//! is self-describing and validates, on decode, that no reconstructed path
//! can escape the root: names must be single normal components and sibling
//! names must be unique.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::filter::RuleSet;
use crate::fsutil::{mtime_millis, perm_bits, valid_name};
use crate::message::BodyReader;

/// Directories narrower than this recurse sequentially; wider ones fan
/// out one task per entry.
const PARALLEL_WIDTH: usize = 16;

/// Nesting deeper than this is rejected by the decoder.
const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    File,
    Directory,
    Symlink,
    Other,
}

impl NodeType {
    pub fn code(self) -> u8 {
        match self {
            NodeType::File => 0,
            NodeType::Directory => 1,
            NodeType::Symlink => 2,
            NodeType::Other => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => NodeType::File,
            1 => NodeType::Directory,
            2 => NodeType::Symlink,
            3 => NodeType::Other,
            other => bail!("unknown node type {}", other),
        })
    }

    /// Only files and directories participate in synchronisation.
    pub fn synced(self) -> bool {
        matches!(self, NodeType::File | NodeType::Directory)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTree {
    pub node_type: NodeType,
    pub name: String,
    pub size: u64,
    pub mtime_millis: i64,
    pub perm_bits: u32,
    /// Relative to the workspace root; empty for the root node itself.
    pub path: PathBuf,
    pub children: Vec<FileTree>,
}

impl FileTree {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }

    pub fn child(&self, name: &str) -> Option<&FileTree> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Total number of nodes including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FileTree::node_count).sum::<usize>()
    }
}

/// Describe `root` as a tree, pruning anything the ignore rules select.
///
/// Attribute reads happen once per node; a node whose attributes cannot be
/// read is dropped with a warning rather than failing the parent. Wide
/// directories are walked in parallel.
pub fn glob_files_relative(root: &Path, ignore: &RuleSet) -> Result<FileTree> {
    let md = std::fs::metadata(root)
        .with_context(|| format!("stat workspace root {}", root.display()))?;
    if !md.is_dir() {
        bail!("workspace root {} is not a directory", root.display());
    }
    let mut node = FileTree {
        node_type: NodeType::Directory,
        name: String::new(),
        size: 0,
        mtime_millis: mtime_millis(&md),
        perm_bits: perm_bits(&md),
        path: PathBuf::new(),
        children: Vec::new(),
    };
    node.children = walk_children(root, Path::new(""), ignore);
    Ok(node)
}

fn walk_children(abs_dir: &Path, rel_dir: &Path, ignore: &RuleSet) -> Vec<FileTree> {
    let entries = match std::fs::read_dir(abs_dir) {
        Ok(iter) => {
            let mut v: Vec<_> = Vec::new();
            for entry in iter {
                match entry {
                    Ok(e) => v.push(e),
                    Err(e) => warn!("skipping unreadable entry under {}: {}", abs_dir.display(), e),
                }
            }
            v
        }
        Err(e) => {
            warn!("skipping unreadable directory {}: {}", abs_dir.display(), e);
            return Vec::new();
        }
    };

    let walk_one = |entry: &std::fs::DirEntry| -> Option<FileTree> {
        let name = entry.file_name().to_str()?.to_string();
        let abs = entry.path();
        let rel = rel_dir.join(&name);
        let md = match std::fs::symlink_metadata(&abs) {
            Ok(md) => md,
            Err(e) => {
                warn!("dropping {}: attributes unreadable: {}", abs.display(), e);
                return None;
            }
        };
        let node_type = if md.file_type().is_symlink() {
            NodeType::Symlink
        } else if md.is_dir() {
            NodeType::Directory
        } else if md.is_file() {
            NodeType::File
        } else {
            NodeType::Other
        };
        if ignore.matches(&rel, node_type == NodeType::Directory) {
            return None;
        }
        let mut node = FileTree {
            node_type,
            name,
            size: if node_type == NodeType::File { md.len() } else { 0 },
            mtime_millis: mtime_millis(&md),
            perm_bits: perm_bits(&md),
            path: rel.clone(),
            children: Vec::new(),
        };
        if node_type == NodeType::Directory {
            node.children = walk_children(&abs, &rel, ignore);
        }
        Some(node)
    };

    if entries.len() < PARALLEL_WIDTH {
        entries.iter().filter_map(walk_one).collect()
    } else {
        use rayon::prelude::*;
        entries.par_iter().filter_map(walk_one).collect()
    }
}

// Wire codec.
//
// Per node: type u8 | perm u32 | size u64 | mtime i64 | name_len u16 |
// name | child_count u32 | children. The root node's name is empty.

pub fn encode_tree(tree: &FileTree, out: &mut Vec<u8>) {
    out.push(tree.node_type.code());
    out.extend_from_slice(&tree.perm_bits.to_be_bytes());
    out.extend_from_slice(&tree.size.to_be_bytes());
    out.extend_from_slice(&tree.mtime_millis.to_be_bytes());
    out.extend_from_slice(&(tree.name.len() as u16).to_be_bytes());
    out.extend_from_slice(tree.name.as_bytes());
    out.extend_from_slice(&(tree.children.len() as u32).to_be_bytes());
    for child in &tree.children {
        encode_tree(child, out);
    }
}

pub fn tree_to_bytes(tree: &FileTree) -> Vec<u8> {
    let mut out = Vec::new();
    encode_tree(tree, &mut out);
    out
}

/// Decode a tree and rebuild relative paths. Rejects duplicate sibling
/// names, path-component escapes, and trailing bytes.
pub fn tree_from_bytes(data: &[u8]) -> Result<FileTree> {
    let mut r = BodyReader::new(data);
    let tree = decode_node(&mut r, Path::new(""), 0, true)?;
    if r.remaining() != 0 {
        bail!("trailing bytes after tree");
    }
    Ok(tree)
}

fn decode_node(
    r: &mut BodyReader<'_>,
    parent: &Path,
    depth: usize,
    is_root: bool,
) -> Result<FileTree> {
    if depth > MAX_DEPTH {
        bail!("tree nesting exceeds {} levels", MAX_DEPTH);
    }
    let node_type = NodeType::from_code(r.u8()?)?;
    let perm = r.u32()?;
    let size = r.u64()?;
    let mtime = r.i64()?;
    let name_len = r.u16()? as usize;
    let name = std::str::from_utf8(r.bytes(name_len).context("node name")?)
        .context("node name is not UTF-8")?
        .to_string();
    if is_root {
        if !name.is_empty() {
            bail!("tree root must be unnamed");
        }
    } else if !valid_name(&name) {
        bail!("illegal node name {:?}", name);
    }
    let path = if is_root {
        PathBuf::new()
    } else {
        parent.join(&name)
    };
    let child_count = r.u32()? as usize;
    let mut children = Vec::with_capacity(child_count.min(1 << 16));
    let mut seen = HashSet::with_capacity(child_count.min(1 << 16));
    for _ in 0..child_count {
        let child = decode_node(r, &path, depth + 1, false)?;
        if !seen.insert(child.name.clone()) {
            bail!("duplicate sibling name {:?} under {:?}", child.name, path);
        }
        children.push(child);
    }
    Ok(FileTree {
        node_type,
        name,
        size,
        mtime_millis: mtime,
        perm_bits: perm,
        path,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file(name: &str, size: u64, mtime: i64) -> FileTree {
        FileTree {
            node_type: NodeType::File,
            name: name.to_string(),
            size,
            mtime_millis: mtime,
            perm_bits: 0o644,
            path: PathBuf::from(name),
            children: Vec::new(),
        }
    }

    fn sample_tree() -> FileTree {
        let mut sub = FileTree {
            node_type: NodeType::Directory,
            name: "sub".into(),
            size: 0,
            mtime_millis: 5,
            perm_bits: 0o755,
            path: "sub".into(),
            children: vec![],
        };
        let mut inner = file("inner.txt", 10, 99);
        inner.path = PathBuf::from("sub/inner.txt");
        sub.children.push(inner);
        FileTree {
            node_type: NodeType::Directory,
            name: String::new(),
            size: 0,
            mtime_millis: 1,
            perm_bits: 0o755,
            path: PathBuf::new(),
            children: vec![file("a.txt", 3, 7), sub],
        }
    }

    #[test]
    fn wire_round_trip_preserves_everything() {
        let tree = sample_tree();
        let bytes = tree_to_bytes(&tree);
        let back = tree_from_bytes(&bytes).unwrap();
        assert_eq!(back, tree);
        assert_eq!(back.child("sub").unwrap().children[0].path, PathBuf::from("sub/inner.txt"));
    }

    #[test]
    fn duplicate_siblings_are_rejected() {
        let mut tree = sample_tree();
        tree.children.push(file("a.txt", 1, 1));
        let bytes = tree_to_bytes(&tree);
        assert!(tree_from_bytes(&bytes).is_err());
    }

    #[test]
    fn escaping_names_are_rejected() {
        for bad in ["..", ".", "a/b", ""] {
            let mut tree = sample_tree();
            tree.children[0].name = bad.to_string();
            let bytes = tree_to_bytes(&tree);
            assert!(tree_from_bytes(&bytes).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn truncated_tree_fails() {
        let bytes = tree_to_bytes(&sample_tree());
        assert!(tree_from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn walk_reports_relative_paths_and_sizes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d1/d2")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("d1/d2/deep.bin"), vec![0u8; 512]).unwrap();

        let tree = glob_files_relative(dir.path(), &RuleSet::default()).unwrap();
        assert!(tree.is_dir());
        assert_eq!(tree.name, "");
        let top = tree.child("top.txt").unwrap();
        assert_eq!(top.size, 3);
        assert_eq!(top.path, PathBuf::from("top.txt"));
        let deep = tree
            .child("d1")
            .and_then(|d| d.child("d2"))
            .and_then(|d| d.child("deep.bin"))
            .unwrap();
        assert_eq!(deep.size, 512);
        assert_eq!(deep.path, PathBuf::from("d1/d2/deep.bin"));
        assert!(deep.mtime_millis > 0);
    }

    #[test]
    fn walk_prunes_ignored_subtrees() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/x.js"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.js"), b"k").unwrap();
        std::fs::write(dir.path().join("skip.log"), b"l").unwrap();

        let ignore = RuleSet::parse(["node_modules/", "*.log"]).unwrap();
        let tree = glob_files_relative(dir.path(), &ignore).unwrap();
        assert!(tree.child("node_modules").is_none());
        assert!(tree.child("skip.log").is_none());
        assert!(tree.child("keep.js").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_typed_not_followed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

        let tree = glob_files_relative(dir.path(), &RuleSet::default()).unwrap();
        assert_eq!(tree.child("link").unwrap().node_type, NodeType::Symlink);
    }

    #[test]
    fn wide_directories_walk_in_parallel() {
        let dir = TempDir::new().unwrap();
        for i in 0..64 {
            std::fs::write(dir.path().join(format!("f{i:02}.dat")), b"x").unwrap();
        }
        let tree = glob_files_relative(dir.path(), &RuleSet::default()).unwrap();
        assert_eq!(tree.children.len(), 64);
    }
}
