//! Sync-plan construction and wire codec.
//!
//! Comparing a local and a remote [`FileTree`] yields a forest of actions.
//! `Upload` on a directory means "ensure it exists"; on a file it means
//! "transfer bytes and metadata". `DeleteRemote` on a directory implies
//! recursive deletion. `None` nodes only survive while some descendant
//! carries a real action.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::message::BodyReader;
use crate::tree::{FileTree, NodeType};
use crate::fsutil::valid_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Upload,
    DeleteRemote,
}

impl Action {
    fn code(self) -> u8 {
        match self {
            Action::None => 0,
            Action::Upload => 1,
            Action::DeleteRemote => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Action::None,
            1 => Action::Upload,
            2 => Action::DeleteRemote,
            other => bail!("unknown plan action {}", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub name: String,
    pub node_type: NodeType,
    pub path: PathBuf,
    pub action: Action,
    pub children: Vec<SyncPlan>,
}

impl SyncPlan {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    /// Number of nodes carrying a real action.
    pub fn action_count(&self) -> usize {
        usize::from(self.action != Action::None)
            + self.children.iter().map(SyncPlan::action_count).sum::<usize>()
    }

    pub fn contains_delete(&self) -> bool {
        self.action == Action::DeleteRemote
            || self.children.iter().any(SyncPlan::contains_delete)
    }
}

/// Compare two workspace roots and emit the action forest.
///
/// `clock_skew_millis` is remote minus local; it is added to local mtimes
/// before comparison so a fast-running remote clock does not mask real
/// changes. On identical corrected mtimes the local file is treated as not
/// newer and skipped.
pub fn build_plan(
    local: Option<&FileTree>,
    remote: Option<&FileTree>,
    clock_skew_millis: i64,
) -> Vec<SyncPlan> {
    // The roots themselves are never uploaded or deleted; a missing side
    // behaves like an empty directory.
    match (local, remote) {
        (Some(l), Some(r)) if l.is_dir() && r.is_dir() => {
            diff_children(l, r, clock_skew_millis)
        }
        (Some(l), None) if l.is_dir() => l
            .children
            .iter()
            .filter(|c| c.node_type.synced())
            .map(upload_subtree)
            .collect(),
        (None, Some(r)) if r.is_dir() => r
            .children
            .iter()
            .filter(|c| c.node_type.synced())
            .map(delete_node)
            .collect(),
        _ => diff(local, remote, clock_skew_millis),
    }
}

fn diff(local: Option<&FileTree>, remote: Option<&FileTree>, skew: i64) -> Vec<SyncPlan> {
    let local = local.filter(|n| n.node_type.synced());
    let remote = remote.filter(|n| n.node_type.synced());
    match (local, remote) {
        (None, None) => Vec::new(),
        (None, Some(r)) => vec![delete_node(r)],
        (Some(l), None) => vec![upload_subtree(l)],
        (Some(l), Some(r)) => {
            if l.node_type != r.node_type {
                // Deletion first so the server clears the slot before the
                // replacement arrives.
                return vec![delete_node(r), upload_subtree(l)];
            }
            match l.node_type {
                NodeType::File => {
                    if l.mtime_millis.saturating_add(skew) <= r.mtime_millis {
                        Vec::new()
                    } else {
                        vec![upload_node(l, Vec::new())]
                    }
                }
                NodeType::Directory => {
                    let children = diff_children(l, r, skew);
                    if children.is_empty() {
                        Vec::new()
                    } else {
                        vec![SyncPlan {
                            name: l.name.clone(),
                            node_type: NodeType::Directory,
                            path: l.path.clone(),
                            action: Action::None,
                            children,
                        }]
                    }
                }
                _ => Vec::new(),
            }
        }
    }
}

fn diff_children(local: &FileTree, remote: &FileTree, skew: i64) -> Vec<SyncPlan> {
    let mut union: BTreeMap<&str, (Option<&FileTree>, Option<&FileTree>)> = BTreeMap::new();
    for child in &local.children {
        union.entry(child.name.as_str()).or_default().0 = Some(child);
    }
    for child in &remote.children {
        union.entry(child.name.as_str()).or_default().1 = Some(child);
    }
    union
        .into_values()
        .flat_map(|(l, r)| diff(l, r, skew))
        .collect()
}

fn delete_node(remote: &FileTree) -> SyncPlan {
    SyncPlan {
        name: remote.name.clone(),
        node_type: remote.node_type,
        path: remote.path.clone(),
        action: Action::DeleteRemote,
        children: Vec::new(),
    }
}

fn upload_node(local: &FileTree, children: Vec<SyncPlan>) -> SyncPlan {
    SyncPlan {
        name: local.name.clone(),
        node_type: local.node_type,
        path: local.path.clone(),
        action: Action::Upload,
        children,
    }
}

fn upload_subtree(local: &FileTree) -> SyncPlan {
    let children = if local.is_dir() {
        local
            .children
            .iter()
            .filter(|c| c.node_type.synced())
            .map(upload_subtree)
            .collect()
    } else {
        Vec::new()
    };
    upload_node(local, children)
}

/// Drop every `DeleteRemote` node, pruning `None` directories left empty.
/// Used by the client's `--dangling keep` policy.
pub fn strip_deletes(forest: Vec<SyncPlan>) -> Vec<SyncPlan> {
    forest
        .into_iter()
        .filter_map(|mut node| {
            if node.action == Action::DeleteRemote {
                return None;
            }
            node.children = strip_deletes(node.children);
            if node.action == Action::None && node.children.is_empty() {
                return None;
            }
            Some(node)
        })
        .collect()
}

// Wire codec. Per node: action u8 | type u8 | name_len u16 | name |
// child_count u32 | children.

pub fn plan_to_bytes(plan: &SyncPlan) -> Vec<u8> {
    let mut out = Vec::new();
    encode_plan(plan, &mut out);
    out
}

fn encode_plan(plan: &SyncPlan, out: &mut Vec<u8>) {
    out.push(plan.action.code());
    out.push(plan.node_type.code());
    out.extend_from_slice(&(plan.name.len() as u16).to_be_bytes());
    out.extend_from_slice(plan.name.as_bytes());
    out.extend_from_slice(&(plan.children.len() as u32).to_be_bytes());
    for child in &plan.children {
        encode_plan(child, out);
    }
}

pub fn plan_from_bytes(data: &[u8]) -> Result<SyncPlan> {
    let mut r = BodyReader::new(data);
    let plan = decode_plan(&mut r, Path::new(""), 0)?;
    if r.remaining() != 0 {
        bail!("trailing bytes after plan");
    }
    Ok(plan)
}

fn decode_plan(r: &mut BodyReader<'_>, parent: &Path, depth: usize) -> Result<SyncPlan> {
    if depth > 512 {
        bail!("plan nesting exceeds 512 levels");
    }
    let action = Action::from_code(r.u8()?)?;
    let node_type = NodeType::from_code(r.u8()?)?;
    let name_len = r.u16()? as usize;
    let name = std::str::from_utf8(r.bytes(name_len).context("plan node name")?)
        .context("plan node name is not UTF-8")?
        .to_string();
    if !valid_name(&name) {
        bail!("illegal plan node name {:?}", name);
    }
    let path = parent.join(&name);
    let child_count = r.u32()? as usize;
    let mut children = Vec::with_capacity(child_count.min(1 << 16));
    for _ in 0..child_count {
        children.push(decode_plan(r, &path, depth + 1)?);
    }
    Ok(SyncPlan {
        name,
        node_type,
        path,
        action,
        children,
    })
}
