//! Reference Edge: one outgoing library reference from a [`crate::node::BinaryNode`].

use std::path::PathBuf;

use crate::graph::NodeId;

/// The key under which an edge is stored within its owning node's edge
/// list: the resolved path when known, otherwise the raw token. Two edges
/// of the same node must never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKey {
    Resolved(PathBuf),
    Raw(String),
}

/// One load-command reference from a binary to another library.
///
/// States progress `Created -> Resolved? -> Bound -> Rewritten`.
/// `Created`/`Resolved` are represented by `resolved_path`;
/// `Bound` by `target_node`; `Rewritten` is not tracked on the edge itself
/// since it is a one-shot terminal action performed by
/// [`crate::rewrite::rewrite_all`].
#[derive(Debug, Clone)]
pub struct Edge {
    /// The exact string as it appears in the load command.
    pub raw_token: String,
    /// Absolute host path, if resolution succeeded at construction time or
    /// during finalize recovery.
    pub resolved_path: Option<PathBuf>,
    /// The node this edge will point at after rewriting, once known.
    pub target_node: Option<NodeId>,
}

impl Edge {
    pub fn new(raw_token: String, resolved_path: Option<PathBuf>) -> Self {
        Self {
            raw_token,
            resolved_path,
            target_node: None,
        }
    }

    pub fn key(&self) -> EdgeKey {
        match &self.resolved_path {
            Some(path) => EdgeKey::Resolved(path.clone()),
            None => EdgeKey::Raw(self.raw_token.clone()),
        }
    }

    /// True iff this edge is satisfied by an in-bundle file. Implies
    /// `target_node` and `resolved_path` are both set.
    pub fn is_copied(&self) -> bool {
        self.target_node.is_some()
    }

    pub fn bind(&mut self, target: NodeId, resolved_path: PathBuf) {
        self.target_node = Some(target);
        self.resolved_path = Some(resolved_path);
    }
}
