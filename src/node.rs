//! Binary Node: the per-binary record of a file participating in the bundle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::config::FreezeOptions;
use crate::edge::Edge;
use crate::error::{FreezeError, Result};
use crate::graph::NodeId;
use crate::macho::{self, Command};
use crate::resolve;

/// One Mach-O (or non-Mach-O) file participating in the bundle.
///
/// `referrer` is set once at construction and never mutated afterwards:
/// it records only the node that *first* introduced this file into the
/// graph, so a referrer chain can never become a cycle even if the
/// underlying Mach-O files reference each other both ways.
#[derive(Debug, Clone)]
pub struct BinaryNode {
    pub source_path: PathBuf,
    pub copied_path: PathBuf,
    pub referrer: Option<NodeId>,
    pub is_mach_o: bool,
    pub commands: Vec<Command>,
    pub effective_search_path: Vec<PathBuf>,
    pub outgoing_edges: Vec<Edge>,
}

impl BinaryNode {
    /// Construct a node for `source_path`, to be copied to `copied_path`,
    /// introduced by `referrer` (whose id and already-computed effective
    /// search path are supplied by the caller — [`crate::graph::GraphTracker`],
    /// which alone has access to sibling nodes).
    pub fn new(
        source_path: &Path,
        copied_path: &Path,
        referrer: Option<(NodeId, &[PathBuf])>,
        options: &FreezeOptions,
    ) -> Result<Self> {
        let canonical_source = fs::canonicalize(source_path)
            .map_err(|source| FreezeError::io(source_path, source))?;

        if !macho::is_mach_o(&canonical_source) {
            return Ok(Self {
                source_path: canonical_source,
                copied_path: copied_path.to_path_buf(),
                referrer: referrer.map(|(id, _)| id),
                is_mach_o: false,
                commands: Vec::new(),
                effective_search_path: Vec::new(),
                outgoing_edges: Vec::new(),
            });
        }

        let commands = macho::load_commands(&canonical_source)?;
        let referrer_id = referrer.map(|(id, _)| id);
        let referrer_search_path = referrer.map(|(_, path)| path).unwrap_or(&[]);
        let effective_search_path =
            Self::compute_effective_search_path(&canonical_source, &commands, referrer_search_path);

        let mut outgoing_edges = Vec::with_capacity(commands.len());
        let mut seen_keys = HashSet::new();
        for command in &commands {
            let Command::LoadDylib { path: token } = command else {
                continue;
            };
            let resolved = resolve::resolve(
                token,
                &canonical_source,
                &effective_search_path,
                options.executable_root.as_deref(),
                options.strict,
            )?;
            let edge = Edge::new(token.clone(), resolved);
            if !seen_keys.insert(edge.key()) {
                return Err(FreezeError::CollidingReferences {
                    path: canonical_source.clone(),
                    resolved: match edge.resolved_path {
                        Some(p) => p,
                        None => PathBuf::from(token),
                    },
                });
            }
            outgoing_edges.push(edge);
        }

        Ok(Self {
            source_path: canonical_source,
            copied_path: copied_path.to_path_buf(),
            referrer: referrer_id,
            is_mach_o: true,
            commands,
            effective_search_path,
            outgoing_edges,
        })
    }

    /// rpath entries are prepended by the referrer's search path
    /// (referrer-first, self-last), matching dyld's observed rpath
    /// search order.
    fn compute_effective_search_path(
        source_path: &Path,
        commands: &[Command],
        referrer_search_path: &[PathBuf],
    ) -> Vec<PathBuf> {
        let own_dir = source_path.parent();
        let mut own: Vec<PathBuf> = commands
            .iter()
            .filter_map(|c| match c {
                Command::Rpath { path } => Some(path),
                _ => None,
            })
            .filter_map(|raw| {
                let candidate = if let Some(rest) = raw
                    .strip_prefix("@loader_path/")
                    .or_else(|| raw.strip_prefix("@executable_path/"))
                {
                    own_dir.map(|dir| dir.join(rest))
                } else {
                    Some(PathBuf::from(raw))
                };
                candidate.filter(|c| c.is_dir())
            })
            .collect();

        let mut path = referrer_search_path.to_vec();
        path.append(&mut own);
        path
    }

    pub fn load_references(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|c| match c {
            Command::LoadDylib { path } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn rpath_entries(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|c| match c {
            Command::Rpath { path } => Some(path.as_str()),
            _ => None,
        })
    }

    /// How deep this node is in the dynamic load chain (0 for a root).
    pub fn referrer_depth(&self, nodes: &[BinaryNode]) -> usize {
        match self.referrer {
            None => 0,
            Some(id) => 1 + nodes[id.index()].referrer_depth(nodes),
        }
    }

    /// Multi-line diagnostic dump, used in the fatal-error path when a
    /// reference cannot be resolved even after finalize recovery.
    pub fn describe(&self) -> String {
        let mut out = format!("Mach-O file: {}\n", self.source_path.display());
        out.push_str("  Effective search path:\n");
        if self.effective_search_path.is_empty() {
            out.push_str("    [none]\n");
        }
        for dir in &self.effective_search_path {
            out.push_str(&format!("    {}\n", dir.display()));
        }
        out.push_str("  Outgoing references:\n");
        if self.outgoing_edges.is_empty() {
            out.push_str("    [none]\n");
        }
        for edge in &self.outgoing_edges {
            match &edge.resolved_path {
                Some(resolved) => {
                    out.push_str(&format!("    {} -> {}\n", edge.raw_token, resolved.display()))
                }
                None => out.push_str(&format!("    {} -> [unresolved]\n", edge.raw_token)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_mach_o_file_is_marked_inert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"not a binary").unwrap();

        let node = BinaryNode::new(&path, &path, None, &FreezeOptions::default()).unwrap();
        assert!(!node.is_mach_o);
        assert!(node.outgoing_edges.is_empty());
        assert!(node.effective_search_path.is_empty());
    }

    #[test]
    fn referrer_depth_walks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"y").unwrap();

        let root = BinaryNode::new(&a, &a, None, &FreezeOptions::default()).unwrap();
        let nodes = vec![root];
        let child = BinaryNode::new(
            &b,
            &b,
            Some((NodeId::new(0), &nodes[0].effective_search_path)),
            &FreezeOptions::default(),
        )
        .unwrap();
        let mut all = nodes;
        all.push(child);
        assert_eq!(all[0].referrer_depth(&all), 0);
        assert_eq!(all[1].referrer_depth(&all), 1);
    }
}
