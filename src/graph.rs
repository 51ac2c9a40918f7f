//! Graph Tracker: owns every [`BinaryNode`] for one freeze operation,
//! indexes them by copied/source path, and finalizes unresolved edges
//! once the whole dependency traversal is complete.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::Serialize;

use crate::config::FreezeOptions;
use crate::error::{FreezeError, Result};
use crate::node::BinaryNode;

/// Index of a [`BinaryNode`] within a [`GraphTracker`].
///
/// An index into the tracker's node vector, rather than a reference or
/// `Rc`, so that `target_node` pointers on edges don't entangle lifetimes
/// with the tracker that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Default)]
pub struct GraphTracker {
    nodes: Vec<BinaryNode>,
    by_copied_path: HashMap<PathBuf, NodeId>,
    by_source_path: HashMap<PathBuf, NodeId>,
    /// Optional convenience cache keyed on source path. Not populated
    /// automatically by the core; a driver may use it to avoid
    /// recomputing a resolution it already performed.
    reference_cache: HashMap<PathBuf, Option<PathBuf>>,
}

impl GraphTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source_path` is being (or has been) copied to
    /// `copied_path`, introduced by `referrer`. Creates and returns a new
    /// node, or an existing one per these rules:
    /// - same source re-presented for the same copied slot: idempotent,
    ///   returns the existing node.
    /// - a different source presented for an already-occupied copied
    ///   slot: a `CopySlotConflict` warning is logged and the first node
    ///   is kept.
    /// - the same source presented for a second, different copied slot:
    ///   a warning is logged and the first node is kept.
    pub fn record_copy(
        &mut self,
        source_path: &Path,
        copied_path: &Path,
        referrer: Option<NodeId>,
        options: &FreezeOptions,
    ) -> Result<NodeId> {
        let canonical_source =
            fs::canonicalize(source_path).map_err(|err| FreezeError::io(source_path, err))?;

        if let Some(&existing) = self.by_copied_path.get(copied_path) {
            if self.nodes[existing.index()].source_path == canonical_source {
                return Ok(existing);
            }
            tracing::warn!(
                target_path = %copied_path.display(),
                existing_source = %self.nodes[existing.index()].source_path.display(),
                attempted_source = %canonical_source.display(),
                "copy-slot conflict: two distinct sources copied to the same bundle path; keeping the first",
            );
            return Ok(existing);
        }

        if let Some(&existing) = self.by_source_path.get(&canonical_source) {
            tracing::warn!(
                source = %canonical_source.display(),
                existing_target = %self.nodes[existing.index()].copied_path.display(),
                attempted_target = %copied_path.display(),
                "source already copied to a different bundle path; refusing the second copy",
            );
            return Ok(existing);
        }

        let referrer_ctx = referrer.map(|id| (id, self.nodes[id.index()].effective_search_path.as_slice()));
        let node = BinaryNode::new(&canonical_source, copied_path, referrer_ctx, options)?;

        let id = NodeId::new(self.nodes.len());
        self.by_copied_path.insert(copied_path.to_path_buf(), id);
        self.by_source_path.insert(canonical_source, id);
        self.nodes.push(node);
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> &BinaryNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut BinaryNode {
        &mut self.nodes[id.index()]
    }

    /// Every node id in the graph, in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId::new)
    }

    pub fn get_node_for_copied(&self, copied_path: &Path) -> Option<&BinaryNode> {
        self.by_copied_path
            .get(copied_path)
            .map(|id| &self.nodes[id.index()])
    }

    pub fn get_node_for_source(&self, source_path: &Path) -> Option<&BinaryNode> {
        self.by_source_path
            .get(source_path)
            .map(|id| &self.nodes[id.index()])
    }

    /// Resolved host paths of every outgoing edge of `id` that has a
    /// resolution (bound or not).
    pub fn dependencies(&self, id: NodeId) -> HashSet<PathBuf> {
        self.nodes[id.index()]
            .outgoing_edges
            .iter()
            .filter_map(|edge| edge.resolved_path.clone())
            .collect()
    }

    /// Deterministic iteration over every node, in insertion order.
    pub fn iter_copied(&self) -> impl Iterator<Item = &BinaryNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn cache_reference_to(&mut self, source_path: PathBuf, resolved: Option<PathBuf>) {
        self.reference_cache.insert(source_path, resolved);
    }

    pub fn cached_reference_for(&self, source_path: &Path) -> Option<&Option<PathBuf>> {
        self.reference_cache.get(source_path)
    }

    /// Binds every still-unbound edge of every node, either to a node
    /// already in the graph (exact resolved-path match, or basename
    /// recovery for unresolved `@rpath` references) or leaves it as an
    /// external reference to a non-copied host library. Fatal if an
    /// unresolved reference has no candidate at all.
    pub fn finalize(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            for j in 0..self.nodes[i].outgoing_edges.len() {
                if self.nodes[i].outgoing_edges[j].is_copied() {
                    continue;
                }

                let resolved_path = self.nodes[i].outgoing_edges[j].resolved_path.clone();
                match resolved_path {
                    Some(resolved) => self.finalize_resolved_edge(i, j, &resolved),
                    None => self.finalize_unresolved_edge(i, j)?,
                }
            }
        }
        Ok(())
    }

    fn finalize_resolved_edge(&mut self, i: usize, j: usize, resolved: &Path) {
        let canonical = fs::canonicalize(resolved).unwrap_or_else(|_| resolved.to_path_buf());
        if let Some(&target) = self.by_source_path.get(&canonical) {
            self.nodes[i].outgoing_edges[j].bind(target, canonical);
        }
        // Otherwise this is a reference to a non-copied host library
        // (e.g. a system framework) and is retained unchanged.
    }

    fn finalize_unresolved_edge(&mut self, i: usize, j: usize) -> Result<()> {
        let raw_token = self.nodes[i].outgoing_edges[j].raw_token.clone();
        let basename = Path::new(&raw_token).file_name().map(|s| s.to_os_string());

        let candidates: Vec<NodeId> = match &basename {
            Some(basename) => self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.source_path.file_name() == Some(basename.as_os_str()))
                .map(|(idx, _)| NodeId::new(idx))
                .collect(),
            None => Vec::new(),
        };

        match candidates.as_slice() {
            [] => {
                let detail = self.nodes[i].describe();
                Err(FreezeError::UnresolvedAfterFinalize {
                    referrer: self.nodes[i].source_path.clone(),
                    token: raw_token,
                    detail,
                })
            }
            [only] => {
                let target_path = self.nodes[only.index()].source_path.clone();
                tracing::warn!(
                    referrer = %self.nodes[i].source_path.display(),
                    token = %raw_token,
                    guessed = %target_path.display(),
                    "guessing unresolved rpath reference by basename match",
                );
                self.nodes[i].outgoing_edges[j].bind(*only, target_path);
                Ok(())
            }
            multiple => {
                let first = multiple[0];
                let target_path = self.nodes[first.index()].source_path.clone();
                tracing::warn!(
                    referrer = %self.nodes[i].source_path.display(),
                    token = %raw_token,
                    candidate_count = multiple.len(),
                    chosen = %target_path.display(),
                    "ambiguous rpath recovery: multiple candidates share a basename, using the first by insertion order",
                );
                self.nodes[i].outgoing_edges[j].bind(first, target_path);
                Ok(())
            }
        }
    }

    /// Renders the insertion-order forest of copied nodes, marking
    /// already-visited nodes instead of re-expanding them. Used for
    /// verbose diagnostics.
    pub fn dump_tree(&self) -> String {
        let mut out = String::new();
        let mut seen = HashSet::new();
        for id in (0..self.nodes.len()).map(NodeId::new) {
            if seen.insert(id) {
                self.dump_node(id, 0, &mut seen, &mut out);
            }
        }
        out
    }

    fn dump_node(&self, id: NodeId, level: usize, seen: &mut HashSet<NodeId>, out: &mut String) {
        let node = &self.nodes[id.index()];
        out.push_str(&"|  ".repeat(level));
        out.push_str(&node.source_path.display().to_string());
        out.push('\n');
        for edge in &node.outgoing_edges {
            let Some(target) = edge.target_node else {
                continue;
            };
            if seen.insert(target) {
                self.dump_node(target, level + 1, seen, out);
            } else {
                out.push_str(&"|  ".repeat(level + 1));
                out.push_str(&self.nodes[target.index()].source_path.display().to_string());
                out.push_str(" (already seen)\n");
            }
        }
    }

    /// Machine-readable snapshot of every node, for a driver that wants to
    /// emit a JSON report instead of (or alongside) the tree dump.
    pub fn summarize(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|node| NodeSummary {
                source_path: node.source_path.clone(),
                copied_path: node.copied_path.clone(),
                is_mach_o: node.is_mach_o,
                referrer_depth: node.referrer_depth(&self.nodes),
                references: node
                    .outgoing_edges
                    .iter()
                    .map(|edge| EdgeSummary {
                        token: edge.raw_token.clone(),
                        resolved_path: edge.resolved_path.clone(),
                        bound: edge.is_copied(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Serializable view of a [`BinaryNode`], returned by [`GraphTracker::summarize`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub source_path: PathBuf,
    pub copied_path: PathBuf,
    pub is_mach_o: bool,
    pub referrer_depth: usize,
    pub references: Vec<EdgeSummary>,
}

/// Serializable view of an [`crate::edge::Edge`], nested in [`NodeSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct EdgeSummary {
    pub token: String,
    pub resolved_path: Option<PathBuf>,
    pub bound: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_err as fs;

    fn tiny_macho() -> &'static [u8] {
        // A zero-load-command x86_64 Mach-O header; enough for
        // `is_mach_o`/`Mach::parse` to recognize the magic, with no dylib
        // or rpath commands of its own.
        &[
            0xcf, 0xfa, 0xed, 0xfe, // MH_MAGIC_64
            0x07, 0x00, 0x00, 0x01, // CPU_TYPE_X86_64
            0x03, 0x00, 0x00, 0x00, // CPU_SUBTYPE
            0x06, 0x00, 0x00, 0x00, // MH_DYLIB
            0x00, 0x00, 0x00, 0x00, // ncmds
            0x00, 0x00, 0x00, 0x00, // sizeofcmds
            0x00, 0x00, 0x00, 0x00, // flags
            0x00, 0x00, 0x00, 0x00, // reserved
        ]
    }

    #[test]
    fn record_copy_is_idempotent_for_same_source_and_slot() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("libfoo.dylib");
        fs::write(&src, tiny_macho()).unwrap();
        let dst = dir.path().join("bundle/libfoo.dylib");

        let mut graph = GraphTracker::new();
        let options = FreezeOptions::default();
        let id1 = graph.record_copy(&src, &dst, None, &options).unwrap();
        let id2 = graph.record_copy(&src, &dst, None, &options).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn record_copy_keeps_first_on_slot_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let src1 = dir.path().join("a.dylib");
        let src2 = dir.path().join("b.dylib");
        fs::write(&src1, tiny_macho()).unwrap();
        fs::write(&src2, tiny_macho()).unwrap();
        let dst = dir.path().join("bundle/lib.dylib");

        let mut graph = GraphTracker::new();
        let options = FreezeOptions::default();
        let id1 = graph.record_copy(&src1, &dst, None, &options).unwrap();
        let id2 = graph.record_copy(&src2, &dst, None, &options).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(id1).source_path, fs::canonicalize(&src1).unwrap());
    }

    #[test]
    fn finalize_binds_external_and_basename_recovered_edges() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bundle")).unwrap();

        // libfoo references an unresolved @rpath entry that only
        // resolves by basename against a sibling copied elsewhere.
        let foo_src = dir.path().join("libfoo.dylib");
        fs::write(&foo_src, tiny_macho()).unwrap();
        let bar_src = dir.path().join("elsewhere/libbar.dylib");
        fs::create_dir_all(bar_src.parent().unwrap()).unwrap();
        fs::write(&bar_src, tiny_macho()).unwrap();

        let mut graph = GraphTracker::new();
        let options = FreezeOptions::default();
        let foo_id = graph
            .record_copy(&foo_src, &dir.path().join("bundle/libfoo.dylib"), None, &options)
            .unwrap();
        graph
            .record_copy(&bar_src, &dir.path().join("bundle/libbar.dylib"), None, &options)
            .unwrap();

        // Manually inject an unresolved rpath edge to exercise recovery,
        // since our tiny synthetic Mach-O has no load commands of its own.
        {
            let node = &mut graph.nodes[foo_id.index()];
            node.outgoing_edges
                .push(crate::edge::Edge::new("@rpath/libbar.dylib".to_string(), None));
        }

        graph.finalize().unwrap();
        let edge = &graph.get(foo_id).outgoing_edges[0];
        assert!(edge.is_copied());
    }

    #[test]
    fn finalize_fails_when_no_candidate_exists() {
        let dir = tempfile::tempdir().unwrap();
        let foo_src = dir.path().join("libfoo.dylib");
        fs::write(&foo_src, tiny_macho()).unwrap();

        let mut graph = GraphTracker::new();
        let options = FreezeOptions::default();
        let foo_id = graph
            .record_copy(&foo_src, &dir.path().join("bundle/libfoo.dylib"), None, &options)
            .unwrap();
        {
            let node = &mut graph.nodes[foo_id.index()];
            node.outgoing_edges.push(crate::edge::Edge::new(
                "@rpath/libnonexistent.dylib".to_string(),
                None,
            ));
        }

        let err = graph.finalize().unwrap_err();
        assert!(matches!(err, FreezeError::UnresolvedAfterFinalize { .. }));
    }

    #[test]
    fn summarize_reflects_bound_edges() {
        let dir = tempfile::tempdir().unwrap();
        let foo_src = dir.path().join("libfoo.dylib");
        fs::write(&foo_src, tiny_macho()).unwrap();

        let mut graph = GraphTracker::new();
        let options = FreezeOptions::default();
        let foo_id = graph
            .record_copy(&foo_src, &dir.path().join("bundle/libfoo.dylib"), None, &options)
            .unwrap();
        {
            let node = &mut graph.nodes[foo_id.index()];
            node.outgoing_edges
                .push(crate::edge::Edge::new("/usr/lib/libSystem.B.dylib".to_string(), None));
        }

        let summary = graph.summarize();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].references.len(), 1);
        assert!(!summary[0].references[0].bound);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("libSystem.B.dylib"));
    }
}
