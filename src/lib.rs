//! macOS Mach-O dependency resolver and install-name rewriter.
//!
//! Given a set of already-copied binaries inside an application bundle,
//! this crate walks their `LC_LOAD_DYLIB` references, resolves each one
//! to a host path, binds the ones that point back into the bundle, and
//! rewrites their load commands to bundle-relative `@loader_path` tokens.
//!
//! The pieces, roughly in the order a driver calls them:
//! [`graph::GraphTracker::record_copy`] to register every file as it is
//! copied, [`graph::GraphTracker::finalize`] once the whole tree has been
//! walked, then [`rewrite::rewrite_all`] to patch bytes and re-sign.

pub mod config;
pub mod edge;
pub mod error;
pub mod graph;
pub mod macho;
pub mod node;
pub mod resolve;
pub mod rewrite;

pub use config::FreezeOptions;
pub use edge::{Edge, EdgeKey};
pub use error::{FreezeError, Result};
pub use graph::{GraphTracker, NodeId};
pub use node::BinaryNode;
