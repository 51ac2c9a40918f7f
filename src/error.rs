use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the resolver/rewriter core.
///
/// Severity follows the error taxonomy: most variants here are fatal to the
/// freeze operation (propagated with `?` all the way to the driver).
/// `CopySlotConflict` and the rpath-recovery guess performed during
/// [`crate::graph::GraphTracker::finalize`] are logged as warnings via
/// `tracing::warn!` rather than constructed as errors.
#[derive(Error, Debug)]
pub enum FreezeError {
    #[error("failed to parse load commands in {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },

    #[error(
        "multiple dynamic libraries resolved to the same file in {path}: {resolved}"
    )]
    CollidingReferences { path: PathBuf, resolved: PathBuf },

    #[error(
        "could not resolve @rpath/{token} referenced from {referrer} in strict mode"
    )]
    UnresolvedRpathStrict { referrer: PathBuf, token: String },

    #[error(
        "could not resolve reference [{token}] in {referrer} after finalize: {detail}"
    )]
    UnresolvedAfterFinalize {
        referrer: PathBuf,
        token: String,
        detail: String,
    },

    #[error("relative reference [{token}] in {referrer} does not resolve to a Mach-O file")]
    RelativeReferenceMissing { referrer: PathBuf, token: String },

    #[error("install_name_tool-equivalent rewrite failed for {path}: {detail}")]
    RewriteFailed { path: PathBuf, detail: String },

    #[error("ad-hoc code signing failed for {path} after retry: {detail}")]
    SignFailed { path: PathBuf, detail: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FreezeError>;

impl FreezeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
