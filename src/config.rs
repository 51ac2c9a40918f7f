use std::path::PathBuf;

/// Options controlling resolver behavior for one freeze operation.
///
/// Constructed directly by library callers, or via `clap::Parser` flags on
/// the `freeze-cli` driver (`--strict`, `--executable-root`).
#[derive(Clone, Debug, Default, clap::Args)]
pub struct FreezeOptions {
    /// Fail immediately when an `@rpath/...` reference cannot be resolved,
    /// instead of deferring to the finalize recovery pass.
    #[arg(long)]
    pub strict: bool,

    /// Directory to use for `@executable_path` resolution, overriding the
    /// default of "same directory as the referring file".
    ///
    /// The core's default (resolving `@executable_path` exactly like
    /// `@loader_path`) can misbehave when a library expects to be loaded
    /// relative to the main executable rather than its immediate referrer.
    #[arg(long)]
    pub executable_root: Option<PathBuf>,
}

impl FreezeOptions {
    pub fn new(strict: bool, executable_root: Option<PathBuf>) -> Self {
        Self {
            strict,
            executable_root,
        }
    }
}
