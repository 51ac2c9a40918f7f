//! Reference Token Resolver: turn a raw load-command token into an
//! absolute host path, given the referring file's context.

use std::path::{Path, PathBuf};

use crate::error::{FreezeError, Result};
use crate::macho;

const LOADER_PREFIX: &str = "@loader_path/";
const EXECUTABLE_PREFIX: &str = "@executable_path/";
const RPATH_PREFIX: &str = "@rpath/";

/// Resolve `token` as seen in a load command of the file at
/// `referrer_source`, against `effective_search_path` (used for `@rpath`)
/// and an optional `executable_root` override (used for
/// `@executable_path`; defaults to the referrer's own directory).
///
/// Returns `Ok(None)` when resolution legitimately fails and the caller
/// should defer to finalize-time recovery (lenient `@rpath`). Returns
/// `Err` when the failure is fatal: strict-mode `@rpath`, or an
/// unresolvable relative (no-prefix) reference.
pub fn resolve(
    token: &str,
    referrer_source: &Path,
    effective_search_path: &[PathBuf],
    executable_root: Option<&Path>,
    strict: bool,
) -> Result<Option<PathBuf>> {
    if let Some(rest) = token.strip_prefix(LOADER_PREFIX) {
        return Ok(resolve_loader(referrer_source, rest));
    }
    if let Some(rest) = token.strip_prefix(EXECUTABLE_PREFIX) {
        return Ok(resolve_executable(referrer_source, executable_root, rest));
    }
    if let Some(rest) = token.strip_prefix(RPATH_PREFIX) {
        return resolve_rpath(token, rest, referrer_source, effective_search_path, strict);
    }

    let as_path = Path::new(token);
    if as_path.is_absolute() {
        return Ok(as_path.exists().then(|| as_path.to_path_buf()));
    }

    // No prefix, not absolute: relative to the referrer's own directory.
    // The loader would also fail here, so this is fatal.
    let candidate = referrer_source
        .parent()
        .map(|dir| dir.join(token))
        .unwrap_or_else(|| PathBuf::from(token));
    if macho::is_mach_o(&candidate) {
        Ok(Some(candidate))
    } else {
        Err(FreezeError::RelativeReferenceMissing {
            referrer: referrer_source.to_path_buf(),
            token: token.to_string(),
        })
    }
}

fn resolve_loader(referrer_source: &Path, rest: &str) -> Option<PathBuf> {
    referrer_source.parent().map(|dir| dir.join(rest))
}

fn resolve_executable(
    referrer_source: &Path,
    executable_root: Option<&Path>,
    rest: &str,
) -> Option<PathBuf> {
    // The core intentionally equates @executable_path with @loader_path
    // unless the driver has designated a distinguished root executable.
    match executable_root {
        Some(root) => Some(root.join(rest)),
        None => resolve_loader(referrer_source, rest),
    }
}

fn resolve_rpath(
    full_token: &str,
    rest: &str,
    referrer_source: &Path,
    effective_search_path: &[PathBuf],
    strict: bool,
) -> Result<Option<PathBuf>> {
    for dir in effective_search_path {
        let candidate = dir.join(rest);
        if macho::is_mach_o(&candidate) {
            return Ok(Some(candidate));
        }
    }
    if strict {
        return Err(FreezeError::UnresolvedRpathStrict {
            referrer: referrer_source.to_path_buf(),
            token: full_token
                .strip_prefix(RPATH_PREFIX)
                .unwrap_or(full_token)
                .to_string(),
        });
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_err as fs;

    #[test]
    fn loader_path_resolves_relative_to_referrer_dir() {
        let dir = tempfile::tempdir().unwrap();
        let referrer = dir.path().join("bin/app");
        fs::create_dir_all(referrer.parent().unwrap()).unwrap();
        fs::write(&referrer, b"").unwrap();

        let resolved = resolve("@loader_path/../lib/libfoo.dylib", &referrer, &[], None, false)
            .unwrap()
            .unwrap();
        assert_eq!(resolved, dir.path().join("bin/../lib/libfoo.dylib"));
    }

    #[test]
    fn executable_path_defaults_to_referrer_dir() {
        let dir = tempfile::tempdir().unwrap();
        let referrer = dir.path().join("bin/app");
        let resolved = resolve(
            "@executable_path/lib/libfoo.dylib",
            &referrer,
            &[],
            None,
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(resolved, dir.path().join("bin/lib/libfoo.dylib"));
    }

    #[test]
    fn executable_path_honors_override_root() {
        let dir = tempfile::tempdir().unwrap();
        let referrer = dir.path().join("bin/lib/inner.dylib");
        let root = dir.path().join("bin");
        let resolved = resolve(
            "@executable_path/libfoo.dylib",
            &referrer,
            &[],
            Some(&root),
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(resolved, root.join("libfoo.dylib"));
    }

    #[test]
    fn rpath_lenient_returns_none_when_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let referrer = dir.path().join("app");
        let resolved = resolve("@rpath/libfoo.dylib", &referrer, &[], None, false).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn rpath_strict_fails_when_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let referrer = dir.path().join("app");
        let err = resolve("@rpath/libfoo.dylib", &referrer, &[], None, true).unwrap_err();
        assert!(matches!(err, FreezeError::UnresolvedRpathStrict { .. }));
    }

    #[test]
    fn absolute_path_resolves_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libfoo.dylib");
        fs::write(&lib, b"").unwrap();
        let resolved = resolve(lib.to_str().unwrap(), Path::new("/nowhere"), &[], None, false)
            .unwrap()
            .unwrap();
        assert_eq!(resolved, lib);
    }

    #[test]
    fn absolute_path_is_none_when_missing() {
        let resolved = resolve("/nonexistent/libfoo.dylib", Path::new("/nowhere"), &[], None, false)
            .unwrap();
        assert!(resolved.is_none());
    }
}
