//! Rewriter / Signer: after [`crate::graph::GraphTracker::finalize`], patch
//! each copied binary's load commands to point at in-bundle locations and
//! apply an ad-hoc signature where required.
//!
//! The byte-level load-command surgery (remove a command, splice in a
//! replacement, keep the header's `sizeofcmds`/`ncmds` and the file size
//! consistent) is an in-process reimplementation of `install_name_tool
//! -change`, built on `goblin` + `scroll`, so this crate never shells out
//! to patch bytes. Signing does shell out to `codesign`, since ad-hoc
//! signing is not a byte format this crate reimplements.

use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use fs_err as fs;
use goblin::container;
use goblin::mach::header::{Header, SIZEOF_HEADER_32, SIZEOF_HEADER_64};
use goblin::mach::load_command::{CommandVariant, DylibCommand};
use goblin::mach::{fat, parse_magic_and_ctx, peek, MachO, MultiArch};
use scroll::Pwrite;

use crate::error::{FreezeError, Result};
use crate::graph::GraphTracker;

/// Rewrite every copied, bound reference in the graph to an in-bundle
/// `@loader_path/<relative>` token, and re-sign each binary that was
/// actually modified.
///
/// Idempotent: after a successful rewrite, each edge's `raw_token` is
/// updated in place to match what is now on disk, so a second call sees
/// `new_token == edge.raw_token` for every edge, rewrites nothing, and
/// re-signs nothing. This requires `&mut GraphTracker` — comparing
/// against the node's construction-time token snapshot instead would
/// make a second call re-attempt a change that already landed.
pub fn rewrite_all(graph: &mut GraphTracker) -> Result<()> {
    for id in graph.node_ids() {
        let node = graph.get(id);
        if !node.is_mach_o {
            continue;
        }
        let copied_path = node.copied_path.clone();

        let mut changed = false;
        for edge_index in 0..graph.get(id).outgoing_edges.len() {
            let Some(target_id) = graph.get(id).outgoing_edges[edge_index].target_node else {
                continue;
            };
            let target_copied_path = graph.get(target_id).copied_path.clone();
            let new_token = install_name_token(&copied_path, &target_copied_path);
            let old_token = graph.get(id).outgoing_edges[edge_index].raw_token.clone();
            if new_token == old_token {
                continue;
            }
            change_load_reference(&copied_path, &old_token, &new_token)?;
            graph.get_mut(id).outgoing_edges[edge_index].raw_token = new_token;
            changed = true;
        }

        if changed {
            sign_adhoc(&copied_path)?;
        }
    }
    Ok(())
}

/// Build the `@loader_path/<relative>` token for a reference from
/// `referrer_copied_path` to `target_copied_path`.
fn install_name_token(referrer_copied_path: &Path, target_copied_path: &Path) -> String {
    let base = referrer_copied_path.parent().unwrap_or(Path::new(""));
    let rel = relative_path(base, target_copied_path);
    format!("@loader_path/{}", rel.to_slash())
}

trait ToSlash {
    fn to_slash(&self) -> String;
}

impl ToSlash for Path {
    fn to_slash(&self) -> String {
        self.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Compute `target` relative to `base`, both assumed absolute.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base_components: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();

    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_components.len() {
        rel.push("..");
    }
    for component in &target_components[common..] {
        rel.push(component.as_os_str());
    }
    rel
}

/// Change every load-dylib command in `path` whose token equals
/// `old_token` to `new_token`, across all architecture slices of a
/// fat/universal binary if present.
fn change_load_reference(path: &Path, old_token: &str, new_token: &str) -> Result<()> {
    let mut data = fs::read(path).map_err(|source| FreezeError::io(path, source))?;
    let original_mode = make_writable(path)?;

    let result = (|| -> Result<()> {
        let magic = peek(&data, 0).map_err(|source| FreezeError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;

        if magic == fat::FAT_MAGIC {
            let arches: Vec<_> = {
                let multi = MultiArch::new(&data).map_err(|source| FreezeError::ParseError {
                    path: path.to_path_buf(),
                    source,
                })?;
                multi
                    .iter_arches()
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|source| FreezeError::ParseError {
                        path: path.to_path_buf(),
                        source,
                    })?
            };
            // Process from last to first so offset shifts in one slice
            // never invalidate the offsets of slices not yet processed.
            for arch in arches.iter().rev() {
                let offset = arch.offset as usize;
                let size = arch.size as usize;
                let mut slice = data[offset..offset + size].to_vec();
                change_load_reference_single(path, &mut slice, old_token, new_token)?;
                data.splice(offset..offset + size, slice);
            }
        } else {
            change_load_reference_single(path, &mut data, old_token, new_token)?;
        }

        fs::write(path, &data).map_err(|source| FreezeError::io(path, source))
    })();

    restore_mode(path, original_mode);
    result
}

fn change_load_reference_single(
    path: &Path,
    data: &mut Vec<u8>,
    old_token: &str,
    new_token: &str,
) -> Result<()> {
    let macho = MachO::parse(data, 0).map_err(|source| FreezeError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    let (_, maybe_ctx) = parse_magic_and_ctx(data, 0).map_err(|source| FreezeError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    let ctx = maybe_ctx.ok_or_else(|| FreezeError::RewriteFailed {
        path: path.to_path_buf(),
        detail: "could not determine Mach-O endianness/width".to_string(),
    })?;
    let mut header = macho.header;

    for lc in &macho.load_commands {
        let dylib_cmd = match &lc.command {
            CommandVariant::LoadDylib(cmd)
            | CommandVariant::LoadWeakDylib(cmd)
            | CommandVariant::ReexportDylib(cmd)
            | CommandVariant::LazyLoadDylib(cmd)
            | CommandVariant::LoadUpwardDylib(cmd) => cmd,
            _ => continue,
        };
        let name = crate::macho::read_dylib_name(data, lc, dylib_cmd);
        if name != old_token {
            continue;
        }

        let cmdsize = lc.command.cmdsize();
        let new_cmd_buf = build_dylib_command_bytes(path, new_token, dylib_cmd, ctx)?;
        remove_load_command(path, data, &mut header, ctx, lc.offset, cmdsize)?;
        insert_load_command(path, data, &mut header, ctx, lc.offset, &new_cmd_buf)?;
        return Ok(());
    }

    Err(FreezeError::RewriteFailed {
        path: path.to_path_buf(),
        detail: format!("no load command with token [{old_token}] found"),
    })
}

fn header_size(ctx: container::Ctx) -> usize {
    if ctx.container.is_big() {
        SIZEOF_HEADER_64
    } else {
        SIZEOF_HEADER_32
    }
}

fn align_to_ctx(size: usize, ctx: container::Ctx) -> usize {
    if ctx.container.is_big() {
        size.next_multiple_of(8)
    } else {
        size.next_multiple_of(4)
    }
}

fn remove_load_command(
    path: &Path,
    buffer: &mut Vec<u8>,
    header: &mut Header,
    ctx: container::Ctx,
    cmd_offset: usize,
    cmdsize: usize,
) -> Result<()> {
    buffer.drain(cmd_offset..cmd_offset + cmdsize);
    header.ncmds -= 1;
    header.sizeofcmds -= cmdsize as u32;

    let padding_offset = header_size(ctx) + header.sizeofcmds as usize;
    let zeroes = vec![0u8; cmdsize];
    let tail = buffer.split_off(padding_offset);
    buffer.extend(&zeroes);
    buffer.extend(tail);

    buffer
        .pwrite_with(*header, 0, ctx)
        .map_err(|e| FreezeError::RewriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    Ok(())
}

fn insert_load_command(
    path: &Path,
    buffer: &mut Vec<u8>,
    header: &mut Header,
    ctx: container::Ctx,
    offset: usize,
    cmd_data: &[u8],
) -> Result<()> {
    let new_cmd_size = cmd_data.len() as u32;
    header.ncmds += 1;
    header.sizeofcmds += new_cmd_size;

    let tail = buffer.split_off(offset);
    buffer.extend_from_slice(cmd_data);
    buffer.extend(tail);

    let drain_start = header_size(ctx) + header.sizeofcmds as usize;
    let drain_end = drain_start + new_cmd_size as usize;
    if drain_end <= buffer.len() {
        buffer.drain(drain_start..drain_end);
    }

    buffer
        .pwrite_with(*header, 0, ctx)
        .map_err(|e| FreezeError::RewriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    Ok(())
}

fn build_dylib_command_bytes(
    path: &Path,
    name: &str,
    old_cmd: &DylibCommand,
    ctx: container::Ctx,
) -> Result<Vec<u8>> {
    let c_str_owned = format!("{name}\0");
    let c_str = CStr::from_bytes_with_nul(c_str_owned.as_bytes()).map_err(|e| {
        FreezeError::RewriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    })?;
    let str_size = (c_str.count_bytes() + 1).next_multiple_of(4);
    // DylibCommand header: cmd(4) + cmdsize(4) + name_offset(4) + timestamp(4) + current_version(4) + compat_version(4) = 24
    let dylib_header_size: usize = 24;
    let cmdsize = align_to_ctx(dylib_header_size + str_size, ctx);

    let new_cmd = DylibCommand {
        cmd: old_cmd.cmd,
        cmdsize: cmdsize as u32,
        dylib: goblin::mach::load_command::Dylib {
            name: dylib_header_size as u32,
            timestamp: old_cmd.dylib.timestamp,
            current_version: old_cmd.dylib.current_version,
            compatibility_version: old_cmd.dylib.compatibility_version,
        },
    };

    let mut buf = vec![0u8; cmdsize];
    buf.pwrite(new_cmd, 0).map_err(|e| FreezeError::RewriteFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    buf.pwrite(c_str, dylib_header_size)
        .map_err(|e| FreezeError::RewriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    Ok(buf)
}

#[cfg(unix)]
fn make_writable(path: &Path) -> Result<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|source| FreezeError::io(path, source))?;
    let original = meta.permissions();
    let mut writable = original.clone();
    writable.set_mode(original.mode() | 0o200);
    fs::set_permissions(path, writable).map_err(|source| FreezeError::io(path, source))?;
    Ok(original)
}

#[cfg(not(unix))]
fn make_writable(path: &Path) -> Result<std::fs::Permissions> {
    let meta = fs::metadata(path).map_err(|source| FreezeError::io(path, source))?;
    Ok(meta.permissions())
}

fn restore_mode(path: &Path, original: std::fs::Permissions) {
    let _ = fs::set_permissions(path, original);
}

/// Apply an ad-hoc code signature, retrying once via an inode-replacement
/// workaround if `codesign` fails the first time. ARM64-only: a no-op on
/// other hosts.
pub fn sign_adhoc(path: &Path) -> Result<()> {
    if std::env::consts::ARCH != "aarch64" {
        return Ok(());
    }

    if run_codesign(path).is_ok() {
        return Ok(());
    }

    // codesign has a known bug where it can corrupt the signature of a
    // file it has signed before; copying to a fresh inode and moving it
    // back erases the stale signature before retrying.
    let tmp_dir = tempfile::tempdir().map_err(|source| FreezeError::io(path, source))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| FreezeError::SignFailed {
            path: path.to_path_buf(),
            detail: "path has no file name".to_string(),
        })?;
    let tmp_path = tmp_dir.path().join(file_name);
    fs::copy(path, &tmp_path).map_err(|source| FreezeError::io(path, source))?;
    fs::rename(&tmp_path, path).map_err(|source| FreezeError::io(path, source))?;

    run_codesign(path).map_err(|detail| FreezeError::SignFailed {
        path: path.to_path_buf(),
        detail,
    })
}

fn run_codesign(path: &Path) -> std::result::Result<(), String> {
    let output = ProcessCommand::new("codesign")
        .args([
            "--sign",
            "-",
            "--force",
            "--preserve-metadata=entitlements,requirements,flags,runtime",
        ])
        .arg(path)
        .output()
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_crosses_up_and_down() {
        let base = Path::new("/bundle/bin");
        let target = Path::new("/bundle/lib/libfoo.dylib");
        assert_eq!(relative_path(base, target), PathBuf::from("../lib/libfoo.dylib"));
    }

    #[test]
    fn relative_path_same_dir() {
        let base = Path::new("/bundle/lib");
        let target = Path::new("/bundle/lib/libbar.dylib");
        assert_eq!(relative_path(base, target), PathBuf::from("libbar.dylib"));
    }

    #[test]
    fn install_name_token_uses_loader_path() {
        let referrer = Path::new("/bundle/bin/app");
        let target = Path::new("/bundle/lib/libfoo.dylib");
        assert_eq!(
            install_name_token(referrer, target),
            "@loader_path/../lib/libfoo.dylib"
        );
    }
}
