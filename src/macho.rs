//! Mach-O Inspector: sniff Mach-O magic and extract load commands.
//!
//! Read-only counterpart to [`crate::rewrite`], which performs the same kind
//! of load-command walk but patches bytes in place. Both read dylib/rpath
//! strings directly out of the raw file bytes at the offsets `goblin`
//! reports, rather than relying on `goblin::mach::MachO::libs`/`rpaths`
//! (which would lose the one-command-at-a-time ordering needed to
//! faithfully reconstruct `Other` commands for rewriting).

use std::path::Path;

use fs_err as fs;
use goblin::mach::load_command::{CommandVariant, DylibCommand, LoadCommand, RpathCommand};
use goblin::mach::{Hint, Mach, MachO};

use crate::error::{FreezeError, Result};

/// One load command in a Mach-O file, as it matters to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LC_LOAD_DYLIB` and its weak/lazy/upward/reexport siblings.
    LoadDylib { path: String },
    /// `LC_RPATH`.
    Rpath { path: String },
    /// Anything else. Preserved so callers that need command order (e.g.
    /// the rewriter inserting/removing commands in place) can still see
    /// where the load/rpath commands sit relative to the rest.
    Other,
}

/// Returns true iff `path` is a regular file whose header matches Mach-O or
/// fat/universal Mach-O magic. Never errors: unreadable or non-file paths
/// are simply not Mach-O.
pub fn is_mach_o(path: &Path) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut header = [0u8; 16];
    use std::io::Read;
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    matches!(
        goblin::mach::peek_bytes(&header),
        Ok(Hint::Mach(_) | Hint::MachFat(_))
    )
}

/// Extracts the ordered load commands from a Mach-O file.
///
/// Returns an empty list for a file that is not Mach-O (no magic match,
/// or too short to contain one) rather than an error; only a genuine I/O
/// failure or a malformed Mach-O body is an `Err`.
///
/// For fat/universal binaries, only the first architecture slice is
/// inspected: the load/rpath commands that matter for dependency
/// resolution are structurally identical across slices of the same
/// bundle-destined library.
pub fn load_commands(path: &Path) -> Result<Vec<Command>> {
    let data = fs::read(path).map_err(|source| FreezeError::io(path, source))?;
    load_commands_from_bytes(path, &data)
}

fn load_commands_from_bytes(path: &Path, data: &[u8]) -> Result<Vec<Command>> {
    let Some(header_bytes) = data.get(..16) else {
        return Ok(Vec::new());
    };
    let header: [u8; 16] = header_bytes.try_into().expect("slice is exactly 16 bytes");
    if !matches!(
        goblin::mach::peek_bytes(&header),
        Ok(Hint::Mach(_) | Hint::MachFat(_))
    ) {
        return Ok(Vec::new());
    }

    let mach = Mach::parse(data).map_err(|source| FreezeError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    match mach {
        Mach::Binary(macho) => Ok(commands_from_macho(data, &macho)),
        Mach::Fat(fat) => {
            let arch = fat
                .iter_arches()
                .next()
                .ok_or_else(|| FreezeError::ParseError {
                    path: path.to_path_buf(),
                    source: goblin::error::Error::Malformed(
                        "fat Mach-O has no architecture slices".to_string(),
                    ),
                })?
                .map_err(|source| FreezeError::ParseError {
                    path: path.to_path_buf(),
                    source,
                })?;
            let start = arch.offset as usize;
            let end = start + arch.size as usize;
            let slice = data.get(start..end).ok_or_else(|| FreezeError::ParseError {
                path: path.to_path_buf(),
                source: goblin::error::Error::Malformed(
                    "fat Mach-O architecture slice out of bounds".to_string(),
                ),
            })?;
            let macho = MachO::parse(slice, 0).map_err(|source| FreezeError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(commands_from_macho(slice, &macho))
        }
    }
}

fn commands_from_macho(data: &[u8], macho: &MachO) -> Vec<Command> {
    macho
        .load_commands
        .iter()
        .map(|lc| match &lc.command {
            CommandVariant::LoadDylib(cmd)
            | CommandVariant::LoadWeakDylib(cmd)
            | CommandVariant::ReexportDylib(cmd)
            | CommandVariant::LazyLoadDylib(cmd)
            | CommandVariant::LoadUpwardDylib(cmd) => Command::LoadDylib {
                path: read_dylib_name(data, lc, cmd),
            },
            CommandVariant::Rpath(cmd) => Command::Rpath {
                path: read_rpath_path(data, lc, cmd),
            },
            _ => Command::Other,
        })
        .collect()
}

/// Read the C-string name out of a dylib load command's raw bytes.
pub(crate) fn read_dylib_name(data: &[u8], lc: &LoadCommand, dylib_cmd: &DylibCommand) -> String {
    let name_offset = lc.offset + dylib_cmd.dylib.name as usize;
    let cmd_end = lc.offset + dylib_cmd.cmdsize as usize;
    read_c_string(data, name_offset, cmd_end)
}

/// Read the C-string path out of an rpath command's raw bytes.
pub(crate) fn read_rpath_path(data: &[u8], lc: &LoadCommand, rpath_cmd: &RpathCommand) -> String {
    let path_offset = lc.offset + rpath_cmd.path as usize;
    let cmd_end = lc.offset + rpath_cmd.cmdsize as usize;
    read_c_string(data, path_offset, cmd_end)
}

fn read_c_string(data: &[u8], start: usize, end: usize) -> String {
    let Some(slice) = data.get(start..end) else {
        return String::new();
    };
    let str_end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..str_end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_elf(tmp: &Path) {
        let mut f = fs::File::create(tmp).unwrap();
        f.write_all(b"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00")
            .unwrap();
    }

    #[test]
    fn non_mach_o_file_is_not_mach_o() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_dylib");
        fake_elf(&path);
        assert!(!is_mach_o(&path));
    }

    #[test]
    fn missing_file_is_not_mach_o() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mach_o(&dir.path().join("does_not_exist")));
    }

    #[test]
    fn truncated_file_is_not_mach_o() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"\xcf\xfa\xed\xfe").unwrap();
        assert!(!is_mach_o(&path));
    }

    #[test]
    fn non_mach_o_load_commands_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_dylib");
        fake_elf(&path);
        assert_eq!(load_commands(&path).unwrap(), Vec::new());
    }

    #[test]
    fn truncated_load_commands_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        fs::write(&path, b"\xcf\xfa\xed\xfe").unwrap();
        assert_eq!(load_commands(&path).unwrap(), Vec::new());
    }
}
