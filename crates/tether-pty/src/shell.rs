//! Default shell detection.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Shells looked up on PATH, most preferred first.
#[cfg(unix)]
pub const SHELL_CANDIDATES: &[&str] = &["bash", "zsh", "fish", "sh"];
#[cfg(windows)]
pub const SHELL_CANDIDATES: &[&str] = &["pwsh.exe", "powershell.exe", "cmd.exe"];

/// Used when no candidate is found on PATH.
#[cfg(unix)]
pub const FALLBACK_SHELL: &str = "/bin/sh";
#[cfg(windows)]
pub const FALLBACK_SHELL: &str = "cmd.exe";

/// Resolve the shell to run when a terminal is created without a command.
///
/// `candidates` overrides [`SHELL_CANDIDATES`] when given. Returns the full
/// path of the first candidate found on PATH, or [`FALLBACK_SHELL`].
pub fn default_shell(candidates: Option<&[String]>) -> String {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let found = match candidates {
        Some(list) => first_on_path(list.iter().map(String::as_str), &path),
        None => first_on_path(SHELL_CANDIDATES.iter().copied(), &path),
    };

    match found {
        Some(shell) => shell.to_string_lossy().into_owned(),
        None => {
            log::warn!("No known shell found on PATH, falling back to {FALLBACK_SHELL}");
            FALLBACK_SHELL.to_string()
        }
    }
}

fn first_on_path<'a>(
    mut candidates: impl Iterator<Item = &'a str>,
    path: &OsStr,
) -> Option<PathBuf> {
    candidates.find_map(|name| find_in_path(name, path))
}

/// Locate `name` in the directories of a PATH-style list.
///
/// A name that already contains a path separator is checked as-is.
pub fn find_in_path(name: &str, path: &OsStr) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    std::env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
