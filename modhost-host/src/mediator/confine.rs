//! Path normalisation and confinement checks.
//!
//! Pure path computations plus read-only filesystem lookups; nothing here
//! creates or modifies files.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Normalises a module-supplied path into a relative, `/`-separated path.
///
/// - `\` counts as a separator, so mixed separators behave alike
/// - leading `./` prefixes are stripped
/// - absolute paths (`/x`, `C:\x`) collapse to their final segment
/// - paths with any `..` segment collapse to their final segment
///
/// Returns `None` when nothing usable is left (empty, `.`/`..` as the final
/// segment, or an interior NUL).
pub(crate) fn normalize_relative(input: &str) -> Option<String> {
    if input.contains('\0') {
        return None;
    }

    let unified = input.replace('\\', "/");
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    let absolute = rest.starts_with('/') || has_drive_prefix(rest);
    let escapes = segments.iter().any(|s| *s == "..");

    if absolute || escapes {
        let last = rest.rsplit('/').find(|s| !s.is_empty())?;
        let last = strip_drive(last);
        return match last {
            "" | "." | ".." => None,
            name => Some(name.to_string()),
        };
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn strip_drive(segment: &str) -> &str {
    if has_drive_prefix(segment) {
        &segment[2..]
    } else {
        segment
    }
}

/// Canonicalises `path` even when its tail does not exist yet: the longest
/// existing ancestor is canonicalised (resolving symlinks) and the missing
/// components are appended. A dangling symlink on the way is refused.
pub(crate) fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();

    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut resolved) => {
                for component in missing.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if std::fs::symlink_metadata(&existing).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("dangling link at {}", existing.display()),
                    ));
                }
                let name = existing
                    .file_name()
                    .map(|n| n.to_os_string())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
                missing.push(name);
                if !existing.pop() {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether `candidate` is a strict descendant of `root`. Both must already be
/// canonical. Component-wise, so `/data/alpha2` is not inside `/data/alpha`.
pub(crate) fn is_strict_descendant(root: &Path, candidate: &Path) -> bool {
    candidate != root && candidate.starts_with(root)
}
