use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates a peer-supplied relative path.
///
/// Backslashes are treated as separators. Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
///
/// A colon elsewhere in a name (`12:30.log`) is allowed.
pub fn validate_relative_path(file_path: &str) -> Result<(), TransferError> {
    let normalized = file_path.replace('\\', "/");
    if normalized.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in Path::new(&normalized).components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Whether `path` starts with a Windows drive designator such as `C:`.
pub fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolves `relative` under `root`, refusing anything that escapes it.
///
/// The lexical check runs first; when the target (or its nearest existing
/// ancestor) exists, its canonical form must also stay inside the canonical
/// root, which catches symlinks pointing elsewhere.
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf, TransferError> {
    validate_relative_path(relative)?;

    let normalized = relative.replace('\\', "/");
    let joined = root.join(normalized.trim_start_matches("./"));

    let canonical_root = root.canonicalize()?;
    let mut ancestor = joined.as_path();
    loop {
        if ancestor.exists() {
            let canonical = ancestor.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                return Err(TransferError::AccessDenied(format!(
                    "path is outside the shared folder: {relative}"
                )));
            }
            break;
        }
        match ancestor.parent() {
            Some(parent) => ancestor = parent,
            None => break,
        }
    }

    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_relative_paths() {
        assert!(validate_relative_path("file.txt").is_ok());
        assert!(validate_relative_path("dir/file.txt").is_ok());
        assert!(validate_relative_path("a/b/c/d.bin").is_ok());
        assert!(validate_relative_path("./file.txt").is_ok());
        assert!(validate_relative_path("dir\\file.txt").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("  ").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("C:\\Windows").is_err());
        assert!(validate_relative_path("\\\\server\\share").is_err());
    }

    #[test]
    fn colon_inside_a_name_is_allowed() {
        assert!(validate_relative_path("12:30.log").is_ok());
        assert!(validate_relative_path("logs/backup 10:15.tar").is_ok());
        assert!(validate_relative_path("C:").is_err());
        assert!(validate_relative_path("d:notes.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_accepts_colon_names() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_in_root(dir.path(), "12:30.log").unwrap();
        assert_eq!(resolved, dir.path().join("12:30.log"));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(validate_relative_path("../secret").is_err());
        assert!(validate_relative_path("dir/../../secret").is_err());
        assert!(validate_relative_path("..\\secret").is_err());
    }

    #[test]
    fn resolve_keeps_path_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_in_root(dir.path(), "sub/new.txt").unwrap();
        assert_eq!(resolved, dir.path().join("sub/new.txt"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_in_root(dir.path(), "../outside.txt"),
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(matches!(
            resolve_in_root(root.path(), "link/file.txt"),
            Err(TransferError::AccessDenied(_))
        ));
    }
}
