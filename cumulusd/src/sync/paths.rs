use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Index-relative path of the synchronization root itself. Relative-path
/// computation against the root yields an empty string, so the root is
/// represented by a bare separator.
pub const ROOT_SENTINEL: &str = "/";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps an index-relative path ("Docs/A.txt", `/` for the root) under the
/// sync root.
pub fn local_path_for(sync_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = sync_root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Index-relative path of an absolute path under `sync_root`; the root
/// itself maps to the sentinel. Paths outside the root yield `None`.
pub fn relative_path_of(sync_root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(sync_root).ok()?;
    let mut out = String::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            _ => return None,
        }
    }
    if out.is_empty() {
        Some(ROOT_SENTINEL.to_string())
    } else {
        Some(out)
    }
}

/// Splits "Docs/A.txt" into ("Docs", "A.txt"); top-level entries get the
/// root sentinel as their parent.
pub fn split_parent(relative: &str) -> (String, String) {
    match relative.rsplit_once('/') {
        Some((dir, name)) if !dir.is_empty() => (dir.to_string(), name.to_string()),
        _ => (
            ROOT_SENTINEL.to_string(),
            relative.trim_start_matches('/').to_string(),
        ),
    }
}

pub fn join_relative(dir: &str, name: &str) -> String {
    if dir == ROOT_SENTINEL || dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Index-relative form of a remote listing `tree` value ("/Docs/" → "Docs").
pub fn relative_from_tree(tree: &str) -> String {
    let trimmed = tree.trim_matches('/');
    if trimmed.is_empty() {
        ROOT_SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// True when any component of the relative path starts with a dot.
pub fn is_hidden(relative: &str) -> bool {
    relative.split('/').any(|part| part.starts_with('.'))
}

/// Rewrites `path` from under `old_prefix` to under `new_prefix`; `None`
/// when `path` is not the prefix or one of its descendants.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    let rest = path.strip_prefix(old_prefix)?.strip_prefix('/')?;
    Some(join_relative(new_prefix, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_path_under_sync_root() {
        let root = PathBuf::from("/home/user/Cumulus");
        assert_eq!(
            local_path_for(&root, "Docs/A.txt").unwrap(),
            PathBuf::from("/home/user/Cumulus/Docs/A.txt")
        );
        assert_eq!(local_path_for(&root, ROOT_SENTINEL).unwrap(), root);
    }

    #[test]
    fn rejects_parent_dir_components() {
        let root = PathBuf::from("/home/user/Cumulus");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
    }

    #[test]
    fn relative_of_root_is_the_sentinel() {
        let root = PathBuf::from("/home/user/Cumulus");
        assert_eq!(
            relative_path_of(&root, &root).as_deref(),
            Some(ROOT_SENTINEL)
        );
        assert_eq!(
            relative_path_of(&root, &root.join("Docs/A.txt")).as_deref(),
            Some("Docs/A.txt")
        );
        assert_eq!(relative_path_of(&root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn splits_and_joins_around_the_sentinel() {
        assert_eq!(
            split_parent("Docs/A.txt"),
            ("Docs".to_string(), "A.txt".to_string())
        );
        assert_eq!(
            split_parent("a.txt"),
            (ROOT_SENTINEL.to_string(), "a.txt".to_string())
        );
        assert_eq!(join_relative(ROOT_SENTINEL, "a.txt"), "a.txt");
        assert_eq!(join_relative("Docs", "A.txt"), "Docs/A.txt");
    }

    #[test]
    fn tree_values_normalize_to_relative_paths() {
        assert_eq!(relative_from_tree("/"), ROOT_SENTINEL);
        assert_eq!(relative_from_tree("/Docs/"), "Docs");
        assert_eq!(relative_from_tree("/Docs/Letters/"), "Docs/Letters");
    }

    #[test]
    fn hidden_components_are_detected_anywhere() {
        assert!(is_hidden(".config"));
        assert!(is_hidden("Docs/.cache/x"));
        assert!(!is_hidden("Docs/A.txt"));
        assert!(!is_hidden(ROOT_SENTINEL));
    }

    #[test]
    fn rebase_rewrites_prefix_only() {
        assert_eq!(rebase("Docs", "Docs", "Work").as_deref(), Some("Work"));
        assert_eq!(
            rebase("Docs/A.txt", "Docs", "Work").as_deref(),
            Some("Work/A.txt")
        );
        assert_eq!(rebase("Docsier/A.txt", "Docs", "Work"), None);
    }
}
