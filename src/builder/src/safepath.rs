//! Symlink-safe path resolution inside a chroot-like root.
//!
//! Walks a target path one component at a time, following directory
//! symlinks as if the root were `/`. Parent references can never climb
//! above the root; they clamp there instead. This is the sole defense
//! against context-escape via symlinks.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_core::error::{KilnError, Result};

/// Symlink resolutions allowed before the walk is declared cyclic.
const MAX_SYMLINK_DEPTH: usize = 20;

/// A target resolved against a sandbox root.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPath {
    /// Real path on the host, always at or under the root.
    pub host: PathBuf,
    /// Normalized absolute path as seen from inside the root.
    pub inside: String,
}

/// Resolve `target` (an absolute path as seen from inside the root)
/// against `root`, following symlinks.
///
/// Components that do not exist yet are appended lexically; the caller
/// may create them later. `..` clamps at the root, both in the target
/// and in any symlink target encountered along the way.
pub fn resolve_under_root(target: &str, root: &Path) -> Result<ScopedPath> {
    let mut pending: VecDeque<String> = components_of(target);
    let mut inside: Vec<String> = Vec::new();
    let mut links = 0usize;

    while let Some(comp) = pending.pop_front() {
        if comp.is_empty() || comp == "." {
            continue;
        }
        if comp == ".." {
            inside.pop();
            continue;
        }

        let mut candidate = inside.clone();
        candidate.push(comp);
        let outside = host_path(root, &candidate);
        assert_scoped(&outside, root, target)?;

        match fs::symlink_metadata(&outside) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The tail may be created later; keep walking lexically.
                inside = candidate;
            }
            Err(e) => return Err(e.into()),
            Ok(md) if md.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINK_DEPTH {
                    return Err(KilnError::Input(format!(
                        "Too many levels of symbolic links: {}",
                        target
                    )));
                }
                let link = fs::read_link(&outside)?;
                let link_str = link.to_string_lossy().into_owned();
                let mut replacement: VecDeque<String> = components_of(&link_str);
                if !link_str.starts_with('/') {
                    // Relative target: restart from the inside-container
                    // parent of the link.
                    for parent_comp in inside.iter().rev() {
                        replacement.push_front(parent_comp.clone());
                    }
                }
                replacement.extend(pending.drain(..));
                pending = replacement;
                inside = Vec::new();
            }
            Ok(_) => {
                inside = candidate;
            }
        }
    }

    let host = host_path(root, &inside);
    assert_scoped(&host, root, target)?;
    Ok(ScopedPath {
        host,
        inside: inside_string(&inside),
    })
}

fn components_of(path: &str) -> VecDeque<String> {
    path.split('/').map(str::to_string).collect()
}

fn host_path(root: &Path, comps: &[String]) -> PathBuf {
    let mut out = root.to_path_buf();
    for c in comps {
        out.push(c);
    }
    out
}

fn inside_string(comps: &[String]) -> String {
    if comps.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", comps.join("/"))
    }
}

fn assert_scoped(outside: &Path, root: &Path, requested: &str) -> Result<()> {
    if outside == root || outside.starts_with(root) {
        Ok(())
    } else {
        Err(KilnError::ForbiddenPath {
            requested: requested.to_string(),
            resolved: outside.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_existing_file() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("dir")).unwrap();
        std::fs::write(root.path().join("dir/file.txt"), "x").unwrap();

        let scoped = resolve_under_root("/dir/file.txt", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("dir/file.txt"));
        assert_eq!(scoped.inside, "/dir/file.txt");
    }

    #[test]
    fn test_nonexistent_tail_is_kept() {
        let root = TempDir::new().unwrap();
        let scoped = resolve_under_root("/a/b/c", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("a/b/c"));
        assert_eq!(scoped.inside, "/a/b/c");
    }

    #[test]
    fn test_dot_and_empty_components_collapse() {
        let root = TempDir::new().unwrap();
        let scoped = resolve_under_root("//a/./b/", root.path()).unwrap();
        assert_eq!(scoped.inside, "/a/b");
    }

    #[test]
    fn test_parent_refs_clamp_at_root() {
        let root = TempDir::new().unwrap();
        let scoped = resolve_under_root("/../../x", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("x"));

        let scoped = resolve_under_root("/a/../../../b", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("b"));
    }

    #[test]
    fn test_absolute_symlink_resolves_inside_root() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::fs::write(root.path().join("real/f"), "x").unwrap();
        symlink("/real", root.path().join("link")).unwrap();

        let scoped = resolve_under_root("/link/f", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("real/f"));
        assert_eq!(scoped.inside, "/real/f");
    }

    #[test]
    fn test_relative_symlink_resolves_against_parent() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("a")).unwrap();
        std::fs::create_dir(root.path().join("b")).unwrap();
        std::fs::write(root.path().join("b/f"), "x").unwrap();
        symlink("../b", root.path().join("a/link")).unwrap();

        let scoped = resolve_under_root("/a/link/f", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("b/f"));
    }

    #[test]
    fn test_escaping_symlink_clamps_to_root() {
        let root = TempDir::new().unwrap();
        symlink("/../../../../..", root.path().join("esc")).unwrap();

        let scoped = resolve_under_root("/esc", root.path()).unwrap();
        assert_eq!(scoped.host, root.path());
        assert_eq!(scoped.inside, "/");

        let scoped = resolve_under_root("/esc/etc/passwd", root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("etc/passwd"));
    }

    #[test]
    fn test_symlink_cycle_is_fatal() {
        let root = TempDir::new().unwrap();
        symlink("b", root.path().join("a")).unwrap();
        symlink("a", root.path().join("b")).unwrap();

        let err = resolve_under_root("/a", root.path()).unwrap_err();
        assert!(err.to_string().contains("Too many levels of symbolic links"));
    }

    #[test]
    fn test_symlink_chain_within_cap() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("target"), "x").unwrap();
        let mut prev = "target".to_string();
        for i in 0..MAX_SYMLINK_DEPTH {
            let name = format!("l{}", i);
            symlink(&prev, root.path().join(&name)).unwrap();
            prev = name;
        }

        let scoped = resolve_under_root(&format!("/{}", prev), root.path()).unwrap();
        assert_eq!(scoped.host, root.path().join("target"));
    }
}
