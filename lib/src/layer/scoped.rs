//! Path resolution scoped to an extraction root.
//!
//! Tar archives are untrusted input: entry names may try to escape via
//! `..` or absolute names, and symlinks inside the tree may point
//! anywhere. Every path is first cleaned lexically (clamped at the root),
//! then resolved component by component with symlink expansion that
//! reinterprets absolute targets as relative to the root.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

// Bounds symlink expansion; same order of magnitude as kernel ELOOP
// limits.
const MAX_SYMLINK_EXPANSIONS: u32 = 255;

/// Clean a tar entry name into a relative path with no `.` or `..`
/// components, treating the name as anchored at the root (so leading `..`
/// components cannot escape, they are simply dropped). Returns `None` for
/// names that reduce to the root itself.
pub(crate) fn clean_entry_name(name: &str) -> Option<Utf8PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in Utf8Path::new(name).components() {
        match comp {
            Utf8Component::Normal(p) => parts.push(p),
            Utf8Component::ParentDir => {
                parts.pop();
            }
            Utf8Component::RootDir | Utf8Component::CurDir | Utf8Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.iter().collect())
    }
}

/// Resolve `path` (already cleaned, relative) against `root`, expanding
/// intermediate symlinks without ever leaving the root. The final
/// component is not followed. The result is a relative path whose
/// intermediate components are real directories (or do not exist yet).
pub(crate) fn resolve_in_root(root: &Utf8Path, path: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut queue: VecDeque<Utf8PathBuf> = path
        .components()
        .filter_map(|c| match c {
            Utf8Component::Normal(p) => Some(Utf8PathBuf::from(p)),
            _ => None,
        })
        .collect();
    let mut resolved = Utf8PathBuf::new();
    let mut expansions = 0u32;

    while let Some(part) = queue.pop_front() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }
        let candidate = resolved.join(&part);
        let meta = match std::fs::symlink_metadata(root.join(&candidate)) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Nothing on disk from here on; the rest is lexical.
                resolved = candidate;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if meta.file_type().is_symlink() && !queue.is_empty() {
            expansions += 1;
            if expansions > MAX_SYMLINK_EXPANSIONS {
                bail!("too many levels of symbolic links resolving {path}");
            }
            let target = std::fs::read_link(root.join(&candidate))?;
            let target = Utf8PathBuf::try_from(target)?;
            // An absolute target means "from the root of the tree being
            // extracted", not the host root.
            if target.has_root() {
                resolved = Utf8PathBuf::new();
            }
            for comp in target.components().rev() {
                match comp {
                    Utf8Component::Normal(p) => queue.push_front(p.into()),
                    Utf8Component::ParentDir => queue.push_front("..".into()),
                    _ => {}
                }
            }
        } else {
            resolved = candidate;
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean_entry_name("a/b/c").unwrap(), Utf8PathBuf::from("a/b/c"));
        assert_eq!(clean_entry_name("/a//b/./c").unwrap(), Utf8PathBuf::from("a/b/c"));
        assert_eq!(
            clean_entry_name("etc/../../../../etc/passwd").unwrap(),
            Utf8PathBuf::from("etc/passwd")
        );
        assert_eq!(clean_entry_name("a/b/..").unwrap(), Utf8PathBuf::from("a"));
        assert!(clean_entry_name("/").is_none());
        assert!(clean_entry_name("./").is_none());
        assert!(clean_entry_name("../..").is_none());
    }

    fn setup_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().to_owned()).unwrap();
        (td, root)
    }

    #[test]
    fn test_resolve_plain() -> Result<()> {
        let (_td, root) = setup_root();
        std::fs::create_dir_all(root.join("a/b"))?;
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("a/b/c"))?,
            Utf8PathBuf::from("a/b/c")
        );
        // Non-existent intermediates resolve lexically
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("x/y/z"))?,
            Utf8PathBuf::from("x/y/z")
        );
        Ok(())
    }

    #[test]
    fn test_resolve_relative_symlink() -> Result<()> {
        let (_td, root) = setup_root();
        std::fs::create_dir_all(root.join("usr/lib"))?;
        std::os::unix::fs::symlink("usr/lib", root.join("lib"))?;
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("lib/libc.so"))?,
            Utf8PathBuf::from("usr/lib/libc.so")
        );
        Ok(())
    }

    #[test]
    fn test_resolve_absolute_symlink_stays_inside() -> Result<()> {
        let (_td, root) = setup_root();
        std::fs::create_dir_all(root.join("etc"))?;
        // Points at the host /etc if followed naively
        std::os::unix::fs::symlink("/etc", root.join("conf"))?;
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("conf/passwd"))?,
            Utf8PathBuf::from("etc/passwd")
        );
        Ok(())
    }

    #[test]
    fn test_resolve_dotdot_symlink_clamped() -> Result<()> {
        let (_td, root) = setup_root();
        std::fs::create_dir_all(root.join("a"))?;
        std::os::unix::fs::symlink("../../../outside", root.join("a/esc"))?;
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("a/esc/f"))?,
            Utf8PathBuf::from("outside/f")
        );
        Ok(())
    }

    #[test]
    fn test_final_component_not_followed() -> Result<()> {
        let (_td, root) = setup_root();
        std::fs::create_dir_all(root.join("real"))?;
        std::os::unix::fs::symlink("real", root.join("sym"))?;
        assert_eq!(
            resolve_in_root(&root, Utf8Path::new("sym"))?,
            Utf8PathBuf::from("sym")
        );
        Ok(())
    }

    #[test]
    fn test_symlink_loop_bounded() -> Result<()> {
        let (_td, root) = setup_root();
        std::os::unix::fs::symlink("b", root.join("a"))?;
        std::os::unix::fs::symlink("a", root.join("b"))?;
        assert!(resolve_in_root(&root, Utf8Path::new("a/file")).is_err());
        Ok(())
    }
}
