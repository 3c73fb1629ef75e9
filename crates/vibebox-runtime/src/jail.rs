use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use vibebox_core::error::SandboxError;

/// Lexically clean a relative path: drop `.` components and resolve
/// `..` against earlier components. A path that would climb above its
/// starting point is a `PathEscape` error.
pub fn clean_relative(rel: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxError::PathEscape(rel.to_string()).into());
                }
            }
            // Absolute/prefix components have no business in a
            // relative path.
            _ => return Err(SandboxError::PathEscape(rel.to_string()).into()),
        }
    }
    Ok(parts.join("/"))
}

/// Resolve a requested cwd against the project root on the host.
/// Empty means the root itself; absolute paths must stay inside the
/// root; relative paths are cleaned and joined.
pub fn resolve_host_cwd(project_root: &Path, cwd: &str) -> Result<PathBuf> {
    if cwd.is_empty() {
        return Ok(project_root.to_path_buf());
    }
    if Path::new(cwd).is_absolute() {
        let requested = Path::new(cwd);
        if !requested.starts_with(project_root) {
            return Err(SandboxError::PathEscape(cwd.to_string()).into());
        }
        // Re-clean the part below the root so `..` cannot climb out.
        let below = requested
            .strip_prefix(project_root)
            .expect("starts_with checked above");
        let cleaned = clean_relative(&below.to_string_lossy())?;
        return Ok(project_root.join(cleaned));
    }
    let cleaned = clean_relative(cwd)?;
    Ok(project_root.join(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_relative_normalizes() {
        assert_eq!(clean_relative("a/./b").unwrap(), "a/b");
        assert_eq!(clean_relative("a/b/../c").unwrap(), "a/c");
        assert_eq!(clean_relative("").unwrap(), "");
    }

    #[test]
    fn test_clean_relative_rejects_escape() {
        for bad in ["..", "../x", "a/../../x"] {
            let err = clean_relative(bad).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<SandboxError>(),
                    Some(SandboxError::PathEscape(_))
                ),
                "{} should escape",
                bad
            );
        }
    }

    #[test]
    fn test_resolve_host_cwd() {
        let root = Path::new("/home/user/project");
        assert_eq!(resolve_host_cwd(root, "").unwrap(), root);
        assert_eq!(
            resolve_host_cwd(root, "src/api").unwrap(),
            root.join("src/api")
        );
        assert_eq!(
            resolve_host_cwd(root, "/home/user/project/src").unwrap(),
            root.join("src")
        );
    }

    #[test]
    fn test_resolve_host_cwd_rejects_escapes() {
        let root = Path::new("/home/user/project");
        assert!(resolve_host_cwd(root, "../other").is_err());
        assert!(resolve_host_cwd(root, "/etc").is_err());
        assert!(resolve_host_cwd(root, "/home/user/project/../other").is_err());
    }
}
