//! Path-safety and small filesystem helpers shared by the tree codec,
//! the archive extractor and the server handlers.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Normalize a relative path to be safely under a root directory.
///
/// Rejects absolute paths, `..`, prefix/root components and NUL bytes,
/// then resolves the existing part of the joined path and checks the
/// result is still inside `root`. This is the traversal defence applied
/// to every path received off the wire.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let joined = root.join(&safe);

    // Resolve symlinks in whatever part of the path already exists so a
    // link pointing outside the root cannot smuggle writes out.
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("canonicalize {}: {}", joined.display(), e))?
    } else if let Some(parent) = joined.parent() {
        if parent.exists() {
            let canonical_parent = parent
                .canonicalize()
                .map_err(|e| anyhow!("canonicalize {}: {}", parent.display(), e))?;
            match joined.file_name() {
                Some(name) => canonical_parent.join(name),
                None => canonical_parent,
            }
        } else {
            joined
        }
    } else {
        joined
    };

    let canonical_root = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    if !final_path.starts_with(&canonical_root) {
        bail!(
            "path {} escapes workspace root {}",
            p.display(),
            root.display()
        );
    }
    Ok(final_path)
}

/// Validate one path segment received off the wire.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("mkdir {}", path.display()))?;
    }
    Ok(())
}

pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}

/// Wall-clock now in UTC milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Modification time of a `Metadata` in UTC milliseconds; 0 when the
/// platform cannot report one.
pub fn mtime_millis(md: &std::fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// POSIX permission bits of a `Metadata`; a plausible default elsewhere.
#[cfg(unix)]
pub fn perm_bits(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn perm_bits(md: &std::fs::Metadata) -> u32 {
    if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Move `tmp` over `target`, falling back to delete-then-rename when the
/// platform refuses to replace atomically. On failure the temp file is
/// removed.
pub fn move_over(tmp: &Path, target: &Path) -> Result<()> {
    match std::fs::rename(tmp, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = std::fs::remove_file(target);
            std::fs::rename(tmp, target).map_err(|e| {
                let _ = std::fs::remove_file(tmp);
                anyhow!(
                    "replace {} with {}: {}",
                    target.display(),
                    tmp.display(),
                    e
                )
            })
        }
    }
}
