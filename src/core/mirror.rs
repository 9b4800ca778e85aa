/// Directory mirroring
///
/// A mirror makes `destination` structurally identical to `source` minus a
/// set of excluded paths. The destination is always removed first, so
/// nothing from a previous run can survive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::error::{ManagerError, Result};

/// Replace `destination` with a copy of `source`, skipping `exclude`.
///
/// Exclusions are compared against each entry's resolved absolute path, one
/// directory level at a time. `label` names the category in errors.
pub fn mirror(label: &str, source: &Path, destination: &Path, exclude: &[PathBuf]) -> Result<()> {
    let failed = |source: io::Error| ManagerError::Mirror {
        label: label.to_string(),
        source,
    };

    let source_abs = fs::canonicalize(source).map_err(failed)?;
    if !source_abs.is_dir() {
        return Err(failed(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", source.display()),
        )));
    }

    let destination_abs = resolve(destination);
    let overlap = if destination_abs.starts_with(&source_abs) {
        Some("inside")
    } else if source_abs.starts_with(&destination_abs) {
        Some("an ancestor of")
    } else {
        None
    };
    if let Some(relation) = overlap {
        return Err(failed(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "destination {} is {} source {}",
                destination.display(),
                relation,
                source.display()
            ),
        )));
    }

    let excluded: Vec<PathBuf> = exclude.iter().map(|p| resolve(p)).collect();

    info!(label, source = %source_abs.display(), destination = %destination_abs.display(), "mirroring");

    if fs::symlink_metadata(&destination_abs).is_ok() {
        force_remove(&destination_abs).map_err(failed)?;
    }
    if let Some(parent) = destination_abs.parent() {
        fs::create_dir_all(parent).map_err(failed)?;
    }

    copy_tree(&source_abs, &destination_abs, &excluded).map_err(failed)
}

/// Remove a file or directory tree, clearing read-only bits first
pub fn remove_tree_forced(path: &Path) -> Result<()> {
    force_remove(path).map_err(|source| ManagerError::RemoveFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Best-effort absolute form of `path`, which may not exist yet
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => resolve_existing_prefix(parent).join(name),
        _ => absolute,
    }
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => resolve_existing_prefix(parent).join(name),
        _ => path.to_path_buf(),
    }
}

fn copy_tree(source: &Path, destination: &Path, excluded: &[PathBuf]) -> io::Result<()> {
    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let skip = excluded.iter().any(|e| e == entry.path());
            if skip {
                debug!(path = %entry.path().display(), "excluded from mirror");
            }
            !skip
        });

    let mut directories = Vec::new();
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            directories.push((entry.into_path(), target));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    // Deepest first, so a read-only source directory can still be filled
    for (source_dir, target) in directories.into_iter().rev() {
        fs::set_permissions(&target, fs::metadata(&source_dir)?.permissions())?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

fn force_remove(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        clear_readonly(path)?;
        fs::remove_dir_all(path)
    } else {
        if !meta.file_type().is_symlink() {
            make_writable(path, &meta)?;
        }
        fs::remove_file(path)
    }
}

/// Pre-pass over a tree making every directory and file owner-writable
fn clear_readonly(dir: &Path) -> io::Result<()> {
    for entry in WalkDir::new(dir).follow_links(false).contents_first(false) {
        let entry = entry?;
        if entry.file_type().is_symlink() {
            continue;
        }
        make_writable(entry.path(), &entry.metadata()?)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_writable(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode();
    let wanted = if meta.is_dir() { mode | 0o700 } else { mode | 0o600 };
    if wanted != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(wanted))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
