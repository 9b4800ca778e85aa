/// Backup orchestration
///
/// 1. `gitlab-backup create` inside the GitLab container
/// 2. pick the newest archive in the (bind-mounted) backups directory
/// 3. prune every other archive and any stray subdirectory there
/// 4. mirror base files, archives, configuration and secrets to the
///    backup location
///
/// Each `gitlab-backup create` adds one archive; only the newest matters
/// for recovery, so pruning keeps storage bounded without a retention knob.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::core::config::Settings;
use crate::core::docker::DockerCli;
use crate::core::error::{ManagerError, Result};
use crate::core::mirror::{mirror, remove_tree_forced};
use crate::utils::console;
use crate::utils::{format_bytes, format_system_time, BACKUP_ARCHIVE_EXTENSION, BACKUP_ARCHIVE_SUFFIX};

/// One archive produced by `gitlab-backup create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: SystemTime,
    pub size: u64,
}

impl BackupArtifact {
    /// Identifier accepted by `gitlab-backup restore BACKUP=<id>`
    pub fn backup_id(&self) -> &str {
        self.file_name
            .strip_suffix(BACKUP_ARCHIVE_SUFFIX)
            .or_else(|| {
                self.file_name
                    .strip_suffix(BACKUP_ARCHIVE_EXTENSION)
                    .and_then(|s| s.strip_suffix('.'))
            })
            .unwrap_or(&self.file_name)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} ({}, {})",
            self.file_name,
            format_bytes(self.size),
            format_system_time(self.modified)
        )
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext == BACKUP_ARCHIVE_EXTENSION)
        .unwrap_or(false)
}

/// Regular `.tar` files directly inside `dir`, sorted by name.
///
/// A missing directory simply has no artifacts.
pub fn list_artifacts(dir: &Path) -> Result<Vec<BackupArtifact>> {
    let io_err = |source: io::Error| ManagerError::Io {
        context: format!("failed to read backups in {}", dir.display()),
        source,
    };

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let meta = entry.metadata().map_err(io_err)?;

        if !meta.is_file() || !is_archive(&path) {
            continue;
        }

        artifacts.push(BackupArtifact {
            file_name: entry.file_name().to_string_lossy().to_string(),
            modified: meta.modified().map_err(io_err)?,
            size: meta.len(),
            path,
        });
    }

    artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(artifacts)
}

/// Most recently modified artifact; ties go to the later file name
pub fn newest_artifact(artifacts: &[BackupArtifact]) -> Option<&BackupArtifact> {
    artifacts
        .iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.file_name.cmp(&b.file_name)))
}

/// Deletes one pruned entry; `is_dir` tells stray trees from archives
pub type RemoveEntry = fn(&Path, bool) -> Result<()>;

fn remove_entry(path: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        remove_tree_forced(path)
    } else {
        fs::remove_file(path).map_err(|source| ManagerError::RemoveFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Remove every archive except `keep`, plus any subdirectory, from `dir`.
///
/// Individual failures are reported as warnings and collected; if any
/// occurred the whole step fails with [`ManagerError::PruneFailed`].
pub fn prune_backups(dir: &Path, keep: &BackupArtifact) -> Result<Vec<PathBuf>> {
    prune_with(dir, keep, remove_entry)
}

fn prune_with(dir: &Path, keep: &BackupArtifact, remove: RemoveEntry) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| ManagerError::Io {
        context: format!("failed to read backups in {}", dir.display()),
        source,
    })?;

    let mut removed = Vec::new();
    let mut failed = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                console::warn(&format!("Could not read entry in {}: {}", dir.display(), e));
                failed.push(dir.to_path_buf());
                continue;
            }
        };
        let path = entry.path();
        if path == keep.path {
            continue;
        }

        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let outcome = if is_dir || is_archive(&path) {
            remove(&path, is_dir)
        } else {
            debug!(path = %path.display(), "leaving non-archive file in place");
            continue;
        };

        match outcome {
            Ok(()) => {
                debug!(path = %path.display(), "pruned");
                removed.push(path);
            }
            Err(e) => {
                console::warn(&e.to_string());
                failed.push(path);
            }
        }
    }

    if failed.is_empty() {
        Ok(removed)
    } else {
        Err(ManagerError::PruneFailed(failed))
    }
}

pub struct BackupOrchestrator<'a> {
    settings: &'a Settings,
    docker: &'a DockerCli,
    remove: RemoveEntry,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(settings: &'a Settings, docker: &'a DockerCli) -> Self {
        Self {
            settings,
            docker,
            remove: remove_entry,
        }
    }

    #[cfg(test)]
    fn with_remover(mut self, remove: RemoveEntry) -> Self {
        self.remove = remove;
        self
    }

    /// Run the full backup sequence, returning the archive that was kept
    pub async fn run(&self) -> Result<BackupArtifact> {
        self.create_backup().await?;

        let backups_dir = &self.settings.backups.live;
        console::step(&format!("Finding latest backup in {}...", backups_dir.display()));
        let artifacts = list_artifacts(backups_dir)?;
        let keep = newest_artifact(&artifacts)
            .cloned()
            .ok_or_else(|| ManagerError::NoBackupArtifact(backups_dir.clone()))?;
        console::step(&format!("Latest backup: {}", keep.describe()));

        console::step("Deleting old backups...");
        let removed = prune_with(backups_dir, &keep, self.remove)?;
        console::success(&format!("Old backups deleted ({} removed)", removed.len()));

        self.mirror_all()?;

        info!(archive = %keep.file_name, "backup complete");
        console::success("Backup completed successfully!");
        Ok(keep)
    }

    async fn create_backup(&self) -> Result<()> {
        console::step("Creating new backup in GitLab container...");
        self.docker
            .exec_in(&self.settings.gitlab_container, &["gitlab-backup", "create"])
            .await?;
        console::success("Backup created successfully inside container");
        Ok(())
    }

    fn mirror_all(&self) -> Result<()> {
        let s = self.settings;
        let app_dir = [s.app_dir.clone()];
        let categories: [(&str, &Path, &Path, &[PathBuf]); 4] = [
            ("base files", s.base.live.as_path(), s.base.backup.as_path(), &app_dir[..]),
            ("backup archives", s.backups.live.as_path(), s.backups.backup.as_path(), &[]),
            ("configuration", s.config.live.as_path(), s.config.backup.as_path(), &[]),
            ("secrets", s.secrets.live.as_path(), s.secrets.backup.as_path(), &[]),
        ];

        for (label, live, backup, exclude) in categories {
            console::step(&format!("Copying {} to {}...", label, backup.display()));
            mirror(label, live, backup, exclude)?;
        }
        console::success("Configs and secrets copied");
        Ok(())
    }
}
