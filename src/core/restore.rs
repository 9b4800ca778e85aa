/// Restore orchestration
///
/// Inverse of the backup: stop GitLab, replace live data with the backup
/// copies, bring GitLab back, fix ownership, run `gitlab-backup restore`,
/// then cycle the stack. Steps already completed are never rolled back.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::backup::{list_artifacts, BackupArtifact};
use crate::core::config::Settings;
use crate::core::docker::DockerCli;
use crate::core::error::{ManagerError, Result};
use crate::core::mirror::{mirror, remove_tree_forced};
use crate::core::service::ServiceController;
use crate::utils::console;
use crate::utils::{
    ASSUME_YES_ENV, BACKUP_OWNER, CONTAINER_BACKUPS_DIR, CONTAINER_CONFIG_DIR,
    RESTORE_STOPPED_PROCESSES, SSH_HOST_KEY_PREFIX, SSH_KEY_OWNER,
};

/// The single archive in `dir`.
///
/// Zero or several candidates is an error: the operator must curate the
/// directory rather than have a backup picked for them.
pub fn find_single_archive(dir: &Path) -> Result<BackupArtifact> {
    let mut artifacts = list_artifacts(dir)?;
    match artifacts.len() {
        0 => Err(ManagerError::NoBackupArtifact(dir.to_path_buf())),
        1 => Ok(artifacts.remove(0)),
        _ => Err(ManagerError::AmbiguousBackups {
            dir: dir.to_path_buf(),
            found: artifacts.into_iter().map(|a| a.file_name).collect(),
        }),
    }
}

/// SSH host key file names in the GitLab config directory, sorted
fn ssh_host_keys(config_dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(config_dir).map_err(|source| ManagerError::Io {
        context: format!("failed to read {}", config_dir.display()),
        source,
    })?;

    let mut keys = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ManagerError::Io {
            context: format!("failed to read {}", config_dir.display()),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(SSH_HOST_KEY_PREFIX) && entry.path().is_file() {
            keys.push(name);
        }
    }
    keys.sort();
    Ok(keys)
}

pub struct RestoreOrchestrator<'a> {
    settings: &'a Settings,
    docker: &'a DockerCli,
    service: &'a ServiceController,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(settings: &'a Settings, docker: &'a DockerCli, service: &'a ServiceController) -> Self {
        Self {
            settings,
            docker,
            service,
        }
    }

    /// Run the full restore sequence, returning the archive restored from
    pub async fn run(&self) -> Result<BackupArtifact> {
        let s = self.settings;

        console::step(&format!("Finding backup in {}...", s.backups.backup.display()));
        let archive = find_single_archive(&s.backups.backup)?;
        let backup_id = archive.backup_id().to_string();
        console::step(&format!("Using backup: {}", archive.describe()));

        self.service.stop().await?;

        if s.app_dir.exists() {
            console::step(&format!("Removing existing GitLab data in {}...", s.app_dir.display()));
            remove_tree_forced(&s.app_dir)?;
            console::success("Existing GitLab data removed");
        }

        self.mirror_back()?;

        self.service.start().await?;

        self.fix_permissions(&archive.file_name).await?;
        self.stop_processes().await;

        console::step(&format!("Restoring backup {} inside container...", archive.file_name));
        let backup_arg = format!("BACKUP={}", backup_id);
        self.docker
            .exec_with_env(
                &s.gitlab_container,
                &[ASSUME_YES_ENV],
                &["gitlab-backup", "restore", &backup_arg],
            )
            .await?;
        console::success(&format!("Backup {} restored", archive.file_name));

        console::step("Reconfiguring GitLab...");
        self.docker
            .exec_in(&s.gitlab_container, &["gitlab-ctl", "reconfigure"])
            .await?;

        self.service.stop().await?;
        self.service.start().await?;

        info!(archive = %archive.file_name, backup_id = %backup_id, "restore complete");
        console::success("Backup, configs and secrets restored successfully!");
        Ok(archive)
    }

    fn mirror_back(&self) -> Result<()> {
        let s = self.settings;
        let categories = [
            ("backup archives", &s.backups),
            ("configuration", &s.config),
            ("secrets", &s.secrets),
        ];

        for (label, pair) in categories {
            console::step(&format!("Restoring {} to {}...", label, pair.live.display()));
            mirror(label, &pair.backup, &pair.live, &[])?;
        }
        console::success("Backup archives, configs and secrets copied back");
        Ok(())
    }

    async fn fix_permissions(&self, archive_name: &str) -> Result<()> {
        let container = &self.settings.gitlab_container;
        console::step("Fixing ownership and permissions...");

        let archive_path = format!("{}/{}", CONTAINER_BACKUPS_DIR, archive_name);
        self.docker
            .exec_in(container, &["chown", BACKUP_OWNER, &archive_path])
            .await?;

        let keys = ssh_host_keys(&self.settings.config.live)?;
        if !keys.is_empty() {
            let in_container: Vec<String> = keys
                .iter()
                .map(|k| format!("{}/{}", CONTAINER_CONFIG_DIR, k))
                .collect();

            let mut chown = vec!["chown", SSH_KEY_OWNER];
            chown.extend(in_container.iter().map(String::as_str));
            self.docker.exec_in(container, &chown).await?;

            let mut chmod = vec!["chmod", "600"];
            chmod.extend(in_container.iter().map(String::as_str));
            self.docker.exec_in(container, &chmod).await?;
        }

        console::success("Ownership and permissions fixed");
        Ok(())
    }

    /// Stop web and background-job processes; they may already be down
    async fn stop_processes(&self) {
        for &process in RESTORE_STOPPED_PROCESSES {
            console::step(&format!("Stopping {} service...", process));
            if let Err(e) = self
                .docker
                .exec_in(&self.settings.gitlab_container, &["gitlab-ctl", "stop", process])
                .await
            {
                console::warn(&format!("Could not stop {}: {}", process, e));
            }
        }
    }
}

/// Live locations that a restore would overwrite, for operator display
pub fn restore_targets(settings: &Settings) -> Vec<PathBuf> {
    vec![
        settings.app_dir.clone(),
        settings.backups.live.clone(),
        settings.config.live.clone(),
        settings.secrets.live.clone(),
    ]
}
