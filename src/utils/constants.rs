/// GitLab Omnibus paths, command names and timing defaults

/// Suffix `gitlab-backup create` appends to every archive
pub const BACKUP_ARCHIVE_SUFFIX: &str = "_gitlab_backup.tar";

/// Extension that identifies a backup artifact
pub const BACKUP_ARCHIVE_EXTENSION: &str = "tar";

/// Archive directory as seen from inside the GitLab container
pub const CONTAINER_BACKUPS_DIR: &str = "/var/opt/gitlab/backups";

/// Configuration directory as seen from inside the GitLab container
pub const CONTAINER_CONFIG_DIR: &str = "/etc/gitlab";

/// File name prefix of the SSH host keys kept in the config directory
pub const SSH_HOST_KEY_PREFIX: &str = "ssh_host_";

/// Owner of restored archives inside the container
pub const BACKUP_OWNER: &str = "git:git";

/// Owner of SSH host keys inside the container
pub const SSH_KEY_OWNER: &str = "root:root";

/// Processes stopped before an in-place restore (web and background jobs)
pub const RESTORE_STOPPED_PROCESSES: &[&str] = &["puma", "sidekiq"];

/// Environment flag that makes `gitlab-backup restore` non-interactive
pub const ASSUME_YES_ENV: (&str, &str) = ("GITLAB_ASSUME_YES", "1");

pub const HEALTH_CHECK_ATTEMPTS: u32 = 60;
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 10;
pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 15;
pub const STATUS_TIMEOUT_SECS: u64 = 10;
pub const API_TIMEOUT_SECS: u64 = 10;

/// Runner registration defaults
pub const DEFAULT_RUNNER_CONTAINER: &str = "gitlab-runner";
pub const DEFAULT_RUNNER_CONFIG_FILE: &str = "/etc/gitlab-runner/config.toml";
pub const DEFAULT_RUNNER_IMAGE: &str = "alpine:latest";
pub const DEFAULT_RUNNER_DESCRIPTION: &str = "auto-runner";
pub const RUNNER_NAME: &str = "DockerRunner";
pub const RUNNER_EXECUTOR: &str = "docker";

/// Header GitLab reads personal access tokens from
pub const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

/// Page size for `GET runners/all`
pub const RUNNERS_PER_PAGE: usize = 100;
