/// Error taxonomy for lifecycle operations
///
/// Every variant is fatal for the command that produced it; advisory
/// failures never become a `ManagerError`, they are printed as warnings.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing required settings: {}", .0.join(", "))]
    MissingSettings(Vec<String>),

    #[error("invalid value for {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("command failed: `{command}` ({reason})")]
    CommandFailed { command: String, reason: String },

    #[error("failed to copy {label}: {source}")]
    Mirror {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {}: {source}", .path.display())]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no backup archive found in {}", .0.display())]
    NoBackupArtifact(PathBuf),

    #[error("expected exactly one backup archive in {}, found {}: {}", .dir.display(), .found.len(), .found.join(", "))]
    AmbiguousBackups { dir: PathBuf, found: Vec<String> },

    #[error("could not remove old backups: {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    PruneFailed(Vec<PathBuf>),

    #[error("GitLab failed to start after {attempts} attempts. Check Docker logs or network settings.")]
    StartTimeout { attempts: u32 },

    #[error("GitLab API error: {0}")]
    Api(String),

    #[error("personal access token is required")]
    MissingAccessToken,

    #[error("GitLab did not return a runner registration token")]
    MissingRegistrationToken,

    #[error("GitLab Runner registration failed: {0}")]
    RegistrationFailed(String),
}
