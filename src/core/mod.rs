pub mod api;
pub mod backup;
pub mod config;
pub mod docker;
pub mod error;
pub mod mirror;
pub mod process;
pub mod restore;
pub mod runner;
pub mod service;

#[cfg(test)]
mod testing;

pub use api::GitlabApi;
pub use backup::BackupOrchestrator;
pub use config::{EnvFile, Settings};
pub use docker::DockerCli;
pub use error::{ManagerError, Result};
pub use process::SystemRunner;
pub use restore::RestoreOrchestrator;
pub use runner::{RegistrationOutcome, RunnerRegistrar};
pub use service::{HttpProbe, ServiceController};
