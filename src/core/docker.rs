/// Docker and Docker Compose integration
///
/// Builds `docker compose` / `docker exec` / `docker restart` invocations and
/// runs them through a [`CommandRunner`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::Result;
use crate::core::process::{CommandLine, CommandRunner, OutputMode};

#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    project_root: PathBuf,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            project_root: project_root.into(),
        }
    }

    /// Directory the compose file lives in
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Build a `docker compose <args>` invocation rooted at the project
    pub fn compose(&self, args: &[&str]) -> CommandLine {
        CommandLine::new("docker")
            .arg("compose")
            .args(args.iter().copied())
            .current_dir(&self.project_root)
    }

    /// Build a `docker exec [-e K=V]... <container> <argv>` invocation
    pub fn exec(&self, container: &str, env: &[(&str, &str)], argv: &[&str]) -> CommandLine {
        let mut cmd = CommandLine::new("docker").arg("exec");
        for (key, value) in env {
            cmd = cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        cmd.arg(container).args(argv.iter().copied())
    }

    /// Run a prepared command, inheriting stdio
    pub async fn run(&self, command: &CommandLine) -> Result<()> {
        self.runner.execute(command, OutputMode::Inherit).await?;
        Ok(())
    }

    /// Run a prepared command and return its trimmed stdout
    pub async fn output(&self, command: &CommandLine) -> Result<String> {
        self.runner.execute(command, OutputMode::Capture).await
    }

    /// Start the stack in the background
    pub async fn compose_up(&self) -> Result<()> {
        self.run(&self.compose(&["up", "-d"])).await
    }

    /// Stop and remove the stack's containers
    pub async fn compose_down(&self) -> Result<()> {
        self.run(&self.compose(&["down"])).await
    }

    /// Execute a command inside a running container
    pub async fn exec_in(&self, container: &str, argv: &[&str]) -> Result<()> {
        self.run(&self.exec(container, &[], argv)).await
    }

    /// Execute a command inside a container with extra environment
    pub async fn exec_with_env(&self, container: &str, env: &[(&str, &str)], argv: &[&str]) -> Result<()> {
        self.run(&self.exec(container, env, argv)).await
    }

    /// Restart a single container
    pub async fn restart_container(&self, container: &str) -> Result<()> {
        self.run(&CommandLine::new("docker").args(["restart", container])).await
    }
}
