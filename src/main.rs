use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use gitlab_manager::cli::{self, Cli, Commands};
use gitlab_manager::core::restore::restore_targets;
use gitlab_manager::core::{
    BackupOrchestrator, DockerCli, EnvFile, GitlabApi, HttpProbe, ManagerError, RegistrationOutcome,
    RestoreOrchestrator, RunnerRegistrar, ServiceController, Settings, SystemRunner,
};
use gitlab_manager::utils::{console, logging};

/// Everything a command needs, built once from the environment file
struct AppContext {
    settings: Settings,
    docker: DockerCli,
    service: ServiceController,
}

impl AppContext {
    fn load(env_file: &Path) -> Result<Self> {
        let env = EnvFile::load(env_file)?;
        debug!(keys = ?env.keys(), "environment loaded");
        let settings = Settings::from_env(&env)?;

        let docker = DockerCli::new(Arc::new(SystemRunner::new()), settings.project_root.clone());
        let service = ServiceController::new(
            docker.clone(),
            Arc::new(HttpProbe::new()?),
            settings.gitlab_url.clone(),
        );

        Ok(Self {
            settings,
            docker,
            service,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);
    info!(version = cli::get_version(), command = ?cli.command, "gitlab-manager starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            console::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = AppContext::load(&cli.env_file)
        .with_context(|| format!("failed to load settings from {}", cli.env_file.display()))?;

    match cli.command {
        Commands::Start => handle_start(&ctx).await,
        Commands::Stop => handle_stop(&ctx).await,
        Commands::Restart => handle_restart(&ctx).await,
        Commands::Status => handle_status(&ctx).await,
        Commands::Backup => handle_backup(&ctx).await,
        Commands::Restore => handle_restore(&ctx).await,
        Commands::RegisterRunner { force } => handle_register_runner(&ctx, force).await,
    }
}

async fn handle_start(ctx: &AppContext) -> Result<()> {
    ctx.service.start().await?;

    if ctx.settings.auto_backup {
        console::step("AUTO_BACKUP is enabled, creating backup...");
        handle_backup(ctx).await?;
    }
    Ok(())
}

async fn handle_stop(ctx: &AppContext) -> Result<()> {
    if ctx.settings.auto_backup {
        console::step("AUTO_BACKUP is enabled, creating backup before stopping...");
        handle_backup(ctx).await?;
    }

    ctx.service.stop().await?;
    Ok(())
}

async fn handle_restart(ctx: &AppContext) -> Result<()> {
    ctx.service.restart().await?;
    Ok(())
}

async fn handle_status(ctx: &AppContext) -> Result<()> {
    ctx.service.status().await;
    Ok(())
}

async fn handle_backup(ctx: &AppContext) -> Result<()> {
    BackupOrchestrator::new(&ctx.settings, &ctx.docker).run().await?;
    Ok(())
}

async fn handle_restore(ctx: &AppContext) -> Result<()> {
    console::step("Restore will replace:");
    for target in restore_targets(&ctx.settings) {
        console::step(&format!("  {}", target.display()));
    }

    RestoreOrchestrator::new(&ctx.settings, &ctx.docker, &ctx.service)
        .run()
        .await?;
    Ok(())
}

async fn handle_register_runner(ctx: &AppContext, force: bool) -> Result<()> {
    let token = match &ctx.settings.personal_access_token {
        Some(token) => token.clone(),
        None => prompt_access_token()?,
    };

    let api = GitlabApi::new(&ctx.settings.gitlab_url, token)?;
    let outcome = RunnerRegistrar::new(&ctx.settings, &ctx.docker, &api)
        .register(force)
        .await?;

    match outcome {
        RegistrationOutcome::AlreadyRegistered(ids) => {
            info!(?ids, "runner registration left unchanged");
        }
        RegistrationOutcome::Registered(ids) => {
            info!(?ids, "runner registered");
        }
    }
    Ok(())
}

fn prompt_access_token() -> Result<String> {
    print!("Enter GitLab personal access token: ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let token = line.trim();
    if token.is_empty() {
        return Err(ManagerError::MissingAccessToken.into());
    }
    Ok(token.to_string())
}
