/// GitLab Runner registration
///
/// Walks `Unregistered -> Registered` through the REST API and the runner
/// container. A forced run first tears existing registrations down.

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::api::{ApiResponse, RunnerApi};
use crate::core::config::Settings;
use crate::core::docker::DockerCli;
use crate::core::error::{ManagerError, Result};
use crate::utils::console;
use crate::utils::{mask_sensitive, RUNNERS_PER_PAGE, RUNNER_EXECUTOR, RUNNER_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered(Vec<u64>),
    /// The registration command failed inside the runner container
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Nothing was changed; these runners already exist
    AlreadyRegistered(Vec<u64>),
    Registered(Vec<u64>),
}

/// Entry of a `GET runners/all` listing
#[derive(Debug, Deserialize)]
struct RunnerSummary {
    id: u64,
}

/// Body of a `POST user/runners` response
#[derive(Debug, Deserialize)]
struct CreatedRunner {
    token: Option<String>,
}

/// Runner ids from one page of a `GET runners/all` body
pub fn runner_ids(body: &Value) -> Result<Vec<u64>> {
    Vec::<RunnerSummary>::deserialize(body)
        .map(|runners| runners.into_iter().map(|r| r.id).collect())
        .map_err(|e| ManagerError::Api(format!("unexpected runner list: {}", e)))
}

/// `sed` expression replacing the value of `key = ...` lines
///
/// The key is escaped for a basic regular expression and the value for the
/// replacement side, so neither can break out of the `s///` command.
pub fn override_expression(key: &str, value: &str) -> String {
    let mut escaped_key = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '.' | '[' | ']' | '*' | '^' | '$' | '\\' | '/') {
            escaped_key.push('\\');
        }
        escaped_key.push(c);
    }

    let mut escaped_value = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '/' | '&') {
            escaped_value.push('\\');
        }
        escaped_value.push(c);
    }

    format!(
        "s/^\\([[:space:]]*{}[[:space:]]*=\\).*/\\1 {}/",
        escaped_key, escaped_value
    )
}

pub struct RunnerRegistrar<'a> {
    settings: &'a Settings,
    docker: &'a DockerCli,
    api: &'a dyn RunnerApi,
}

impl<'a> RunnerRegistrar<'a> {
    pub fn new(settings: &'a Settings, docker: &'a DockerCli, api: &'a dyn RunnerApi) -> Self {
        Self {
            settings,
            docker,
            api,
        }
    }

    /// Registrations GitLab currently knows about
    pub async fn current_state(&self) -> Result<RegistrationState> {
        let ids = self.list_runner_ids().await?;
        if ids.is_empty() {
            Ok(RegistrationState::Unregistered)
        } else {
            Ok(RegistrationState::Registered(ids))
        }
    }

    /// Every runner id, following pages until a short one
    async fn list_runner_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut page = 1;

        loop {
            let path = format!("runners/all?per_page={}&page={}", RUNNERS_PER_PAGE, page);
            let batch = match self.api.request(Method::GET, &path, None).await {
                ApiResponse::Data(body) => runner_ids(&body)?,
                ApiResponse::NoContent => Vec::new(),
                ApiResponse::Error(e) => {
                    return Err(ManagerError::Api(format!("failed to list runners: {}", e)))
                }
            };

            let last_page = batch.len() < RUNNERS_PER_PAGE;
            ids.extend(batch);
            if last_page {
                return Ok(ids);
            }
            page += 1;
        }
    }

    pub async fn register(&self, force: bool) -> Result<RegistrationOutcome> {
        console::step("Checking existing runner registrations...");
        let state = self.current_state().await?;

        if let RegistrationState::Registered(ids) = &state {
            if !force {
                console::success(&format!(
                    "GitLab Runner already registered (ids: {}). Use --force to re-register.",
                    join_ids(ids)
                ));
                return Ok(RegistrationOutcome::AlreadyRegistered(ids.clone()));
            }
            self.unregister(ids).await;
        }

        match self.register_new().await? {
            RegistrationState::Registered(ids) => {
                console::success("GitLab Runner registered successfully!");
                Ok(RegistrationOutcome::Registered(ids))
            }
            RegistrationState::Error(reason) => Err(ManagerError::RegistrationFailed(reason)),
            RegistrationState::Unregistered => Err(ManagerError::RegistrationFailed(
                "runner is not registered after registration".to_string(),
            )),
        }
    }

    /// Delete every registration and the local runner config; failures only warn
    async fn unregister(&self, ids: &[u64]) {
        console::step("Removing existing runner registrations...");
        for id in ids {
            let path = format!("runners/{}", id);
            match self.api.request(Method::DELETE, &path, None).await {
                ApiResponse::Error(e) => console::warn(&format!("Failed to delete runner {}: {}", id, e)),
                _ => console::success(&format!("Deleted runner {}", id)),
            }
        }

        let config = &self.settings.runner_config_file;
        if let Err(e) = self
            .docker
            .exec_in(&self.settings.runner_container, &["rm", "-f", config])
            .await
        {
            console::warn(&format!("Failed to remove runner config {}: {}", config, e));
        }
    }

    async fn register_new(&self) -> Result<RegistrationState> {
        let s = self.settings;

        console::step("Requesting runner registration token...");
        let token = self.registration_token().await?;
        console::success(&format!("Received registration token {}", mask_sensitive(&token, 4)));

        console::step("Registering GitLab Runner...");
        let extra_hosts = format!("{}:host-gateway", s.gitlab_host);
        let register: [&str; 15] = [
            "gitlab-runner",
            "register",
            "--non-interactive",
            "--name",
            RUNNER_NAME,
            "--url",
            &s.gitlab_url,
            "--token",
            &token,
            "--executor",
            RUNNER_EXECUTOR,
            "--docker-image",
            &s.runner_image,
            "--docker-extra-hosts",
            &extra_hosts,
        ];
        if let Err(e) = self.docker.exec_in(&s.runner_container, &register).await {
            return Ok(RegistrationState::Error(e.to_string()));
        }

        for (key, value) in &s.runner_settings {
            console::step(&format!("Setting runner option {} = {}", key, value));
            let expression = override_expression(key, value);
            self.docker
                .exec_in(
                    &s.runner_container,
                    &["sed", "-i", &expression, &s.runner_config_file],
                )
                .await?;
        }

        console::step("Restarting GitLab Runner...");
        self.docker.restart_container(&s.runner_container).await?;

        let ids = match self.current_state().await {
            Ok(RegistrationState::Registered(ids)) => ids,
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "could not list runners after registration");
                Vec::new()
            }
        };
        info!(ids = %join_ids(&ids), "runner registered");
        Ok(RegistrationState::Registered(ids))
    }

    async fn registration_token(&self) -> Result<String> {
        let description = self.settings.runner_description.as_str();
        let form = [
            ("runner_type", "instance_type"),
            ("description", description),
            ("run_untagged", "true"),
        ];

        match self.api.request(Method::POST, "user/runners", Some(&form)).await {
            ApiResponse::Data(body) => CreatedRunner::deserialize(&body)
                .ok()
                .and_then(|created| created.token)
                .filter(|t| !t.is_empty())
                .ok_or(ManagerError::MissingRegistrationToken),
            ApiResponse::NoContent => Err(ManagerError::MissingRegistrationToken),
            ApiResponse::Error(e) => {
                warn!(error = %e, "runner token request failed");
                Err(ManagerError::MissingRegistrationToken)
            }
        }
    }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backup::tests::settings_for;
    use crate::core::testing::{FakeApi, FakeRunner};
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn settings() -> Settings {
        let mut settings = settings_for(Path::new("/live"), Path::new("/backup"));
        settings.runner_settings = vec![("privileged".to_string(), "true".to_string())];
        settings
    }

    /// Lists `existing` runners until a token is issued, then runner 42
    fn gitlab_with(existing: Vec<u64>) -> FakeApi {
        let issued = AtomicBool::new(false);
        FakeApi::with_handler(move |method, path| match (method.as_str(), path) {
            ("GET", p) if p.starts_with("runners/all") => {
                if issued.load(Ordering::SeqCst) {
                    ApiResponse::Data(json!([{"id": 42}]))
                } else {
                    ApiResponse::Data(Value::Array(
                        existing.iter().map(|id| json!({"id": id})).collect(),
                    ))
                }
            }
            ("POST", "user/runners") => {
                issued.store(true, Ordering::SeqCst);
                ApiResponse::Data(json!({"id": 42, "token": "glrt-0123456789"}))
            }
            ("DELETE", _) => ApiResponse::NoContent,
            _ => ApiResponse::Error("HTTP 404 Not Found".to_string()),
        })
    }

    #[test]
    fn test_runner_ids_reads_id_fields() {
        assert_eq!(
            runner_ids(&json!([{"id": 1}, {"id": 5, "active": true}])).unwrap(),
            vec![1, 5]
        );
        assert!(runner_ids(&json!([])).unwrap().is_empty());
        assert!(matches!(
            runner_ids(&json!({"message": "nope"})),
            Err(ManagerError::Api(_))
        ));
    }

    #[test]
    fn test_override_expression_escapes_both_sides() {
        assert_eq!(
            override_expression("privileged", "true"),
            r"s/^\([[:space:]]*privileged[[:space:]]*=\).*/\1 true/"
        );
        assert_eq!(
            override_expression("docker.volumes", "/cache&more"),
            r"s/^\([[:space:]]*docker\.volumes[[:space:]]*=\).*/\1 \/cache\&more/"
        );
    }

    #[tokio::test]
    async fn test_register_is_idempotent_without_force() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = gitlab_with(vec![7]);

        let registrar = RunnerRegistrar::new(&settings, &docker, &api);
        assert_eq!(
            registrar.register(false).await.unwrap(),
            RegistrationOutcome::AlreadyRegistered(vec![7])
        );
        assert_eq!(
            registrar.register(false).await.unwrap(),
            RegistrationOutcome::AlreadyRegistered(vec![7])
        );

        assert!(api.mutations().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_forced_register_replaces_existing() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = gitlab_with(vec![7, 8]);

        let outcome = RunnerRegistrar::new(&settings, &docker, &api)
            .register(true)
            .await
            .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Registered(vec![42]));
        assert_eq!(
            api.requests(),
            vec![
                "GET runners/all?per_page=100&page=1",
                "DELETE runners/7",
                "DELETE runners/8",
                "POST user/runners",
                "GET runners/all?per_page=100&page=1",
            ]
        );
        assert_eq!(
            runner.rendered(),
            vec![
                "docker exec gitlab-runner rm -f /etc/gitlab-runner/config.toml",
                "docker exec gitlab-runner gitlab-runner register --non-interactive --name DockerRunner \
                 --url http://gitlab.local --token glrt-0123456789 --executor docker \
                 --docker-image alpine:latest --docker-extra-hosts gitlab.local:host-gateway",
                "docker exec gitlab-runner sed -i \
                 's/^\\([[:space:]]*privileged[[:space:]]*=\\).*/\\1 true/' /etc/gitlab-runner/config.toml",
                "docker restart gitlab-runner",
            ]
        );
    }

    #[tokio::test]
    async fn test_register_from_scratch_skips_teardown() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = gitlab_with(Vec::new());

        let outcome = RunnerRegistrar::new(&settings, &docker, &api)
            .register(false)
            .await
            .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Registered(vec![42]));
        assert_eq!(api.mutations(), vec!["POST user/runners"]);
        assert!(runner.position(&["rm", "-f"]).is_none());
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = FakeApi::with_handler(|method, _| match method.as_str() {
            "POST" => ApiResponse::Data(json!({"id": 42})),
            _ => ApiResponse::Data(json!([])),
        });

        let err = RunnerRegistrar::new(&settings, &docker, &api)
            .register(false)
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::MissingRegistrationToken));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_register_command_is_fatal() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::failing_on(&["gitlab-runner", "register"]));
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = gitlab_with(Vec::new());

        let err = RunnerRegistrar::new(&settings, &docker, &api)
            .register(false)
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::RegistrationFailed(_)));
        assert!(runner.position(&["sed"]).is_none());
        assert!(runner.position(&["restart"]).is_none());
    }

    #[tokio::test]
    async fn test_failed_teardown_only_warns() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::failing_on(&["rm", "-f"]));
        let docker = DockerCli::new(runner.clone(), "/live");
        let issued = AtomicBool::new(false);
        let api = FakeApi::with_handler(move |method, path| match (method.as_str(), path) {
            ("GET", _) if issued.load(Ordering::SeqCst) => ApiResponse::Data(json!([{"id": 42}])),
            ("GET", _) => ApiResponse::Data(json!([{"id": 7}])),
            ("DELETE", _) => ApiResponse::Error("HTTP 404 Not Found".to_string()),
            _ => {
                issued.store(true, Ordering::SeqCst);
                ApiResponse::Data(json!({"token": "glrt-abcdefghij"}))
            }
        });

        let outcome = RunnerRegistrar::new(&settings, &docker, &api)
            .register(true)
            .await
            .unwrap();

        assert_eq!(outcome, RegistrationOutcome::Registered(vec![42]));
        assert!(runner.position(&["restart", "gitlab-runner"]).is_some());
    }

    #[tokio::test]
    async fn test_list_error_is_fatal() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = FakeApi::with_handler(|_, _| ApiResponse::Error("HTTP 401 Unauthorized".to_string()));

        let err = RunnerRegistrar::new(&settings, &docker, &api)
            .register(true)
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Api(_)));
        assert_eq!(api.requests(), vec!["GET runners/all?per_page=100&page=1"]);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_list_blocks_registration() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let api = FakeApi::with_handler(|method, _| match method.as_str() {
            "GET" => ApiResponse::Data(json!({"message": "404 Not Found"})),
            _ => ApiResponse::Data(json!({"token": "glrt-abcdefghij"})),
        });

        let err = RunnerRegistrar::new(&settings, &docker, &api)
            .register(false)
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Api(_)));
        assert!(api.mutations().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_forced_register_deletes_every_page() {
        let settings = settings();
        let runner = Arc::new(FakeRunner::new());
        let docker = DockerCli::new(runner.clone(), "/live");
        let issued = AtomicBool::new(false);
        let api = FakeApi::with_handler(move |method, path| match (method.as_str(), path) {
            ("GET", _) if issued.load(Ordering::SeqCst) => ApiResponse::Data(json!([{"id": 500}])),
            ("GET", p) if p.ends_with("page=1") => {
                ApiResponse::Data(Value::Array((1..=100).map(|id| json!({"id": id})).collect()))
            }
            ("GET", p) if p.ends_with("page=2") => {
                ApiResponse::Data(json!([{"id": 101}, {"id": 102}]))
            }
            ("GET", _) => ApiResponse::Data(json!([])),
            ("DELETE", _) => ApiResponse::NoContent,
            _ => {
                issued.store(true, Ordering::SeqCst);
                ApiResponse::Data(json!({"token": "glrt-abcdefghij"}))
            }
        });

        let registrar = RunnerRegistrar::new(&settings, &docker, &api);
        assert_eq!(
            registrar.register(true).await.unwrap(),
            RegistrationOutcome::Registered(vec![500])
        );

        let requests = api.requests();
        assert_eq!(requests[0], "GET runners/all?per_page=100&page=1");
        assert_eq!(requests[1], "GET runners/all?per_page=100&page=2");
        let deletes: Vec<&String> = requests.iter().filter(|r| r.starts_with("DELETE ")).collect();
        assert_eq!(deletes.len(), 102);
        assert_eq!(deletes[101], "DELETE runners/102");
    }
}
