/// GitLab REST API client (`/api/v4`)
///
/// Transport problems and unexpected statuses come back as
/// [`ApiResponse::Error`]; whether they are fatal is the caller's call.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::core::error::{ManagerError, Result};
use crate::utils::{API_TIMEOUT_SECS, PRIVATE_TOKEN_HEADER};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// 200/201 with a JSON body
    Data(Value),
    /// 204, or a success with an empty body
    NoContent,
    /// Any other status, or a transport/decoding failure
    Error(String),
}

/// Minimal request surface used by runner registration
pub trait RunnerApi: Send + Sync {
    /// Issue `method` against `path` (relative to `/api/v4/`), optionally
    /// with a form-encoded body.
    fn request<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        form: Option<&'a [(&'a str, &'a str)]>,
    ) -> BoxFuture<'a, ApiResponse>;
}

pub struct GitlabApi {
    client: Client,
    base_url: String,
    token: String,
}

impl GitlabApi {
    pub fn new(gitlab_url: &str, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .danger_accept_invalid_certs(true) // For self-signed certs
            .build()
            .map_err(|e| ManagerError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}/api/v4", gitlab_url.trim_end_matches('/')),
            token: token.into(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, method: Method, path: &str, form: Option<&[(&str, &str)]>) -> ApiResponse {
        let url = self.endpoint(path);
        debug!(%method, %url, "GitLab API request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(PRIVATE_TOKEN_HEADER, &self.token);
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return ApiResponse::Error(format!("Request failed: {}", e)),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ApiResponse::Error(format!("Failed to read response: {}", e)),
        };
        debug!(%method, %url, status = status.as_u16(), "GitLab API response");

        classify(status, &body)
    }
}

impl RunnerApi for GitlabApi {
    fn request<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        form: Option<&'a [(&'a str, &'a str)]>,
    ) -> BoxFuture<'a, ApiResponse> {
        self.send(method, path, form).boxed()
    }
}

/// Map a status and raw body onto the API response contract
pub fn classify(status: StatusCode, body: &str) -> ApiResponse {
    match status {
        StatusCode::NO_CONTENT => ApiResponse::NoContent,
        StatusCode::OK | StatusCode::CREATED => {
            if body.trim().is_empty() {
                return ApiResponse::NoContent;
            }
            match serde_json::from_str(body) {
                Ok(value) => ApiResponse::Data(value),
                Err(e) => ApiResponse::Error(format!("Invalid JSON response: {}", e)),
            }
        }
        other => {
            let detail = body.trim();
            if detail.is_empty() {
                ApiResponse::Error(format!("HTTP {}", other))
            } else {
                ApiResponse::Error(format!("HTTP {}: {}", other, detail))
            }
        }
    }
}
