//! Recording fakes for the process, health and API seams.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::Method;

use crate::core::api::{ApiResponse, RunnerApi};
use crate::core::error::{ManagerError, Result};
use crate::core::process::{CommandLine, CommandRunner, OutputMode};
use crate::core::service::{HealthProbe, Probe};

type CommandHandler = Box<dyn Fn(&CommandLine) -> Result<String> + Send + Sync>;

/// Records every command and answers through a scripted handler
pub struct FakeRunner {
    calls: Mutex<Vec<CommandLine>>,
    handler: CommandHandler,
}

impl FakeRunner {
    /// Every command succeeds with empty output
    pub fn new() -> Self {
        Self::with_handler(|_| Ok(String::new()))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CommandLine) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// Commands containing `needle` fail; everything else succeeds
    pub fn failing_on(needle: &[&str]) -> Self {
        let needle: Vec<String> = needle.iter().map(|s| s.to_string()).collect();
        Self::with_handler(move |cmd| {
            let needle: Vec<&str> = needle.iter().map(String::as_str).collect();
            if cmd.contains_args(&needle) {
                Err(fail(cmd))
            } else {
                Ok(String::new())
            }
        })
    }

    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().unwrap().clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Index of the first recorded command containing `needle`
    pub fn position(&self, needle: &[&str]) -> Option<usize> {
        self.calls().iter().position(|c| c.contains_args(needle))
    }
}

pub fn fail(cmd: &CommandLine) -> ManagerError {
    ManagerError::CommandFailed {
        command: cmd.to_string(),
        reason: "exit status: 1".to_string(),
    }
}

impl CommandRunner for FakeRunner {
    fn execute<'a>(&'a self, command: &'a CommandLine, _mode: OutputMode)
        -> BoxFuture<'a, Result<String>> {
        self.calls.lock().unwrap().push(command.clone());
        let result = (self.handler)(command);
        async move { result }.boxed()
    }
}

/// Becomes ready on a fixed poll, or never
pub struct FakeProbe {
    ready_on: Option<u32>,
    calls: AtomicU32,
}

impl FakeProbe {
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_on: Some(n),
            calls: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_on: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthProbe for FakeProbe {
    fn probe<'a>(&'a self, _url: &'a str, _timeout: Duration) -> BoxFuture<'a, Probe> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let probe = match self.ready_on {
            Some(ready) if n >= ready => Probe::Ready(200),
            Some(_) => Probe::Unhealthy(502),
            None => Probe::Unreachable("connection refused".to_string()),
        };
        async move { probe }.boxed()
    }
}

type ApiHandler = Box<dyn Fn(&Method, &str) -> ApiResponse + Send + Sync>;

/// Records `METHOD path` for each request and answers through a handler
pub struct FakeApi {
    requests: Mutex<Vec<String>>,
    handler: ApiHandler,
}

impl FakeApi {
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&Method, &str) -> ApiResponse + Send + Sync + 'static,
    {
        Self {
            requests: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests other than GET
    pub fn mutations(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| !r.starts_with("GET "))
            .collect()
    }
}

impl RunnerApi for FakeApi {
    fn request<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        _form: Option<&'a [(&'a str, &'a str)]>,
    ) -> BoxFuture<'a, ApiResponse> {
        self.requests.lock().unwrap().push(format!("{} {}", method, path));
        let response = (self.handler)(&method, path);
        async move { response }.boxed()
    }
}
