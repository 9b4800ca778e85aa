/// Configuration loading from .env files
///
/// The file is read once at startup, `${VAR}` references are expanded, and
/// the result is frozen into [`Settings`]. The process environment is only
/// ever read, never written.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use tracing::debug;

use crate::core::error::{ManagerError, Result};
use crate::utils::{
    is_valid_setting_key, parse_bool, DEFAULT_RUNNER_CONFIG_FILE, DEFAULT_RUNNER_CONTAINER,
    DEFAULT_RUNNER_DESCRIPTION, DEFAULT_RUNNER_IMAGE,
};

/// Rounds of `${VAR}` substitution before a value is considered cyclic
const MAX_EXPANSION_ROUNDS: usize = 32;

/// Parsed and expanded contents of a .env file
#[derive(Debug, Clone)]
pub struct EnvFile {
    env_file: PathBuf,
    values: HashMap<String, String>,
}

impl EnvFile {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();

        if !env_file.exists() {
            return Err(ManagerError::Config(format!(
                ".env file not found at {}",
                env_file.display()
            )));
        }

        let content = fs::read_to_string(&env_file).map_err(|e| {
            ManagerError::Config(format!("failed to read {}: {}", env_file.display(), e))
        })?;

        let values = Self::parse(&content, |name| std::env::var(name).ok())?;
        debug!(path = %env_file.display(), keys = values.len(), "loaded env file");

        Ok(Self { env_file, values })
    }

    /// Parse `content`, resolving unknown `${VAR}` references through `env`
    pub fn parse<F>(content: &str, env: F) -> Result<HashMap<String, String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut order = Vec::new();
        let mut values = HashMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                if key.is_empty() {
                    continue;
                }
                let value = strip_quotes(value.trim()).to_string();

                if values.insert(key.clone(), value).is_none() {
                    order.push(key);
                }
            }
        }

        let pattern = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ManagerError::Config(format!("invalid substitution pattern: {}", e)))?;

        // Expand in file order so later keys see already-expanded values
        for key in &order {
            let mut current = values.get(key).cloned().unwrap_or_default();
            let mut rounds = 0;

            loop {
                let expanded = pattern
                    .replace_all(&current, |caps: &Captures| {
                        let name = &caps[1];
                        values
                            .get(name)
                            .cloned()
                            .or_else(|| env(name))
                            .unwrap_or_default()
                    })
                    .into_owned();

                if expanded == current {
                    break;
                }

                rounds += 1;
                if rounds >= MAX_EXPANSION_ROUNDS {
                    return Err(ManagerError::Config(format!(
                        "{} does not settle after {} substitution rounds (recursive reference?)",
                        key, MAX_EXPANSION_ROUNDS
                    )));
                }
                current = expanded;
            }

            values.insert(key.clone(), current);
        }

        Ok(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Directory containing the .env file; relative paths resolve against it
    pub fn base_dir(&self) -> PathBuf {
        let parent = match self.env_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::canonicalize(&parent).unwrap_or(parent)
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn strip_quotes(value: &str) -> &str {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// A category of data with its live and backup locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPair {
    pub live: PathBuf,
    pub backup: PathBuf,
}

/// Immutable operational settings shared by every command
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding docker-compose.yml
    pub project_root: PathBuf,
    pub gitlab_container: String,
    pub runner_container: String,
    /// Scripts and compose files
    pub base: MirrorPair,
    /// Archives written by `gitlab-backup create`
    pub backups: MirrorPair,
    pub config: MirrorPair,
    pub secrets: MirrorPair,
    /// Live application data, excluded from the base mirror
    pub app_dir: PathBuf,
    pub gitlab_host: String,
    pub gitlab_url: String,
    /// Runner config path inside the runner container
    pub runner_config_file: String,
    pub runner_image: String,
    pub runner_description: String,
    pub runner_settings: Vec<(String, String)>,
    pub auto_backup: bool,
    pub personal_access_token: Option<String>,
}

impl Settings {
    /// Build settings from a loaded file, falling back to the process environment
    pub fn from_env(env: &EnvFile) -> Result<Self> {
        Self::from_lookup(&env.base_dir(), |key| {
            env.get(key)
                .map(str::to_string)
                .or_else(|| std::env::var(key).ok())
        })
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(project_root: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut required = |key: &str| -> String {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(value) => value,
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        };

        let gitlab_container = required("GITLAB_CONTAINER_NAME");
        let base_live = required("GITLAB_BASE_DIR");
        let base_backup = required("BACKUP_BASE_DIR");
        let backups_live = required("GITLAB_BACKUPS_DIR");
        let backups_backup = required("BACKUP_BACKUPS_DIR");
        let config_live = required("GITLAB_CONFIG_DIR");
        let config_backup = required("BACKUP_CONFIG_DIR");
        let secrets_live = required("GITLAB_SECRETS_DIR");
        let secrets_backup = required("BACKUP_SECRETS_DIR");
        let app_dir = required("GITLAB_APP_DIR");
        let gitlab_host = required("GITLAB_HOST");
        let gitlab_url = required("GITLAB_URL");

        if !missing.is_empty() {
            return Err(ManagerError::MissingSettings(missing));
        }

        let optional = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let path = |value: &str| -> PathBuf {
            let p = PathBuf::from(value);
            if p.is_absolute() {
                p
            } else {
                project_root.join(p)
            }
        };

        let pair = |live: &str, backup: &str| MirrorPair {
            live: path(live),
            backup: path(backup),
        };

        Ok(Self {
            project_root: project_root.to_path_buf(),
            gitlab_container,
            runner_container: optional("GITLAB_RUNNER_CONTAINER_NAME", DEFAULT_RUNNER_CONTAINER),
            base: pair(&base_live, &base_backup),
            backups: pair(&backups_live, &backups_backup),
            config: pair(&config_live, &config_backup),
            secrets: pair(&secrets_live, &secrets_backup),
            app_dir: path(&app_dir),
            gitlab_host,
            gitlab_url: gitlab_url.trim_end_matches('/').to_string(),
            runner_config_file: optional("GITLAB_RUNNER_CONFIG_FILE", DEFAULT_RUNNER_CONFIG_FILE),
            runner_image: optional("GITLAB_RUNNER_DOCKER_IMAGE", DEFAULT_RUNNER_IMAGE),
            runner_description: optional("GITLAB_RUNNER_DESCRIPTION", DEFAULT_RUNNER_DESCRIPTION),
            runner_settings: parse_runner_settings(&optional("GITLAB_RUNNER_SETTINGS", ""))?,
            auto_backup: parse_bool(&optional("AUTO_BACKUP", "false")),
            personal_access_token: lookup("GITLAB_PERSONAL_ACCESS_TOKEN")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
    }
}

/// Parse `key=value,key=value` runner overrides; values are lowercased
pub fn parse_runner_settings(value: &str) -> Result<Vec<(String, String)>> {
    let mut settings = Vec::new();

    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, val) = pair.split_once('=').ok_or_else(|| ManagerError::InvalidSetting {
            key: "GITLAB_RUNNER_SETTINGS".to_string(),
            reason: format!("expected key=value, got '{}'", pair),
        })?;

        let key = key.trim();
        if !is_valid_setting_key(key) {
            return Err(ManagerError::InvalidSetting {
                key: "GITLAB_RUNNER_SETTINGS".to_string(),
                reason: format!("invalid runner setting name '{}'", key),
            });
        }

        settings.push((key.to_string(), val.trim().to_lowercase()));
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn full_lookup(key: &str) -> Option<String> {
        let value = match key {
            "GITLAB_CONTAINER_NAME" => "gitlab",
            "GITLAB_BASE_DIR" => "./gitlab",
            "BACKUP_BASE_DIR" => "/mnt/backup/gitlab",
            "GITLAB_BACKUPS_DIR" => "./gitlab/data/backups",
            "BACKUP_BACKUPS_DIR" => "/mnt/backup/backups",
            "GITLAB_CONFIG_DIR" => "./gitlab/config",
            "BACKUP_CONFIG_DIR" => "/mnt/backup/config",
            "GITLAB_SECRETS_DIR" => "./gitlab/secrets",
            "BACKUP_SECRETS_DIR" => "/mnt/backup/secrets",
            "GITLAB_APP_DIR" => "./gitlab/data",
            "GITLAB_HOST" => "gitlab.local",
            "GITLAB_URL" => "http://gitlab.local/",
            "GITLAB_RUNNER_SETTINGS" => "privileged=TRUE, concurrent=4",
            "AUTO_BACKUP" => "True",
            _ => return None,
        };
        Some(value.to_string())
    }

    #[test]
    fn test_parse_skips_comments_and_strips_quotes() {
        let content = "# comment\n\nNAME=\"gitlab\"\nHOST='gitlab.local'\nnot a pair\n  PORT = 8080  \n";
        let values = EnvFile::parse(content, no_env).unwrap();

        assert_eq!(values.get("NAME").map(String::as_str), Some("gitlab"));
        assert_eq!(values.get("HOST").map(String::as_str), Some("gitlab.local"));
        assert_eq!(values.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_parse_expands_nested_references() {
        let content = "ROOT=/srv\nBASE=${ROOT}/gitlab\nDATA=${BASE}/data\nURL=http://${HOST}\n";
        let values = EnvFile::parse(content, |name| {
            (name == "HOST").then(|| "gitlab.local".to_string())
        })
        .unwrap();

        assert_eq!(values["DATA"], "/srv/gitlab/data");
        assert_eq!(values["URL"], "http://gitlab.local");
    }

    #[test]
    fn test_parse_resolves_forward_references() {
        let values = EnvFile::parse("A=${B}/x\nB=${C}\nC=c\n", no_env).unwrap();
        assert_eq!(values["A"], "c/x");
    }

    #[test]
    fn test_parse_unknown_reference_becomes_empty() {
        let values = EnvFile::parse("A=pre-${NOPE}-post\n", no_env).unwrap();
        assert_eq!(values["A"], "pre--post");
    }

    #[test]
    fn test_parse_rejects_cyclic_reference() {
        let err = EnvFile::parse("A=${A}x\n", no_env).unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EnvFile::load("/definitely/not/here/.env").unwrap_err();
        assert!(err.to_string().contains(".env file not found"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Test configuration").unwrap();
        writeln!(file, "GITLAB_CONTAINER_NAME=gitlab").unwrap();
        writeln!(file, "GITLAB_URL=\"http://${{GITLAB_CONTAINER_NAME}}.local\"").unwrap();

        let env = EnvFile::load(file.path()).unwrap();

        assert_eq!(env.get("GITLAB_URL"), Some("http://gitlab.local"));
        assert_eq!(env.keys(), vec!["GITLAB_CONTAINER_NAME", "GITLAB_URL"]);
    }

    #[test]
    fn test_settings_resolve_relative_paths_and_defaults() {
        let settings = Settings::from_lookup(Path::new("/srv/project"), full_lookup).unwrap();

        assert_eq!(settings.app_dir, PathBuf::from("/srv/project/./gitlab/data"));
        assert_eq!(settings.backups.backup, PathBuf::from("/mnt/backup/backups"));
        assert_eq!(settings.gitlab_url, "http://gitlab.local");
        assert_eq!(settings.runner_container, "gitlab-runner");
        assert_eq!(settings.runner_config_file, "/etc/gitlab-runner/config.toml");
        assert!(settings.auto_backup);
        assert!(settings.personal_access_token.is_none());
        assert_eq!(
            settings.runner_settings,
            vec![
                ("privileged".to_string(), "true".to_string()),
                ("concurrent".to_string(), "4".to_string())
            ]
        );
    }

    #[test]
    fn test_settings_report_all_missing_keys() {
        let err = Settings::from_lookup(Path::new("/srv"), |key| {
            (key != "GITLAB_URL" && key != "GITLAB_APP_DIR")
                .then(|| full_lookup(key))
                .flatten()
        })
        .unwrap_err();

        match err {
            ManagerError::MissingSettings(keys) => {
                assert_eq!(keys, vec!["GITLAB_APP_DIR", "GITLAB_URL"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_runner_settings_rejects_bad_pairs() {
        assert!(parse_runner_settings("").unwrap().is_empty());
        assert!(parse_runner_settings("privileged").is_err());
        assert!(parse_runner_settings("a/b=1").is_err());
    }
}
