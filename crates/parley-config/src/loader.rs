use crate::Config;
use anyhow::{Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static ENV_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{env:([^}]+)\}").unwrap());

/// Reads the settings document the shell persisted. Loading never writes.
pub struct ConfigLoader {
    config: Config,
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            config_path: None,
        }
    }

    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        let content = substitute_env_vars(content);
        self.config = parse_jsonc(&content).with_context(|| "Failed to parse config content")?;
        Ok(())
    }

    /// Missing files leave the defaults in place.
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let content = substitute_env_vars(&content);
        self.config = parse_jsonc(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        self.config_path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Repairs the current workspace pointer and logs validation problems.
    /// Problems are not fatal; the registry keeps the first of any duplicate.
    pub fn finish(mut self) -> Config {
        if self.config.repair_current_workspace() {
            tracing::warn!(
                current = ?self.config.current_workspace_id,
                "current workspace id repaired"
            );
        }
        if let Err(errors) = self.config.validate() {
            for error in errors {
                tracing::warn!(%error, "config validation");
            }
        }
        self.config
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces `{env:VAR}` with the variable's value, or nothing when unset.
fn substitute_env_vars(text: &str) -> String {
    ENV_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn parse_jsonc(content: &str) -> Result<Config> {
    let parse_options = ParseOptions {
        allow_trailing_commas: true,
        ..Default::default()
    };
    let parsed = parse_to_serde_value(content, &parse_options)
        .with_context(|| "Failed to parse JSONC")?
        .context("Config content is empty")?;
    serde_json::from_value(parsed).with_context(|| "Failed to parse config JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_trailing_commas() {
        let mut loader = ConfigLoader::new();
        loader
            .load_from_str(
                r#"{
                    // settings written by the shell
                    "revoke_reply_count": 2,
                    "open_ai_backends": [
                        {
                            "name": "gpt-fast",
                            "openai_key": "sk-1",
                            "openai_endpoint": "https://api.example.com/v1",
                            "openai_short_model": "small",
                            "openai_long_model": "large",
                            "openai_threshold": 4000,
                            "openai_temperature": 0.5,
                        },
                    ],
                }"#,
            )
            .unwrap();

        let config = loader.config();
        assert_eq!(config.revoke_reply_count, 2);
        assert_eq!(config.open_ai_backends[0].threshold, 4000);
        assert_eq!(config.wss_domain, crate::schema::DEFAULT_WSS_DOMAIN);
    }

    #[test]
    fn substitutes_environment_variables() {
        std::env::set_var("PARLEY_TEST_KEY", "sk-from-env");
        let out = substitute_env_vars(r#"{"openai_key": "{env:PARLEY_TEST_KEY}", "x": "{env:PARLEY_UNSET_VAR}"}"#);
        assert_eq!(out, r#"{"openai_key": "sk-from-env", "x": ""}"#);
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ConfigLoader::new();
        loader.load_from_file(dir.path().join("absent.json")).unwrap();
        assert!(loader.config_path().is_none());
        assert_eq!(loader.config(), &Config::default());
    }

    #[test]
    fn finish_repairs_dangling_current_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "workspaces": [
                    {"id": 1, "title": "a", "created_at": "2024-01-01T00:00:00Z"},
                    {"id": 5, "title": "b", "created_at": "2024-03-01T00:00:00Z"}
                ],
                "current_workspace_id": 99
            }"#,
        )
        .unwrap();

        let mut loader = ConfigLoader::new();
        loader.load_from_file(&path).unwrap();
        assert_eq!(loader.config_path(), Some(path.as_path()));

        let config = loader.finish();
        assert_eq!(config.current_workspace_id, Some(5));
    }

    #[test]
    fn rejects_malformed_content() {
        let mut loader = ConfigLoader::new();
        assert!(loader.load_from_str("{ not json").is_err());
        assert!(loader.load_from_str("").is_err());
    }
}
