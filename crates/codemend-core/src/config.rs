use std::collections::HashMap;

use crate::error::{Error, Result};

/// Full application configuration, loaded from the environment with a
/// `.env` fallback. Sensitive values (the API token, the webhook secret)
/// never come from anywhere else.
#[derive(Debug, Clone)]
pub struct Config {
    /// Token used for API calls and authenticated clone URLs. Required.
    pub github_token: String,
    /// HMAC secret for inbound webhook verification. Empty disables the check.
    pub webhook_secret: String,
    pub api_base_url: String,

    /// Root directory under which per-run workspaces are created.
    pub base_clone_path: String,
    pub data_dir: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Scheduling / pipeline
    pub sweep_interval_s: u64,
    pub command_timeout_s: u64,
    /// Name of the lint executable resolved on the host.
    pub lint_tool: String,
    /// Interval applied to a repository whose settings omit one.
    pub default_interval: String,
    /// Path of the per-repository settings file fetched through the API.
    pub settings_file: String,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn require(key: &str, dotenv: &HashMap<String, String>) -> Result<String> {
    get(key, dotenv)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Configuration(key.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            github_token: require("GITHUB_TOKEN", &dotenv)?,
            webhook_secret: get_str("WEBHOOK_SECRET", &dotenv, ""),
            api_base_url: get_str("GITHUB_API_URL", &dotenv, "https://api.github.com"),
            base_clone_path: get_str("BASE_CLONE_PATH", &dotenv, "/tmp/codemend"),
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3000),
            sweep_interval_s: get_u64("SWEEP_INTERVAL_S", &dotenv, 3600),
            command_timeout_s: get_u64("COMMAND_TIMEOUT_S", &dotenv, 600),
            lint_tool: get_str("LINT_TOOL", &dotenv, "ansible-lint"),
            default_interval: get_str("DEFAULT_INTERVAL", &dotenv, "daily"),
            settings_file: get_str("SETTINGS_FILE", &dotenv, ".github/codemend.yml"),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, ""),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, ""),
        })
    }
}
