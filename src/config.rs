//! Process configuration.
//!
//! Identity and model are required and come from the environment; everything
//! else has defaults and can be overridden through layered TOML files.
//! Priority: explicit path (`--config` / `TOOLGATE_CONFIG`) > project
//! (`.toolgate/config.toml`) > user (`~/.toolgate/config.toml`).

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming the acting user.
pub const USER_ID_ENV: &str = "TOOLGATE_USER_ID";
/// Environment variable naming the chat model.
pub const MODEL_ENV: &str = "TOOLGATE_MODEL";

/// System prompt used when the config file does not provide one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to external tools. \
Pick the right tool for each request, report results clearly, and ask for \
missing details instead of guessing.";

/// Settings for the chat backend (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Model/tool iterations allowed per driver invocation.
    pub max_steps: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_steps: 12,
        }
    }
}

impl LlmConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<SecretString> {
        let key = std::env::var(&self.api_key_env).with_context(|| {
            format!(
                "Missing API key. Set {} in your environment or .env file.",
                self.api_key_env
            )
        })?;
        Ok(SecretString::from(key))
    }
}

/// Settings for the tool gateway collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub base_url: String,
    /// Name of the environment variable holding the gateway key, if the
    /// gateway wants one.
    pub api_key_env: Option<String>,
    /// Capability groups to request tools from.
    pub toolkits: Vec<String>,
    /// Individual tools to request by name.
    pub tools: Vec<String>,
    /// Maximum number of tool definitions to request.
    pub limit: usize,
    pub auth_poll_interval_ms: u64,
    pub auth_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9099".to_string(),
            api_key_env: None,
            toolkits: Vec::new(),
            tools: Vec::new(),
            limit: 100,
            auth_poll_interval_ms: 2_000,
            auth_timeout_secs: 300,
        }
    }
}

/// Agent behavior settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
    /// Tools that always need human approval, regardless of gateway metadata.
    pub confirm_tools: Vec<String>,
}

/// Everything the session needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub user_id: String,
    pub model: String,
    pub llm: LlmConfig,
    pub registry: RegistryConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from the environment plus any config files found.
    ///
    /// The two required values fail fast here, before any loop starts.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut file = FileConfig::default();

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".toolgate").join("config.toml");
            if user_path.exists() {
                file.merge(FileConfig::load_from(&user_path)?);
            }
        }

        let project_path = Path::new(".toolgate").join("config.toml");
        if project_path.exists() {
            file.merge(FileConfig::load_from(&project_path)?);
        }

        if let Some(path) = explicit_path {
            file.merge(FileConfig::load_from(path)?);
        }

        Self::from_parts(require_env(USER_ID_ENV)?, require_env(MODEL_ENV)?, file)
    }

    fn from_parts(user_id: String, model: String, file: FileConfig) -> Result<Self> {
        Ok(Self {
            user_id,
            model,
            llm: file.llm.unwrap_or_default(),
            registry: file.registry.unwrap_or_default(),
            agent: file.agent.unwrap_or_default(),
        })
    }

    /// The effective system prompt.
    pub fn system_prompt(&self) -> String {
        self.agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }
}

/// On-disk configuration shape. Sections are optional so partial files merge
/// cleanly; a later file replaces any section it provides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    llm: Option<LlmConfig>,
    registry: Option<RegistryConfig>,
    agent: Option<AgentConfig>,
}

impl FileConfig {
    fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn merge(&mut self, other: FileConfig) {
        if other.llm.is_some() {
            self.llm = other.llm;
        }
        if other.registry.is_some() {
            self.registry = other.registry;
        }
        if other.agent.is_some() {
            self.agent = other.agent;
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => anyhow::bail!("Missing {}. Add it to your environment or .env file.", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_parts("u_1".to_string(), "gpt-4o".to_string(), FileConfig::default())
                .unwrap();
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.llm.max_steps, 12);
        assert_eq!(config.registry.limit, 100);
        assert!(config.agent.confirm_tools.is_empty());
        assert_eq!(config.system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[registry]
base_url = "https://gateway.example.com"
toolkits = ["sharepoint"]
limit = 25

[agent]
confirm_tools = ["Mail_Send"]
system_prompt = "Be terse."
"#,
        );
        let parsed = FileConfig::load_from(file.path()).unwrap();
        let config = Config::from_parts("u_1".to_string(), "gpt-4o".to_string(), parsed).unwrap();
        assert_eq!(config.registry.base_url, "https://gateway.example.com");
        assert_eq!(config.registry.toolkits, vec!["sharepoint"]);
        assert_eq!(config.registry.limit, 25);
        assert_eq!(config.agent.confirm_tools, vec!["Mail_Send"]);
        assert_eq!(config.system_prompt(), "Be terse.");
        // Untouched sections keep their defaults.
        assert_eq!(config.llm.max_steps, 12);
    }

    #[test]
    fn test_merge_later_file_wins_per_section() {
        let mut base = FileConfig::load_from(
            write_config("[llm]\nmax_steps = 6\n\n[agent]\nconfirm_tools = [\"A\"]\n").path(),
        )
        .unwrap();
        let overlay =
            FileConfig::load_from(write_config("[agent]\nconfirm_tools = [\"B\"]\n").path())
                .unwrap();
        base.merge(overlay);

        assert_eq!(base.llm.unwrap().max_steps, 6);
        assert_eq!(base.agent.unwrap().confirm_tools, vec!["B"]);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let file = write_config("[registry\nbase_url = ");
        assert!(FileConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_require_env() {
        std::env::set_var("TOOLGATE_TEST_REQUIRED", "someone@example.com");
        assert_eq!(
            require_env("TOOLGATE_TEST_REQUIRED").unwrap(),
            "someone@example.com"
        );
        std::env::remove_var("TOOLGATE_TEST_REQUIRED");

        let err = require_env("TOOLGATE_TEST_ABSENT").unwrap_err();
        assert!(err.to_string().contains("TOOLGATE_TEST_ABSENT"));
    }

    #[test]
    fn test_blank_env_value_is_missing() {
        std::env::set_var("TOOLGATE_TEST_BLANK", "   ");
        assert!(require_env("TOOLGATE_TEST_BLANK").is_err());
        std::env::remove_var("TOOLGATE_TEST_BLANK");
    }
}
