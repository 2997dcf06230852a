//! Client for the external tool gateway.
//!
//! The gateway owns tool discovery, server-side execution, and authorization
//! grants. This process only asks questions and waits for answers; nothing
//! here inspects what a tool actually does.

use crate::config::RegistryConfig;
use crate::suspension::AuthorizationHandle;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Gating metadata attached to a tool definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolRequirements {
    /// The tool needs an authorization grant for the acting user.
    pub authorization: bool,
    /// The tool needs human approval per invocation.
    pub approval: bool,
}

/// One invocable tool as described by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub requirements: ToolRequirements,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl ToolDef {
    /// Render this definition as an OpenAI-style function schema.
    pub fn as_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Pending,
    Completed,
    Failed,
}

/// Authorization state for a tool/user pair, as the gateway reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub url: String,
    pub status: AuthorizationStatus,
}

impl Authorization {
    pub fn is_completed(&self) -> bool {
        self.status == AuthorizationStatus::Completed
    }

    pub fn handle(&self) -> AuthorizationHandle {
        AuthorizationHandle {
            id: self.id.clone(),
            url: self.url.clone(),
        }
    }
}

/// What to ask the gateway for at startup.
#[derive(Debug, Clone)]
pub struct RegistryQuery {
    pub toolkits: Vec<String>,
    pub tools: Vec<String>,
    pub limit: usize,
    pub user_id: String,
}

/// The gateway operations the engine and the decision resolver depend on.
/// A trait so tests can script outcomes.
pub trait ToolGateway: Send + Sync {
    /// Run one tool call server-side and return its output.
    fn execute(&self, tool_name: &str, input: &Value, user_id: &str) -> Result<Value>;

    /// Look up (or start) the authorization flow for a tool/user pair.
    fn authorize(&self, tool_name: &str, user_id: &str) -> Result<Authorization>;

    /// Block until the given authorization completes. Errors on rejection
    /// or timeout.
    fn wait_for_completion(&self, authorization_id: &str) -> Result<()>;
}

/// Blocking HTTP client for the gateway's REST surface.
pub struct RegistryClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: Option<SecretString>,
    poll_interval: Duration,
    auth_timeout: Duration,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(env_name) => {
                let key = std::env::var(env_name).with_context(|| {
                    format!(
                        "Missing gateway key. Set {} in your environment or .env file.",
                        env_name
                    )
                })?;
                Some(SecretString::from(key))
            }
            None => None,
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_millis(config.auth_poll_interval_ms),
            auth_timeout: Duration::from_secs(config.auth_timeout_secs),
        })
    }

    fn request(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    /// Fetch tool definitions. Called once at startup; the result is held
    /// for the process lifetime.
    pub fn fetch_tools(&self, query: &RegistryQuery) -> Result<Vec<ToolDef>> {
        #[derive(Deserialize)]
        struct ToolPage {
            items: Vec<ToolDef>,
        }

        let mut params: Vec<(&str, String)> = vec![
            ("user_id", query.user_id.clone()),
            ("limit", query.limit.to_string()),
        ];
        if !query.toolkits.is_empty() {
            params.push(("toolkits", query.toolkits.join(",")));
        }
        if !query.tools.is_empty() {
            params.push(("tools", query.tools.join(",")));
        }

        let response = self
            .request(self.http.get(format!("{}/v1/tools", self.base_url)))
            .query(&params)
            .send()
            .context("Tool listing request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Tool listing failed with {}: {}",
                status,
                response.text().unwrap_or_default()
            );
        }
        let page: ToolPage = response.json().context("Failed to decode tool listing")?;
        Ok(page.items)
    }
}

impl ToolGateway for RegistryClient {
    fn execute(&self, tool_name: &str, input: &Value, user_id: &str) -> Result<Value> {
        let response = self
            .request(self.http.post(format!("{}/v1/tools/execute", self.base_url)))
            .json(&json!({
                "tool_name": tool_name,
                "input": input,
                "user_id": user_id,
            }))
            .send()
            .with_context(|| format!("Execution request for {} failed", tool_name))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Execution of {} failed with {}: {}",
                tool_name,
                status,
                response.text().unwrap_or_default()
            );
        }
        let body: Value = response
            .json()
            .with_context(|| format!("Failed to decode {} output", tool_name))?;
        Ok(body.get("output").cloned().unwrap_or(body))
    }

    fn authorize(&self, tool_name: &str, user_id: &str) -> Result<Authorization> {
        let response = self
            .request(self.http.post(format!("{}/v1/auth/authorize", self.base_url)))
            .json(&json!({"tool_name": tool_name, "user_id": user_id}))
            .send()
            .with_context(|| format!("Authorization request for {} failed", tool_name))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Authorization request for {} failed with {}: {}",
                tool_name,
                status,
                response.text().unwrap_or_default()
            );
        }
        response.json().context("Failed to decode authorization")
    }

    fn wait_for_completion(&self, authorization_id: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct AuthStatusBody {
            status: AuthorizationStatus,
        }

        let deadline = Instant::now() + self.auth_timeout;
        loop {
            let response = self
                .request(self.http.get(format!(
                    "{}/v1/auth/status/{}",
                    self.base_url, authorization_id
                )))
                .send()
                .context("Authorization status request failed")?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!(
                    "Authorization status check failed with {}: {}",
                    status,
                    response.text().unwrap_or_default()
                );
            }
            let body: AuthStatusBody = response
                .json()
                .context("Failed to decode authorization status")?;

            match body.status {
                AuthorizationStatus::Completed => return Ok(()),
                AuthorizationStatus::Failed => {
                    anyhow::bail!("Authorization {} was rejected", authorization_id)
                }
                AuthorizationStatus::Pending => {
                    if Instant::now() >= deadline {
                        anyhow::bail!(
                            "Timed out waiting for authorization {}",
                            authorization_id
                        );
                    }
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_def_decodes_requirements() {
        let def: ToolDef = serde_json::from_value(json!({
            "name": "Mail_Send",
            "description": "Send an email",
            "input_schema": {"type": "object", "properties": {"to": {"type": "string"}}},
            "requirements": {"authorization": true}
        }))
        .unwrap();

        assert!(def.requirements.authorization);
        assert!(!def.requirements.approval);
    }

    #[test]
    fn test_tool_def_defaults() {
        let def: ToolDef = serde_json::from_value(json!({"name": "Ping"})).unwrap();
        assert_eq!(def.description, "");
        assert_eq!(def.requirements, ToolRequirements::default());
        assert_eq!(def.input_schema["type"], "object");
    }

    #[test]
    fn test_function_schema_shape() {
        let def: ToolDef = serde_json::from_value(json!({
            "name": "Drive_Search",
            "description": "Search drives",
        }))
        .unwrap();

        let schema = def.as_function_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "Drive_Search");
        assert_eq!(schema["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_authorization_decoding() {
        let auth: Authorization = serde_json::from_value(json!({
            "id": "auth_9",
            "url": "https://gateway.example.com/grant/auth_9",
            "status": "pending"
        }))
        .unwrap();

        assert!(!auth.is_completed());
        let handle = auth.handle();
        assert_eq!(handle.id, "auth_9");
        assert_eq!(handle.url, "https://gateway.example.com/grant/auth_9");
    }
}
