use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default profile to use (bundles provider, prompt, model, parameters)
    pub default_profile: String,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfigEntry>,

    #[serde(default)]
    pub prompts: HashMap<String, PromptEntry>,

    #[serde(default)]
    pub profiles: HashMap<String, ProfileEntry>,

    #[serde(default)]
    pub agent: AgentConfigEntry,
}

/// A named system prompt
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptEntry {
    pub prompt: String,
}

/// A profile bundles provider, prompt, model, and parameters together
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileEntry {
    /// Provider name to use (references [providers.X])
    #[serde(default)]
    pub provider: Option<String>,

    /// Prompt name to use (references [prompts.X]) or inline system prompt
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Extra parameters to pass to the API
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfigEntry {
    /// Falls back to OPENAI_API_KEY when omitted
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Extra parameters to pass to the API (e.g., reasoning_effort)
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigEntry {
    /// Token limit before history compression (KODE_TOKEN_LIMIT overrides)
    #[serde(default)]
    pub token_limit: Option<u64>,

    /// Messages kept verbatim when compressing history
    #[serde(default = "default_keep_recent")]
    pub keep_recent_messages: usize,

    #[serde(default = "default_true")]
    pub stream: bool,

    /// Model calls allowed in one tool-calling chain
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_keep_recent() -> usize {
    7
}

fn default_max_iterations() -> u32 {
    100
}

impl Default for AgentConfigEntry {
    fn default() -> Self {
        Self {
            token_limit: None,
            keep_recent_messages: default_keep_recent(),
            stream: true,
            max_iterations: default_max_iterations(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            anyhow::bail!(
                "No configuration found. Create {} with at least:\n\n\
                 default_profile = \"default\"\n\n\
                 [providers.openai]\n\
                 api_key = \"sk-...\"\n\n\
                 [profiles.default]\n\
                 provider = \"openai\"\n",
                config_path.display()
            )
        }
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("kode"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolve a profile name to its effective settings
    pub fn resolve_profile(&self, profile_name: &str) -> Option<ResolvedProfile> {
        let profile = self.profiles.get(profile_name)?;

        // Provider is required in profile
        let provider_name = profile.provider.clone()?;
        let provider_config = self.providers.get(&provider_name);

        // A named prompt, otherwise an inline one
        let system_prompt = profile.prompt.as_ref().map(|p| match self.prompts.get(p) {
            Some(entry) => entry.prompt.clone(),
            None => p.clone(),
        });

        // Merge parameters: provider params + profile params (profile wins)
        let mut parameters = provider_config
            .map(|p| p.parameters.clone())
            .unwrap_or_default();
        parameters.extend(profile.parameters.clone());

        Some(ResolvedProfile {
            provider_name,
            provider_config: provider_config.cloned(),
            system_prompt,
            model: profile.model.clone(),
            parameters,
        })
    }
}

/// Resolved profile with all settings expanded
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub provider_name: String,
    pub provider_config: Option<ProviderConfigEntry>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub parameters: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_defaults() {
        let toml = r#"
            default_profile = "default"

            [providers.openai]
            api_key = "sk-test"
            default_model = "gpt-4o"

            [profiles.default]
            provider = "openai"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.default_profile, "default");
        assert!(config.providers.contains_key("openai"));
        assert_eq!(config.agent.keep_recent_messages, 7);
        assert_eq!(config.agent.max_iterations, 100);
        assert!(config.agent.stream);
        assert!(config.agent.token_limit.is_none());
    }

    #[test]
    fn test_parse_agent_section() {
        let toml = r#"
            default_profile = "default"

            [agent]
            token_limit = 32000
            stream = false
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.agent.token_limit, Some(32000));
        assert!(!config.agent.stream);
        assert_eq!(config.agent.keep_recent_messages, 7);
    }

    #[test]
    fn test_resolve_profile() {
        let toml = r#"
            default_profile = "coding"

            [providers.local]
            base_url = "http://localhost:8080/v1"
            parameters = { temperature = 0.2, reasoning_effort = "low" }

            [prompts.coder]
            prompt = "You are a coding assistant."

            [profiles.coding]
            provider = "local"
            prompt = "coder"
            model = "qwen-coder"
            parameters = { reasoning_effort = "high" }

            [profiles.inline]
            provider = "local"
            prompt = "Answer tersely."
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        let resolved = config.resolve_profile("coding").unwrap();
        assert_eq!(resolved.provider_name, "local");
        assert_eq!(resolved.system_prompt.as_deref(), Some("You are a coding assistant."));
        assert_eq!(resolved.model.as_deref(), Some("qwen-coder"));
        assert_eq!(resolved.parameters["reasoning_effort"], "high");
        assert_eq!(resolved.parameters["temperature"], 0.2);

        let inline = config.resolve_profile("inline").unwrap();
        assert_eq!(inline.system_prompt.as_deref(), Some("Answer tersely."));
        assert!(config.resolve_profile("missing").is_none());
    }
}
