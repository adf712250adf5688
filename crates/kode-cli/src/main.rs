use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kode_core::{Block, ConversationStore, MemoryType, Provider, ToolRegistry};
use kode_providers::OpenAIProvider;

mod chat;
mod compaction;
mod config;
mod render;
mod runner;
mod session;

use compaction::LlmCompressor;
use config::Config;
use render::Renderer;
use runner::{AgentRunner, RunnerConfig, SendOutcome};
use session::JsonSessionPersister;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: all tracing including stream chunks
    Trace,
    /// Verbose: requests, tool execution details
    Debug,
    /// Standard: turn lifecycle, shell commands
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "kode")]
#[command(author, version, about = "kode: an interactive coding assistant", long_about = None)]
pub struct Cli {
    /// Prompt to send (one-shot mode)
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Profile to use (bundles provider, prompt, model, parameters)
    #[arg(short = 'P', long)]
    pub profile: Option<String>,

    /// Model to use (overrides config/profile default)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Base URL for the API (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// System prompt (overrides profile)
    #[arg(short, long)]
    pub system: Option<String>,

    /// Temperature (0.0-2.0)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Disable streaming output
    #[arg(long)]
    pub no_stream: bool,

    /// Resume a saved session by id
    #[arg(long)]
    pub resume: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };

    // Set up logging
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        // Log file specified: write JSON to file
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load()?;
    let settings = resolve_settings(&cli, &config)?;
    tracing::info!(
        profile = %settings.profile_name,
        provider = %settings.provider_name,
        model = ?settings.model,
        "Starting kode"
    );

    let provider: Arc<dyn Provider> = Arc::new(create_provider(&settings));
    let store = Arc::new(ConversationStore::new());
    let persister = JsonSessionPersister::new(Config::config_dir()?.join("sessions"));

    if let Some(id) = &cli.resume {
        let session = persister
            .load(id)
            .with_context(|| format!("Failed to load session '{}'", id))?;
        store.initialize_from_session(session);
    }

    let compressor = Arc::new(LlmCompressor::new(provider.clone(), settings.model.clone()));

    // The tool catalogue is registered by integrations; the core ships none.
    let tools = Arc::new(ToolRegistry::new());

    let runner_config = RunnerConfig {
        model: settings.model.clone(),
        temperature: cli.temperature.or(config.agent.temperature),
        max_tokens: cli.max_tokens.or(config.agent.max_tokens),
        extra_params: settings.parameters.clone(),
        system_prompt: settings.system_prompt.clone(),
        stream: config.agent.stream && !cli.no_stream,
        token_limit: config.agent.token_limit,
        keep_recent: config.agent.keep_recent_messages,
        max_iterations: config.agent.max_iterations,
    };

    let runner = Arc::new(AgentRunner::new(
        store,
        provider,
        tools,
        compressor,
        runner_config,
    ));

    // Piped stdin without --prompt is treated as a one-shot prompt
    let prompt = match &cli.prompt {
        Some(prompt) => Some(prompt.clone()),
        None if !atty::is(atty::Stream::Stdin) => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read prompt from stdin")?;
            Some(input)
        }
        None => None,
    };

    let result = if let Some(prompt) = &prompt {
        completion_mode(&runner, prompt).await
    } else {
        chat::run_chat(runner.clone()).await
    };

    runner
        .shutdown(&persister)
        .context("Failed to save session")?;

    result
}

/// Send a single prompt, print the response as it streams, and exit.
async fn completion_mode(runner: &AgentRunner, prompt: &str) -> Result<()> {
    let mut renderer = Renderer::new(std::io::stdout());

    if let SendOutcome::MemoryPending(note) = chat::run_turn(runner, &mut renderer, prompt).await? {
        runner.save_memory(&note, MemoryType::Project);
        renderer.render(&runner.store().messages())?;
    }

    let messages = runner.store().messages();
    let failure = messages
        .last()
        .into_iter()
        .flat_map(|m| m.blocks.iter())
        .find_map(|b| match b {
            Block::Error(e) => Some(e.content.clone()),
            _ => None,
        });
    if let Some(message) = failure {
        anyhow::bail!(message);
    }

    Ok(())
}

/// Resolved settings from CLI, profile, and config
struct ResolvedSettings {
    profile_name: String,
    provider_name: String,
    api_key: String,
    base_url: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    parameters: HashMap<String, serde_json::Value>,
}

/// Resolve all settings from CLI args, profile, and config
fn resolve_settings(cli: &Cli, config: &Config) -> Result<ResolvedSettings> {
    // Determine which profile to use (CLI > config default)
    let profile_name = cli
        .profile
        .clone()
        .unwrap_or_else(|| config.default_profile.clone());

    let resolved_profile = config
        .resolve_profile(&profile_name)
        .with_context(|| format!("Profile '{}' not found or missing provider", profile_name))?;

    let provider_name = resolved_profile.provider_name.clone();
    let provider_config = resolved_profile.provider_config.as_ref();

    // Resolve API key
    let api_key = cli
        .base_url
        .as_ref()
        .map(|_| "none".to_string()) // If base_url provided via CLI, allow dummy key
        .or_else(|| provider_config.and_then(|p| p.api_key.clone()))
        .or_else(|| std::env::var(format!("{}_API_KEY", provider_name.to_uppercase())).ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .with_context(|| {
            format!(
                "API key not found for provider '{}'. Configure in ~/.config/kode/config.toml",
                provider_name
            )
        })?;

    // Resolve base URL: CLI > provider config
    let base_url = cli
        .base_url
        .clone()
        .or_else(|| provider_config.and_then(|p| p.base_url.clone()));

    // Resolve model: CLI > profile > provider default
    let model = cli
        .model
        .clone()
        .or_else(|| resolved_profile.model.clone())
        .or_else(|| provider_config.and_then(|p| p.default_model.clone()));

    // Resolve system prompt: CLI > profile
    let system_prompt = cli
        .system
        .clone()
        .or(resolved_profile.system_prompt.clone());

    Ok(ResolvedSettings {
        profile_name,
        provider_name,
        api_key,
        base_url,
        model,
        system_prompt,
        parameters: resolved_profile.parameters,
    })
}

fn create_provider(settings: &ResolvedSettings) -> OpenAIProvider {
    let mut provider = OpenAIProvider::new(&settings.api_key);
    if let Some(model) = &settings.model {
        provider = provider.with_default_model(model);
    }
    if let Some(url) = &settings.base_url {
        provider = provider.with_base_url(url);
    }
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            default_profile = "default"

            [providers.local]
            api_key = "sk-local"
            base_url = "http://localhost:8080/v1"
            default_model = "local-default"
            parameters = { reasoning_effort = "low" }

            [profiles.default]
            provider = "local"
            prompt = "Be brief."

            [profiles.big]
            provider = "local"
            model = "local-big"
            parameters = { reasoning_effort = "high" }
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_defaults_from_profile() {
        let cli = Cli::parse_from(["kode"]);
        let settings = resolve_settings(&cli, &config()).unwrap();

        assert_eq!(settings.profile_name, "default");
        assert_eq!(settings.api_key, "sk-local");
        assert_eq!(settings.base_url.as_deref(), Some("http://localhost:8080/v1"));
        assert_eq!(settings.model.as_deref(), Some("local-default"));
        assert_eq!(settings.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(settings.parameters["reasoning_effort"], "low");
    }

    #[test]
    fn test_cli_overrides_profile() {
        let cli = Cli::parse_from([
            "kode",
            "--profile",
            "big",
            "--model",
            "cli-model",
            "--system",
            "From the CLI.",
            "--base-url",
            "http://127.0.0.1:9000/v1",
        ]);
        let settings = resolve_settings(&cli, &config()).unwrap();

        assert_eq!(settings.model.as_deref(), Some("cli-model"));
        assert_eq!(settings.system_prompt.as_deref(), Some("From the CLI."));
        assert_eq!(settings.base_url.as_deref(), Some("http://127.0.0.1:9000/v1"));
        assert_eq!(settings.api_key, "none");
        assert_eq!(settings.parameters["reasoning_effort"], "high");
    }

    #[test]
    fn test_profile_model_beats_provider_default() {
        let cli = Cli::parse_from(["kode", "-P", "big"]);
        let settings = resolve_settings(&cli, &config()).unwrap();
        assert_eq!(settings.model.as_deref(), Some("local-big"));
    }

    #[test]
    fn test_unknown_profile_is_error() {
        let cli = Cli::parse_from(["kode", "--profile", "missing"]);
        assert!(resolve_settings(&cli, &config()).is_err());
    }

    #[test]
    fn test_debug_flag_parses() {
        let cli = Cli::parse_from(["kode", "--debug", "--no-stream", "-p", "hello"]);
        assert!(cli.debug);
        assert!(cli.no_stream);
        assert_eq!(cli.prompt.as_deref(), Some("hello"));
        assert_eq!(cli.log_level, LogLevel::Warn);
    }
}
