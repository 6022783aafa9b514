//! `prospector` binary: runs prompts through the failover engine.

use clap::{Parser, Subcommand};
use prospector_agent::{
    CancellationToken, FailoverConfig, FailoverEngine, LlmProvider, OpenAiBackend, ProviderConfig,
};
use prospector_core::Message;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const API_KEY_ENV: &str = "PROSPECTOR_API_KEY";

#[derive(Parser)]
#[command(name = "prospector", about = "Prospector: LLM calls that survive rate limits")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "prospector.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt through the model rotation
    Ask {
        /// User prompt
        prompt: String,
        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,
        /// Start on this model instead of the configured first one
        #[arg(long)]
        model: Option<String>,
    },
    /// Show the resolved model rotation
    Models,
}

#[derive(Serialize)]
struct AskOutput<'a> {
    result: &'a prospector_agent::InvocationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_message: Option<String>,
    stats: prospector_agent::EngineStats,
}

fn load_config(raw: &str) -> anyhow::Result<FailoverConfig> {
    let mut config = FailoverConfig::from_toml_str(raw)?;
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        let provider = config
            .provider
            .get_or_insert_with(|| ProviderConfig::new(LlmProvider::OpenAi, String::new()));
        provider.api_key = key;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config file '{}': {e}",
            cli.config.display()
        )
    })?;
    let config = load_config(&config_str)?;

    match cli.command {
        Commands::Ask {
            prompt,
            system,
            model,
        } => {
            let provider = config.provider.clone().ok_or_else(|| {
                anyhow::anyhow!("No [provider] section in config and {API_KEY_ENV} is not set")
            })?;
            if provider.api_key.is_empty() {
                warn!("API key is empty; the provider will likely reject requests");
            }

            let backend = Arc::new(OpenAiBackend::new(provider)?);
            let engine = FailoverEngine::new(config, backend);
            if let Some(model) = model {
                engine.force_model(&model)?;
            }

            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, cancelling");
                    on_ctrl_c.cancel();
                }
            });

            info!(model = %engine.active_model(), "Sending prompt");
            let result = engine.invoke_with_cancel(&messages, None, &cancel).await;
            let output = AskOutput {
                result: &result,
                user_message: result.user_message(),
                stats: engine.stats(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);

            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Models => {
            let rotation = config.rotation();
            println!("Model rotation:");
            for (i, model) in rotation.iter().enumerate() {
                let marker = if i == 0 { " (first)" } else { "" };
                println!("  {}. {model}{marker}", i + 1);
            }
            let policy = &config.retry_policy;
            println!(
                "\nRetries per model: {}, base delay: {}ms, max delay: {}ms",
                policy.max_retries, policy.base_delay_ms, policy.max_delay_ms
            );
            println!(
                "Short cooldown: {}ms, max inline wait: {}ms",
                config.cooldowns.short_cooldown_ms, config.cooldowns.max_inline_wait_ms
            );
        }
    }

    Ok(())
}
