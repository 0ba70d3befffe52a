//! Relay command-line client.

mod config;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use relay_llm::{
    AuthSources, Block, CompletionOptions, LlmClient, NormalizedContent, Provider, SettingsOverrides,
    UsageInfo, resolve_auth,
};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::config::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Provider-neutral LLM chat client")]
struct Cli {
    /// Config file (default: ~/.relay/config.toml).
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream one completion for a prompt to stdout.
    Chat {
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Rate-limit isolation key.
        #[arg(long)]
        runtime: Option<String>,
    },
    /// Validate config and report which credential source resolves per provider.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let cfg = RelayConfig::load(cli.config).await?;

    match cli.command {
        Command::Chat {
            prompt,
            provider,
            model,
            runtime,
        } => chat(&cfg, prompt, provider.as_deref(), model, runtime).await,
        Command::Doctor => doctor(&cfg).await,
    }
}

async fn chat(
    cfg: &RelayConfig,
    prompt: String,
    provider: Option<&str>,
    model: Option<String>,
    runtime: Option<String>,
) -> anyhow::Result<()> {
    let provider = match (provider, model.as_deref().and_then(Provider::detect)) {
        (None, Some(detected)) => detected,
        (cli, _) => cfg.provider(cli)?,
    };
    let client = LlmClient::new(provider, cfg.settings_store());

    let mut settings = SettingsOverrides::new();
    if let Some(model) = model {
        settings.insert("model".to_string(), serde_json::Value::String(model));
    }
    let cancel = CancellationToken::new();
    let options = CompletionOptions {
        conversation: vec![NormalizedContent::human(prompt)],
        system_prompt: cfg.system_prompt.clone(),
        settings,
        runtime,
        cancel: cancel.clone(),
        ..CompletionOptions::default()
    };

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; cancelling");
                cancel.cancel();
            }
        }
    });

    let mut stream = client.generate_chat_completion(options);
    let mut stdout = std::io::stdout();
    let mut usage: Option<UsageInfo> = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for block in &chunk.blocks {
            match block {
                Block::Text { text } => write!(stdout, "{text}")?,
                Block::ToolCall { name, parameters, .. } => {
                    writeln!(stdout, "\n[tool call] {name} {parameters}")?
                }
                Block::Thinking {
                    thought, is_hidden, ..
                } if !is_hidden && !thought.is_empty() => eprintln!("[thinking] {thought}"),
                _ => {}
            }
        }
        stdout.flush()?;
        if let Some(u) = chunk.usage() {
            usage = Some(u.clone());
        }
    }
    writeln!(stdout)?;

    if let Some(usage) = usage {
        eprintln!(
            "usage: prompt={} completion={} total={}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
        if let Some(rate) = usage.cache_hit_rate() {
            eprintln!("cache hit rate: {rate:.1}%");
        }
    }
    Ok(())
}

async fn doctor(cfg: &RelayConfig) -> anyhow::Result<()> {
    let store = cfg.settings_store();
    println!("relay doctor: config ok");
    for provider in [Provider::Anthropic, Provider::Gemini] {
        let settings = store.effective(provider.as_str(), &SettingsOverrides::new());
        let model = settings.model().unwrap_or(provider.default_model()).to_string();
        match resolve_auth(provider, &AuthSources::from_env(&settings)).await {
            Ok(variant) => println!("{provider}: model={model} auth={:?}", variant.mode()),
            Err(e) => println!("{provider}: model={model} auth unavailable ({e})"),
        }
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("warn,relay=info,relay_app=info,relay_llm=info"),
    };
    let log_format = std::env::var("RELAY_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    // stdout carries the completion; logs go to stderr.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported RELAY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
