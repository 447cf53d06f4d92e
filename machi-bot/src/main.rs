//! Orkestra - a headless multi-channel orchestration agent, CLI entry point.
//!
//! This binary is thin glue: it loads configuration, builds a model and a
//! tool registry from it, and drives the orchestration core
//! ([`orkestra::router::Router`]) from a stdin/stdout transport loop.

#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI program intentionally uses stdout/stderr

mod config;
mod error;
mod tools;
mod util;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use config::BotConfig;
use error::{BotError, Result};

use orkestra::cron::CronScheduler;
use orkestra::events::EventLog;
use orkestra::message::InboundMessage;
use orkestra::providers::{HttpJsonProvider, MockModel, Model};
use orkestra::router::{Router, RouterRequest};
use orkestra::secrets::SecretVault;
use orkestra::tool::ToolRegistry;
use tools::{CronTool, EditFileTool, ListDirTool, ReadFileTool, SecretTool, WriteFileTool};

/// Transports in practice (Telegram, Slack, ...) cap message size; chunk
/// long replies the same way for the stdout transport so behavior matches.
const CHAT_CHUNK_CHARS: usize = 3500;

/// Orkestra - a headless multi-channel orchestration agent.
#[derive(Parser)]
#[command(name = "orkestra")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path.
    #[arg(short, long, env = "ORKESTRA_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and the workspace directory.
    Init(InitArgs),
    /// Start an interactive chat session over stdin/stdout.
    Chat,
    /// Show resolved configuration and provider status.
    Status,
    /// Manage configuration.
    Config(ConfigArgs),
}

/// Arguments for the init command.
#[derive(Args)]
struct InitArgs {
    /// Overwrite an existing configuration file.
    #[arg(short, long)]
    force: bool,
}

/// Arguments for the config command.
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration.
    Show,
    /// Print the configuration file path.
    Path,
    /// Validate the configuration and list issues.
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Init(args) => cmd_init(args).await,
        Commands::Chat => cmd_chat(cli.config).await,
        Commands::Status => cmd_status(cli.config).await,
        Commands::Config(args) => cmd_config(cli.config, args).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn cmd_init(args: InitArgs) -> Result<()> {
    let cfg_path = config::config_path();
    if cfg_path.exists() && !args.force {
        println!("configuration already exists at {}", cfg_path.display());
        println!("pass --force to overwrite");
        return Ok(());
    }
    if args.force {
        let cfg = BotConfig::default();
        config::save_config(&cfg).await.map_err(|e| BotError::config(e.to_string()))?;
    }
    let cfg = config::init_config().await.map_err(|e| BotError::config(e.to_string()))?;
    println!("initialized orkestra configuration at {}", cfg_path.display());
    println!("workspace: {}", util::workspace_dir().display());
    for issue in cfg.validate() {
        println!("{issue}");
    }
    Ok(())
}

async fn cmd_status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path).await?;
    println!("config: {}", config::config_path().display());
    println!("workspace: {}", util::workspace_dir().display());
    println!("sessions: {}", util::sessions_dir().display());
    println!("model: {}", util::truncate_str(&cfg.agents.defaults.model, 80));
    println!("max iterations: {}", cfg.agents.defaults.max_iterations);
    print_provider_status(&cfg);
    let issues = cfg.validate();
    if issues.is_empty() {
        println!("configuration ok");
    } else {
        for issue in issues {
            println!("{issue}");
        }
    }
    Ok(())
}

fn print_provider_status(cfg: &BotConfig) {
    let rows: [(&str, bool); 6] = [
        ("openrouter", cfg.providers.openrouter.is_some()),
        ("openai", cfg.providers.openai.is_some()),
        ("anthropic", cfg.providers.anthropic.is_some()),
        ("ollama", cfg.providers.ollama.is_some()),
        ("groq", cfg.providers.groq.is_some()),
        ("gemini", cfg.providers.gemini.is_some()),
    ];
    for (name, configured) in rows {
        let mark = if configured { "configured" } else { "not configured" };
        println!("provider {name}: {mark}");
    }
}

async fn cmd_config(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Path => println!("{}", config::config_path().display()),
        ConfigAction::Show => {
            let cfg = load_config(config_path).await?;
            let toml = toml::to_string_pretty(&cfg).map_err(|e| BotError::config(e.to_string()))?;
            println!("{toml}");
        }
        ConfigAction::Validate => {
            let cfg = load_config(config_path).await?;
            let issues = cfg.validate();
            if issues.is_empty() {
                println!("configuration is valid");
            } else {
                for issue in &issues {
                    println!("{issue}");
                }
                if !cfg.is_valid() {
                    return Err(BotError::config("configuration has errors"));
                }
            }
        }
    }
    Ok(())
}

async fn load_config(config_path: Option<PathBuf>) -> Result<BotConfig> {
    let cfg = match config_path {
        Some(path) => config::load_config_from(path).await,
        None => config::load_config().await,
    }
    .map_err(|e| BotError::config(e.to_string()))?;
    Ok(cfg.with_env())
}

/// Builds the primary and (if a second provider is configured) fallback
/// model from whichever providers are present in config/environment,
/// highest-trust first. Falls back to [`MockModel`] so `chat` always works
/// offline.
fn build_models(cfg: &BotConfig) -> (Arc<dyn Model>, Option<Arc<dyn Model>>) {
    let model_id = cfg.agents.defaults.model.clone();
    let mut candidates: Vec<Arc<dyn Model>> = Vec::new();

    if let Some(anthropic) = &cfg.providers.anthropic {
        candidates.push(Arc::new(HttpJsonProvider::new(
            "https://api.anthropic.com/v1",
            Some(anthropic.api_key.clone()),
            model_id.clone(),
        )));
    }
    if let Some(openrouter) = &cfg.providers.openrouter {
        let base = openrouter.api_base.clone().unwrap_or_else(|| "https://openrouter.ai/api/v1".to_owned());
        candidates.push(Arc::new(HttpJsonProvider::new(base, Some(openrouter.api_key.clone()), model_id.clone())));
    }
    if let Some(openai) = &cfg.providers.openai {
        let base = openai.api_base.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
        candidates.push(Arc::new(HttpJsonProvider::new(base, Some(openai.api_key.clone()), model_id.clone())));
    }
    if let Some(groq) = &cfg.providers.groq {
        candidates.push(Arc::new(HttpJsonProvider::new(
            "https://api.groq.com/openai/v1",
            Some(groq.api_key.clone()),
            model_id.clone(),
        )));
    }
    if let Some(gemini) = &cfg.providers.gemini {
        candidates.push(Arc::new(HttpJsonProvider::new(
            "https://generativelanguage.googleapis.com/v1beta/openai",
            Some(gemini.api_key.clone()),
            model_id.clone(),
        )));
    }
    if let Some(vllm) = &cfg.providers.vllm {
        candidates.push(Arc::new(HttpJsonProvider::new(vllm.api_base.clone(), Some(vllm.api_key.clone()), model_id.clone())));
    }
    if let Some(ollama) = &cfg.providers.ollama {
        candidates.push(Arc::new(HttpJsonProvider::new(ollama.api_base.clone(), None, model_id)));
    }

    if candidates.is_empty() {
        let mock = Arc::new(
            MockModel::new(vec![
                "No model provider is configured. Run `orkestra config show` \
                 to see what's set, or add credentials under [providers] in your config."
                    .to_owned(),
            ])
            .with_model_id("mock"),
        );
        return (mock, None);
    }

    let mut iter = candidates.into_iter();
    let primary = iter.next().expect("checked non-empty above");
    let fallback = iter.next();
    (primary, fallback)
}

async fn cmd_chat(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(config_path).await?;
    tokio::fs::create_dir_all(util::workspace_dir()).await?;
    tokio::fs::create_dir_all(util::config_dir()).await?;

    let (orchestrator, fallback) = build_models(&cfg);
    let secrets =
        Arc::new(SecretVault::open(util::config_dir().join("secrets")).map_err(|e| BotError::Storage(e.to_string()))?);
    let events =
        EventLog::open(util::config_dir().join("events")).map_err(|e| BotError::Storage(e.to_string()))?;
    let scheduler = Arc::new(
        CronScheduler::open(util::config_dir().join("cron"))
            .await
            .map_err(|e| BotError::Storage(e.to_string()))?,
    );

    let registry = Arc::new(ToolRegistry::new());
    let workspace = util::workspace_dir();
    registry
        .register(Arc::new(ReadFileTool::new(workspace.clone())))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry
        .register(Arc::new(WriteFileTool::new(workspace.clone())))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry
        .register(Arc::new(EditFileTool::new(workspace.clone())))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry
        .register(Arc::new(ListDirTool::new(workspace.clone())))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry
        .register(Arc::new(CronTool::new(scheduler)))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry
        .register(Arc::new(SecretTool::new(Arc::clone(&secrets))))
        .await
        .map_err(|e| BotError::model(e.to_string()))?;
    registry.set_events(events).await;

    let router = Router::new(orchestrator, fallback, registry, secrets);

    println!("orkestra chat (model: {}) - type 'exit' to quit", cfg.agents.defaults.model);
    let mut history = Vec::new();
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let inbound = InboundMessage {
            id: util::generate_message_id(),
            provider: "cli".to_owned(),
            sender_id: "local".to_owned(),
            chat_id: "cli".to_owned(),
            thread_id: None,
            text: line.to_owned(),
            media: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            metadata: serde_json::Map::new(),
        };
        let request = RouterRequest {
            history: history.clone(),
            inbound,
            available_tools: vec![
                "read_file".to_owned(),
                "write_file".to_owned(),
                "edit_file".to_owned(),
                "list_dir".to_owned(),
                "cron".to_owned(),
                "secret".to_owned(),
            ],
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        let result = router.execute(request).await;
        if let Some(err) = result.error {
            println!("error: {err}");
            continue;
        }
        if !result.suppress_reply
            && let Some(reply) = &result.reply
        {
            for (i, chunk) in util::split_into_chunks(reply, CHAT_CHUNK_CHARS).iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                println!("{chunk}");
            }
        }
        history.push(orkestra::message::ChatMessage::user(line.to_owned()));
        if let Some(reply) = result.reply {
            history.push(orkestra::message::ChatMessage::assistant(reply));
        }
        if history.len() > 40 {
            let drop = history.len() - 40;
            history.drain(0..drop);
        }
    }

    Ok(())
}
