use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ema_actor::{ActorConfig, ActorEvent, ActorStatus, ActorWorker};
use ema_core::buffer::{BufferStore, InMemoryBufferStore, JsonlBufferStore};
use ema_core::config::{Config, LoggingConfig};
use ema_core::memory::InMemoryMemoryStore;
use ema_core::types::{ActorId, Content};
use ema_providers::openai::OpenAiClient;
use ema_providers::RetryConfig;
use ema_tools::memory::{MemoryAddTool, MemorySearchTool};
use ema_tools::{EmaReplyTool, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "ema",
    about = "Ema — a tool-using, memory-backed AI actor on your terminal",
    version
)]
struct Cli {
    /// Config file path (default: ~/.ema/config.json)
    #[arg(short, long)]
    config: Option<String>,

    /// One-shot message (omit for interactive mode)
    #[arg(short, long)]
    message: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.level.clone().unwrap_or_else(|| "info".into())
    };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for directive in &config.filters {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ema")
                .join("config.json")
        })
}

fn build_worker(config: &Config) -> anyhow::Result<ActorWorker> {
    let provider = config
        .first_provider()
        .ok_or_else(|| anyhow::anyhow!("no LLM provider configured"))?;
    let api_key = provider
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("provider '{}' has no API key", provider.id))?;

    let mut llm = OpenAiClient::new(
        api_key,
        provider
            .default_model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".into()),
    )
    .with_retry(RetryConfig::from(&config.retry_settings()));
    if let Some(base_url) = &provider.base_url {
        llm = llm.with_base_url(base_url);
    }
    if let Some(max_tokens) = provider.max_tokens {
        llm = llm.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = provider.temperature {
        llm = llm.with_temperature(temperature);
    }

    let id = ActorId::new(1, 1);
    let memory = Arc::new(InMemoryMemoryStore::new());
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EmaReplyTool::new()));
    tools.register(Arc::new(MemorySearchTool::new(memory.clone(), id.actor_id)));
    tools.register(Arc::new(MemoryAddTool::new(memory.clone(), id.actor_id)));

    let buffer: Arc<dyn BufferStore> = match config.buffer_dir() {
        Some(dir) => Arc::new(JsonlBufferStore::new(dir)),
        None => Arc::new(InMemoryBufferStore::new()),
    };

    Ok(ActorWorker::new(
        id,
        ActorConfig::from_config(config),
        Arc::new(llm),
        tools,
        buffer,
        memory,
    ))
}

async fn wait_until_idle(worker: &ActorWorker) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if worker.status() == ActorStatus::Idle {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&config_path(&cli))?;
    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("invalid configuration");
    }

    let worker = build_worker(&config)?;
    worker.subscribe(|snapshot| {
        for event in &snapshot.events {
            match event {
                ActorEvent::EmaReplyReceived { reply } => {
                    println!(
                        "[{:?}/{:?}] {}",
                        reply.expression, reply.action, reply.response
                    );
                }
                ActorEvent::RunFinished { ok, msg, .. } if !ok => {
                    eprintln!("run failed: {msg}");
                }
                _ => {}
            }
        }
    });

    if let Some(message) = cli.message {
        worker.work(vec![Content::text(message)])?;
        // Give the queue a beat to pick up, then wait for the run to settle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        wait_until_idle(&worker).await;
        return Ok(());
    }

    // Interactive mode.
    use tokio::io::{AsyncBufReadExt, BufReader};
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    println!("ema interactive mode — empty line or Ctrl-D to exit");
    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            break;
        }
        worker.work(vec![Content::text(line)])?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        wait_until_idle(&worker).await;
    }

    Ok(())
}
