use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tagstream_core::{
    client_registry::ClientRegistry,
    config::Config,
    error::{CoreResult, ParseResult},
    model::{ChatRequest, ToolCall, ToolDefinition},
    provider::{ScriptedProvider, TokenProvider},
    router::HandlerTable,
    sink::JsonLinesSink,
    tool_call::parse_tool_call,
    validator::ProtocolValidator,
    worker::{CancelHandle, StreamWorker, ToolExecutor, cancel_pair},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Split reasoning-model streams into typed events", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a chat completion from a configured provider (JSON lines on stdout)
    Stream {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "JSON file with the assistant's tool list")]
        tools: Option<PathBuf>,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Replay tokens from a JSON array file through the demultiplexer
    Replay {
        #[arg(help = "JSON array of token strings")]
        tokens: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "replay")]
        model: String,
        #[arg(long, help = "JSON file with the assistant's tool list")]
        tools: Option<PathBuf>,
        #[arg(long, help = "Delay before each token, in milliseconds")]
        delay_ms: Option<u64>,
    },
    /// Validate one tool call against assistant content and a tool list
    Validate {
        #[arg(long, help = "File with the assistant's content text")]
        content: PathBuf,
        #[arg(long, help = "File with the tool call (JSON or raw function-call text)")]
        call: PathBuf,
        #[arg(long, help = "JSON file with the assistant's tool list")]
        tools: PathBuf,
    },
}

/// Reports what would run instead of running it.
struct DryRunExecutor;

#[async_trait]
impl ToolExecutor for DryRunExecutor {
    async fn execute(&self, call: &ToolCall) -> CoreResult<Value> {
        let arguments = serde_json::from_str::<Value>(&call.function.arguments)
            .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
        tracing::info!(tool = %call.function.name, "dry run; tool not executed");
        Ok(json!({
            "dry_run": true,
            "tool": call.function.name,
            "arguments": arguments,
        }))
    }
}

fn read_tools(path: Option<&Path>) -> anyhow::Result<Vec<ToolDefinition>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tools from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing tools in {}", path.display()))
}

fn new_run_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{ms}")
}

/// Cancel the run on Ctrl-C.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling run");
            handle.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sink = JsonLinesSink::new(std::io::stdout());

    match cli.command {
        Commands::Stream {
            config,
            model,
            message,
            tools,
            run_id,
        } => {
            let cfg = Config::from_path(&config)?;
            let table = HandlerTable::from_config(&cfg)?;
            let registry = ClientRegistry::from_config(&cfg)?;

            let handler = table.resolve(&model);
            let Some(provider_cfg) = cfg.providers.get(&handler.provider) else {
                bail!("model '{model}' routes to unknown provider '{}'", handler.provider);
            };
            let provider = registry.get_or_create(&handler.provider, provider_cfg)?;

            let mut req = ChatRequest::user(model, message);
            let tools = read_tools(tools.as_deref())?;
            if !tools.is_empty() {
                req.tools = Some(tools);
            }

            let worker = StreamWorker::new(handler.settings, Arc::new(DryRunExecutor))
                .validate_tool_calls(cfg.stream.validate_tool_calls);
            let (handle, cancel) = cancel_pair();
            cancel_on_ctrl_c(handle);
            let run_id = run_id.unwrap_or_else(new_run_id);
            let summary = worker
                .run_request(provider.as_ref(), req, &run_id, &sink, cancel)
                .await?;
            registry.close_all();
            tracing::info!(run_id = %summary.run_id, outcome = summary.outcome.as_str(), events = summary.events, "run finished");
        }
        Commands::Replay {
            tokens,
            config,
            model,
            tools,
            delay_ms,
        } => {
            let cfg = match &config {
                Some(path) => Config::from_path(path)?,
                None => Config::with_default_provider("scripted"),
            };
            let text = std::fs::read_to_string(&tokens)
                .with_context(|| format!("reading tokens from {}", tokens.display()))?;
            let list: Vec<String> = serde_json::from_str(&text)
                .with_context(|| format!("{} must hold a JSON array of strings", tokens.display()))?;
            let mut provider = ScriptedProvider::new(list);
            if let Some(ms) = delay_ms {
                provider = provider.with_delay(Duration::from_millis(ms));
            }

            let handler = HandlerTable::from_config(&cfg)?.resolve(&model);
            let mut req = ChatRequest::user(model, "");
            let tools = read_tools(tools.as_deref())?;
            if !tools.is_empty() {
                req.tools = Some(tools);
            }
            let worker = StreamWorker::new(handler.settings, Arc::new(DryRunExecutor))
                .validate_tool_calls(cfg.stream.validate_tool_calls);
            let (handle, cancel) = cancel_pair();
            cancel_on_ctrl_c(handle);
            let summary = worker
                .run_request(&provider as &dyn TokenProvider, req, &new_run_id(), &sink, cancel)
                .await?;
            tracing::info!(outcome = summary.outcome.as_str(), events = summary.events, "replay finished");
        }
        Commands::Validate {
            content,
            call,
            tools,
        } => {
            let content = std::fs::read_to_string(&content)
                .with_context(|| format!("reading content from {}", content.display()))?;
            let call_text = std::fs::read_to_string(&call)
                .with_context(|| format!("reading tool call from {}", call.display()))?;
            let call = match parse_tool_call(&call_text) {
                ParseResult::Ok(c) => c,
                ParseResult::Incomplete => bail!("tool call in {} is truncated", call.display()),
                ParseResult::Malformed(reason) => bail!("tool call in {}: {reason}", call.display()),
            };
            let tools = read_tools(Some(&tools))?;
            let outcome = ProtocolValidator::new().validate(&content, &call, &tools);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.valid {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}
