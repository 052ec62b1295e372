//! Toolbridge - connect language-model agents to tool servers.
//!
//! Thin CLI over the library: manage configured servers, inspect their
//! tools, invoke tools directly, or run an agentic query end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolbridge::ai::{AgentEvent, OpenAIProvider, ServerSelector, ServerSummary, ToolCallLoop};
use toolbridge::config::{DescriptorStore, FileStore, ServerStatus};
use toolbridge::mcp::ClientRegistry;

/// Connect language-model agents to tool servers
#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the server configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers and their status
    List,

    /// List the tools a server exposes
    Tools {
        /// Server id
        id: String,
    },

    /// Connect a server and mark it running
    Start {
        /// Server id
        id: String,
    },

    /// Disconnect a server and mark it stopped
    Stop {
        /// Server id
        id: String,
    },

    /// Stop and start a server
    Restart {
        /// Server id
        id: String,
    },

    /// Invoke one tool directly
    Call {
        /// Server id
        id: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Run an agentic query against a server
    Ask {
        /// The query
        query: String,
        /// Target server id (skips selection)
        #[arg(long)]
        server: Option<String>,
        /// Completion rounds before the run aborts
        #[arg(long, default_value_t = toolbridge::MAX_ROUNDS)]
        max_rounds: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolbridge=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolbridge=warn"))
    };
    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let store = Arc::new(match cli.config {
        Some(ref path) => FileStore::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => FileStore::load_default().context("failed to load default config")?,
    });
    let registry = ClientRegistry::new(store.clone());

    match cli.command {
        Commands::List => {
            let servers = store.list();
            if servers.is_empty() {
                println!("No servers configured ({}).", store.path().display());
                return Ok(());
            }
            for server in servers {
                println!(
                    "{:<20} {:<8} {:?}",
                    server.id,
                    server.transport.kind(),
                    server.status
                );
            }
        }

        Commands::Tools { id } => {
            let handle = registry.get(&id, true).await?;
            for tool in handle.tools().await {
                match tool.description {
                    Some(description) => println!("{:<24} {description}", tool.name),
                    None => println!("{}", tool.name),
                }
            }
            registry.close_all().await;
        }

        Commands::Start { id } => {
            registry.start(&id).await?;
            println!("Started {id}.");
        }

        Commands::Stop { id } => {
            registry.stop(&id).await?;
            println!("Stopped {id}.");
        }

        Commands::Restart { id } => {
            registry.restart(&id).await?;
            println!("Restarted {id}.");
        }

        Commands::Call { id, tool, args } => {
            let arguments: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&args).context("arguments must be a JSON object")?;

            let handle = registry.get(&id, true).await?;
            let result =
                handle.call_tool(&tool, (!arguments.is_empty()).then_some(arguments)).await?;
            println!("{}", result.text());
            registry.close_all().await;
        }

        Commands::Ask { query, server, max_rounds } => {
            let provider = Arc::new(OpenAIProvider::new()?);

            // Bring up everything the config marks running.
            for descriptor in store.list() {
                if descriptor.status == ServerStatus::Running {
                    if let Err(e) = registry.get(&descriptor.id, true).await {
                        tracing::warn!(server = %descriptor.id, error = %e, "failed to connect");
                    }
                }
            }

            let handle = match server {
                Some(id) => registry.get(&id, true).await?,
                None => {
                    let running = registry.running_handles().await;
                    let mut summaries = Vec::with_capacity(running.len());
                    for handle in &running {
                        summaries.push(ServerSummary::from_handle(handle).await);
                    }
                    let selector = ServerSelector::new(provider.clone());
                    let Some(id) = selector.select(&query, &summaries).await else {
                        bail!("no running servers; start one with `toolbridge start <id>`");
                    };
                    registry.get(&id, true).await?
                }
            };

            let runner =
                ToolCallLoop::new(provider, handle).with_max_rounds(max_rounds);
            let mut events = runner.run(&query, Vec::new());
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
            registry.close_all().await;
        }
    }

    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Status { message } => eprintln!("· {message}"),
        AgentEvent::LlmResponse { content } => println!("{content}"),
        AgentEvent::ToolCall { name, arguments, .. } => {
            eprintln!("→ {name} {arguments}");
        }
        AgentEvent::ToolResult { name, elapsed_ms, output, .. } => {
            eprintln!("← {name} ({elapsed_ms}ms)");
            if !output.is_empty() {
                println!("{output}");
            }
        }
        AgentEvent::Error { message, .. } => eprintln!("✗ {message}"),
        AgentEvent::Done { rounds, .. } => eprintln!("✓ done after {rounds} round(s)"),
    }
}
