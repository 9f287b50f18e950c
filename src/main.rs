//! PML Gateway CLI

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use pml_gateway::config::GatewayConfig;
use pml_gateway::dag::{build_logical, fuse, SourceScanner};
use pml_gateway::dispatch::{serve_stdio, Dispatcher, Gateway};
use pml_gateway::error::{FixSuggestion, PmlError};
use pml_gateway::event::EventBus;
use pml_gateway::mux::Multiplexer;
use pml_gateway::registry::CapabilityRegistry;
use pml_gateway::runtime::{CodeRunner, MockRunner, ProcessRunner, WorkflowExecutor, WorkflowStore};

#[derive(Parser)]
#[command(name = "pml-gateway")]
#[command(about = "Gateway and orchestration runtime for tool-calling agents")]
#[command(version)]
struct Cli {
    /// Path to config.toml (defaults to ~/.config/pml-gateway/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the JSON-RPC gateway over stdio
    Serve,

    /// Validate the configuration and list configured servers
    Check,

    /// Build the two-level DAG for a code file and print it as JSON
    Build {
        /// Path to the code file
        file: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig, PmlError> {
    match path {
        Some(path) => GatewayConfig::load_from(path),
        None => GatewayConfig::load(),
    }
}

fn build_gateway(config: &GatewayConfig) -> Arc<Gateway> {
    let bus = Arc::new(EventBus::new());
    let mux = Arc::new(Multiplexer::new(config.server_configs()));
    let registry = Arc::new(CapabilityRegistry::in_memory(Arc::clone(&bus)));

    let runner: Arc<dyn CodeRunner> = match &config.sandbox.runner {
        Some(command) => Arc::new(ProcessRunner::new(
            command.clone(),
            config.sandbox.args.clone(),
        )),
        // No sandbox configured: code tasks echo their bindings
        None => Arc::new(MockRunner::new(|_, bindings| Ok(bindings.clone()))),
    };

    let executor = WorkflowExecutor::new(
        Arc::clone(&mux),
        runner,
        Arc::clone(&bus),
        Arc::clone(&registry) as _,
    );

    Arc::new(Gateway {
        mux,
        registry,
        bus,
        store: Arc::new(WorkflowStore::new()),
        executor,
        parser: Arc::new(SourceScanner::new()),
        auto_approve: config.gateway.auto_approve,
    })
}

async fn run(cli: Cli) -> Result<(), PmlError> {
    match cli.command {
        Commands::Serve => {
            let config = load_config(cli.config.as_ref())?;
            let gateway = build_gateway(&config);

            gateway.mux.connect_all().await;
            let discovered = gateway.mux.discover().await?;
            eprintln!(
                "{} {} tools discovered across {} servers",
                "→".cyan(),
                discovered,
                config.servers.len()
            );

            serve_stdio(Dispatcher::new(gateway)).await
        }
        Commands::Check => {
            let config = load_config(cli.config.as_ref())?;
            println!("{} config OK", "✓".green());
            println!(
                "  auto_approve: {}",
                config.gateway.auto_approve.to_string().dimmed()
            );
            println!(
                "  sandbox: {}",
                config
                    .sandbox
                    .runner
                    .as_deref()
                    .unwrap_or("(none)")
                    .dimmed()
            );
            for server in config.server_configs() {
                println!(
                    "  {} {} (scope: {}, approval: {:?})",
                    "server".dimmed(),
                    server.id,
                    server.scope.as_str(),
                    server.approval
                );
            }
            Ok(())
        }
        Commands::Build { file } => {
            let code = std::fs::read_to_string(&file)?;
            let output = build_logical(&SourceScanner::new(), &code)?;
            let dag = fuse(&output, &pml_gateway::mux::ToolIndex::new())?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "logical": output.logical,
                    "physical": dag.tasks,
                    "layers": dag.layers()?,
                }))?
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "✗".red(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "hint:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}
