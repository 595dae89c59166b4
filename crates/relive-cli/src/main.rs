//! relive CLI - rebuild and hot-swap a Cargo application while it keeps serving.

mod cargo;
mod colors;
mod proxy;
mod run;
mod watch;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use relive_core::HookRegistry;

#[derive(Parser)]
#[command(name = "relive")]
#[command(about = "Rebuild and hot-swap a Cargo application while it keeps serving")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, start and live-reload an application
    Run(RunArgs),

    /// List the built-in hooks
    Hooks,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory containing Cargo.toml
    #[arg(long, default_value = ".")]
    pub manifest_dir: PathBuf,

    /// Package to build
    #[arg(short, long)]
    pub package: Option<String>,

    /// Binary to run
    #[arg(long)]
    pub bin: Option<String>,

    /// Build with optimizations
    #[arg(long)]
    pub release: bool,

    /// Paths to watch (default: src/ and Cargo.toml)
    #[arg(short, long = "watch")]
    pub watch: Vec<PathBuf>,

    /// Setting passed to the application and the hooks
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,

    /// Startup hook (repeatable, replaces the configured list)
    #[arg(long = "startup-hook", value_name = "ID")]
    pub startup_hooks: Vec<String>,

    /// Shutdown hook (repeatable, replaces the configured list)
    #[arg(long = "shutdown-hook", value_name = "ID")]
    pub shutdown_hooks: Vec<String>,

    /// Configuration file (default: relive.toml next to Cargo.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serve a stable address that forwards to the current generation
    #[arg(long)]
    pub proxy: bool,

    /// Check for changes on every proxied request
    #[arg(long, requires = "proxy")]
    pub reload_on_request: bool,

    /// Directory for per-generation executable copies
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Arguments passed to the application
    #[arg(last = true)]
    pub app_args: Vec<String>,
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run(args) => run::execute(args).await?,
        Commands::Hooks => list_hooks(),
    }

    Ok(())
}

/// Print the built-in hooks.
fn list_hooks() {
    let registry = HookRegistry::with_builtins();
    println!("{}Built-in hooks{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    for hook in registry.describe() {
        println!(
            "{}{:<24}{} {:<9} {}",
            colors::CYAN,
            hook.id,
            colors::RESET,
            hook.kind,
            hook.description
        );
    }
}
