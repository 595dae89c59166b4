//! Run command implementation for relive CLI.
//!
//! Builds the application, starts generation 0 and then reloads it whenever
//! a watched file changes, until Ctrl+C or Enter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use relive_core::{
    ChangeFlag, DevSettings, Error, ModifiedSinceGate, ProcessLauncher, ReloadConfig,
    ReloadOrchestrator, ReloadOutcome, Trigger,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::RunArgs;
use crate::cargo::{CargoGate, default_entry_point};
use crate::colors;
use crate::proxy::{self, ReloadProxy};
use crate::watch::FileWatcher;

/// Configuration file looked up next to Cargo.toml.
const CONFIG_FILE: &str = "relive.toml";

/// Start the application and keep it live-reloaded.
pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let manifest_dir = args
        .manifest_dir
        .canonicalize()
        .with_context(|| format!("Directory not found: {}", args.manifest_dir.display()))?;
    if !manifest_dir.join("Cargo.toml").is_file() {
        anyhow::bail!("No Cargo.toml in {}", manifest_dir.display());
    }

    let config = load_config(&args, &manifest_dir)?;
    let settings = DevSettings::from_settings(&config.settings)?;
    print_header(&manifest_dir, &config);

    let flag = ChangeFlag::new();
    let gate = ModifiedSinceGate::new(
        CargoGate::new(&manifest_dir)
            .package(args.package.clone())
            .bin(args.bin.clone())
            .release(args.release),
    );
    let staging_dir = args
        .staging_dir
        .clone()
        .unwrap_or_else(|| manifest_dir.join(".relive").join("staging"));
    let launcher = ProcessLauncher::new()
        .with_staging_dir(staging_dir)
        .with_args(args.app_args.clone());
    let orchestrator = Arc::new(ReloadOrchestrator::new(launcher, gate, flag.clone()));

    let watch_paths = watch_paths(&args.watch, &manifest_dir);
    let mut watcher = FileWatcher::new(&watch_paths, flag)?;

    println!("{}Building...{}", colors::DIM, colors::RESET);
    colors::flush_stdout();
    let started = Instant::now();
    let generation = match orchestrator.start(config).await {
        Ok(generation) => generation,
        Err(e) => {
            println!("{}✗ Failed to start:{} {}", colors::RED, colors::RESET, e);
            return Err(e.into());
        }
    };
    let endpoint = orchestrator
        .current_endpoint()
        .await
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    println!(
        "{}✓ Generation {} running at http://{}{} {}({:.1}s){}",
        colors::GREEN,
        generation,
        endpoint,
        colors::RESET,
        colors::DIM,
        started.elapsed().as_secs_f64(),
        colors::RESET
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let proxy_task = if args.proxy {
        let host = settings.proxy_host.as_str();
        let listener = match TcpListener::bind((host, settings.proxy_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                orchestrator.stop().await;
                return Err(e).with_context(|| {
                    format!("failed to bind proxy to {}:{}", host, settings.proxy_port)
                });
            }
        };
        println!(
            "{}  ◆ Proxy:{} http://{}:{}",
            colors::CYAN,
            colors::RESET,
            host,
            settings.proxy_port
        );
        let proxy = Arc::new(ReloadProxy::new(orchestrator.clone(), args.reload_on_request)?);
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        Some(tokio::spawn(proxy::serve(listener, proxy, shutdown)))
    } else {
        None
    };

    println!("{}", "─".repeat(50));
    println!(
        "{}Watching for changes. Press Enter or Ctrl+C to stop{}",
        colors::GREEN,
        colors::RESET
    );
    println!();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(_)) => break,
                Ok(None) | Err(_) => stdin_open = false,
            },
            batch = watcher.recv() => match batch {
                Some(paths) => {
                    tokio::spawn(reload(orchestrator.clone(), Trigger::FileChange(paths)));
                }
                None => break,
            },
        }
    }

    println!("\n{}Stopping...{}", colors::DIM, colors::RESET);
    orchestrator.stop().await;
    let _ = shutdown_tx.send(());
    if let Some(task) = proxy_task {
        match task.await {
            Ok(Err(e)) => tracing::warn!("{:#}", e),
            Err(e) => tracing::warn!("proxy task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    println!("{}✓ Stopped{}", colors::GREEN, colors::RESET);

    Ok(())
}

/// Run one reload and report its outcome.
async fn reload(orchestrator: Arc<ReloadOrchestrator>, trigger: Trigger) {
    let started = Instant::now();
    match orchestrator.reload(trigger).await {
        Ok(ReloadOutcome::Reloaded { previous, current }) => {
            let previous = previous.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "{}✓ Reloaded {} → {}{} {}({:.1}s){}",
                colors::GREEN,
                previous,
                current,
                colors::RESET,
                colors::DIM,
                started.elapsed().as_secs_f64(),
                colors::RESET
            );
        }
        Ok(ReloadOutcome::UpToDate) => {
            println!("{}Build up to date{}", colors::DIM, colors::RESET);
        }
        Ok(ReloadOutcome::Skipped) | Err(Error::Stopped) => {}
        Err(e) => {
            println!(
                "{}✗ Reload failed:{} {}\n{}  still serving the previous generation{}",
                colors::RED,
                colors::RESET,
                e,
                colors::DIM,
                colors::RESET
            );
        }
    }
    colors::flush_stdout();
}

/// Load the configuration file (if any) and apply the command line on top.
fn load_config(args: &RunArgs, manifest_dir: &Path) -> anyhow::Result<ReloadConfig> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => Some(manifest_dir.join(CONFIG_FILE)).filter(|p| p.is_file()),
    };

    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            if !table.contains_key("entry-point") {
                let entry_point = default_entry_point(manifest_dir, args.package.as_deref())?;
                table.insert("entry-point".to_string(), toml::Value::String(entry_point));
            }
            toml::Value::Table(table)
                .try_into::<ReloadConfig>()
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        }
        None => ReloadConfig::new(default_entry_point(manifest_dir, args.package.as_deref())?),
    };

    if let Some(bin) = &args.bin {
        config.entry_point = bin.clone();
    }
    for (key, value) in &args.settings {
        config.settings.insert(key.clone(), value.clone());
    }
    if !args.startup_hooks.is_empty() {
        config.startup_hooks = args.startup_hooks.clone();
    }
    if !args.shutdown_hooks.is_empty() {
        config.shutdown_hooks = args.shutdown_hooks.clone();
    }
    Ok(config)
}

fn watch_paths(requested: &[PathBuf], manifest_dir: &Path) -> Vec<PathBuf> {
    if !requested.is_empty() {
        return requested
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { manifest_dir.join(p) })
            .collect();
    }
    ["src", "Cargo.toml"]
        .iter()
        .map(|p| manifest_dir.join(p))
        .filter(|p| p.exists())
        .collect()
}

fn print_header(manifest_dir: &Path, config: &ReloadConfig) {
    println!(
        "\n{}relive{} - {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        config.entry_point,
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Project:{} {}",
        colors::CYAN,
        colors::RESET,
        manifest_dir.display()
    );
    println!(
        "{}  ◆ Hooks:{} {} / {}",
        colors::CYAN,
        colors::RESET,
        config.startup_hooks.join(", "),
        config.shutdown_hooks.join(", ")
    );
}
