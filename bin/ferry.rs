#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ferry::Ferry;
use ferry_common::logging;
use ferry_control::{ListQuery, TargetIds};
use serde::Serialize;
use tokio::io::AsyncReadExt;

/// Durable retry queue for outbound mail relay
#[derive(Parser, Debug)]
#[command(name = "ferry", version, long_about = None)]
struct Cli {
    /// Configuration file. Defaults to `FERRY_CONFIG`, then
    /// ./ferry.config.ron, then /etc/ferry/ferry.config.ron
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the retry worker (the default)
    Run,
    /// Inspect or change the queue while the worker is stopped
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List queued jobs
    List {
        /// Page number, starting at 1
        #[arg(long)]
        page: Option<usize>,

        /// Jobs per page
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Queue size, retry histogram and scheduler settings
    Stats,
    /// Queue a job from a JSON request (`-` reads stdin)
    Enqueue { request: PathBuf },
    /// Remove jobs without delivering them
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Count an attempt and make jobs eligible immediately
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove jobs and notify their senders when bounces are enabled
    Bounce {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config)?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let ferry: Ferry = ron::from_str(&config_content)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => ferry.run().await,
        Command::Queue { action } => {
            logging::init();
            queue(&ferry, action).await
        }
    }
}

async fn queue(ferry: &Ferry, action: QueueAction) -> anyhow::Result<()> {
    let assembly = ferry.assemble()?;
    let service = &assembly.service;

    match action {
        QueueAction::List { page, limit } => print(&service.list(ListQuery { page, limit })),
        QueueAction::Stats => print(&service.stats()),
        QueueAction::Enqueue { request } => {
            let body = if request.as_os_str() == "-" {
                let mut body = Vec::new();
                tokio::io::stdin().read_to_end(&mut body).await?;
                body
            } else {
                tokio::fs::read(&request).await?
            };
            print(&service.enqueue_json(&body).await?)
        }
        QueueAction::Delete { ids } => print(&service.delete(&TargetIds::many(ids)).await?),
        QueueAction::Retry { ids } => print(&service.retry(&TargetIds::many(ids)).await?),
        QueueAction::Bounce { ids } => print(&service.bounce(&TargetIds::many(ids)).await?),
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `--config`
/// 2. `FERRY_CONFIG` environment variable
/// 3. ./ferry.config.ron (current working directory)
/// 4. /etc/ferry/ferry.config.ron (system-wide config)
fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var("FERRY_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "FERRY_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./ferry.config.ron"),
        PathBuf::from("/etc/ferry/ferry.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - FERRY_CONFIG environment variable\n{paths_tried}"
    )
}
