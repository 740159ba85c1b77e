mod commands;
mod display;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{intents_for, parse_action, Action, HELP};
use preamp_bridge_client::SyncRuntime;
use preamp_core::ClientConfig;
use preamp_sync::EngineView;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Terminal remote for the preamp bridge
#[derive(Parser, Debug)]
#[command(name = "preamp", version, about)]
struct Args {
    /// Bridge host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print views as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,preamp=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!("Connecting to bridge at {}", config.host);

    let handle = SyncRuntime::connect(&config)?.spawn();

    let json = args.json;
    let mut updates = handle.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_line = String::new();
        while updates.changed().await.is_ok() {
            let view = updates.borrow_and_update().clone();
            let line = if json {
                serde_json::to_string(&view).unwrap_or_default()
            } else {
                status_line(&view)
            };
            if line != last_line {
                println!("{}", line);
                last_line = line;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            break;
        };

        let action = match parse_action(&line) {
            Ok(Some(action)) => action,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match action {
            Action::Quit => break,
            Action::Help => println!("{}", HELP),
            Action::View => print_view(&handle.view(), json)?,
            action => {
                for intent in intents_for(action, &handle.view()) {
                    handle.send(intent)?;
                }
            }
        }
    }

    tracing::info!("Shutting down");
    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

/// `--config`, else `<config dir>/preamp/config.toml` if present, else defaults;
/// `--host` wins over the file
fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config {}", path.display());
                ClientConfig::load(&path)?
            }
            _ => ClientConfig::default(),
        },
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("preamp").join("config.toml"))
}

fn status_line(view: &EngineView) -> String {
    let mut line = format!("[{}]", view.status);
    if let Some(notice) = &view.notice {
        line.push(' ');
        line.push_str(notice);
    }
    line
}

fn print_view(view: &EngineView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
    } else {
        print!("{}", display::render_view(view));
    }
    Ok(())
}
