//! Parley relay daemon entry point.

mod args;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use parley_server::{RelayConfig, RelayEvent, RelayServer};
use parley_storage::{FjallStore, Storage};

use crate::args::{Args, Command};
use crate::config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = match Settings::resolve(&args) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(args, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, settings: Settings) -> anyhow::Result<()> {
    let store = Arc::new(FjallStore::open(Some(&settings.data_dir))?);

    if let Some(command) = args.command {
        return query(command, store.as_ref());
    }
    serve(settings, store).await
}

/// Answers a one-shot directory query and exits.
fn query(command: Command, store: &FjallStore) -> anyhow::Result<()> {
    match command {
        Command::Users => {
            for user in store.users()? {
                match user.last_logout {
                    Some(logout) => println!(
                        "{}\tlast login {}\tlast logout {}",
                        user.name, user.last_login, logout
                    ),
                    None => println!("{}\tlast login {}", user.name, user.last_login),
                }
            }
        }
        Command::History { name } => {
            for record in store.login_history(name.as_deref())? {
                println!(
                    "{}\t{}\t{}:{}",
                    record.when, record.user, record.ip, record.port
                );
            }
        }
        Command::Stats => {
            for stats in store.message_stats()? {
                println!(
                    "{}\tsent {}\treceived {}",
                    stats.user, stats.sent, stats.received
                );
            }
        }
    }
    Ok(())
}

async fn serve(settings: Settings, store: Arc<FjallStore>) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %settings.data_dir.display(),
        "starting parley relay"
    );

    let config = RelayConfig {
        bind: settings.bind,
        max_frame: settings.max_frame,
    };
    let mut server = RelayServer::bind(config, store.clone() as Arc<dyn Storage>).await?;

    if let Some(mut events) = server.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RelayEvent::SessionOpened { user, addr } => {
                        tracing::info!(%user, %addr, "user online");
                    }
                    RelayEvent::SessionClosed { user } => {
                        tracing::info!(%user, "user offline");
                    }
                }
            }
        });
    }

    let cancel = server.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    server.run().await?;

    // The journal may hold writes from the final sessions.
    store.sync()?;
    Ok(())
}
