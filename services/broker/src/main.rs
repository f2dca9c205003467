// broker: Topic-prefix publish/subscribe broker over TCP.
//
// Three listeners share one routing fabric: publishers (5876) push framed
// messages, subscribers (5875) receive every frame whose topic their
// patterns prefix-match, and commanders (5877) register subscriptions on
// subscribers' behalf.

use broker::Broker;
use broker::config::{self, BrokerConfig};
use clap::{Arg, Command};
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "broker starting");

    let matches = Command::new("rusty-relay broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Topic-prefix publish/subscribe broker")
        .arg(
            Arg::new("config")
                .help("Path to the broker TOML config; defaults apply without one")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let cfg = match matches.get_one::<PathBuf>("config") {
        Some(path) => match config::load_config_from_path(path) {
            Ok(cfg) => {
                info!(config = %path.display(), "config loaded");
                cfg
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => BrokerConfig::default(),
    };

    let broker = match Broker::bind(cfg).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let handle = broker.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        handle.shutdown();
    });

    broker.run().await;
}

/// Resolves on SIGINT (ctrl-c) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
