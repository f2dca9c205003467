// broker: Library entry point.
// Exposes modules for integration testing.

pub mod batch;
pub mod command;
pub mod config;
pub mod context;
pub mod handshake;
mod listener;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod subscriber;

use crate::config::BrokerConfig;
use crate::context::ServerContext;
use crate::registry::SubscriberRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Errors that keep the broker from starting.  All of them are fatal to
/// the process (exit code 1).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        source: std::io::Error,
    },
}

/// Lets `main` (or a test) stop a running broker from outside.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

/// A bound-but-not-yet-running broker.
///
/// `bind` claims the three listener ports (use port 0 in tests to let the
/// OS choose); `run` consumes the broker and serves until shutdown.
pub struct Broker {
    cfg: BrokerConfig,
    subscriber_listener: TcpListener,
    publisher_listener: TcpListener,
    command_listener: TcpListener,
    stop: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Bind all three listener endpoints.
    pub async fn bind(cfg: BrokerConfig) -> Result<Self, BrokerError> {
        let bind = |port: u16| format!("{}:{}", cfg.listeners.bind_addr, port);

        let subscriber_listener = bind_listener("subscriber", &bind(cfg.listeners.subscriber_port)).await?;
        let publisher_listener = bind_listener("publisher", &bind(cfg.listeners.publisher_port)).await?;
        let command_listener = bind_listener("command", &bind(cfg.listeners.command_port)).await?;

        let (stop, _) = watch::channel(false);
        Ok(Broker {
            cfg,
            subscriber_listener,
            publisher_listener,
            command_listener,
            stop: Arc::new(stop),
        })
    }

    /// The bound subscriber endpoint (useful when port 0 was configured).
    pub fn subscriber_addr(&self) -> SocketAddr {
        self.subscriber_listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub fn publisher_addr(&self) -> SocketAddr {
        self.publisher_listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.command_listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Serve until the shutdown handle fires.  Connection tasks observe the
    /// same flag and exit at their next wait boundary; queued batches are
    /// discarded, not flushed.
    pub async fn run(self) {
        let registry = Arc::new(SubscriberRegistry::new());
        let ctx = Arc::new(ServerContext::new());
        let (router_tx, router_rx) = mpsc::channel(self.cfg.router.queue_capacity);
        let sweep_interval = Duration::from_millis(self.cfg.router.sweep_interval_ms);

        let router = router::run_router(
            router_rx,
            Arc::clone(&registry),
            sweep_interval,
            self.stop.subscribe(),
        );

        let subscribers = {
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&self.stop);
            listener::run_listener(
                self.subscriber_listener,
                "subscriber",
                self.stop.subscribe(),
                move |stream, conn_id| {
                    tokio::spawn(subscriber::run_subscriber(
                        stream,
                        conn_id,
                        Arc::clone(&registry),
                        Arc::clone(&ctx),
                        stop.subscribe(),
                    ));
                },
            )
        };

        let publishers = {
            let batch_cfg = self.cfg.batch.clone();
            let stop = Arc::clone(&self.stop);
            listener::run_listener(
                self.publisher_listener,
                "publisher",
                self.stop.subscribe(),
                move |stream, conn_id| {
                    tokio::spawn(publisher::run_publisher(
                        stream,
                        conn_id,
                        router_tx.clone(),
                        batch_cfg.clone(),
                        stop.subscribe(),
                    ));
                },
            )
        };

        let commanders = {
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            let stop = Arc::clone(&self.stop);
            listener::run_listener(
                self.command_listener,
                "command",
                self.stop.subscribe(),
                move |stream, conn_id| {
                    tokio::spawn(command::run_commander(
                        stream,
                        conn_id,
                        Arc::clone(&registry),
                        Arc::clone(&ctx),
                        stop.subscribe(),
                    ));
                },
            )
        };

        tokio::join!(router, subscribers, publishers, commanders);
        info!("broker stopped");
    }
}

async fn bind_listener(role: &'static str, addr: &str) -> Result<TcpListener, BrokerError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| BrokerError::Bind {
        role,
        addr: addr.to_owned(),
        source: e,
    })?;
    info!(
        role,
        port = listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
            .port(),
        "listener started"
    );
    Ok(listener)
}
