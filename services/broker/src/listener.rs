//! The accept loop shared by the three listener endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

// Connection ids are process-wide, so logs from the three listeners never
// collide.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Accept connections until shutdown, handing each socket and its fresh
/// connection id to `spawn_handler` (the role-specific factory).
pub(crate) async fn run_listener<F>(
    listener: TcpListener,
    role: &'static str,
    mut shutdown: watch::Receiver<bool>,
    mut spawn_handler: F,
) where
    F: FnMut(TcpStream, u64),
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_id = next_conn_id();
                    debug!(role, conn_id, %peer, "accepted connection");
                    spawn_handler(stream, conn_id);
                }
                Err(e) => {
                    warn!(role, error = %e, "accept error");
                }
            },
        }
    }
}
