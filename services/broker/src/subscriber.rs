//! Subscriber connections: handshake, registration (which atomically picks
//! up pending subscriptions), then the send pipeline.
//!
//! The pipeline is the registry's per-subscriber queue drained in order by
//! this task: the batch being written is the in-flight item, the queued
//! rest is the ordered pending list, and `write_all` carries the cursor
//! across partial writes.  A slow peer backs the queue up without touching
//! any other subscriber.

use crate::context::ServerContext;
use crate::handshake::{self, HandshakeError};
use crate::registry::SubscriberRegistry;
use rr_protocol::INTENT_SUBSCRIBER;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Drive one subscriber connection to completion.
pub async fn run_subscriber(
    stream: TcpStream,
    conn_id: u64,
    registry: Arc<SubscriberRegistry>,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let name = match handshake::perform(&mut reader, &mut writer, INTENT_SUBSCRIBER, conn_id).await
    {
        Ok(name) => name,
        Err(HandshakeError::Closed) => {
            debug!(conn_id, "subscriber closed during handshake");
            return;
        }
        Err(e) => {
            warn!(conn_id, error = %e, "subscriber handshake failed");
            return;
        }
    };
    info!(conn_id, name = %name, "a subscriber has connected");

    let mut registration = registry.register(&name, conn_id, &ctx);
    let disconnected = Arc::clone(&registration.disconnected);

    // Subscribers send nothing after the handshake; reads only watch for
    // EOF so an abandoned peer is noticed even when no traffic flows.
    let mut eof_buf = [0u8; 64];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => if *shutdown.borrow() { break },
            batch = registration.batches.recv() => {
                let Some(batch) = batch else { break };
                if let Err(e) = writer.write_all(batch.bytes()).await {
                    warn!(conn_id, name = %name, error = %e, "subscriber write failed");
                    break;
                }
                debug!(
                    conn_id,
                    name = %name,
                    topic = %batch.topic(),
                    bytes = batch.len(),
                    "batch delivered"
                );
            }
            read = reader.read(&mut eof_buf) => match read {
                Ok(0) => {
                    info!(conn_id, name = %name, "Subscriber disconnected");
                    break;
                }
                Ok(n) => {
                    debug!(conn_id, name = %name, n, "ignoring bytes from subscriber");
                }
                Err(e) => {
                    warn!(conn_id, name = %name, error = %e, "subscriber read failed");
                    break;
                }
            },
        }
    }

    // Gate further pushes; the drain task's sweep removes the entry.
    disconnected.store(true, Ordering::Relaxed);
}
