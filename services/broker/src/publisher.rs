//! Publisher connections: handshake, then a receive loop feeding the
//! streaming framer and the batcher, pushing sealed batches into the
//! bounded router queue.
//!
//! The queue send suspends when the queue is full — that suspension is the
//! broker's backpressure on fast publishers.  Protocol violations cost the
//! publisher its connection and nothing else.

use crate::batch::{Batcher, MessageBatch};
use crate::config::BatchConfig;
use crate::handshake::{self, HandshakeError};
use rr_protocol::{FrameParser, INTENT_PUBLISHER};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const READ_BUF_LEN: usize = 8192;

/// Drive one publisher connection to completion.
pub async fn run_publisher(
    stream: TcpStream,
    conn_id: u64,
    router: mpsc::Sender<MessageBatch>,
    cfg: BatchConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let name = match handshake::perform(&mut reader, &mut writer, INTENT_PUBLISHER, conn_id).await
    {
        Ok(name) => name,
        Err(HandshakeError::Closed) => {
            debug!(conn_id, "publisher closed during handshake");
            return;
        }
        Err(e) => {
            warn!(conn_id, error = %e, "publisher handshake failed");
            return;
        }
    };
    info!(conn_id, name = %name, "a publisher has connected");

    let mut parser = FrameParser::new(cfg.max_frame_bytes);
    let mut batcher = Batcher::new(cfg.grow_cap_bytes);
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break } else { continue }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    info!(conn_id, name = %name, "Publisher disconnected");
                    // Complete frames already batched still go out; a
                    // partial frame in the parser is discarded.
                    if let Some(sealed) = batcher.flush() {
                        let _ = route(&router, sealed).await;
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(conn_id, name = %name, error = %e, "publisher read failed");
                    break;
                }
            },
        };

        let frames = match parser.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(conn_id, name = %name, error = %e, "publisher protocol violation");
                break;
            }
        };

        for frame in &frames {
            if let Some(sealed) = batcher.push(frame) {
                if route(&router, sealed).await.is_err() {
                    return;
                }
            }
        }

        // A frame that ended this read seals the batch; a read ending
        // mid-frame leaves it open for the frames still in flight.
        if !parser.is_mid_frame() {
            if let Some(sealed) = batcher.flush() {
                if route(&router, sealed).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn route(
    router: &mpsc::Sender<MessageBatch>,
    batch: MessageBatch,
) -> Result<(), mpsc::error::SendError<MessageBatch>> {
    debug!(
        topic = %batch.topic(),
        bytes = batch.len(),
        frames = batch.frame_count(),
        "batch sealed"
    );
    // Suspends while the queue is full; errors only when the router has
    // shut down, which ends this connection too.
    router.send(batch).await
}
