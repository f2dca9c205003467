//! Commander connections: the control plane.
//!
//! A commander sends CR-terminated lines of `name|op|value|timeout_ms`
//! records (several records may share one line, CR-separated).  Subscribe
//! records land on every connected subscriber with that name, or are
//! latched in the server context for one that has not connected yet.  The
//! server acks each consumed line with a CR.

use crate::context::ServerContext;
use crate::handshake::{self, HandshakeError};
use crate::registry::SubscriberRegistry;
use rr_protocol::{CommandRecord, INTENT_COMMANDER, OP_SUBSCRIBE, TERMINATOR, parse_record};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const READ_BUF_LEN: usize = 256;

/// Drive one commander connection to completion.
pub async fn run_commander(
    stream: TcpStream,
    conn_id: u64,
    registry: Arc<SubscriberRegistry>,
    ctx: Arc<ServerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let name = match handshake::perform(&mut reader, &mut writer, INTENT_COMMANDER, conn_id).await
    {
        Ok(name) => name,
        Err(HandshakeError::Closed) => {
            debug!(conn_id, "commander closed during handshake");
            return;
        }
        Err(e) => {
            warn!(conn_id, error = %e, "commander handshake failed");
            return;
        }
    };
    info!(conn_id, name = %name, "a commander has connected");

    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut line: Vec<u8> = Vec::new();

    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    info!(conn_id, name = %name, "Commander disconnected");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(conn_id, name = %name, error = %e, "commander read failed");
                    return;
                }
            },
        };

        line.extend_from_slice(&buf[..n]);
        if line.last() != Some(&TERMINATOR) {
            continue;
        }
        line.pop();

        for record in line.split(|&b| b == TERMINATOR).filter(|r| !r.is_empty()) {
            let Ok(record) = std::str::from_utf8(record) else {
                warn!(conn_id, name = %name, "command record is not valid UTF-8");
                return;
            };
            match parse_record(record) {
                Ok(rec) => apply_record(&rec, &registry, &ctx, conn_id),
                Err(e) => {
                    warn!(conn_id, name = %name, record, error = %e, "invalid command");
                    return;
                }
            }
        }
        line.clear();

        if let Err(e) = writer.write_all(&[TERMINATOR]).await {
            warn!(conn_id, name = %name, error = %e, "commander ack failed");
            return;
        }
    }
}

fn apply_record(
    rec: &CommandRecord,
    registry: &SubscriberRegistry,
    ctx: &ServerContext,
    conn_id: u64,
) {
    if rec.op != OP_SUBSCRIBE {
        warn!(conn_id, op = %rec.op, "ignoring unknown command op");
        return;
    }

    let patterns = rec.patterns();
    if !registry.subscribe_or_latch(ctx, &rec.name, rec.timeout_ms, &patterns) {
        // The subscriber probably just hasn't connected yet.
        debug!(subscriber = %rec.name, ?patterns, "latched pending subscription");
    }
}
