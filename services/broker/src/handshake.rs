//! The connect handshake shared by all three roles.
//!
//! 1. intent — exactly 2 bytes (`P\r`, `S\r`, `C\r`).  The role is fixed
//!    by the port the client connected to; the token is a sanity check and
//!    a mismatch is logged, not fatal.
//! 2. name — bytes up to the first CR, at most 255 of them.
//! 3. ack — the server sends one CR back.
//!
//! Reads go through the connection's `BufReader` so that bytes pipelined
//! after the name's CR (a publisher's first frame, say) stay buffered for
//! the role loop instead of being lost.

use rr_protocol::{INTENT_LEN, MAX_NAME_BYTES, TERMINATOR};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::warn;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer closed during handshake")]
    Closed,
    #[error("client name exceeds {MAX_NAME_BYTES} bytes")]
    NameTooLong,
    #[error("client name is not valid UTF-8")]
    NameNotUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Drive the handshake to completion and return the client name.
pub async fn perform(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    expected_intent: [u8; INTENT_LEN],
    conn_id: u64,
) -> Result<String, HandshakeError> {
    // Intent: read exactly 2 bytes.
    let mut intent = [0u8; INTENT_LEN];
    reader.read_exact(&mut intent).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HandshakeError::Closed
        } else {
            HandshakeError::Io(e)
        }
    })?;
    if intent != expected_intent {
        warn!(
            conn_id,
            got = ?String::from_utf8_lossy(&intent),
            expected = ?String::from_utf8_lossy(&expected_intent),
            "unexpected intent token, continuing"
        );
    }

    // Name: up to the first CR, capped.
    let mut raw = Vec::new();
    let mut limited = (&mut *reader).take((MAX_NAME_BYTES + 1) as u64);
    limited.read_until(TERMINATOR, &mut raw).await?;

    if raw.last() == Some(&TERMINATOR) {
        raw.pop();
    } else if raw.len() > MAX_NAME_BYTES {
        return Err(HandshakeError::NameTooLong);
    } else {
        // EOF before the terminator arrived.
        return Err(HandshakeError::Closed);
    }
    let name = String::from_utf8(raw).map_err(|_| HandshakeError::NameNotUtf8)?;

    // Ack.
    writer.write_all(&[TERMINATOR]).await?;

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rr_protocol::INTENT_SUBSCRIBER;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn handshake_extracts_name_and_acks() {
        let (mut client, server) = pair().await;
        let (rd, mut wr) = server.into_split();
        let mut rd = BufReader::new(rd);

        let server_side =
            tokio::spawn(async move { perform(&mut rd, &mut wr, INTENT_SUBSCRIBER, 1).await });

        client.write_all(b"S\ralice\r").await.unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [TERMINATOR]);

        let name = server_side.await.unwrap().unwrap();
        assert_eq!(name, "alice");
    }

    #[tokio::test]
    async fn bytes_after_the_name_are_not_consumed() {
        let (mut client, server) = pair().await;
        let (rd, mut wr) = server.into_split();
        let mut rd = BufReader::new(rd);

        // Name and first frame pipelined in a single segment.
        client.write_all(b"P\rpub1\rtopic|2|AB").await.unwrap();

        let name = perform(&mut rd, &mut wr, *b"P\r", 1).await.unwrap();
        assert_eq!(name, "pub1");

        let mut rest = vec![0u8; 10];
        rd.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, b"topic|2|AB");
    }

    #[tokio::test]
    async fn early_close_is_reported() {
        let (client, server) = pair().await;
        let (rd, mut wr) = server.into_split();
        let mut rd = BufReader::new(rd);

        drop(client);
        let err = perform(&mut rd, &mut wr, INTENT_SUBSCRIBER, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Closed));
    }

    #[tokio::test]
    async fn unterminated_name_past_the_cap_is_rejected() {
        let (mut client, server) = pair().await;
        let (rd, mut wr) = server.into_split();
        let mut rd = BufReader::new(rd);

        let server_side =
            tokio::spawn(async move { perform(&mut rd, &mut wr, INTENT_SUBSCRIBER, 1).await });

        let long = vec![b'x'; MAX_NAME_BYTES + 10];
        client.write_all(b"S\r").await.unwrap();
        client.write_all(&long).await.unwrap();

        let err = server_side.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::NameTooLong));
    }

    #[tokio::test]
    async fn mismatched_intent_is_tolerated() {
        let (mut client, server) = pair().await;
        let (rd, mut wr) = server.into_split();
        let mut rd = BufReader::new(rd);

        let server_side =
            tokio::spawn(async move { perform(&mut rd, &mut wr, INTENT_SUBSCRIBER, 1).await });

        client.write_all(b"P\rbob\r").await.unwrap();
        let name = server_side.await.unwrap().unwrap();
        assert_eq!(name, "bob");
    }
}
