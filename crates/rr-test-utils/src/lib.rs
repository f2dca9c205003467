// rr-test-utils: Wire-protocol clients for exercising a live broker.
//
// Each client speaks the real byte protocol over a real socket: the 2-byte
// intent, the CR-terminated name, the CR ack, then frames or command
// lines.  Integration suites in the broker service drive end-to-end
// scenarios with these.

use rr_protocol::{Frame, FrameParser, INTENT_COMMANDER, INTENT_PUBLISHER, INTENT_SUBSCRIBER, TERMINATOR};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default patience for reads in test clients.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_with_intent(
    addr: SocketAddr,
    intent: [u8; 2],
    name: &str,
) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&intent).await?;
    stream.write_all(name.as_bytes()).await?;
    stream.write_all(&[TERMINATOR]).await?;

    let mut ack = [0u8; 1];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut ack))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no handshake ack"))??;
    if ack[0] != TERMINATOR {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected ack byte {:#04x}", ack[0]),
        ));
    }
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// A publisher-side client: handshakes as `P\r` and pushes frames.
pub struct TestPublisher {
    stream: TcpStream,
}

impl TestPublisher {
    pub async fn connect(addr: SocketAddr, name: &str) -> io::Result<Self> {
        let stream = connect_with_intent(addr, INTENT_PUBLISHER, name).await?;
        Ok(TestPublisher { stream })
    }

    /// Publish one frame as a single write.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> io::Result<()> {
        let wire = Frame::new(topic, payload.to_vec()).encode();
        self.stream.write_all(&wire).await
    }

    /// Write raw bytes — lets tests place read boundaries anywhere,
    /// including mid-frame.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Close the write side so the broker sees EOF.
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// A subscriber-side client: handshakes as `S\r` and collects delivered
/// frames through the same streaming parser the wire contract defines.
pub struct TestSubscriber {
    stream: TcpStream,
    parser: FrameParser,
    ready: Vec<Frame>,
}

impl TestSubscriber {
    pub async fn connect(addr: SocketAddr, name: &str) -> io::Result<Self> {
        let stream = connect_with_intent(addr, INTENT_SUBSCRIBER, name).await?;
        Ok(TestSubscriber {
            stream,
            parser: FrameParser::new(64 * 1024 * 1024),
            ready: Vec::new(),
        })
    }

    /// Receive the next `n` frames, failing after [`RECV_TIMEOUT`].
    pub async fn recv_frames(&mut self, n: usize) -> io::Result<Vec<Frame>> {
        let mut buf = vec![0u8; 8192];
        while self.ready.len() < n {
            let read = timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("got {} of {n} expected frames", self.ready.len()),
                    )
                })??;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "broker closed the subscriber connection",
                ));
            }
            let frames = self
                .parser
                .feed(&buf[..read])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            self.ready.extend(frames);
        }
        Ok(self.ready.drain(..n).collect())
    }

    pub async fn recv_frame(&mut self) -> io::Result<Frame> {
        Ok(self.recv_frames(1).await?.remove(0))
    }

    /// Assert that nothing arrives for `quiet` — the topic-isolation and
    /// expiry checks.  Errors if any byte shows up.
    pub async fn expect_silence(&mut self, quiet: Duration) -> io::Result<()> {
        if !self.ready.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "parsed frames already waiting",
            ));
        }
        let mut buf = [0u8; 1];
        match timeout(quiet, self.stream.read(&mut buf)).await {
            Err(_) => Ok(()), // silence — as expected
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "broker closed the subscriber connection",
            )),
            Ok(Ok(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected delivery",
            )),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Drop the connection abruptly (no shutdown), as a crashing client
    /// would.
    pub fn abort(self) {
        drop(self.stream);
    }
}

// ---------------------------------------------------------------------------
// Commander
// ---------------------------------------------------------------------------

/// A control-plane client: handshakes as `C\r` and sends command lines.
pub struct TestCommander {
    stream: TcpStream,
}

impl TestCommander {
    pub async fn connect(addr: SocketAddr, name: &str) -> io::Result<Self> {
        let stream = connect_with_intent(addr, INTENT_COMMANDER, name).await?;
        Ok(TestCommander { stream })
    }

    /// Issue a subscribe command and wait for the line ack.
    pub async fn subscribe(
        &mut self,
        subscriber: &str,
        patterns: &str,
        timeout_ms: u64,
    ) -> io::Result<()> {
        self.send_line(&format!("{subscriber}|subscribe|{patterns}|{timeout_ms}"))
            .await?;
        self.recv_ack().await
    }

    /// Send one CR-terminated line without waiting for the ack.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(&[TERMINATOR]).await
    }

    /// Wait for the broker's CR ack.
    pub async fn recv_ack(&mut self) -> io::Result<()> {
        let mut ack = [0u8; 1];
        timeout(RECV_TIMEOUT, self.stream.read_exact(&mut ack))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no command ack"))??;
        if ack[0] != TERMINATOR {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected ack byte {:#04x}", ack[0]),
            ));
        }
        Ok(())
    }

    /// True once the broker has dropped this connection (e.g. after a
    /// malformed command) — the next read sees EOF.
    pub async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            timeout(RECV_TIMEOUT, self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}
