//! Newline-delimited TCP transport.
//!
//! Every line a client sends is one request. Lines from one connection are
//! dispatched one after another on the blocking pool, and replies are
//! written back in the order they were sent, one per line. A line longer
//! than the configured limit is answered with a failure and the connection
//! is closed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use modhost_host::ModuleRegistry;
use modhost_types::{Connection, ConnectionError, ConnectionId, Response, UNSPECIFIED_ID};

/// Longest request line `serve` accepts.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// The sending side of one client connection. Replies are queued to a
/// writer task, so `send` never blocks the dispatching thread.
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
}

impl TcpConnection {
    pub fn new(peer: SocketAddr, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            outbound,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &str) -> Result<(), ConnectionError> {
        self.outbound
            .send(message.to_string())
            .map_err(|_| ConnectionError::Closed(self.id))
    }
}

/// Accepts clients until the listener fails.
pub async fn serve(listener: TcpListener, registry: Arc<ModuleRegistry>) -> io::Result<()> {
    serve_with_limit(listener, registry, DEFAULT_MAX_LINE_BYTES).await
}

/// [`serve`] with an explicit request line limit.
pub async fn serve_with_limit(
    listener: TcpListener,
    registry: Arc<ModuleRegistry>,
    max_line_bytes: usize,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, max_line_bytes, "Transport listening");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, registry, max_line_bytes).await {
                debug!(%peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ModuleRegistry>,
    max_line_bytes: usize,
) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection: Arc<dyn Connection> = Arc::new(TcpConnection::new(peer, tx));
    let id = connection.id();
    debug!(%peer, connection = %id, "Client connected");

    let writer = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            write_half.write_all(line.as_bytes()).await?;
        }
        write_half.shutdown().await
    });

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line_bytes));
    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(connection = %id, limit = max_line_bytes, "Request line too long, closing connection");
                reject_oversized(connection.as_ref(), max_line_bytes);
                break;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let registry = Arc::clone(&registry);
        let connection = Arc::clone(&connection);
        let outcome = tokio::task::spawn_blocking(move || registry.dispatch(connection, &line)).await;
        match outcome {
            Ok(outcome) => debug!(connection = %id, ?outcome, "Dispatched"),
            Err(e) => warn!(connection = %id, error = %e, "Dispatch task failed"),
        }
    }

    // The writer drains once the last sender is gone.
    drop(connection);
    match writer.await {
        Ok(result) => result?,
        Err(e) => warn!(connection = %id, error = %e, "Writer task failed"),
    }
    debug!(%peer, connection = %id, "Client disconnected");
    Ok(())
}

fn reject_oversized(connection: &dyn Connection, max_line_bytes: usize) {
    let reply = Response::error(format!("Malformed request: line exceeds {max_line_bytes} bytes"))
        .with_id(UNSPECIFIED_ID);
    let sent = reply
        .to_json()
        .map_err(|e| e.to_string())
        .and_then(|text| connection.send(&text).map_err(|e| e.to_string()));
    if let Err(e) = sent {
        debug!(connection = %connection.id(), error = %e, "Could not report oversized line");
    }
}
