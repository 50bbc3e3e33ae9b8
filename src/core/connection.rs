/// Lazily (re)connecting backend connection
///
/// A `BackendConnection` targets one endpoint and carries the topology
/// generation it was minted under. It does not dial until first used, and any
/// I/O failure marks it disconnected so the next operation dials afresh.
/// There is no retry or backoff here: the caller's deadlines bound each
/// request.
use crate::core::{Endpoint, Signature};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Keepalive probe interval for idle pooled sockets
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

pub struct BackendConnection {
    endpoint: Endpoint,
    generation: Signature,
    stream: Option<TcpStream>,
    connected: bool,
    connect_timeout: Duration,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl BackendConnection {
    /// Create a wrapper for `endpoint`; no connection is made yet
    pub fn new(endpoint: Endpoint, generation: Signature, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            generation,
            stream: None,
            connected: false,
            connect_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Topology generation this wrapper belongs to
    pub fn generation(&self) -> &Signature {
        &self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Close any stale transport and dial the endpoint
    async fn connect(&mut self) -> io::Result<()> {
        self.stream = None;
        self.connected = false;

        let dial = TcpStream::connect((self.endpoint.host(), self.endpoint.port()));
        let stream = match timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Unable to connect to backend {}: {}", self.endpoint, e);
                return Err(e);
            }
            Err(_) => {
                debug!("Timeout connecting to backend {}", self.endpoint);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.endpoint),
                ));
            }
        };

        if let Err(e) = configure_backend_stream(&stream) {
            warn!("Failed to configure backend stream to {}: {}", self.endpoint, e);
        }

        trace!("Connected to backend {}", self.endpoint);
        self.stream = Some(stream);
        self.connected = true;
        Ok(())
    }

    async fn ensure_connected(&mut self) -> io::Result<()> {
        if !self.connected || self.stream.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Read into `buf`, honouring the read deadline. End of stream is
    /// reported as `UnexpectedEof`.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_connected().await?;

        let deadline = self.read_deadline;
        let result = match self.stream.as_mut() {
            Some(stream) => with_deadline(deadline, stream.read(buf)).await,
            None => Err(not_connected()),
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                self.connected = false;
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("backend {} closed the connection", self.endpoint),
                ))
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    /// Write some of `buf`, honouring the write deadline
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_connected().await?;

        let deadline = self.write_deadline;
        let result = match self.stream.as_mut() {
            Some(stream) => with_deadline(deadline, stream.write(buf)).await,
            None => Err(not_connected()),
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                self.connected = false;
                Err(io::Error::new(io::ErrorKind::WriteZero, "backend accepted no bytes"))
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    /// Deadline for subsequent reads; dials first when disconnected
    pub async fn set_read_deadline(&mut self, deadline: Instant) -> io::Result<()> {
        self.ensure_connected().await?;
        self.read_deadline = Some(deadline);
        Ok(())
    }

    /// Deadline for subsequent writes; dials first when disconnected
    pub async fn set_write_deadline(&mut self, deadline: Instant) -> io::Result<()> {
        self.ensure_connected().await?;
        self.write_deadline = Some(deadline);
        Ok(())
    }

    /// Drop the transport without a graceful shutdown. The next operation
    /// dials a fresh connection.
    pub fn reset(&mut self) {
        if self.stream.take().is_some() {
            trace!("Reset connection to backend {}", self.endpoint);
        }
        self.connected = false;
    }

    /// Close the transport if one exists; a no-op otherwise
    pub async fn destroy(&mut self) -> io::Result<()> {
        self.connected = false;
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("endpoint", &self.endpoint)
            .field("generation", &self.generation.to_string())
            .field("connected", &self.connected)
            .finish()
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        },
        None => fut.await,
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "backend connection not established")
}

/// Configure backend stream for low latency and dead peer detection
fn configure_backend_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}
