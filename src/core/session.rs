/// Per-client session loop
///
/// A session reads one request at a time from its client, decides whether a
/// replica may answer it, and either serves a fresh cached reply or relays
/// the request to a pooled backend connection. Reply bytes are forwarded to
/// the client as they arrive while the reply scanner tracks when the reply
/// is complete.
use crate::core::{BackendConnection, ResponseCache, Role};
use crate::discovery::Topology;
use crate::error::{ErrorSeverity, ProxyError, ProxyResult, RedisError};
use crate::redis::{classify, request_len, scan, ReplyProgress, Request};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest request a client may send, matching Redis' own query buffer limit
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 512 * 1024 * 1024;

/// Deadlines applied to each I/O step of a round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Waiting for a pooled backend connection
    pub borrow: Duration,
    /// Per write attempt to the backend
    pub backend_write: Duration,
    /// Per read from the backend
    pub backend_read: Duration,
    /// Per chunk written to the client
    pub client_write: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            borrow: Duration::from_secs(10),
            backend_write: Duration::from_secs(10),
            backend_read: Duration::from_secs(5),
            client_write: Duration::from_secs(5),
        }
    }
}

pub struct Session<S> {
    client: S,
    peer: String,
    topology: Arc<Topology>,
    cache: Option<Arc<ResponseCache>>,
    timeouts: SessionTimeouts,
    max_request_bytes: usize,
    pending: BytesMut,
    scratch: Vec<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        client: S,
        topology: Arc<Topology>,
        cache: Option<Arc<ResponseCache>>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            client,
            peer: "client".to_string(),
            topology,
            cache,
            timeouts,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            pending: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            scratch: vec![0u8; DEFAULT_BUFFER_SIZE],
        }
    }

    /// Name used for this session in log lines
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Size of each read from the client or the backend
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        self.pending = BytesMut::with_capacity(size);
        self.scratch = vec![0u8; size];
        self
    }

    /// Largest request accepted before the session is ended
    pub fn with_max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Serve requests until the client disconnects or an error ends the
    /// session. The client connection is shut down either way.
    pub async fn run(mut self) -> ProxyResult<()> {
        debug!("Session {} opened", self.peer);
        let result = self.serve().await;

        match &result {
            Ok(()) => debug!("Session {} closed by client", self.peer),
            Err(e) if e.is_recoverable() => info!("Session {} closed: {}", self.peer, e),
            Err(e) => match e.severity() {
                ErrorSeverity::Critical => error!("Session {} failed: {}", self.peer, e),
                _ => warn!("Session {} aborted: {}", self.peer, e),
            },
        }

        let _ = self.client.shutdown().await;
        result
    }

    async fn serve(&mut self) -> ProxyResult<()> {
        while let Some(frame) = self.next_request().await? {
            self.handle(frame).await?;
        }
        Ok(())
    }

    /// Next complete request from the client, or `None` once it hung up
    async fn next_request(&mut self) -> ProxyResult<Option<Bytes>> {
        loop {
            let blank = self
                .pending
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
            self.pending.advance(blank);

            match request_len(&self.pending)? {
                Some(len) if len <= self.max_request_bytes => {
                    return Ok(Some(self.pending.split_to(len).freeze()));
                }
                Some(_) => return Err(self.oversized()),
                None if self.pending.len() >= self.max_request_bytes => {
                    return Err(self.oversized());
                }
                None => {}
            }

            self.pending.reserve(self.scratch.len());
            if self.client.read_buf(&mut self.pending).await? == 0 {
                if !self.pending.is_empty() {
                    trace!(
                        "Session {} dropped {} bytes of an incomplete request",
                        self.peer,
                        self.pending.len()
                    );
                }
                return Ok(None);
            }
        }
    }

    fn oversized(&self) -> ProxyError {
        ProxyError::Redis(RedisError::RequestTooLarge {
            limit: self.max_request_bytes,
        })
    }

    async fn handle(&mut self, frame: Bytes) -> ProxyResult<()> {
        let request = Request::parse(&frame)?;
        let role = classify(&request, self.topology.has_replicas().await);
        trace!("Session {}: {} -> {}", self.peer, request.verb(), role);

        let cache = match role {
            Role::Replica => self.cache.clone(),
            Role::Primary => None,
        };

        if let Some(cache) = &cache {
            if let Some(reply) = cache.get(&frame).await {
                trace!("Session {}: {} served from cache", self.peer, request.verb());
                return self.write_cached(&reply).await;
            }
        }

        let reply = self.roundtrip(role, &frame).await?;

        if let Some(cache) = cache {
            cache.put(frame, reply).await;
        }
        Ok(())
    }

    /// Relay one request through a borrowed backend connection. The
    /// connection goes back to its pool whatever happens; after a failed
    /// relay its transport is reset first so no leftover reply bytes reach
    /// the next borrower.
    async fn roundtrip(&mut self, role: Role, frame: &[u8]) -> ProxyResult<Bytes> {
        let mut conn = match timeout(self.timeouts.borrow, self.topology.borrow(role)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(ProxyError::timeout(format!("borrow {} connection", role))),
        };
        let result = self.relay(&mut conn, frame).await;
        if result.is_err() {
            conn.reset();
        }
        self.topology.give_back(role, conn).await;
        result
    }

    async fn relay(&mut self, conn: &mut BackendConnection, frame: &[u8]) -> ProxyResult<Bytes> {
        let mut written = 0;
        while written < frame.len() {
            conn.set_write_deadline(Instant::now() + self.timeouts.backend_write)
                .await?;
            written += conn.write(&frame[written..]).await?;
        }

        let mut reply = BytesMut::new();
        let mut progress = ReplyProgress::new();
        loop {
            conn.set_read_deadline(Instant::now() + self.timeouts.backend_read)
                .await?;
            let n = conn.read(&mut self.scratch).await?;
            let chunk = &self.scratch[..n];

            progress = scan(progress, chunk)?;
            write_chunk(&mut self.client, chunk, self.timeouts.client_write).await?;
            reply.extend_from_slice(chunk);

            if progress.is_complete() {
                return Ok(reply.freeze());
            }
            trace!(
                "Partial reply from {}: {} bytes so far, {} values outstanding",
                conn.endpoint(),
                reply.len(),
                progress.outstanding()
            );
        }
    }

    async fn write_cached(&mut self, reply: &[u8]) -> ProxyResult<()> {
        for chunk in reply.chunks(self.scratch.len()) {
            write_chunk(&mut self.client, chunk, self.timeouts.client_write).await?;
        }
        Ok(())
    }
}

async fn write_chunk<W>(client: &mut W, chunk: &[u8], limit: Duration) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        client.write_all(chunk).await?;
        client.flush().await
    };
    match timeout(limit, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProxyError::timeout("write to client")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Endpoint;
    use crate::error::RedisError;
    use std::io::Cursor;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::net::TcpListener;

    const GET_FOO: &[u8] = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
    const SET_FOO: &[u8] = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";

    struct Backend {
        addr: SocketAddr,
        accepted: Arc<AtomicUsize>,
        served: Arc<AtomicUsize>,
    }

    impl Backend {
        fn endpoint(&self) -> Endpoint {
            Endpoint::new(self.addr.ip().to_string(), self.addr.port())
        }
    }

    /// Answer every request with `chunks`, pausing `gap` between them
    async fn spawn_backend(chunks: Vec<Vec<u8>>, gap: Duration) -> Backend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));

        let (accepted_count, served_count) = (Arc::clone(&accepted), Arc::clone(&served));
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                accepted_count.fetch_add(1, Ordering::SeqCst);
                let chunks = chunks.clone();
                let served = Arc::clone(&served_count);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        served.fetch_add(1, Ordering::SeqCst);
                        for (i, chunk) in chunks.iter().enumerate() {
                            if i > 0 {
                                tokio::time::sleep(gap).await;
                            }
                            if stream.write_all(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Backend {
            addr,
            accepted,
            served,
        }
    }

    async fn topology(primary: &Backend, replicas: &[&Backend]) -> Arc<Topology> {
        let topology = Arc::new(Topology::new(2, Duration::from_secs(1)));
        topology.install_primary(primary.endpoint()).await;
        topology
            .install_replicas(replicas.iter().map(|b| b.endpoint()).collect())
            .await;
        topology
    }

    /// Client whose input is fixed up front and whose writes are recorded
    /// call by call
    struct RecordingClient {
        input: Cursor<Vec<u8>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingClient {
        fn new(input: &[u8]) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let client = Self {
                input: Cursor::new(input.to_vec()),
                writes: Arc::clone(&writes),
            };
            (client, writes)
        }
    }

    impl AsyncRead for RecordingClient {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for RecordingClient {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_repeated_read_is_served_from_cache() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let replica = spawn_backend(vec![b"$3\r\nbar\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[&replica]).await;
        let cache = Arc::new(ResponseCache::default());

        let client = tokio_test::io::Builder::new()
            .read(GET_FOO)
            .write(b"$3\r\nbar\r\n")
            .read(GET_FOO)
            .write(b"$3\r\nbar\r\n")
            .build();

        Session::new(client, topology, Some(Arc::clone(&cache)), SessionTimeouts::default())
            .run()
            .await
            .unwrap();

        assert_eq!(replica.served.load(Ordering::SeqCst), 1);
        assert_eq!(replica.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(primary.accepted.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(GET_FOO).await.unwrap(), &b"$3\r\nbar\r\n"[..]);
    }

    #[tokio::test]
    async fn test_large_bulk_is_forwarded_chunk_by_chunk() {
        let payload = vec![b'x'; 10_000];
        let mut first = b"$10000\r\n".to_vec();
        first.extend_from_slice(&payload[..3000]);
        let second = payload[3000..7000].to_vec();
        let mut third = payload[7000..].to_vec();
        third.extend_from_slice(b"\r\n");

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        expected.extend_from_slice(&third);

        let primary = spawn_backend(vec![first, second, third], Duration::from_millis(50)).await;
        let topology = topology(&primary, &[]).await;

        let (client, writes) = RecordingClient::new(GET_FOO);
        Session::new(client, topology, None, SessionTimeouts::default())
            .run()
            .await
            .unwrap();

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes.concat(), expected);
        assert_eq!(primary.served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reads_go_to_primary_without_replicas() {
        let primary = spawn_backend(vec![b"$7\r\nprimary\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;
        let cache = Arc::new(ResponseCache::default());

        let client = tokio_test::io::Builder::new()
            .read(GET_FOO)
            .write(b"$7\r\nprimary\r\n")
            .read(GET_FOO)
            .write(b"$7\r\nprimary\r\n")
            .build();

        Session::new(client, topology, Some(Arc::clone(&cache)), SessionTimeouts::default())
            .run()
            .await
            .unwrap();

        assert_eq!(primary.served.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_reach_primary_and_are_never_cached() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let replica = spawn_backend(vec![b"$3\r\nbar\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[&replica]).await;
        let cache = Arc::new(ResponseCache::default());

        let client = tokio_test::io::Builder::new()
            .read(SET_FOO)
            .write(b"+OK\r\n")
            .read(SET_FOO)
            .write(b"+OK\r\n")
            .read(GET_FOO)
            .write(b"$3\r\nbar\r\n")
            .build();

        Session::new(client, topology, Some(Arc::clone(&cache)), SessionTimeouts::default())
            .run()
            .await
            .unwrap();

        assert_eq!(primary.served.load(Ordering::SeqCst), 2);
        assert_eq!(replica.served.load(Ordering::SeqCst), 1);
        assert!(cache.get(SET_FOO).await.is_none());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_pipelined_requests_are_answered_in_order() {
        let primary = spawn_backend(vec![b"+PONG\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let (client, writes) = RecordingClient::new(b"PING\r\n*1\r\n$4\r\nPING\r\n");
        Session::new(client, topology, None, SessionTimeouts::default())
            .run()
            .await
            .unwrap();

        assert_eq!(writes.lock().unwrap().concat(), b"+PONG\r\n+PONG\r\n".to_vec());
        assert_eq!(primary.served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_request_ends_session() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let (client, writes) = RecordingClient::new(b"*1\r\n:5\r\n");
        let result = Session::new(client, topology, None, SessionTimeouts::default())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(ProxyError::Redis(RedisError::ProtocolError { .. }))
        ));
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(primary.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unparseable_reply_resets_backend_connection() {
        let primary = spawn_backend(vec![b"?garbage\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let (client, _writes) = RecordingClient::new(SET_FOO);
        let result = Session::new(client, Arc::clone(&topology), None, SessionTimeouts::default())
            .run()
            .await;
        assert!(matches!(result, Err(ProxyError::Protocol(_))));

        // Both wrappers are back in the pool and neither holds a transport
        for _ in 0..2 {
            let conn = topology.borrow(Role::Primary).await.unwrap();
            assert!(!conn.is_connected());
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let topology = Arc::new(Topology::new(1, Duration::from_secs(1)));
        topology
            .install_primary(Endpoint::new(addr.ip().to_string(), addr.port()))
            .await;

        let (client, _writes) = RecordingClient::new(SET_FOO);
        let result = Session::new(client, Arc::clone(&topology), None, SessionTimeouts::default())
            .run()
            .await;

        assert!(matches!(result, Err(ProxyError::Network(_))));
        assert!(topology.borrow(Role::Primary).await.is_ok());
    }

    #[tokio::test]
    async fn test_deeply_nested_request_ends_only_the_session() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let mut input = "*1\r\n".repeat(200_000).into_bytes();
        input.extend_from_slice(b"$1\r\na\r\n");
        let (client, writes) = RecordingClient::new(&input);
        let result = Session::new(client, topology, None, SessionTimeouts::default())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(ProxyError::Redis(RedisError::ProtocolError { .. }))
        ));
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(primary.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_incomplete_request_ends_session() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let client = tokio_test::io::Builder::new()
            .read(b"*1\r\n$4000000000\r\n")
            .read(&[b'x'; 100])
            .build();
        let result = Session::new(client, topology, None, SessionTimeouts::default())
            .with_max_request_bytes(64)
            .run()
            .await;

        assert!(matches!(
            result,
            Err(ProxyError::Redis(RedisError::RequestTooLarge { limit: 64 }))
        ));
        assert_eq!(primary.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_complete_request_over_limit_is_rejected() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;

        let (client, writes) = RecordingClient::new(GET_FOO);
        let result = Session::new(client, topology, None, SessionTimeouts::default())
            .with_max_request_bytes(GET_FOO.len() - 1)
            .run()
            .await;

        assert!(matches!(
            result,
            Err(ProxyError::Redis(RedisError::RequestTooLarge { .. }))
        ));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_borrow_from_empty_replica_pool_times_out() {
        let primary = spawn_backend(vec![b"+OK\r\n".to_vec()], Duration::ZERO).await;
        let topology = topology(&primary, &[]).await;
        let timeouts = SessionTimeouts {
            borrow: Duration::from_millis(50),
            ..SessionTimeouts::default()
        };

        let (client, _writes) = RecordingClient::new(b"");
        let mut session = Session::new(client, topology, None, timeouts);
        let result = session.roundtrip(Role::Replica, GET_FOO).await;

        assert!(matches!(result, Err(ProxyError::Timeout { .. })));
        assert_eq!(primary.accepted.load(Ordering::SeqCst), 0);
    }
}
