/// Sentinel protocol client
///
/// Talks RESP to sentinels (`SENTINEL MASTERS`, `SENTINEL SLAVES <name>`) and
/// to the primary itself for the `__sentinel__:hello` announcement channel.
/// Every call opens its own short-lived connection.
use crate::core::Endpoint;
use crate::discovery::{Coordinator, HelloStream, PrimaryInfo, ReplicaInfo};
use crate::error::TopologyError;
use crate::redis::{RespEncoder, RespParser, RespValue};
use async_trait::async_trait;
use bytes::BytesMut;
use fnv::FnvHashMap;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Pub/sub channel sentinels announce themselves on
pub const HELLO_CHANNEL: &str = "__sentinel__:hello";

const READ_CHUNK: usize = 4096;

/// One RESP connection to a sentinel or to the primary
struct RespConnection {
    endpoint: Endpoint,
    stream: TcpStream,
    buffer: BytesMut,
}

impl RespConnection {
    async fn open(endpoint: &Endpoint, dial_timeout: Duration) -> Result<Self, TopologyError> {
        let dial = TcpStream::connect((endpoint.host(), endpoint.port()));
        let stream = match timeout(dial_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TopologyError::unreachable(endpoint, e)),
            Err(_) => return Err(TopologyError::unreachable(endpoint, "connect timed out")),
        };
        stream
            .set_nodelay(true)
            .map_err(|e| TopologyError::unreachable(endpoint, e))?;

        trace!("Connected to {}", endpoint);
        Ok(Self {
            endpoint: endpoint.clone(),
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    async fn send(&mut self, command: &str, args: &[&str]) -> Result<(), TopologyError> {
        let request = RespEncoder::encode(&RespEncoder::create_command(command, args));
        self.stream
            .write_all(&request)
            .await
            .map_err(|e| TopologyError::unreachable(&self.endpoint, e))
    }

    /// Read the next complete value, however many reads it takes
    async fn next_value(&mut self) -> Result<RespValue, TopologyError> {
        loop {
            if let Some(value) = RespParser::parse(&mut self.buffer)
                .map_err(|e| TopologyError::malformed(e.to_string()))?
            {
                return Ok(value);
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| TopologyError::unreachable(&self.endpoint, e))?;
            if n == 0 {
                return Err(TopologyError::unreachable(
                    &self.endpoint,
                    "connection closed",
                ));
            }
        }
    }

    async fn query(
        &mut self,
        command: &str,
        args: &[&str],
        query_timeout: Duration,
    ) -> Result<RespValue, TopologyError> {
        let exchange = async {
            self.send(command, args).await?;
            let value = self.next_value().await?;
            Ok::<_, TopologyError>(value)
        };
        let reply = timeout(query_timeout, exchange)
            .await
            .map_err(|_| TopologyError::unreachable(&self.endpoint, "query timed out"))??;

        if let RespValue::Error(message) = reply {
            return Err(TopologyError::malformed(format!(
                "{} replied to {}: {}",
                self.endpoint, command, message
            )));
        }
        Ok(reply)
    }
}

/// Coordinator backed by real sentinels
#[derive(Debug, Clone)]
pub struct SentinelClient {
    query_timeout: Duration,
}

impl SentinelClient {
    /// `query_timeout` bounds each dial and each request/reply exchange
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<RespConnection, TopologyError> {
        RespConnection::open(endpoint, self.query_timeout).await
    }
}

impl Default for SentinelClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Coordinator for SentinelClient {
    async fn announcements(&self, via: &Endpoint) -> Result<HelloStream, TopologyError> {
        let mut conn = self.connect(via).await?;
        let ack = conn
            .query("SUBSCRIBE", &[HELLO_CHANNEL], self.query_timeout)
            .await?;
        match ack.into_array().as_deref().and_then(|a| a.first()).and_then(RespValue::as_str) {
            Some(kind) if kind.eq_ignore_ascii_case("subscribe") => {}
            _ => return Err(TopologyError::malformed("unexpected SUBSCRIBE acknowledgement")),
        }
        debug!("Subscribed to {} on {}", HELLO_CHANNEL, via);

        // Ends after the first transport error; the caller bounds it in time
        let hellos = stream::unfold(Some(conn), |state| async move {
            let mut conn = state?;
            match conn.next_value().await {
                Ok(message) => Some((parse_hello(message), Some(conn))),
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(hellos.boxed())
    }

    async fn primaries(&self, sentinel: &Endpoint) -> Result<Vec<PrimaryInfo>, TopologyError> {
        let mut conn = self.connect(sentinel).await?;
        let reply = conn
            .query("SENTINEL", &["MASTERS"], self.query_timeout)
            .await?;

        entries(reply)?
            .into_iter()
            .map(|fields| -> Result<PrimaryInfo, TopologyError> {
                Ok(PrimaryInfo {
                    name: field(&fields, "name")?.to_string(),
                    endpoint: endpoint_of(&fields)?,
                    flags: flags_of(&fields),
                })
            })
            .collect()
    }

    async fn replicas(
        &self,
        sentinel: &Endpoint,
        primary: &str,
    ) -> Result<Vec<ReplicaInfo>, TopologyError> {
        let mut conn = self.connect(sentinel).await?;
        let reply = conn
            .query("SENTINEL", &["SLAVES", primary], self.query_timeout)
            .await?;

        entries(reply)?
            .into_iter()
            .map(|fields| -> Result<ReplicaInfo, TopologyError> {
                Ok(ReplicaInfo {
                    endpoint: endpoint_of(&fields)?,
                    flags: flags_of(&fields),
                })
            })
            .collect()
    }
}

type Fields = FnvHashMap<String, String>;

/// Split a reply made of flat `key, value, key, value` arrays into maps
fn entries(reply: RespValue) -> Result<Vec<Fields>, TopologyError> {
    let items = reply
        .into_array()
        .ok_or_else(|| TopologyError::malformed("expected an array of entries"))?;

    items
        .into_iter()
        .map(|item| -> Result<Fields, TopologyError> {
            let flat = item
                .into_array()
                .ok_or_else(|| TopologyError::malformed("expected a field array"))?;
            if flat.len() % 2 != 0 {
                return Err(TopologyError::malformed("odd number of fields"));
            }

            let mut fields = Fields::default();
            for pair in flat.chunks(2) {
                match (pair[0].as_str(), pair[1].as_str()) {
                    (Some(key), Some(value)) => {
                        fields.insert(key.to_string(), value.to_string());
                    }
                    _ => return Err(TopologyError::malformed("non-string field")),
                }
            }
            Ok(fields)
        })
        .collect()
}

fn field<'a>(fields: &'a Fields, key: &str) -> Result<&'a str, TopologyError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TopologyError::malformed(format!("missing field '{key}'")))
}

fn endpoint_of(fields: &Fields) -> Result<Endpoint, TopologyError> {
    let host = field(fields, "ip")?;
    let port = field(fields, "port")?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TopologyError::InvalidEndpoint(format!("{host}:{port}")))?;
    Ok(Endpoint::new(host, port))
}

fn flags_of(fields: &Fields) -> Vec<String> {
    fields
        .get("flags")
        .map(|flags| {
            flags
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Extract the announcing sentinel from a `message` push. The payload is
/// `ip,port,runid,epoch,...`.
fn parse_hello(message: RespValue) -> Result<Endpoint, TopologyError> {
    let parts = message
        .into_array()
        .ok_or_else(|| TopologyError::malformed("hello is not an array"))?;
    if parts.len() != 3 || parts[0].as_str() != Some("message") {
        return Err(TopologyError::malformed("unexpected message on hello channel"));
    }

    let payload = parts[2]
        .as_str()
        .ok_or_else(|| TopologyError::malformed("hello payload is not text"))?;
    let mut fields = payload.split(',');
    match (fields.next(), fields.next()) {
        (Some(host), Some(port)) if !host.is_empty() => port
            .parse::<u16>()
            .map(|port| Endpoint::new(host, port))
            .map_err(|_| TopologyError::InvalidEndpoint(payload.to_string())),
        _ => Err(TopologyError::InvalidEndpoint(payload.to_string())),
    }
}
