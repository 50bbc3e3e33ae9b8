/// Short-lived cache of replica replies
///
/// Keys are the verbatim bytes of a client request, values the verbatim bytes
/// of the full backend reply. An entry older than the freshness window is
/// treated as absent and removed by the periodic sweep.
use bytes::Bytes;
use fnv::FnvHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Entries {
    data: FnvHashMap<Bytes, Bytes>,
    captured: FnvHashMap<Bytes, Instant>,
}

pub struct ResponseCache {
    entries: RwLock<Entries>,
    freshness: Duration,
    max_request_bytes: usize,
}

impl ResponseCache {
    pub fn new(freshness: Duration, max_request_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            freshness,
            max_request_bytes,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    fn admits(&self, request: &[u8]) -> bool {
        !request.is_empty() && request.len() <= self.max_request_bytes
    }

    /// Stored reply for `request` if it was captured within the freshness window
    pub async fn get(&self, request: &[u8]) -> Option<Bytes> {
        if !self.admits(request) {
            return None;
        }

        let entries = self.entries.read().await;
        let captured = entries.captured.get(request)?;
        if captured.elapsed() >= self.freshness {
            return None;
        }
        entries.data.get(request).cloned()
    }

    /// Store a complete reply, replacing any previous entry for the request
    pub async fn put(&self, request: Bytes, reply: Bytes) {
        if !self.admits(&request) {
            return;
        }

        let mut entries = self.entries.write().await;
        entries.captured.insert(request.clone(), Instant::now());
        entries.data.insert(request, reply);
    }

    /// Remove every entry older than the freshness window
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let freshness = self.freshness;

        let expired: Vec<Bytes> = entries
            .captured
            .iter()
            .filter(|(_, captured)| captured.elapsed() >= freshness)
            .map(|(request, _)| request.clone())
            .collect();

        for request in &expired {
            entries.captured.remove(request);
            entries.data.remove(request);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the background sweep that purges expired entries every `period`
    pub fn start_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = self.purge_expired().await;
                if purged > 0 {
                    debug!("Purged {} expired cache entries", purged);
                }
            }
        })
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS, 4096)
    }
}
