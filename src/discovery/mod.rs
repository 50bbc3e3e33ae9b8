/// Topology discovery
///
/// `Discovery` keeps the shared [`Topology`] in line with what the sentinels
/// report. One pass explores the sentinels announcing themselves on the
/// primary's hello channel, then asks a random sentinel for the current
/// primary and its replicas. A pass runs synchronously at startup and then
/// periodically in the background.
pub mod sentinel;
pub mod topology;

pub use sentinel::SentinelClient;
pub use topology::Topology;

use crate::core::Endpoint;
use crate::error::{ProxyError, ProxyResult, TopologyError};
use crate::utils::join_endpoints;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPLORATION_WINDOW: Duration = Duration::from_secs(4);

/// Flags that make a replica unfit to serve reads
const UNHEALTHY_FLAGS: &[&str] = &["s_down", "o_down", "disconnected"];

/// Stream of sentinel endpoints announced on the hello channel
pub type HelloStream = BoxStream<'static, Result<Endpoint, TopologyError>>;

/// A primary as reported by a sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInfo {
    pub name: String,
    pub endpoint: Endpoint,
    pub flags: Vec<String>,
}

/// A replica as reported by a sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub endpoint: Endpoint,
    pub flags: Vec<String>,
}

impl ReplicaInfo {
    pub fn is_healthy(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|flag| UNHEALTHY_FLAGS.contains(&flag.as_str()))
    }
}

/// Source of topology facts
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Subscribe to sentinel announcements through `via` (the primary)
    async fn announcements(&self, via: &Endpoint) -> Result<HelloStream, TopologyError>;

    /// Primaries monitored by `sentinel`
    async fn primaries(&self, sentinel: &Endpoint) -> Result<Vec<PrimaryInfo>, TopologyError>;

    /// Replicas of the primary called `primary`, as seen by `sentinel`
    async fn replicas(
        &self,
        sentinel: &Endpoint,
        primary: &str,
    ) -> Result<Vec<ReplicaInfo>, TopologyError>;
}

pub struct Discovery {
    topology: Arc<Topology>,
    coordinator: Arc<dyn Coordinator>,
    master_name: Option<String>,
    refresh_interval: Duration,
    exploration_window: Duration,
}

impl Discovery {
    pub fn new(topology: Arc<Topology>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            topology,
            coordinator,
            master_name: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            exploration_window: DEFAULT_EXPLORATION_WINDOW,
        }
    }

    /// Follow the primary with this name instead of the first one reported
    pub fn with_master_name(mut self, name: Option<String>) -> Self {
        self.master_name = name;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_exploration_window(mut self, window: Duration) -> Self {
        self.exploration_window = window;
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Install the initial primary and run the first pass. Failing to reach
    /// the initial primary is fatal; a failed topology query only leaves the
    /// initial primary in place.
    pub async fn bootstrap(&self, primary: Endpoint, seeds: Vec<Endpoint>) -> ProxyResult<()> {
        info!(
            "Starting with primary {}, no replicas and sentinel seeds [{}]",
            primary,
            join_endpoints(&seeds)
        );
        self.topology.set_sentinels(seeds).await;
        self.topology.install_primary(primary.clone()).await;

        self.refresh_sentinels().await.map_err(|e| {
            error!("Unable to reach initial primary {}: {}", primary, e);
            ProxyError::from(e)
        })?;

        if let Err(e) = self.refresh_topology().await {
            warn!("Initial topology query failed, keeping {}: {}", primary, e);
        }
        Ok(())
    }

    /// Collect the sentinels announcing themselves on the primary's hello
    /// channel during the exploration window. Returns how many were found.
    /// When none are, the previous list is kept.
    pub async fn refresh_sentinels(&self) -> Result<usize, TopologyError> {
        let primary = self.topology.primary().await.ok_or(TopologyError::NoPrimary)?;

        debug!("Exploring sentinels through primary {}", primary);
        let mut hellos = self.coordinator.announcements(&primary).await?;
        let deadline = Instant::now() + self.exploration_window;
        let mut found: Vec<Endpoint> = Vec::new();

        loop {
            match timeout_at(deadline, hellos.next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Ok(sentinel))) => {
                    if !found.contains(&sentinel) {
                        debug!("Found sentinel at {}", sentinel);
                        found.push(sentinel);
                    }
                }
                Ok(Some(Err(e))) => warn!("Ignoring unreadable sentinel hello: {}", e),
            }
        }

        info!(
            "Sentinel exploration found {} sentinels: [{}]",
            found.len(),
            join_endpoints(&found)
        );
        if found.is_empty() {
            let known = self.topology.sentinels().await.len();
            warn!("No sentinel announced itself, keeping {} known sentinels", known);
            return Ok(0);
        }

        let count = found.len();
        self.topology.set_sentinels(found).await;
        Ok(count)
    }

    /// Ask a random known sentinel for the primary and its replicas and
    /// install whatever changed
    pub async fn refresh_topology(&self) -> Result<(), TopologyError> {
        let sentinels = self.topology.sentinels().await;
        let sentinel = sentinels
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(TopologyError::NoSentinels)?;
        debug!("Querying sentinel {}", sentinel);

        let primaries = self.coordinator.primaries(&sentinel).await?;
        let primary = match &self.master_name {
            Some(name) => primaries
                .into_iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| TopologyError::UnknownPrimary {
                    sentinel: sentinel.to_string(),
                    name: name.clone(),
                })?,
            None => primaries
                .into_iter()
                .next()
                .ok_or_else(|| TopologyError::NoPrimaries {
                    sentinel: sentinel.to_string(),
                })?,
        };
        debug!("Sentinel {} reports primary {} at {}", sentinel, primary.name, primary.endpoint);
        self.topology.install_primary(primary.endpoint.clone()).await;

        let replicas = self.coordinator.replicas(&sentinel, &primary.name).await?;
        let usable: Vec<Endpoint> = replicas
            .into_iter()
            .filter(|replica| {
                let healthy = replica.is_healthy();
                if !healthy {
                    debug!(
                        "Skipping replica {} with flags {}",
                        replica.endpoint,
                        replica.flags.join(",")
                    );
                }
                healthy
            })
            .map(|replica| replica.endpoint)
            .collect();
        self.topology.install_replicas(usable).await;
        Ok(())
    }

    /// One full pass; failures are logged and leave the topology as it was
    pub async fn refresh(&self) {
        if let Err(e) = self.refresh_sentinels().await {
            warn!("Sentinel refresh failed: {}", e);
        }
        if let Err(e) = self.refresh_topology().await {
            warn!("Topology refresh failed: {}", e);
        }
    }

    /// Run `refresh` every refresh interval in the background
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; bootstrap already covered it
            interval.tick().await;
            loop {
                interval.tick().await;
                self.refresh().await;
            }
        })
    }
}
