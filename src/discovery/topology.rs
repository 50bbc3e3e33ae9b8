/// Shared topology context
///
/// `Topology` is the one object sessions and the discovery task share: the
/// known sentinels, the current primary and replica set, and the two role
/// pools whose generations follow them. Each field has its own lock so
/// readers never wait on each other; discovery is the only writer.
use crate::core::{BackendConnection, Endpoint, Role, RolePool, Signature};
use crate::error::ProxyResult;
use crate::utils::join_endpoints;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub struct Topology {
    sentinels: RwLock<Vec<Endpoint>>,
    primary: RwLock<Option<Endpoint>>,
    replicas: RwLock<Vec<Endpoint>>,
    primary_pool: RolePool,
    replica_pool: RolePool,
    per_endpoint: usize,
    connect_timeout: Duration,
}

impl Topology {
    /// Empty topology. Each known endpoint gets `per_endpoint` wrappers in
    /// the pool of its role.
    pub fn new(per_endpoint: usize, connect_timeout: Duration) -> Self {
        Self {
            sentinels: RwLock::new(Vec::new()),
            primary: RwLock::new(None),
            replicas: RwLock::new(Vec::new()),
            primary_pool: RolePool::new(Role::Primary),
            replica_pool: RolePool::new(Role::Replica),
            per_endpoint,
            connect_timeout,
        }
    }

    fn pool(&self, role: Role) -> &RolePool {
        match role {
            Role::Primary => &self.primary_pool,
            Role::Replica => &self.replica_pool,
        }
    }

    /// Borrow a wrapper of the live generation for `role`
    pub async fn borrow(&self, role: Role) -> ProxyResult<BackendConnection> {
        self.pool(role).borrow().await
    }

    pub async fn give_back(&self, role: Role, conn: BackendConnection) {
        self.pool(role).give_back(conn).await
    }

    /// Live signature for `role`; empty when nothing is known
    pub async fn signature(&self, role: Role) -> Signature {
        self.pool(role).generation().await
    }

    /// Whether reads may be sent to replicas
    pub async fn has_replicas(&self) -> bool {
        !self.signature(Role::Replica).await.is_empty()
    }

    pub async fn primary(&self) -> Option<Endpoint> {
        self.primary.read().await.clone()
    }

    pub async fn replicas(&self) -> Vec<Endpoint> {
        self.replicas.read().await.clone()
    }

    pub async fn sentinels(&self) -> Vec<Endpoint> {
        self.sentinels.read().await.clone()
    }

    pub async fn set_sentinels(&self, sentinels: Vec<Endpoint>) {
        *self.sentinels.write().await = sentinels;
    }

    fn mint(&self, endpoint: &Endpoint, generation: &Signature) -> BackendConnection {
        BackendConnection::new(endpoint.clone(), generation.clone(), self.connect_timeout)
    }

    /// Make `endpoint` the primary. Returns false when it already is.
    pub async fn install_primary(&self, endpoint: Endpoint) -> bool {
        let mut primary = self.primary.write().await;
        let signature = Signature::of_endpoint(&endpoint);
        if primary.as_ref() == Some(&endpoint)
            && self.primary_pool.generation().await == signature
        {
            return false;
        }

        let conns = (0..self.per_endpoint)
            .map(|_| self.mint(&endpoint, &signature))
            .collect();
        self.primary_pool.regenerate(signature, conns).await;

        match primary.replace(endpoint.clone()) {
            Some(old) => info!("Primary changed from {} to {}", old, endpoint),
            None => info!("Primary set to {}", endpoint),
        }
        true
    }

    /// Make `endpoints` the replica set. Order does not matter. Returns false
    /// when the set is unchanged.
    pub async fn install_replicas(&self, mut endpoints: Vec<Endpoint>) -> bool {
        endpoints.sort_by_key(ToString::to_string);
        endpoints.dedup();

        let mut replicas = self.replicas.write().await;
        let signature = Signature::of_endpoint_set(&endpoints);
        if self.replica_pool.generation().await == signature {
            return false;
        }

        // Round-robin so borrowers spread over every replica
        let mut conns = Vec::with_capacity(self.per_endpoint * endpoints.len());
        for _ in 0..self.per_endpoint {
            for endpoint in &endpoints {
                conns.push(self.mint(endpoint, &signature));
            }
        }
        self.replica_pool.regenerate(signature, conns).await;

        if endpoints.is_empty() {
            info!("No usable replicas, all commands go to the primary");
        } else {
            info!("Replica set is now [{}]", join_endpoints(&endpoints));
        }
        *replicas = endpoints;
        true
    }

    /// Fail all pending and future borrows
    pub fn close(&self) {
        self.primary_pool.close();
        self.replica_pool.close();
    }
}
