/// Generation-aware pool of backend connections for one role
///
/// Every wrapper in the pool is tagged with the topology signature it was
/// minted under. The pool keeps the live signature for its role; discovery is
/// the only writer of it (via [`RolePool::regenerate`]). Staleness is detected
/// lazily: an old-generation wrapper is discarded when a borrower pops it, and
/// refused when a session tries to return it.
///
/// Capacity follows the generation: it is the number of wrappers minted for
/// the live topology, so a replica pool grows and shrinks with the replica
/// set.
use crate::core::{BackendConnection, Role, Signature};
use crate::error::{ProxyError, ProxyResult};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

struct Idle {
    conns: VecDeque<BackendConnection>,
    capacity: usize,
}

pub struct RolePool {
    role: Role,
    generation: RwLock<Signature>,
    idle: Mutex<Idle>,
    /// One permit per idle wrapper
    available: Semaphore,
}

impl RolePool {
    /// Empty pool with no generation; it holds nothing until the first
    /// [`RolePool::regenerate`]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            generation: RwLock::new(Signature::empty()),
            idle: Mutex::new(Idle {
                conns: VecDeque::new(),
                capacity: 0,
            }),
            available: Semaphore::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Wrappers minted for the live generation
    pub fn capacity(&self) -> usize {
        self.idle().capacity
    }

    /// Number of wrappers currently waiting in the pool (any generation)
    pub fn idle_count(&self) -> usize {
        self.idle().conns.len()
    }

    /// Live signature for this role
    pub async fn generation(&self) -> Signature {
        self.generation.read().await.clone()
    }

    fn idle(&self) -> MutexGuard<'_, Idle> {
        // The queue holds no invariants a panicking holder could break
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a wrapper of the live generation, waiting until one is available.
    /// Wrappers of older generations met on the way are dropped, which closes
    /// their sockets.
    pub async fn borrow(&self) -> ProxyResult<BackendConnection> {
        loop {
            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| ProxyError::backend(format!("{} pool is closed", self.role)))?;
            permit.forget();

            let Some(conn) = self.idle().conns.pop_front() else {
                continue;
            };

            let live = self.generation.read().await;
            if conn.generation() == &*live {
                return Ok(conn);
            }

            debug!(
                "Discarding stale {} connection to {} (generation {}, live {})",
                self.role,
                conn.endpoint(),
                conn.generation(),
                *live
            );
        }
    }

    /// Return a borrowed wrapper. Wrappers of an older generation are dropped
    /// so a rebuilt pool is not refilled with the topology it replaced.
    pub async fn give_back(&self, conn: BackendConnection) {
        let live = self.generation.read().await;
        if conn.generation() != &*live {
            debug!(
                "Dropping returned {} connection to {} from generation {}",
                self.role,
                conn.endpoint(),
                conn.generation()
            );
            return;
        }

        {
            let mut idle = self.idle();
            if idle.conns.len() >= idle.capacity {
                debug!("{} pool is full, dropping returned connection", self.role);
                return;
            }
            idle.conns.push_back(conn);
        }
        self.available.add_permits(1);
    }

    /// Switch the pool to a new generation and enqueue freshly minted
    /// wrappers for it. The pool's capacity becomes the number of wrappers
    /// offered. Returns how many were enqueued.
    ///
    /// Wrappers already in the pool are left for borrowers to discard, except
    /// that when the pool is full an idle stale wrapper is displaced for each
    /// new one.
    pub async fn regenerate(&self, signature: Signature, conns: Vec<BackendConnection>) -> usize {
        let mut live = self.generation.write().await;
        let previous = std::mem::replace(&mut *live, signature.clone());

        let offered = conns.len();
        let mut added = 0;
        let mut displaced = 0;
        {
            let mut idle = self.idle();
            idle.capacity = offered;
            for conn in conns {
                if idle.conns.len() < idle.capacity {
                    idle.conns.push_back(conn);
                    added += 1;
                } else if let Some(pos) =
                    idle.conns.iter().position(|c| c.generation() != &signature)
                {
                    idle.conns.remove(pos);
                    idle.conns.push_back(conn);
                    displaced += 1;
                } else {
                    break;
                }
            }
        }
        self.available.add_permits(added);
        drop(live);

        let enqueued = added + displaced;
        if enqueued < offered {
            warn!(
                "{} pool is full of live connections, {} of {} new connections not enqueued",
                self.role,
                offered - enqueued,
                offered
            );
        }
        info!(
            "{} pool moved from generation {} to {} ({} connections enqueued, {} stale displaced)",
            self.role, previous, signature, enqueued, displaced
        );
        enqueued
    }

    /// Wake all waiting borrowers with an error; used at shutdown
    pub fn close(&self) {
        self.available.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Endpoint;
    use std::sync::Arc;
    use std::time::Duration;

    fn wrappers(host: &str, signature: &Signature, count: usize) -> Vec<BackendConnection> {
        (0..count)
            .map(|_| {
                BackendConnection::new(
                    Endpoint::new(host, 6379),
                    signature.clone(),
                    Duration::from_secs(1),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_borrow_skips_stale_generation() {
        let pool = RolePool::new(Role::Primary);
        let gen_a = Signature::of(["10.0.0.1:6379"]);
        let gen_b = Signature::of(["10.0.0.2:6379"]);

        assert_eq!(pool.regenerate(gen_a.clone(), wrappers("10.0.0.1", &gen_a, 2)).await, 2);
        assert_eq!(pool.regenerate(gen_b.clone(), wrappers("10.0.0.2", &gen_b, 1)).await, 1);
        assert_eq!(pool.idle_count(), 2);

        let conn = pool.borrow().await.unwrap();
        assert_eq!(conn.generation(), &gen_b);
        assert_eq!(conn.endpoint().host(), "10.0.0.2");
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_return_is_dropped() {
        let pool = RolePool::new(Role::Replica);
        let gen_a = Signature::of(["a:1"]);
        let gen_b = Signature::of(["b:1"]);

        pool.regenerate(gen_a.clone(), wrappers("a", &gen_a, 1)).await;
        let borrowed = pool.borrow().await.unwrap();

        pool.regenerate(gen_b.clone(), wrappers("b", &gen_b, 1)).await;
        pool.give_back(borrowed).await;
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.borrow().await.unwrap();
        pool.give_back(conn).await;
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_full_pool_displaces_stale_wrappers() {
        let pool = RolePool::new(Role::Primary);
        let gen_a = Signature::of(["a:1"]);
        let gen_b = Signature::of(["b:1"]);

        pool.regenerate(gen_a.clone(), wrappers("a", &gen_a, 3)).await;
        let enqueued = pool.regenerate(gen_b.clone(), wrappers("b", &gen_b, 2)).await;
        assert_eq!(enqueued, 2);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.idle_count(), 3);

        for _ in 0..2 {
            assert_eq!(pool.borrow().await.unwrap().generation(), &gen_b);
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_follows_generation() {
        let pool = RolePool::new(Role::Replica);
        assert_eq!(pool.capacity(), 0);

        let gen_a = Signature::of(["a:1"]);
        let gen_b = Signature::of(["a:1", "b:1", "c:1"]);
        pool.regenerate(gen_a.clone(), wrappers("a", &gen_a, 2)).await;
        assert_eq!(pool.capacity(), 2);

        assert_eq!(pool.regenerate(gen_b.clone(), wrappers("b", &gen_b, 6)).await, 6);
        assert_eq!(pool.capacity(), 6);

        let mut borrowed = Vec::new();
        for _ in 0..6 {
            borrowed.push(pool.borrow().await.unwrap());
        }
        for conn in borrowed {
            pool.give_back(conn).await;
        }
        assert_eq!(pool.idle_count(), 6);
    }

    #[tokio::test]
    async fn test_borrow_waits_for_a_return() {
        let pool = Arc::new(RolePool::new(Role::Primary));
        let gen = Signature::of(["a:1"]);
        pool.regenerate(gen.clone(), wrappers("a", &gen, 1)).await;

        let held = pool.borrow().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.borrow()).await;
        assert!(waiting.is_err());

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow().await })
        };
        pool.give_back(held).await;

        let conn = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(conn.generation(), &gen);
    }

    #[tokio::test]
    async fn test_close_wakes_borrowers() {
        let pool = Arc::new(RolePool::new(Role::Replica));
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow().await })
        };
        tokio::task::yield_now().await;
        pool.close();

        match waiter.await.unwrap() {
            Err(err) => {
                assert!(matches!(err, ProxyError::Backend { .. }));
                assert!(err.is_recoverable());
            }
            Ok(_) => panic!("borrow succeeded on a closed pool"),
        }
    }

    #[tokio::test]
    async fn test_borrow_never_yields_mismatched_generation() {
        let pool = Arc::new(RolePool::new(Role::Replica));
        let generations: Vec<Signature> = (0..5)
            .map(|i| Signature::of([format!("10.0.0.{i}:6379")]))
            .collect();

        for signature in &generations {
            pool.regenerate(signature.clone(), wrappers("10.0.0.9", signature, 4)).await;

            for _ in 0..4 {
                let conn = pool.borrow().await.unwrap();
                assert_eq!(conn.generation(), &pool.generation().await);
                pool.give_back(conn).await;
            }
        }
        assert_eq!(pool.generation().await, generations[4]);
    }
}
