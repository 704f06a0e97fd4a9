//! Tunnel pool
//!
//! Creates tunnels up to `max_tunnels` and spreads new streams over the
//! existing ones once the cap is reached. While the cap is taken up by
//! tunnels still handshaking, callers wait for one of them to become usable.
//!
//! Invariant (when `max_tunnels > 0`): `active + waiting <= max_tunnels`.

use super::connection::Tunnel;
use super::TunnelError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Re-check interval while waiting for a tunnel, in case a wakeup is missed
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// What [`TunnelPool::acquire`] handed out
#[derive(Debug)]
pub enum Acquired<T> {
    /// A new tunnel, plus whatever the creation step returned
    Created(Arc<Tunnel>, T),
    /// An already active tunnel
    Reused(Arc<Tunnel>),
}

impl<T> Acquired<T> {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        match self {
            Acquired::Created(tunnel, _) | Acquired::Reused(tunnel) => tunnel,
        }
    }
}

#[derive(Default)]
struct PoolState {
    active: Vec<Arc<Tunnel>>,
    waiting: usize,
}

/// Pick one item uniformly at random
pub fn pick_random<'a, T, R>(items: &'a [T], rng: &mut R) -> Option<&'a T>
where
    R: Rng + ?Sized,
{
    items.choose(rng)
}

/// Capped set of active tunnels
pub struct TunnelPool {
    max_tunnels: usize,
    state: Mutex<PoolState>,
    changed: Notify,
    rng: Mutex<StdRng>,
}

impl TunnelPool {
    /// `max_tunnels == 0` means unbounded
    pub fn new(max_tunnels: usize) -> Self {
        Self::with_rng(max_tunnels, StdRng::from_entropy())
    }

    /// Use a caller-provided random source for tunnel selection
    pub fn with_rng(max_tunnels: usize, rng: StdRng) -> Self {
        Self {
            max_tunnels,
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn max_tunnels(&self) -> usize {
        self.max_tunnels
    }

    /// Number of usable tunnels
    pub fn active_count(&self) -> usize {
        let mut state = self.lock_state();
        state.active.retain(|t| !t.is_closed());
        state.active.len()
    }

    /// Number of tunnels currently being created
    pub fn waiting_count(&self) -> usize {
        self.lock_state().waiting
    }

    /// Get a tunnel, creating one with `create` when the cap allows
    ///
    /// `create` must return a tunnel that finished its handshake. If it
    /// fails nothing is registered and the error is handed back.
    pub async fn acquire<T, F, Fut>(&self, create: F) -> Result<Acquired<T>, TunnelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Arc<Tunnel>, T), TunnelError>>,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                state.active.retain(|t| !t.is_closed());

                if self.max_tunnels == 0 || state.active.len() + state.waiting < self.max_tunnels {
                    state.waiting += 1;
                    break;
                }

                let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(tunnel) = pick_random(&state.active, &mut *rng) {
                    trace!("Reusing tunnel {}", tunnel);
                    return Ok(Acquired::Reused(Arc::clone(tunnel)));
                }
            }

            trace!("Tunnel pool at capacity, waiting for a tunnel");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }

        let slot = Slot { pool: self, promoted: false };
        let (tunnel, extra) = create().await?;
        slot.promote(Arc::clone(&tunnel));
        debug!("Tunnel {} added to pool", tunnel);
        Ok(Acquired::Created(tunnel, extra))
    }

    /// Drop a tunnel from the pool
    pub fn release(&self, tunnel: &Arc<Tunnel>) {
        {
            let mut state = self.lock_state();
            state.active.retain(|t| !Arc::ptr_eq(t, tunnel));
        }
        self.changed.notify_waiters();
    }

    /// Dispose every tunnel in the pool
    pub fn close_all(&self) {
        let tunnels = std::mem::take(&mut self.lock_state().active);
        for tunnel in tunnels {
            tunnel.dispose("pool closed");
        }
        self.changed.notify_waiters();
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A reserved creation slot; released on drop unless promoted to an active tunnel
struct Slot<'a> {
    pool: &'a TunnelPool,
    promoted: bool,
}

impl Slot<'_> {
    fn promote(mut self, tunnel: Arc<Tunnel>) {
        {
            let mut state = self.pool.lock_state();
            state.waiting -= 1;
            state.active.push(tunnel);
        }
        self.promoted = true;
        self.pool.changed.notify_waiters();
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.promoted {
            self.pool.lock_state().waiting -= 1;
            self.pool.changed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::fast_config;
    use crate::tunnel::Role;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dummy_tunnel() -> Arc<Tunnel> {
        let (a, _b) = tokio::io::duplex(64);
        Tunnel::from_stream(Role::Accepting, a, fast_config())
    }

    #[test]
    fn test_pick_random_is_deterministic_with_seed() {
        let items = [1, 2, 3, 4, 5];
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(pick_random(&items, &mut a), pick_random(&items, &mut b));
        }

        let empty: [u8; 0] = [];
        assert!(pick_random(&empty, &mut a).is_none());
    }

    #[test]
    fn test_pick_random_spreads() {
        let items = [0usize, 1, 2, 3];
        let mut rng = StdRng::seed_from_u64(42);
        let seen: HashSet<usize> = (0..200)
            .filter_map(|_| pick_random(&items, &mut rng).copied())
            .collect();
        assert_eq!(seen.len(), items.len());
    }

    #[tokio::test]
    async fn test_never_exceeds_cap() {
        const CAP: usize = 3;
        let pool = Arc::new(TunnelPool::new(CAP));
        let created = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = Arc::clone(&pool);
            let created = Arc::clone(&created);
            tasks.push(tokio::spawn(async move {
                let acquired = pool
                    .acquire(|| async {
                        created.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok((dummy_tunnel(), ()))
                    })
                    .await
                    .unwrap();
                assert!(pool.active_count() + pool.waiting_count() <= CAP);
                Arc::clone(acquired.tunnel())
            }));
        }

        let mut distinct = HashSet::new();
        for task in tasks {
            let tunnel = task.await.unwrap();
            distinct.insert(Arc::as_ptr(&tunnel) as usize);
        }

        assert_eq!(created.load(Ordering::SeqCst), CAP);
        assert_eq!(distinct.len(), CAP);
        assert_eq!(pool.active_count(), CAP);
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_first_tunnel() {
        let pool = Arc::new(TunnelPool::new(1));

        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.acquire(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok((dummy_tunnel(), "first"))
                })
                .await
                .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = pool
            .acquire(|| async { Ok((dummy_tunnel(), "second")) })
            .await
            .unwrap();

        let first = first.await.unwrap();
        let Acquired::Created(created, label) = first else {
            panic!("first caller should create");
        };
        assert_eq!(label, "first");
        let Acquired::Reused(reused) = second else {
            panic!("second caller should reuse");
        };
        assert!(Arc::ptr_eq(&created, &reused));
    }

    #[tokio::test]
    async fn test_failed_creation_frees_slot() {
        let pool = TunnelPool::new(1);

        let failed: Result<Acquired<()>, _> = pool
            .acquire(|| async { Err(TunnelError::Handshake("refused".to_string())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(pool.waiting_count(), 0);
        assert_eq!(pool.active_count(), 0);

        let acquired = pool.acquire(|| async { Ok((dummy_tunnel(), ())) }).await.unwrap();
        assert!(matches!(acquired, Acquired::Created(..)));
    }

    #[tokio::test]
    async fn test_closed_tunnels_are_replaced() {
        let pool = TunnelPool::new(1);

        let first = pool.acquire(|| async { Ok((dummy_tunnel(), ())) }).await.unwrap();
        first.tunnel().dispose("test");

        let second = pool.acquire(|| async { Ok((dummy_tunnel(), ())) }).await.unwrap();
        assert!(matches!(second, Acquired::Created(..)));
        assert!(!Arc::ptr_eq(first.tunnel(), second.tunnel()));
    }

    #[tokio::test]
    async fn test_unbounded_pool_always_creates() {
        let pool = TunnelPool::new(0);
        for _ in 0..4 {
            let acquired = pool.acquire(|| async { Ok((dummy_tunnel(), ())) }).await.unwrap();
            assert!(matches!(acquired, Acquired::Created(..)));
        }
        assert_eq!(pool.active_count(), 4);
    }
}
