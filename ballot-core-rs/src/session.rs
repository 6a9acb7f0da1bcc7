//! Lease-backed sessions.
//!
//! A session owns one lease and keeps it alive from a background task:
//! - Keep-alive pings every `keep_alive_interval` (ttl/3 by default)
//! - Transient ping failures are retried until the lease's own deadline
//! - The done signal fires once, when the keep-alive task stops
//!
//! Keys written with the session's lease disappear when the lease does,
//! which is what lets a crashed or partitioned campaigner lose leadership.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::store::{Client, Lease};
use crate::types::LeaseId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lease time-to-live
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lease time-to-live requested at grant
    pub ttl: Duration,
    /// Adopt an existing lease instead of granting a new one
    pub lease_id: Option<LeaseId>,
    /// Keep-alive cadence (ttl/3 when unset)
    pub keep_alive_interval: Option<Duration>,
    /// Parent context; cancelling it stops the keep-alive
    pub ctx: Context,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            lease_id: None,
            keep_alive_interval: None,
            ctx: Context::background(),
        }
    }
}

impl SessionConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_lease(mut self, lease_id: LeaseId) -> Self {
        self.lease_id = Some(lease_id);
        self
    }

    pub fn with_keep_alive_interval(mut self, every: Duration) -> Self {
        self.keep_alive_interval = Some(every);
        self
    }

    pub fn with_context(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }
}

/// Handle on one lease and its keep-alive task
pub struct Session {
    client: Arc<dyn Client>,
    id: LeaseId,
    ttl: Duration,
    /// Cancelled when the handle is closed, orphaned or dropped
    ctx: Context,
    done: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Grant (or adopt) a lease and start keeping it alive.
    ///
    /// A failed grant is returned as `Error::SessionCreate`; nothing is
    /// retried.
    pub async fn new(client: Arc<dyn Client>, config: SessionConfig) -> Result<Self> {
        let (id, ttl) = match config.lease_id {
            Some(id) => (id, config.ttl),
            None => {
                let resp = config
                    .ctx
                    .run(client.grant(config.ttl))
                    .await
                    .map_err(|e| Error::SessionCreate(Box::new(e)))?;
                (resp.id, resp.ttl)
            }
        };

        let ctx = config.ctx.with_cancel();
        let done = CancellationToken::new();
        let every = config
            .keep_alive_interval
            .unwrap_or(ttl / 3)
            .max(Duration::from_millis(10));
        let task = tokio::spawn(keep_alive(
            client.clone(),
            id,
            ttl,
            every,
            ctx.clone(),
            done.clone(),
        ));

        info!("Session: Started lease {:x} (ttl={:?}, keep-alive every {:?})", id, ttl, every);

        Ok(Self {
            client,
            id,
            ttl,
            ctx,
            done,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Lease backing this session
    pub fn lease(&self) -> LeaseId {
        self.id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Context that ends when this handle is closed or orphaned
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// Resolves once the keep-alive task has stopped: the store reported
    /// the lease gone, the lease ran out while the store was unreachable,
    /// or the handle was closed/orphaned.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stop keeping the lease alive without revoking it.
    ///
    /// Keys attached to the lease live on until its TTL runs out.
    pub async fn orphan(&self) {
        self.ctx.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.done.cancel();
    }

    /// Stop the keep-alive and revoke the lease.
    ///
    /// Idempotent. The revoke is bounded by the TTL; if it fails the error
    /// is returned, and the lease still expires on its own.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.orphan().await;

        let ctx = Context::background().with_timeout(self.ttl);
        match ctx.run(self.client.revoke(self.id)).await {
            Ok(_) | Err(Error::LeaseNotFound(_)) => {
                info!("Session: Closed lease {:x}", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("Session: Failed to revoke lease {:x}: {}", self.id, e);
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &format_args!("{:x}", self.id))
            .field("ttl", &self.ttl)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Keep-alive background task
async fn keep_alive(
    client: Arc<dyn Client>,
    id: LeaseId,
    ttl: Duration,
    every: Duration,
    ctx: Context,
    done: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + ttl;

    loop {
        tokio::select! {
            _ = ctx.done() => {
                debug!("Session: Keep-alive for lease {:x} stopped", id);
                break;
            }
            _ = ticker.tick() => {
                match ctx.run(client.keep_alive_once(id)).await {
                    Ok(resp) if !resp.ttl.is_zero() => {
                        deadline = Instant::now() + resp.ttl;
                    }
                    Ok(_) | Err(Error::LeaseNotFound(_)) => {
                        warn!("Session: Lease {:x} expired", id);
                        break;
                    }
                    Err(e) if e.is_context() => break,
                    Err(e) => {
                        if Instant::now() >= deadline {
                            warn!("Session: Lease {:x} lapsed while keep-alive failed: {}", id, e);
                            break;
                        }
                        debug!("Session: Keep-alive for lease {:x} failed, retrying: {}", id, e);
                    }
                }
            }
        }
    }

    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn config(ttl_secs: u64) -> SessionConfig {
        SessionConfig::default().with_ttl(Duration::from_secs(ttl_secs))
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.ttl, DEFAULT_SESSION_TTL);
        assert!(config.lease_id.is_none());
        assert!(config.keep_alive_interval.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_outlives_ttl() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(3)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(!session.is_done());
        assert!(store.lease_time_to_live(session.lease()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_revokes_and_is_idempotent() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(5)).await.unwrap();
        let lease = session.lease();

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_done());
        assert!(session.ctx().err().is_some());
        assert!(store.lease_time_to_live(lease).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_leaves_lease_to_expire() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(3)).await.unwrap();
        let lease = session.lease();

        session.orphan().await;
        assert!(session.is_done());
        assert!(store.lease_time_to_live(lease).is_some());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.lease_time_to_live(lease).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_fires_when_store_revokes() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(6)).await.unwrap();

        store.revoke(session.lease()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(6), session.done())
            .await
            .expect("done should fire on the next keep-alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_longer_than_ttl_expires_session() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(3)).await.unwrap();

        store.set_available(false);
        tokio::time::timeout(Duration::from_secs(5), session.done())
            .await
            .expect("session should lapse after its ttl");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.lease_time_to_live(session.lease()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_partition_is_survived() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(6)).await.unwrap();

        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!session.is_done());
    }

    #[tokio::test]
    async fn test_grant_failure_is_session_create() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = Session::new(store.clone(), config(5)).await.unwrap_err();
        assert!(matches!(err, Error::SessionCreate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopts_existing_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(4)).await.unwrap();

        let session = Session::new(store.clone(), config(4).with_lease(lease.id))
            .await
            .unwrap();
        assert_eq!(session.lease(), lease.id);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(store.lease_time_to_live(lease.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_keep_alive() {
        let store = MemoryStore::new();
        let session = Session::new(store.clone(), config(3)).await.unwrap();
        let lease = session.lease();
        drop(session);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.lease_time_to_live(lease).is_none());
    }
}
