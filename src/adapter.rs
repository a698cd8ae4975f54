//! Common lifecycle for datastore adapters.
//!
//! Every adapter (relational source, search sink, state store) exposes the
//! same lifecycle calls. Implementors provide a single connection attempt
//! ([`Datastore::open`]) and a liveness probe; `connect` and `reconnect`
//! are built on top. Operations go through [`guarded`], which re-establishes
//! a lost connection before each attempt and retries transient failures.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::backoff::{retry, BackoffPolicy};
use crate::error::StoreError;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Short store name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Retry policy for this store's operations.
    fn policy(&self) -> &BackoffPolicy;

    /// One connection attempt. Replaces any existing client or pool.
    async fn open(&self) -> Result<(), StoreError>;

    /// Cheap liveness probe. Never errors.
    async fn is_connected(&self) -> bool;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);

    /// Establish the connection, retrying transient failures with backoff.
    ///
    /// A connection that opens but fails the liveness probe is a
    /// [`StoreError::Connection`].
    async fn connect(&self) -> Result<(), StoreError> {
        retry(self.policy(), "connect", move || open_live(self)).await?;
        tracing::info!(store = self.name(), "connected");
        Ok(())
    }

    /// Re-open the connection only when the liveness probe fails.
    async fn reconnect(&self) -> Result<(), StoreError> {
        if self.is_connected().await {
            return Ok(());
        }
        tracing::warn!(store = self.name(), "connection lost, reconnecting");
        open_live(self).await?;
        tracing::info!(store = self.name(), "reconnected");
        Ok(())
    }
}

async fn open_live<D: Datastore + ?Sized>(store: &D) -> Result<(), StoreError> {
    store.open().await?;
    if !store.is_connected().await {
        return Err(StoreError::connection(store.name(), "liveness check failed after connect"));
    }
    Ok(())
}

/// Run `f` with reconnect-if-lost and retry-with-backoff around it.
///
/// `f` must acquire its client inside the returned future so that each
/// attempt sees the connection re-established by the previous reconnect.
pub async fn guarded<D, T, F, Fut>(store: &D, op: &'static str, mut f: F) -> Result<T, StoreError>
where
    D: Datastore + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    retry(store.policy(), op, || {
        let attempt = f();
        async move {
            store.reconnect().await?;
            attempt.await
        }
    })
    .await
}

/// Connection state for the in-memory adapters, with hooks to simulate
/// outages.
#[derive(Debug, Default)]
pub struct Faults {
    connected: AtomicBool,
    refuse_opens: AtomicU32,
    stale_opens: AtomicU32,
    fail_ops: AtomicU32,
}

impl Faults {
    /// Drop the simulated connection. The next guarded call reconnects.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_opens(&self, n: u32) {
        self.refuse_opens.store(n, Ordering::SeqCst);
    }

    /// Let the next `n` connection attempts succeed without a live
    /// connection behind them.
    pub fn stale_opens(&self, n: u32) {
        self.stale_opens.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` operations with a transient error.
    pub fn fail_ops(&self, n: u32) {
        self.fail_ops.store(n, Ordering::SeqCst);
    }

    pub fn open(&self, store: &'static str) -> Result<(), StoreError> {
        if take_one(&self.refuse_opens) {
            return Err(StoreError::connection(store, "connection refused (simulated)"));
        }
        if take_one(&self.stale_opens) {
            self.connected.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Gate an operation on the simulated connection.
    pub fn check(&self, store: &'static str, op: &'static str) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::connection(store, format!("{op}: not connected")));
        }
        if take_one(&self.fail_ops) {
            return Err(StoreError::transient(store, op, "simulated failure"));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Flappy {
        policy: BackoffPolicy,
        up: AtomicBool,
        opens: AtomicU32,
        refuse_opens: AtomicU32,
    }

    impl Flappy {
        fn new(refuse_opens: u32) -> Self {
            Self {
                policy: BackoffPolicy {
                    max_attempts: Some(5),
                    ..Default::default()
                },
                up: AtomicBool::new(false),
                opens: AtomicU32::new(0),
                refuse_opens: AtomicU32::new(refuse_opens),
            }
        }
    }

    #[async_trait]
    impl Datastore for Flappy {
        fn name(&self) -> &'static str {
            "flappy"
        }

        fn policy(&self) -> &BackoffPolicy {
            &self.policy
        }

        async fn open(&self) -> Result<(), StoreError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let left = self.refuse_opens.load(Ordering::SeqCst);
            if left > 0 {
                self.refuse_opens.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::connection("flappy", "refused"));
            }
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.up.store(false, Ordering::SeqCst);
        }
    }

    struct Simulated {
        policy: BackoffPolicy,
        faults: Faults,
    }

    impl Simulated {
        fn new() -> Self {
            Self {
                policy: BackoffPolicy {
                    max_attempts: Some(3),
                    ..Default::default()
                },
                faults: Faults::default(),
            }
        }
    }

    #[async_trait]
    impl Datastore for Simulated {
        fn name(&self) -> &'static str {
            "simulated"
        }

        fn policy(&self) -> &BackoffPolicy {
            &self.policy
        }

        async fn open(&self) -> Result<(), StoreError> {
            self.faults.open("simulated")
        }

        async fn is_connected(&self) -> bool {
            self.faults.is_connected()
        }

        async fn close(&self) {
            self.faults.close();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_liveness_check_fails() {
        let store = Simulated::new();
        store.faults.stale_opens(10);
        let err = store.connect().await.unwrap_err();
        assert!(err.is_connection());
        assert!(matches!(err, StoreError::Connection { store: "simulated", .. }));
        assert!(!store.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_dead_connection() {
        let store = Simulated::new();
        store.faults.stale_opens(1);
        store.connect().await.unwrap();
        assert!(store.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_checks_liveness() {
        let store = Simulated::new();
        store.connect().await.unwrap();
        store.faults.drop_connection();
        store.faults.stale_opens(1);
        assert!(store.reconnect().await.unwrap_err().is_connection());
        store.reconnect().await.unwrap();
        assert!(store.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_refusals() {
        let store = Flappy::new(2);
        let start = tokio::time::Instant::now();
        store.connect().await.unwrap();
        assert_eq!(store.opens.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_noop_when_alive() {
        let store = Flappy::new(0);
        store.connect().await.unwrap();
        store.reconnect().await.unwrap();
        assert_eq!(store.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_reconnects_before_operation() {
        let store = Flappy::new(0);
        store.connect().await.unwrap();
        store.close().await;
        store.close().await;

        let out = guarded(&store, "read", || async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(store.is_connected().await);
        assert_eq!(store.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_gives_up_after_budget() {
        let store = Flappy::new(100);
        let err = guarded(&store, "read", || async { Ok::<_, StoreError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(store.opens.load(Ordering::SeqCst), 5);
    }
}
