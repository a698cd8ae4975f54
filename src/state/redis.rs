//! Redis [`StateStore`] over a multiplexed [`ConnectionManager`].

use std::sync::RwLock;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;

use crate::adapter::{guarded, Datastore};
use crate::backoff::BackoffPolicy;
use crate::error::StoreError;

use super::StateStore;

const STORE: &str = "redis";

pub struct RedisStore {
    client: ::redis::Client,
    policy: BackoffPolicy,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Validates the URL; no connection is made until [`Datastore::connect`].
    pub fn new(url: &str, policy: BackoffPolicy) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::fatal(STORE, "open", e.to_string()))?;
        Ok(Self {
            client,
            policy,
            manager: RwLock::new(None),
        })
    }

    fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let guard = self.manager.read().unwrap_or_else(|e| e.into_inner());
        guard
            .clone()
            .ok_or_else(|| StoreError::connection(STORE, "not connected"))
    }
}

async fn ping(conn: &mut ConnectionManager) -> Result<(), StoreError> {
    let _: String = ::redis::cmd("PING")
        .query_async(conn)
        .await
        .map_err(|e| StoreError::from_redis("ping", e))?;
    Ok(())
}

#[async_trait]
impl Datastore for RedisStore {
    fn name(&self) -> &'static str {
        STORE
    }

    fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    async fn open(&self) -> Result<(), StoreError> {
        let mut manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| StoreError::from_redis("connect", e))?;
        ping(&mut manager).await?;
        *self.manager.write().unwrap_or_else(|e| e.into_inner()) = Some(manager);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.conn() {
            Ok(mut conn) => ping(&mut conn).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        self.manager.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[async_trait]
impl StateStore for RedisStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        guarded(self, "get", move || async move {
            let mut conn = self.conn()?;
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| StoreError::from_redis("get", e))
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        guarded(self, "set", move || async move {
            let mut conn = self.conn()?;
            conn.set::<_, _, ()>(key, value)
                .await
                .map_err(|e| StoreError::from_redis("set", e))
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        guarded(self, "exists", move || async move {
            let mut conn = self.conn()?;
            conn.exists::<_, bool>(key)
                .await
                .map_err(|e| StoreError::from_redis("exists", e))
        })
        .await
    }
}
