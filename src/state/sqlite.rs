//! SQLite [`StateStore`] for single-node deployments without Redis.

use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::adapter::{guarded, Datastore};
use crate::backoff::BackoffPolicy;
use crate::error::StoreError;
use crate::{db, migrate};

use super::StateStore;

const STORE: &str = "sqlite";

fn sqlx_err(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::from_sqlx(STORE, op, e)
}

pub struct SqliteStore {
    path: PathBuf,
    policy: BackoffPolicy,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, policy: BackoffPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            pool: RwLock::new(None),
        }
    }

    fn pool(&self) -> Result<SqlitePool, StoreError> {
        let guard = self.pool.read().unwrap_or_else(|e| e.into_inner());
        guard
            .clone()
            .ok_or_else(|| StoreError::connection(STORE, "not connected"))
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    fn name(&self) -> &'static str {
        STORE
    }

    fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    async fn open(&self) -> Result<(), StoreError> {
        let pool = db::connect(&self.path).await.map_err(sqlx_err("connect"))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(sqlx_err("migrate"))?;
        let old = self
            .pool
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(pool);
        if let Some(old) = old {
            old.close().await;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.pool() {
            Ok(pool) => !pool.is_closed() && sqlx::query("SELECT 1").execute(&pool).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        let pool = self.pool.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        guarded(self, "get", move || async move {
            sqlx::query_scalar::<_, Vec<u8>>("SELECT value FROM sync_state WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool()?)
                .await
                .map_err(sqlx_err("get"))
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        guarded(self, "set", move || async move {
            let now = chrono::Utc::now().timestamp();
            sqlx::query(
                r#"
                INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&self.pool()?)
            .await
            .map_err(sqlx_err("set"))?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        guarded(self, "exists", move || async move {
            sqlx::query_scalar::<_, bool>("SELECT COUNT(*) > 0 FROM sync_state WHERE key = ?")
                .bind(key)
                .fetch_one(&self.pool()?)
                .await
                .map_err(sqlx_err("exists"))
        })
        .await
    }
}
