//! PostgreSQL source over sqlx.
//!
//! Change extraction runs through a server-side cursor declared inside a
//! read-only transaction, so a pass over a large table never materialises
//! more than one batch client-side. The [`PgCursor`] owns its transaction:
//! dropping it without [`PgCursor::close`] rolls the transaction back and the
//! server frees the cursor.
//!
//! Cursor statements go over the simple query protocol, which has no bind
//! parameters, so [`SqlParam`] values are rendered as typed literals.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Row, Transaction};
use uuid::Uuid;

use search_sync_core::models::{
    ChangeRecord, DocumentKind, FilmCredit, FilmworkRow, GenreRef, GenreRow, PersonCredit,
    PersonRow, SourceRow,
};

use crate::adapter::{guarded, Datastore};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::StoreError;

use super::{ChangeFeed, ChangeStream};

const STORE: &str = "postgres";

static CURSOR_SEQ: AtomicU64 = AtomicU64::new(0);

fn sqlx_err(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::from_sqlx(STORE, op, e)
}

/// A value substituted for `$n` in a cursor query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    UuidList(Vec<Uuid>),
    Int(i64),
}

impl SqlParam {
    fn literal(&self) -> String {
        match self {
            SqlParam::Timestamp(ts) => format!(
                "'{}'::timestamptz",
                ts.to_rfc3339_opts(SecondsFormat::Micros, true)
            ),
            SqlParam::Uuid(id) => format!("'{id}'::uuid"),
            SqlParam::UuidList(ids) => {
                let items: Vec<String> = ids.iter().map(|id| format!("'{id}'")).collect();
                format!("ARRAY[{}]::uuid[]", items.join(","))
            }
            SqlParam::Int(n) => n.to_string(),
        }
    }
}

/// Substitute `$1..$n` in `query` with the literals of `params`.
pub fn render_query(query: &str, params: &[SqlParam]) -> Result<String, StoreError> {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' || !chars.peek().is_some_and(|d| d.is_ascii_digit()) {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().copied().filter(|d| d.is_ascii_digit()) {
            digits.push(d);
            chars.next();
        }
        let index: usize = digits.parse().unwrap_or(0);
        let param = index
            .checked_sub(1)
            .and_then(|i| params.get(i))
            .ok_or_else(|| {
                StoreError::fatal(
                    STORE,
                    "render",
                    format!("placeholder ${index} has no parameter ({} given)", params.len()),
                )
            })?;
        out.push_str(&param.literal());
    }
    Ok(out)
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A server-side cursor inside its own read-only transaction.
pub struct PgCursor {
    tx: Transaction<'static, Postgres>,
    name: String,
    declared: bool,
}

impl PgCursor {
    /// (Re)declare the cursor for `query`.
    pub async fn execute(&mut self, query: &str, params: &[SqlParam]) -> Result<(), StoreError> {
        let sql = render_query(query, params)?;
        let conn: &mut PgConnection = &mut self.tx;
        if self.declared {
            let close = format!("CLOSE {}", self.name);
            conn.execute(sqlx::raw_sql(&close))
                .await
                .map_err(sqlx_err("close_cursor"))?;
            self.declared = false;
        }
        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {sql}", self.name);
        tracing::debug!(cursor = %self.name, sql = %declare, "declare cursor");
        conn.execute(sqlx::raw_sql(&declare))
            .await
            .map_err(sqlx_err("declare_cursor"))?;
        self.declared = true;
        Ok(())
    }

    /// Up to `n` more rows.
    pub async fn fetch_many(&mut self, n: usize) -> Result<Vec<PgRow>, StoreError> {
        if !self.declared {
            return Err(StoreError::fatal(STORE, "fetch", "cursor has no query"));
        }
        let conn: &mut PgConnection = &mut self.tx;
        let fetch = format!("FETCH FORWARD {n} FROM {}", self.name);
        conn.fetch_all(sqlx::raw_sql(&fetch))
            .await
            .map_err(sqlx_err("fetch"))
    }

    /// Close the cursor and end its transaction.
    pub async fn close(mut self) -> Result<(), StoreError> {
        if self.declared {
            let conn: &mut PgConnection = &mut self.tx;
            let close = format!("CLOSE {}", self.name);
            conn.execute(sqlx::raw_sql(&close))
                .await
                .map_err(sqlx_err("close_cursor"))?;
        }
        self.tx.commit().await.map_err(sqlx_err("commit"))
    }
}

struct Inner {
    dsn: String,
    schema: String,
    pool_size: u32,
    acquire_timeout: Duration,
    policy: BackoffPolicy,
    pool: RwLock<Option<PgPool>>,
    opens: AtomicU32,
}

/// PostgreSQL [`ChangeFeed`]. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct PostgresSource {
    inner: Arc<Inner>,
}

impl PostgresSource {
    pub fn new(
        dsn: impl Into<String>,
        schema: impl Into<String>,
        pool_size: u32,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dsn: dsn.into(),
                schema: schema.into(),
                pool_size: pool_size.max(1),
                acquire_timeout: Duration::from_secs(10),
                policy,
                pool: RwLock::new(None),
                opens: AtomicU32::new(0),
            }),
        }
    }

    /// How long one connection attempt waits for the server.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.acquire_timeout = timeout;
        }
        self
    }

    /// Connection attempts made so far.
    pub fn open_attempts(&self) -> u32 {
        self.inner.opens.load(Ordering::Relaxed)
    }

    fn pool(&self) -> Result<PgPool, StoreError> {
        let guard = self.inner.pool.read().unwrap_or_else(|e| e.into_inner());
        guard
            .clone()
            .ok_or_else(|| StoreError::connection(STORE, "not connected"))
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.inner.schema), quote_ident(name))
    }

    /// Start a read-only transaction holding a fresh, undeclared cursor.
    pub async fn cursor(&self) -> Result<PgCursor, StoreError> {
        guarded(self, "cursor", move || self.begin_cursor()).await
    }

    /// Single attempt at [`Self::cursor`], for callers that retry themselves.
    async fn begin_cursor(&self) -> Result<PgCursor, StoreError> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await.map_err(sqlx_err("begin"))?;
        tx.execute(sqlx::raw_sql("SET TRANSACTION READ ONLY"))
            .await
            .map_err(sqlx_err("begin"))?;
        let seq = CURSOR_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(PgCursor {
            tx,
            name: format!("ssync_cursor_{seq}"),
            declared: false,
        })
    }

    fn changes_query(&self, table: &str) -> String {
        format!(
            "SELECT id, updated_at FROM {} WHERE (updated_at, id) > ($1, $2) ORDER BY updated_at, id",
            self.table(table)
        )
    }

    fn filmworks_query(&self) -> String {
        format!(
            r#"
            SELECT fw.id, fw.title, fw.description, fw.rating::text AS rating, fw.type::text AS kind,
                COALESCE(json_agg(DISTINCT jsonb_build_object('id', g.id, 'name', g.name))
                    FILTER (WHERE g.id IS NOT NULL), '[]') AS genres,
                COALESCE(json_agg(DISTINCT jsonb_build_object('id', p.id, 'name', p.full_name, 'role', pfw.role))
                    FILTER (WHERE p.id IS NOT NULL), '[]') AS persons
            FROM {fw} fw
            LEFT JOIN {gfw} gfw ON gfw.film_work_id = fw.id
            LEFT JOIN {g} g ON g.id = gfw.genre_id
            LEFT JOIN {pfw} pfw ON pfw.film_work_id = fw.id
            LEFT JOIN {p} p ON p.id = pfw.person_id
            WHERE fw.id = ANY($1)
            GROUP BY fw.id
            "#,
            fw = self.table("film_work"),
            gfw = self.table("genre_film_work"),
            g = self.table("genre"),
            pfw = self.table("person_film_work"),
            p = self.table("person"),
        )
    }

    fn genres_query(&self) -> String {
        format!(
            "SELECT id, name, description FROM {} WHERE id = ANY($1)",
            self.table("genre")
        )
    }

    fn persons_query(&self) -> String {
        format!(
            r#"
            SELECT p.id, p.full_name,
                COALESCE(json_agg(DISTINCT jsonb_build_object('film_id', fw.id, 'title', fw.title, 'role', pfw.role))
                    FILTER (WHERE fw.id IS NOT NULL), '[]') AS credits
            FROM {p} p
            LEFT JOIN {pfw} pfw ON pfw.person_id = p.id
            LEFT JOIN {fw} fw ON fw.id = pfw.film_work_id
            WHERE p.id = ANY($1)
            GROUP BY p.id
            "#,
            p = self.table("person"),
            pfw = self.table("person_film_work"),
            fw = self.table("film_work"),
        )
    }

    async fn fetch_ids(&self, op: &'static str, sql: &str, ids: &[Uuid]) -> Result<Vec<Uuid>, StoreError> {
        guarded(self, op, move || async move {
            let pool = self.pool()?;
            let rows = sqlx::query(sql)
                .bind(ids)
                .fetch_all(&pool)
                .await
                .map_err(sqlx_err(op))?;
            rows.iter()
                .map(|r| r.try_get::<Uuid, _>(0).map_err(sqlx_err(op)))
                .collect()
        })
        .await
    }
}

fn filmwork_row(row: &PgRow) -> Result<SourceRow, sqlx::Error> {
    Ok(SourceRow::Filmwork(FilmworkRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        rating: row.try_get("rating")?,
        kind: row.try_get("kind")?,
        genres: row.try_get::<Json<Vec<GenreRef>>, _>("genres")?.0,
        persons: row.try_get::<Json<Vec<PersonCredit>>, _>("persons")?.0,
    }))
}

fn genre_row(row: &PgRow) -> Result<SourceRow, sqlx::Error> {
    Ok(SourceRow::Genre(GenreRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
    }))
}

fn person_row(row: &PgRow) -> Result<SourceRow, sqlx::Error> {
    Ok(SourceRow::Person(PersonRow {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        credits: row.try_get::<Json<Vec<FilmCredit>>, _>("credits")?.0,
    }))
}

#[async_trait]
impl Datastore for PostgresSource {
    fn name(&self) -> &'static str {
        STORE
    }

    fn policy(&self) -> &BackoffPolicy {
        &self.inner.policy
    }

    async fn open(&self) -> Result<(), StoreError> {
        self.inner.opens.fetch_add(1, Ordering::Relaxed);
        let pool = PgPoolOptions::new()
            .max_connections(self.inner.pool_size)
            .acquire_timeout(self.inner.acquire_timeout)
            .connect(&self.inner.dsn)
            .await
            .map_err(sqlx_err("connect"))?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(sqlx_err("connect"))?;
        let old = {
            let mut guard = self.inner.pool.write().unwrap_or_else(|e| e.into_inner());
            guard.replace(pool)
        };
        if let Some(old) = old {
            old.close().await;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let Ok(pool) = self.pool() else {
            return false;
        };
        !pool.is_closed() && sqlx::query("SELECT 1").execute(&pool).await.is_ok()
    }

    async fn close(&self) {
        let pool = {
            let mut guard = self.inner.pool.write().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(store = STORE, "pool closed");
        }
    }
}

#[async_trait]
impl ChangeFeed for PostgresSource {
    async fn open_changes(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Box<dyn ChangeStream>, StoreError> {
        let stream = PgChangeStream {
            source: self.clone(),
            query: self.changes_query(table),
            position: (since, Uuid::from_u128(u128::MAX)),
            cursor: None,
        };
        Ok(Box::new(stream))
    }

    async fn related_roots(
        &self,
        junction: &str,
        related_column: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT {root} FROM {table} WHERE {related} = ANY($1) ORDER BY {root}",
            root = quote_ident(root_column),
            table = self.table(junction),
            related = quote_ident(related_column),
        );
        self.fetch_ids("related_roots", &sql, ids).await
    }

    async fn junction_roots(
        &self,
        junction: &str,
        root_column: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT {root} FROM {table} WHERE id = ANY($1) ORDER BY {root}",
            root = quote_ident(root_column),
            table = self.table(junction),
        );
        self.fetch_ids("junction_roots", &sql, ids).await
    }

    async fn load_rows(
        &self,
        kind: DocumentKind,
        ids: &[Uuid],
    ) -> Result<Vec<SourceRow>, StoreError> {
        let (sql, map): (String, fn(&PgRow) -> Result<SourceRow, sqlx::Error>) = match kind {
            DocumentKind::Movie => (self.filmworks_query(), filmwork_row),
            DocumentKind::Genre => (self.genres_query(), genre_row),
            DocumentKind::Person => (self.persons_query(), person_row),
        };
        let sql = sql.as_str();
        guarded(self, "load_rows", move || async move {
            let pool = self.pool()?;
            let rows = sqlx::query(sql)
                .bind(ids)
                .fetch_all(&pool)
                .await
                .map_err(sqlx_err("load_rows"))?;
            rows.iter()
                .map(|r| map(r).map_err(sqlx_err("load_rows")))
                .collect()
        })
        .await
    }
}

/// Keyset-resumable change stream.
///
/// Tracks the `(updated_at, id)` of the last delivered row. When a fetch
/// fails transiently the cursor is dropped and re-declared from that
/// position, so no row is delivered twice and none is skipped.
struct PgChangeStream {
    source: PostgresSource,
    query: String,
    position: (DateTime<Utc>, Uuid),
    cursor: Option<PgCursor>,
}

impl PgChangeStream {
    /// One attempt; [`ChangeStream::next_batch`] owns the retry loop.
    async fn declare(&mut self) -> Result<(), StoreError> {
        self.source.reconnect().await?;
        let mut cursor = self.source.begin_cursor().await?;
        let params = [
            SqlParam::Timestamp(self.position.0),
            SqlParam::Uuid(self.position.1),
        ];
        cursor.execute(&self.query, &params).await?;
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn try_fetch(&mut self, size: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        if self.cursor.is_none() {
            self.declare().await?;
        }
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(StoreError::connection(STORE, "cursor unavailable"));
        };
        let rows = cursor.fetch_many(size).await?;
        let records = rows
            .iter()
            .map(|r| {
                Ok(ChangeRecord::new(
                    r.try_get("id").map_err(sqlx_err("fetch"))?,
                    r.try_get("updated_at").map_err(sqlx_err("fetch"))?,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        if let Some(last) = records.last() {
            self.position = (last.updated_at, last.id);
        }
        Ok(records)
    }
}

#[async_trait]
impl ChangeStream for PgChangeStream {
    async fn next_batch(&mut self, size: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        let policy = self.source.inner.policy.clone();
        let mut backoff = Backoff::new(&policy, "fetch_changes");
        loop {
            match self.try_fetch(size).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    // The transaction is unusable after an error; start over
                    // from the last delivered position.
                    self.cursor = None;
                    match backoff.next_delay(&e) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(e),
                    }
                }
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        match self.cursor {
            Some(cursor) => cursor.close().await,
            None => Ok(()),
        }
    }
}
