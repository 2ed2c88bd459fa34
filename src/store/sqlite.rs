//! SQLite-backed transactional store.
//!
//! All entities share one `meta_kv(k, v)` table. The database runs in WAL
//! mode, so a read transaction keeps the snapshot taken at its first read
//! until it ends; cursors page through their range inside that transaction
//! and therefore never observe concurrent commits.

use super::{MetaStore, RangeCursor, StoreTxn};
use crate::errors::{MetaError, MetaResult};
use crate::keys::KeyRange;
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use std::collections::VecDeque;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Rows fetched per cursor round-trip.
pub const SCAN_BATCH: i64 = 512;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the first endpoint in `endpoints` that answers a ping.
    ///
    /// Endpoints are SQLite URLs (`sqlite://path/to/meta.db`). Only existing
    /// database files are opened, so a mistyped path falls through to the
    /// next endpoint. The key/value table is created if it is missing.
    pub async fn connect(endpoints: &[String], max_connections: u32) -> MetaResult<Self> {
        Self::connect_first(endpoints, max_connections, false).await
    }

    /// Like [`SqliteStore::connect`], but creates the database file when it
    /// does not exist yet.
    pub async fn create(endpoints: &[String], max_connections: u32) -> MetaResult<Self> {
        Self::connect_first(endpoints, max_connections, true).await
    }

    async fn connect_first(
        endpoints: &[String],
        max_connections: u32,
        create: bool,
    ) -> MetaResult<Self> {
        let mut last_err = None;
        for endpoint in endpoints {
            match Self::connect_one(endpoint, max_connections, create).await {
                Ok(store) => {
                    info!(endpoint = %endpoint, "connected to metadata store");
                    return Ok(store);
                }
                Err(err) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %err,
                        "metadata store endpoint unavailable"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MetaError::InvalidAddress(endpoints.join(","))))
    }

    async fn connect_one(endpoint: &str, max_connections: u32, create: bool) -> MetaResult<Self> {
        let options = SqliteConnectOptions::from_str(endpoint)
            .map_err(|_| MetaError::InvalidAddress(endpoint.to_string()))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.ping().await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Lightweight liveness query (`SELECT 1`).
    pub async fn ping(&self) -> MetaResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        if one != 1 {
            return Err(MetaError::store(format!("unexpected ping result: {one}")));
        }
        Ok(())
    }

    /// Create the key/value table if it does not exist yet. Idempotent.
    pub async fn migrate(&self) -> MetaResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MetaStore for SqliteStore {
    type Txn = SqliteTxn;

    async fn begin(&self) -> MetaResult<SqliteTxn> {
        Ok(SqliteTxn {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct SqliteTxn {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTxn for SqliteTxn {
    type Cursor = SqliteCursor;

    async fn get(&mut self, key: &[u8]) -> MetaResult<Option<Bytes>> {
        let value = sqlx::query_scalar::<_, Vec<u8>>("SELECT v FROM meta_kv WHERE k = ?")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> MetaResult<()> {
        sqlx::query(
            "INSERT INTO meta_kv (k, v) VALUES (?, ?)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> MetaResult<()> {
        sqlx::query("DELETE FROM meta_kv WHERE k = ?")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn scan(self, range: KeyRange) -> MetaResult<SqliteCursor> {
        SqliteCursor::open(self.tx, range).await
    }

    async fn commit(self) -> MetaResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) {
        if let Err(err) = self.tx.rollback().await {
            debug!("rollback failed: {}", err);
        }
    }
}

/// Pages through `[lo, hi)` `SCAN_BATCH` rows at a time.
pub struct SqliteCursor {
    tx: Transaction<'static, Sqlite>,
    hi: Vec<u8>,
    page: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// No rows remain past the current page.
    exhausted: bool,
}

impl SqliteCursor {
    async fn open(tx: Transaction<'static, Sqlite>, range: KeyRange) -> MetaResult<Self> {
        let mut cursor = Self {
            tx,
            hi: range.hi,
            page: VecDeque::new(),
            exhausted: false,
        };
        if range.lo < cursor.hi {
            cursor.fetch_page(&range.lo, true).await?;
        } else {
            cursor.exhausted = true;
        }
        Ok(cursor)
    }

    async fn fetch_page(&mut self, lower: &[u8], inclusive: bool) -> MetaResult<()> {
        let sql = if inclusive {
            "SELECT k, v FROM meta_kv WHERE k >= ? AND k < ? ORDER BY k LIMIT ?"
        } else {
            "SELECT k, v FROM meta_kv WHERE k > ? AND k < ? ORDER BY k LIMIT ?"
        };
        let rows = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(sql)
            .bind(lower)
            .bind(self.hi.as_slice())
            .bind(SCAN_BATCH)
            .fetch_all(&mut *self.tx)
            .await?;
        self.exhausted = (rows.len() as i64) < SCAN_BATCH;
        self.page.extend(rows);
        Ok(())
    }
}

#[async_trait]
impl RangeCursor for SqliteCursor {
    fn valid(&self) -> bool {
        !self.page.is_empty()
    }

    async fn next(&mut self) -> MetaResult<()> {
        let Some((key, _)) = self.page.pop_front() else {
            return Ok(());
        };
        // The key just passed is the exclusive lower bound of the next page.
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page(&key, false).await?;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.page
            .front()
            .map(|(key, _)| key.as_slice())
            .unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.page
            .front()
            .map(|(_, value)| value.as_slice())
            .unwrap_or_default()
    }

    async fn close(self) {
        if let Err(err) = self.tx.rollback().await {
            debug!("cursor rollback failed: {}", err);
        }
    }
}
