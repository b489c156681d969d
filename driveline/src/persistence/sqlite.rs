use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{Connection, Row, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};

/// Durable tables reconciled against in-flight publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreTable {
    Events,
    Alerts,
}

impl StoreTable {
    pub fn name(self) -> &'static str {
        match self {
            StoreTable::Events => "events",
            StoreTable::Alerts => "alerts",
        }
    }
}

impl std::fmt::Display for StoreTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: i64,
    pub event_id: String,
    pub payload: String,
    pub timestamp: i64,
    pub mid: i64,
    pub stream_support: bool,
    pub batch_support: bool,
    pub topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEventRow {
    pub event_id: String,
    pub payload: String,
    pub timestamp: i64,
    pub stream_support: bool,
    pub batch_support: bool,
    pub topic: Option<String>,
}

impl NewEventRow {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Connection owner. All writes are serialized through the single connection
/// mutex; readers share it and must not span a transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<SqliteConnection>>,
    path: Arc<PathBuf>,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<SqliteStore> {
        if !path.exists() {
            log::debug!("Creating the local database file {path:?}");
            std::fs::File::create(path)
                .with_context(|| format!("Unable to create the database file {path:?}"))?;
        }

        let mut conn = SqliteConnection::connect(&path.as_os_str().to_string_lossy())
            .await
            .with_context(|| {
                format!(
                    "Unable to open SQLite in file {path:?}. Make sure the current process can \
                     read and write the file and no other process accesses it."
                )
            })?;

        log::debug!("Applying database schema");
        sqlx::query(include_str!("../../db_init.sql"))
            .execute(&mut conn)
            .await
            .context("Unable to apply the database schema")?;

        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            path: Arc::new(path.to_owned()),
        })
    }

    pub(crate) async fn connection(&self) -> MutexGuard<'_, SqliteConnection> {
        self.conn.lock().await
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(self.path.as_ref())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    // Event rows
    // ================================================================================

    pub async fn insert_row(&self, table: StoreTable, row: &NewEventRow) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let query = format!(
            "INSERT INTO {table} (event_id, payload, timestamp, stream_support, batch_support, topic) \
             VALUES (?, ?, ?, ?, ?, ?)"
        );
        let result = sqlx::query(&query)
            .bind(&row.event_id)
            .bind(&row.payload)
            .bind(row.timestamp)
            .bind(row.stream_support as i64)
            .bind(row.batch_support as i64)
            .bind(&row.topic)
            .execute(conn.deref_mut())
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Inserts a batch inside one transaction; a failure rolls the whole
    /// batch back.
    pub async fn insert_rows(&self, table: StoreTable, rows: &[NewEventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await?;
        let query = format!(
            "INSERT INTO {table} (event_id, payload, timestamp, stream_support, batch_support, topic) \
             VALUES (?, ?, ?, ?, ?, ?)"
        );
        for row in rows {
            sqlx::query(&query)
                .bind(&row.event_id)
                .bind(&row.payload)
                .bind(row.timestamp)
                .bind(row.stream_support as i64)
                .bind(row.batch_support as i64)
                .bind(&row.topic)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Rows eligible for stream upload, in insertion order. Rows with a
    /// non-zero mid are in flight and stay locked out.
    pub async fn fetch_stream_batch(&self, table: StoreTable, limit: i64) -> Result<Vec<EventRow>> {
        let mut conn = self.conn.lock().await;
        let query = format!(
            "SELECT id, event_id, payload, timestamp, mid, stream_support, batch_support, topic \
             FROM {table} WHERE mid = 0 AND stream_support = 1 ORDER BY id LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(conn.deref_mut())
            .await?;
        rows.iter().map(to_event_row).collect()
    }

    pub async fn assign_mid(&self, table: StoreTable, row_ids: &[i64], mid: i64) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let id_list = row_ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let query = format!("UPDATE {table} SET mid = ? WHERE id IN ({id_list})");
        sqlx::query(&query)
            .bind(mid)
            .execute(conn.deref_mut())
            .await?;
        Ok(())
    }

    /// Returns every row to the publishable pool. Run on each (re)connect.
    pub async fn clear_mids(&self, table: StoreTable) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let query = format!("UPDATE {table} SET mid = 0 WHERE mid != 0");
        let result = sqlx::query(&query).execute(conn.deref_mut()).await?;
        Ok(result.rows_affected())
    }

    /// Removes the rows a PUBACK settled. With batch mode enabled on the
    /// events table, rows the batch path still owns are marked uploaded
    /// (stream_support cleared) instead of deleted, inside the same
    /// transaction.
    pub async fn delete_by_mid(&self, table: StoreTable, mid: i64, batch_mode: bool) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if table == StoreTable::Events && batch_mode {
            let mut tx = conn.begin().await?;
            sqlx::query("DELETE FROM events WHERE mid = ? AND batch_support = 0")
                .bind(mid)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE events SET stream_support = 0, mid = 0 WHERE mid = ?")
                .bind(mid)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        } else {
            let query = format!("DELETE FROM {table} WHERE mid = ?");
            sqlx::query(&query)
                .bind(mid)
                .execute(conn.deref_mut())
                .await?;
        }
        Ok(())
    }

    pub async fn count(&self, table: StoreTable) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let query = format!("SELECT COUNT(id) FROM {table}");
        let count: i64 = sqlx::query_scalar(&query)
            .fetch_one(conn.deref_mut())
            .await?;
        Ok(count)
    }

    pub async fn fetch_row(&self, table: StoreTable, id: i64) -> Result<Option<EventRow>> {
        let mut conn = self.conn.lock().await;
        let query = format!(
            "SELECT id, event_id, payload, timestamp, mid, stream_support, batch_support, topic \
             FROM {table} WHERE id = ?"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(conn.deref_mut())
            .await?;
        row.as_ref().map(to_event_row).transpose()
    }

    // Purge
    // ================================================================================

    /// Granularity reduction: event ids holding more than `per_event_cap`
    /// rows are downsampled to their most recent half. In-flight rows are
    /// never purged.
    pub async fn reduce_granularity(&self, table: StoreTable, per_event_cap: i64) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let query = format!(
            "SELECT event_id, COUNT(id) AS cnt FROM {table} GROUP BY event_id HAVING cnt > ?"
        );
        let heavy = sqlx::query(&query)
            .bind(per_event_cap)
            .fetch_all(conn.deref_mut())
            .await?;

        let mut removed = 0;
        for row in heavy {
            let event_id: String = row.try_get("event_id")?;
            let count: i64 = row.try_get("cnt")?;
            let delete = format!(
                "DELETE FROM {table} WHERE id IN \
                 (SELECT id FROM {table} WHERE event_id = ? AND mid = 0 ORDER BY id LIMIT ?)"
            );
            let result = sqlx::query(&delete)
                .bind(&event_id)
                .bind(count / 2)
                .execute(conn.deref_mut())
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    pub async fn vacuum(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("VACUUM").execute(conn.deref_mut()).await?;
        Ok(())
    }

    // Settings
    // ================================================================================

    pub async fn setting_get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(conn.deref_mut())
            .await?;
        Ok(value)
    }

    pub async fn setting_set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(conn.deref_mut())
            .await?;
        Ok(())
    }

    /// Dotted-path config overrides persisted at runtime; read before any
    /// component initializes.
    pub async fn settings_all(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key")
            .fetch_all(conn.deref_mut())
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }
}

fn to_event_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRow> {
    Ok(EventRow {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        payload: row.try_get("payload")?,
        timestamp: row.try_get("timestamp")?,
        mid: row.try_get("mid")?,
        stream_support: row.try_get::<i64, _>("stream_support")? != 0,
        batch_support: row.try_get::<i64, _>("batch_support")? != 0,
        topic: row.try_get("topic")?,
    })
}
