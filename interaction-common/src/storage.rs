//! # Storage
//!
//! Persistence of interaction records and the per-user retention sweep, on top of a typed
//! `sqlx` pool for SQLite or MySQL.
//!
//! Every timestamp crosses this boundary as UTC epoch milliseconds, so comparisons never
//! depend on the backend or on the timezone of the host.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::event::{DnsInteraction, HttpInteraction, InteractionRecord};
use crate::kv::UserProfile;

/// Enumeration of errors for operations with InteractionStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} is not a supported storage backend")]
    UnsupportedBackend(String),
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("stored timestamp {0} is out of range")]
    CorruptTimestamp(i64),
}

impl StorageError {
    /// The underlying sqlx error, if any. Callers feed this to a `ClassifierRegistry`.
    pub fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            StorageError::ConnectionError { error } => Some(error),
            StorageError::QueryError { error, .. } => Some(error),
            StorageError::UnsupportedBackend(_) | StorageError::CorruptTimestamp(_) => None,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Supported database backends.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Backend {
    Sqlite,
    MySql,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::MySql => "mysql",
        }
    }

    fn schema(&self) -> &'static [&'static str] {
        match self {
            Backend::Sqlite => SQLITE_SCHEMA,
            Backend::MySql => MYSQL_SCHEMA,
        }
    }
}

impl FromStr for Backend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "sqlite" | "sqlite3" => Ok(Backend::Sqlite),
            "mysql" => Ok(Backend::MySql),
            invalid => Err(StorageError::UnsupportedBackend(invalid.to_owned())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    retention_interval_secs INTEGER NOT NULL DEFAULT 7200
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS dns_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    domain TEXT NOT NULL,
    ip TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
    "#,
    "CREATE INDEX IF NOT EXISTS dns_interactions_user_created ON dns_interactions (user_id, created_at)",
    r#"
CREATE TABLE IF NOT EXISTS http_interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    ip TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    body TEXT NOT NULL,
    content_type TEXT NOT NULL,
    method TEXT NOT NULL,
    created_at INTEGER NOT NULL
)
    "#,
    "CREATE INDEX IF NOT EXISTS http_interactions_user_created ON http_interactions (user_id, created_at)",
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGINT NOT NULL PRIMARY KEY,
    retention_interval_secs BIGINT NOT NULL DEFAULT 7200
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS dns_interactions (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    user_id BIGINT NOT NULL,
    domain VARCHAR(255) NOT NULL,
    ip VARCHAR(64) NOT NULL,
    created_at BIGINT NOT NULL,
    INDEX dns_interactions_user_created (user_id, created_at)
)
    "#,
    r#"
CREATE TABLE IF NOT EXISTS http_interactions (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    user_id BIGINT NOT NULL,
    url TEXT NOT NULL,
    ip VARCHAR(64) NOT NULL,
    user_agent TEXT NOT NULL,
    body MEDIUMTEXT NOT NULL,
    content_type VARCHAR(255) NOT NULL,
    method VARCHAR(16) NOT NULL,
    created_at BIGINT NOT NULL,
    INDEX http_interactions_user_created (user_id, created_at)
)
    "#,
];

fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(StorageError::CorruptTimestamp(millis))
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StorageError + '_ {
    move |error| StorageError::QueryError {
        command: command.to_owned(),
        error,
    }
}

#[derive(Clone, Debug)]
enum Pool {
    Sqlite(SqlitePool),
    MySql(MySqlPool),
}

enum Connection {
    Sqlite(PoolConnection<Sqlite>),
    MySql(PoolConnection<MySql>),
}

/// Run `$body` with `$conn` bound to the session's connection, whichever backend it is.
/// Each backend gets its own typed copy of the statement, so integers decode as the
/// column's full 64 bits.
macro_rules! with_connection {
    ($session:expr, |$conn:ident| $body:expr) => {
        match &mut $session.connection {
            Connection::Sqlite(connection) => {
                let $conn = &mut **connection;
                $body
            }
            Connection::MySql(connection) => {
                let $conn = &mut **connection;
                $body
            }
        }
    };
}

/// Interaction storage backed by a connection pool.
/// Cloning is cheap: clones share the same pool.
#[derive(Clone, Debug)]
pub struct InteractionStore {
    backend: Backend,
    pool: Pool,
}

impl InteractionStore {
    /// Connect a new pool to the database at `url`.
    pub async fn connect(backend: Backend, url: &str, max_connections: u32) -> StorageResult<Self> {
        let connection_error = |error| StorageError::ConnectionError { error };

        let pool = match backend {
            Backend::Sqlite => Pool::Sqlite(
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await
                    .map_err(connection_error)?,
            ),
            Backend::MySql => Pool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url)
                    .await
                    .map_err(connection_error)?,
            ),
        };

        Ok(Self { backend, pool })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Create the tables this crate reads and writes, if they don't exist yet.
    pub async fn migrate(&self) -> StorageResult<()> {
        for statement in self.backend.schema() {
            match &self.pool {
                Pool::Sqlite(pool) => sqlx::query(statement).execute(pool).await.map(|_| ()),
                Pool::MySql(pool) => sqlx::query(statement).execute(pool).await.map(|_| ()),
            }
            .map_err(query_error("CREATE"))?;
        }

        Ok(())
    }

    /// Check out a dedicated connection. It goes back to the pool when the `Session` is dropped.
    pub async fn session(&self) -> StorageResult<Session> {
        let connection_error = |error| StorageError::ConnectionError { error };

        let connection = match &self.pool {
            Pool::Sqlite(pool) => Connection::Sqlite(pool.acquire().await.map_err(connection_error)?),
            Pool::MySql(pool) => Connection::MySql(pool.acquire().await.map_err(connection_error)?),
        };

        Ok(Session { connection })
    }

    /// Close every connection in the pool, waiting for checked out sessions to be returned.
    pub async fn close(&self) {
        match &self.pool {
            Pool::Sqlite(pool) => pool.close().await,
            Pool::MySql(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.pool {
            Pool::Sqlite(pool) => pool.is_closed(),
            Pool::MySql(pool) => pool.is_closed(),
        }
    }
}

/// A single database connection with all the statements the pipeline runs.
pub struct Session {
    connection: Connection,
}

impl Session {
    /// Persist a single interaction record.
    pub async fn insert(&mut self, record: &InteractionRecord) -> StorageResult<()> {
        match record {
            InteractionRecord::Dns(dns) => with_connection!(self, |connection| {
                sqlx::query(
                    r#"
INSERT INTO dns_interactions
    (user_id, domain, ip, created_at)
VALUES
    (?, ?, ?, ?)
                    "#,
                )
                .bind(dns.user_id)
                .bind(&dns.domain)
                .bind(&dns.ip)
                .bind(to_millis(dns.created_at))
                .execute(connection)
                .await
                .map(|_| ())
            }),
            InteractionRecord::Http(http) => with_connection!(self, |connection| {
                sqlx::query(
                    r#"
INSERT INTO http_interactions
    (user_id, url, ip, user_agent, body, content_type, method, created_at)
VALUES
    (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(http.user_id)
                .bind(&http.url)
                .bind(&http.ip)
                .bind(&http.user_agent)
                .bind(&http.body)
                .bind(&http.content_type)
                .bind(&http.method)
                .bind(to_millis(http.created_at))
                .execute(connection)
                .await
                .map(|_| ())
            }),
        }
        .map_err(query_error("INSERT"))
    }

    pub async fn insert_user(&mut self, profile: &UserProfile) -> StorageResult<()> {
        with_connection!(self, |connection| {
            sqlx::query("INSERT INTO users (id, retention_interval_secs) VALUES (?, ?)")
                .bind(profile.id)
                .bind(profile.retention_interval_secs)
                .execute(connection)
                .await
                .map(|_| ())
        })
        .map_err(query_error("INSERT"))
    }

    pub async fn user_ids(&mut self) -> StorageResult<Vec<i64>> {
        with_connection!(self, |connection| {
            sqlx::query_scalar::<_, i64>("SELECT id FROM users ORDER BY id")
                .fetch_all(connection)
                .await
        })
        .map_err(query_error("SELECT"))
    }

    /// Read a user's retention interval straight from the users table.
    pub async fn user_retention(&mut self, user_id: i64) -> StorageResult<Option<i64>> {
        with_connection!(self, |connection| {
            sqlx::query_scalar::<_, i64>("SELECT retention_interval_secs FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(connection)
                .await
        })
        .map_err(query_error("SELECT"))
    }

    /// Delete every DNS and HTTP interaction of `user_id` created strictly before `cutoff`.
    /// Returns the number of records removed.
    pub async fn delete_expired(
        &mut self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let cutoff = to_millis(cutoff);
        let mut deleted = 0;

        for statement in [
            "DELETE FROM dns_interactions WHERE user_id = ? AND created_at < ?",
            "DELETE FROM http_interactions WHERE user_id = ? AND created_at < ?",
        ] {
            deleted += with_connection!(self, |connection| {
                sqlx::query(statement)
                    .bind(user_id)
                    .bind(cutoff)
                    .execute(connection)
                    .await
                    .map(|result| result.rows_affected())
            })
            .map_err(query_error("DELETE"))?;
        }

        Ok(deleted)
    }

    /// Oldest-first DNS interactions of a user.
    pub async fn dns_interactions(
        &mut self,
        user_id: i64,
        limit: i64,
    ) -> StorageResult<Vec<DnsInteraction>> {
        let query = r#"
SELECT user_id, domain, ip, created_at
FROM dns_interactions
WHERE user_id = ?
ORDER BY id
LIMIT ?
        "#;
        let rows: Vec<(i64, String, String, i64)> = with_connection!(self, |connection| {
            sqlx::query_as(query)
                .bind(user_id)
                .bind(limit)
                .fetch_all(connection)
                .await
        })
        .map_err(query_error("SELECT"))?;

        rows.into_iter()
            .map(|(user_id, domain, ip, created_at)| -> StorageResult<DnsInteraction> {
                Ok(DnsInteraction {
                    user_id,
                    domain,
                    ip,
                    created_at: from_millis(created_at)?,
                    callback: None,
                })
            })
            .collect()
    }

    /// Oldest-first HTTP interactions of a user.
    pub async fn http_interactions(
        &mut self,
        user_id: i64,
        limit: i64,
    ) -> StorageResult<Vec<HttpInteraction>> {
        let query = r#"
SELECT user_id, url, ip, user_agent, body, content_type, method, created_at
FROM http_interactions
WHERE user_id = ?
ORDER BY id
LIMIT ?
        "#;
        let rows: Vec<HttpRow> = with_connection!(self, |connection| {
            sqlx::query_as(query)
                .bind(user_id)
                .bind(limit)
                .fetch_all(connection)
                .await
        })
        .map_err(query_error("SELECT"))?;

        rows.into_iter()
            .map(
                |(user_id, url, ip, user_agent, body, content_type, method, created_at)|
                 -> StorageResult<HttpInteraction> {
                    Ok(HttpInteraction {
                        user_id,
                        url,
                        ip,
                        user_agent,
                        body,
                        content_type,
                        method,
                        created_at: from_millis(created_at)?,
                        callback: None,
                    })
                },
            )
            .collect()
    }
}

type HttpRow = (i64, String, String, String, String, String, String, i64);
