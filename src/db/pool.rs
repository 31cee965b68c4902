//! Adapter between bb8 and the sqlx::Postgres driver.
use std::env;

use anyhow::{Context, Result};
use derive_builder::Builder;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};

use super::table::TableRef;
use crate::config::{CONNECT_TIMEOUT, PING_TIMEOUT};

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

impl std::ops::Deref for PoolConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            PoolConnection::Postgres(conn) => conn,
            #[cfg(test)]
            PoolConnection::Sqlite(_) => panic!("Cannot deref SQLite connection as PgConnection"),
        }
    }
}

impl std::ops::DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            PoolConnection::Postgres(conn) => conn,
            #[cfg(test)]
            PoolConnection::Sqlite(_) => panic!("Cannot deref SQLite connection as PgConnection"),
        }
    }
}

/// Warehouse connection settings, resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl WarehouseConfig {
    /// Resolve connection settings. Explicit values win; the environment
    /// (`WAREHOUSE_HOST`, `WAREHOUSE_PORT`, `WAREHOUSE_USER`,
    /// `WAREHOUSE_PASSWORD`, `WAREHOUSE_DATABASE`, with `.env` support)
    /// backs everything else. The password is environment-only.
    pub fn resolve(
        host: Option<String>,
        port: Option<u16>,
        username: Option<String>,
        database: Option<String>,
    ) -> Result<Self> {
        dotenvy::dotenv().ok();

        let from_env = |key: &str| {
            env::var(key).with_context(|| format!("missing environment variable {}", key))
        };

        let port = match port {
            Some(p) => p,
            None => match env::var("WAREHOUSE_PORT") {
                Ok(value) => value
                    .parse()
                    .context("WAREHOUSE_PORT must be a port number")?,
                Err(_) => 5432,
            },
        };

        Ok(Self {
            host: match host {
                Some(h) => h,
                None => from_env("WAREHOUSE_HOST")?,
            },
            port,
            username: match username {
                Some(u) => u,
                None => from_env("WAREHOUSE_USER")?,
            },
            password: from_env("WAREHOUSE_PASSWORD")?,
            database: match database {
                Some(d) => d,
                None => from_env("WAREHOUSE_DATABASE")?,
            },
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::resolve(None, None, None, None)
    }
}

// Wrap pool implementations so the rest of the crate sees one handle
// regardless of the backing driver.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    config: WarehouseConfig,
    /// Sized by the caller to the peak number of concurrent batch uploads.
    #[builder(default = "16")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> Result<Pool> {
    let PoolArgs {
        config,
        max_pool_size,
    } = args;

    let connect_options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(PgSslMode::Prefer);

    let conn_manager = ConnectionManager::new(connect_options);

    let bb8_pool = bb8::Builder::new()
        .max_size(max_pool_size)
        .build(conn_manager)
        .await
        .context("Failed to create connection pool")?;

    Ok(Pool {
        inner: PoolInner::Postgres(bb8_pool),
    })
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(|e| match e {
                    bb8::RunError::User(e) => e,
                    bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
                })?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Check if this pool is using PostgreSQL (returns false for SQLite)
    pub fn is_postgres(&self) -> bool {
        matches!(&self.inner, PoolInner::Postgres(_))
    }

    /// Render the destination table for SQL statements. Postgres gets the
    /// fully-qualified quoted form; SQLite has no database/schema prefix, so
    /// tests address the bare table name.
    pub fn table_target(&self, table: &TableRef) -> String {
        match &self.inner {
            PoolInner::Postgres(_) => table.qualified(),
            #[cfg(test)]
            PoolInner::Sqlite(_) => table.table.clone(),
        }
    }
}

// Wrap the connect options so that we can implement the bb8::ManageConnection trait.
pub struct ConnectionManager {
    connect_options: PgConnectOptions,
}

impl ConnectionManager {
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self { connect_options }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}
