//! PostgreSQL collaborators.
//!
//! The invalidation table lives in the application database and peers talk
//! through `LISTEN`/`NOTIFY` on a single channel. Every subscription opens its
//! own connection since a listening session cannot run other statements
//! while it blocks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};
use trellis_core::{BackendError, Timestamp, TrellisError, TrellisResult};

use super::{
    ChannelListener, Database, InvalidationRecord, InvalidationTable, NotificationChannel,
    INVALIDATION_TABLE,
};

/// Channel every process of a database listens on.
pub const NOTIFY_CHANNEL: &str = "trellis_cache";

/// Module states that count as activated.
pub const DEFAULT_MODULES_QUERY: &str =
    "SELECT name FROM ir_module WHERE state IN ('activated', 'to upgrade', 'to remove')";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Connection settings for the PostgreSQL collaborators.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Connection timeout
    pub timeout: Duration,
    /// Use `INSERT ... ON CONFLICT`; off for servers older than 9.5.
    pub upsert: bool,
    /// Query returning the activated module names.
    pub modules_query: String,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "trellis".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            timeout: Duration::from_secs(30),
            upsert: true,
            modules_query: DEFAULT_MODULES_QUERY.to_string(),
        }
    }
}

impl PgConfig {
    /// Create a configuration from `TRELLIS_DB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("TRELLIS_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("TRELLIS_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("TRELLIS_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("TRELLIS_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("TRELLIS_DB_PASSWORD").unwrap_or_default(),
            timeout: std::env::var("TRELLIS_DB_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            upsert: defaults.upsert,
            modules_query: defaults.modules_query,
        }
    }

    pub fn with_dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = dbname.into();
        self
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn with_modules_query(mut self, query: impl Into<String>) -> Self {
        self.modules_query = query.into();
        self
    }

    fn client_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .connect_timeout(self.timeout)
            .application_name("trellis-cache");
        config
    }

    fn connect(&self) -> TrellisResult<Client> {
        self.client_config()
            .connect(NoTls)
            .map_err(|e| connection_error(&self.dbname, e))
    }
}

fn connection_error(database: &str, e: postgres::Error) -> TrellisError {
    BackendError::ConnectionFailed {
        database: database.to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn table_error(database: &str, e: postgres::Error) -> TrellisError {
    BackendError::TableFailed {
        database: database.to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn channel_error(database: &str, e: postgres::Error) -> TrellisError {
    BackendError::ChannelFailed {
        database: database.to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         name TEXT PRIMARY KEY, \
         timestamp TIMESTAMPTZ NOT NULL)",
        table = INVALIDATION_TABLE
    )
}

fn upsert_sql() -> String {
    format!(
        "INSERT INTO {table} (name, timestamp) VALUES ($1, CURRENT_TIMESTAMP) \
         ON CONFLICT (name) DO UPDATE \
         SET timestamp = GREATEST({table}.timestamp, EXCLUDED.timestamp) \
         RETURNING timestamp",
        table = INVALIDATION_TABLE
    )
}

// ============================================================================
// DATABASE
// ============================================================================

/// A PostgreSQL database with the invalidation table and a notify channel.
pub struct PostgresDatabase {
    name: String,
    table: PostgresTable,
    channel: Arc<PostgresChannel>,
    modules_query: String,
}

impl PostgresDatabase {
    /// Connect and create the invalidation table if missing.
    pub fn connect(config: PgConfig) -> TrellisResult<Self> {
        let mut client = config.connect()?;
        client
            .batch_execute(&create_table_sql())
            .map_err(|e| table_error(&config.dbname, e))?;
        tracing::debug!(
            database = %config.dbname,
            host = %config.host,
            "Connected cache invalidation table"
        );

        let client = Arc::new(Mutex::new(client));
        Ok(Self {
            name: config.dbname.clone(),
            table: PostgresTable {
                database: config.dbname.clone(),
                client: Arc::clone(&client),
                upsert: config.upsert,
            },
            channel: Arc::new(PostgresChannel {
                database: config.dbname.clone(),
                client,
                config: config.clone(),
            }),
            modules_query: config.modules_query,
        })
    }
}

impl Database for PostgresDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &dyn InvalidationTable {
        &self.table
    }

    fn channel(&self) -> Option<Arc<dyn NotificationChannel>> {
        Some(Arc::clone(&self.channel) as Arc<dyn NotificationChannel>)
    }

    fn active_modules(&self) -> TrellisResult<Vec<String>> {
        let rows = self
            .table
            .client
            .lock()
            .query(self.modules_query.as_str(), &[])
            .map_err(|e| connection_error(&self.name, e))?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| connection_error(&self.name, e))
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// The `cache_invalidation` table, stamped with the server's clock.
pub struct PostgresTable {
    database: String,
    client: Arc<Mutex<Client>>,
    upsert: bool,
}

impl PostgresTable {
    fn timestamp(&self, sql: &str, name: &str) -> TrellisResult<Timestamp> {
        let row = self
            .client
            .lock()
            .query_one(sql, &[&name])
            .map_err(|e| table_error(&self.database, e))?;
        row.try_get::<_, Timestamp>(0)
            .map_err(|e| table_error(&self.database, e))
    }
}

impl InvalidationTable for PostgresTable {
    fn supports_upsert(&self) -> bool {
        self.upsert
    }

    fn upsert(&self, name: &str) -> TrellisResult<Timestamp> {
        self.timestamp(&upsert_sql(), name)
    }

    fn select(&self, name: &str) -> TrellisResult<Option<Timestamp>> {
        let sql = format!("SELECT timestamp FROM {} WHERE name = $1", INVALIDATION_TABLE);
        let row = self
            .client
            .lock()
            .query_opt(sql.as_str(), &[&name])
            .map_err(|e| table_error(&self.database, e))?;
        row.map(|row| row.try_get::<_, Timestamp>(0))
            .transpose()
            .map_err(|e| table_error(&self.database, e))
    }

    fn insert(&self, name: &str) -> TrellisResult<Timestamp> {
        let sql = format!(
            "INSERT INTO {} (name, timestamp) VALUES ($1, CURRENT_TIMESTAMP) RETURNING timestamp",
            INVALIDATION_TABLE
        );
        self.timestamp(&sql, name)
    }

    fn update(&self, name: &str) -> TrellisResult<Timestamp> {
        let sql = format!(
            "UPDATE {} SET timestamp = CURRENT_TIMESTAMP WHERE name = $1 RETURNING timestamp",
            INVALIDATION_TABLE
        );
        self.timestamp(&sql, name)
    }

    fn select_all(&self) -> TrellisResult<Vec<InvalidationRecord>> {
        let sql = format!("SELECT name, timestamp FROM {}", INVALIDATION_TABLE);
        let rows = self
            .client
            .lock()
            .query(sql.as_str(), &[])
            .map_err(|e| table_error(&self.database, e))?;
        rows.iter()
            .map(|row| {
                Ok(InvalidationRecord {
                    name: row.try_get(0)?,
                    timestamp: row.try_get(1)?,
                })
            })
            .collect::<Result<Vec<_>, postgres::Error>>()
            .map_err(|e| table_error(&self.database, e))
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// `NOTIFY` publisher; subscriptions get a dedicated connection.
pub struct PostgresChannel {
    database: String,
    client: Arc<Mutex<Client>>,
    config: PgConfig,
}

impl NotificationChannel for PostgresChannel {
    fn publish(&self, payload: &str) -> TrellisResult<()> {
        self.client
            .lock()
            .execute("SELECT pg_notify($1, $2)", &[&NOTIFY_CHANNEL, &payload])
            .map_err(|e| channel_error(&self.database, e))?;
        Ok(())
    }

    fn listen(&self) -> TrellisResult<Box<dyn ChannelListener>> {
        let mut client = self.config.connect()?;
        client
            .batch_execute(&format!("LISTEN {}", NOTIFY_CHANNEL))
            .map_err(|e| channel_error(&self.database, e))?;
        Ok(Box::new(PostgresListener {
            database: self.database.clone(),
            client,
        }))
    }
}

struct PostgresListener {
    database: String,
    client: Client,
}

impl ChannelListener for PostgresListener {
    fn wait(&mut self, timeout: Duration) -> TrellisResult<Vec<String>> {
        let mut notifications = self.client.notifications();
        let first = notifications
            .timeout_iter(timeout)
            .next()
            .map_err(|e| channel_error(&self.database, e))?;
        let Some(first) = first else {
            return Ok(Vec::new());
        };

        let mut payloads = vec![first.payload().to_string()];
        let mut pending = notifications.iter();
        while let Some(notification) = pending
            .next()
            .map_err(|e| channel_error(&self.database, e))?
        {
            payloads.push(notification.payload().to_string());
        }
        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PgConfig::default()
            .with_dbname("erp")
            .with_upsert(false)
            .with_modules_query("SELECT 'ir'");
        assert_eq!(config.dbname, "erp");
        assert_eq!(config.port, 5432);
        assert!(!config.upsert);
        assert_eq!(config.modules_query, "SELECT 'ir'");
        assert!(PgConfig::default().modules_query.contains("ir_module"));
    }

    #[test]
    fn test_upsert_keeps_greatest_timestamp() {
        let sql = upsert_sql();
        assert!(sql.starts_with("INSERT INTO cache_invalidation"));
        assert!(sql.contains("ON CONFLICT (name)"));
        assert!(sql.contains("GREATEST(cache_invalidation.timestamp, EXCLUDED.timestamp)"));
        assert!(sql.ends_with("RETURNING timestamp"));
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql();
        assert!(sql.contains("IF NOT EXISTS cache_invalidation"));
        assert!(sql.contains("name TEXT PRIMARY KEY"));
    }

    #[test]
    fn test_unreachable_server_is_a_connection_error() {
        let config = PgConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout: Duration::from_secs(2),
            ..PgConfig::default()
        };
        match PostgresDatabase::connect(config) {
            Err(TrellisError::Backend(BackendError::ConnectionFailed { database, .. })) => {
                assert_eq!(database, "trellis");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to port 1"),
        }
    }
}
