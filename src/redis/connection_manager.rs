use std::{
    fmt,
    future::Future,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_channel::{Receiver, Sender};
use redis::{
    Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{AdmissionError, RetryConfig, with_retry};

/// Connection settings for [`RedisConnectionManager`].
///
/// # Examples
///
/// ```ignore
/// use llm_admission::redis::RedisConnectionOptions;
///
/// let options = RedisConnectionOptions {
///     host: "redis.internal".to_string(),
///     max_connections: 4,
///     ..RedisConnectionOptions::default()
/// };
///
/// // or
/// let options = RedisConnectionOptions::from_url("redis://:secret@redis.internal:6379/2")?;
/// ```
#[derive(Clone, Debug)]
pub struct RedisConnectionOptions {
    /// Redis host name or address.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Logical database index.
    pub db: i64,
    /// ACL user name, if any.
    pub username: Option<String>,
    /// Password, if any.
    pub password: Option<String>,
    /// Upper bound on pooled connections. Must be > 0.
    pub max_connections: usize,
    /// Retry policy applied to every operation issued through the manager.
    pub retry_config: RetryConfig,
    /// How long to wait for a connection to be established.
    pub connection_timeout: Duration,
    /// How long to wait for a reply.
    pub response_timeout: Duration,
}

impl Default for RedisConnectionOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            max_connections: 10,
            retry_config: RetryConfig::default(),
            connection_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
        }
    }
}

impl RedisConnectionOptions {
    /// Options for the server at `url`, with every other setting at its default.
    ///
    /// Only plain TCP URLs (`redis://`) are accepted.
    pub fn from_url(url: &str) -> Result<Self, AdmissionError> {
        let info = url
            .into_connection_info()
            .map_err(|err| AdmissionError::InvalidConfig(format!("invalid redis url: {err}")))?;

        let ConnectionAddr::Tcp(host, port) = info.addr else {
            return Err(AdmissionError::InvalidConfig(
                "only redis:// urls are supported".to_string(),
            ));
        };

        Ok(Self {
            host,
            port,
            db: info.redis.db,
            username: info.redis.username,
            password: info.redis.password,
            ..Self::default()
        })
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        // No reconnect backoff inside the manager: `RetryConfig` is the only
        // source of delay between attempts.
        ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(self.connection_timeout)
            .set_response_timeout(self.response_timeout)
    }
}

struct Pool {
    client: Client,
    manager_config: ConnectionManagerConfig,
    retry_config: RetryConfig,
    max_connections: usize,
    // `None` marks a slot whose connection has not been opened yet.
    idle_sender: Sender<Option<ConnectionManager>>,
    idle_receiver: Receiver<Option<ConnectionManager>>,
    closed: AtomicBool,
}

impl Pool {
    fn release(&self, slot: Option<ConnectionManager>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        // Cannot be full: there are never more slots than the channel capacity.
        let _ = self.idle_sender.try_send(slot);
    }

    async fn open(&self) -> Result<ConnectionManager, AdmissionError> {
        let connection = self
            .client
            .get_connection_manager_with_config(self.manager_config.clone())
            .await?;

        Ok(connection)
    }
}

/// Returns an unopened slot to the pool unless defused.
struct EmptySlot<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl Drop for EmptySlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(None);
        }
    }
}

/// A connection checked out of a [`RedisConnectionManager`].
///
/// Returned to the pool when dropped, on every exit path.
pub struct PooledConnection {
    connection: ConnectionManager,
    pool: Arc<Pool>,
}

impl Deref for PooledConnection {
    type Target = ConnectionManager;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(Some(self.connection.clone()));
    }
}

/// Bounded pool of Redis connections with retrying execution.
///
/// Connections are opened lazily, up to `max_connections`, and each one is a
/// [`redis::aio::ConnectionManager`] that reconnects on its own. Cloning the
/// manager shares the pool.
///
/// # Lifecycle
///
/// [`RedisConnectionManager::connect`] opens the first connection so that bad
/// credentials surface at startup. [`RedisConnectionManager::close`] drops every
/// idle connection; connections checked out at that moment are dropped when
/// released instead of being returned.
#[derive(Clone)]
pub struct RedisConnectionManager {
    pool: Arc<Pool>,
}

impl fmt::Debug for RedisConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnectionManager")
            .field("max_connections", &self.pool.max_connections)
            .field("idle", &self.pool.idle_receiver.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RedisConnectionManager {
    /// Build the pool and open its first connection.
    ///
    /// A store that is down at startup is not an error: the pool is returned
    /// and will keep trying on use. Fatal errors such as rejected credentials
    /// are returned.
    pub async fn connect(options: RedisConnectionOptions) -> Result<Self, AdmissionError> {
        let manager = Self::new(options)?;

        match manager.checkout().await {
            Ok(connection) => drop(connection),
            Err(err) if err.is_transient() => {
                tracing::warn!(error = %err, "Redis unreachable at startup, connecting lazily");
            }
            Err(err) => return Err(err),
        }

        tracing::info!(
            max_connections = manager.pool.max_connections,
            "Redis connection pool ready"
        );

        Ok(manager)
    }

    /// Build the pool without opening any connection.
    pub fn new(options: RedisConnectionOptions) -> Result<Self, AdmissionError> {
        if options.max_connections == 0 {
            return Err(AdmissionError::InvalidConfig(
                "max connections must be > 0".to_string(),
            ));
        }

        let client = Client::open(options.connection_info())?;
        let (idle_sender, idle_receiver) = async_channel::bounded(options.max_connections);

        for _ in 0..options.max_connections {
            // Freshly created with exactly this capacity.
            let _ = idle_sender.try_send(None);
        }

        Ok(Self {
            pool: Arc::new(Pool {
                client,
                manager_config: options.manager_config(),
                retry_config: options.retry_config,
                max_connections: options.max_connections,
                idle_sender,
                idle_receiver,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Retry policy applied by [`RedisConnectionManager::execute`].
    pub fn retry_config(&self) -> &RetryConfig {
        &self.pool.retry_config
    }

    /// Returns `true` once [`RedisConnectionManager::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.closed.load(Ordering::Acquire)
    }

    /// Check a connection out of the pool, waiting if all are in use.
    pub async fn checkout(&self) -> Result<PooledConnection, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::PoolClosed);
        }

        let slot = self
            .pool
            .idle_receiver
            .recv()
            .await
            .map_err(|_| AdmissionError::PoolClosed)?;

        let connection = match slot {
            Some(connection) => connection,
            None => {
                let mut empty = EmptySlot {
                    pool: &*self.pool,
                    armed: true,
                };
                let connection = self.pool.open().await?;
                empty.armed = false;

                connection
            }
        };

        Ok(PooledConnection {
            connection,
            pool: self.pool.clone(),
        })
    }

    /// Run `op` on a pooled connection, retrying transient failures per the
    /// configured [`RetryConfig`]. Each attempt checks out a connection afresh.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, AdmissionError>
    where
        F: Fn(PooledConnection) -> Fut,
        Fut: Future<Output = Result<T, AdmissionError>>,
    {
        let op = &op;

        with_retry(&self.pool.retry_config, || async move {
            let connection = self.checkout().await?;
            op(connection).await
        })
        .await
    }

    /// Close the pool and drop every idle connection.
    pub fn close(&self) {
        if self.pool.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.pool.idle_sender.close();

        let mut dropped = 0;
        while let Ok(slot) = self.pool.idle_receiver.try_recv() {
            if slot.is_some() {
                dropped += 1;
            }
        }

        tracing::info!(connections = dropped, "Redis connection pool closed");
    }
}
