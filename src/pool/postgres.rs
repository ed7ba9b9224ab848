/// The PostgreSQL implementation of a pool backend
///
/// Health is assessed over a dedicated monitoring session: one cached
/// `tokio-postgres` client per backend, reconnected lazily after any
/// failure. The role is read from `pg_is_in_recovery()`: true on a
/// streaming follower, false on the primary.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, NoTls};

use crate::config::{split_host_port, ConfigError, HealthConfig};
use crate::error::{PorteraError, PorteraResult};
use crate::pool::backend::{Backend, BackendState, InflightRegistry, PooledConn};

/// Connect timeout for the monitoring session.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PostgresBackend {
    address: String,
    config: tokio_postgres::Config,
    /// The cached monitoring session; discarded on any probe error so the
    /// next tick reconnects.
    session: Mutex<Option<Client>>,
    inflight: Arc<InflightRegistry>,
}

impl PostgresBackend {
    pub fn new(address: &str, health: &HealthConfig) -> Result<Self, ConfigError> {
        let (host, port) = split_host_port(address)?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .user(&health.username)
            .password(&health.password)
            .dbname(&health.database)
            .connect_timeout(PROBE_CONNECT_TIMEOUT)
            .ssl_mode(SslMode::Disable);

        Ok(Self {
            address: address.to_string(),
            config,
            session: Mutex::new(None),
            inflight: Arc::new(InflightRegistry::default()),
        })
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn ping(&self) -> PorteraResult<BackendState> {
        let mut session = self.session.lock().await;

        // Ensure that the monitoring connection is alive.
        let client = match session.take() {
            Some(client) => client,
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                tokio::spawn(async move {
                    // The driver finishes when the client is dropped; a
                    // broken link surfaces through the next query instead.
                    let _ = connection.await;
                });
                client
            }
        };

        // Check whether we are a primary or a follower.
        let result = client
            .query_one("select pg_is_in_recovery();", &[])
            .await
            .and_then(|row| row.try_get::<_, bool>(0));

        match result {
            Ok(in_recovery) => {
                *session = Some(client);
                if in_recovery {
                    Ok(BackendState::ReadOnly)
                } else {
                    Ok(BackendState::ReadWrite)
                }
            }
            // Dropping the client discards the session; the next tick
            // reconnects.
            Err(err) => Err(err.into()),
        }
    }

    fn addr(&self) -> &str {
        &self.address
    }

    async fn connect(&self, dial_timeout: Duration) -> PorteraResult<PooledConn> {
        let stream = match timeout(dial_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.fail();
                return Err(err.into());
            }
            Err(_) => {
                self.fail();
                return Err(PorteraError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", self.address),
                )));
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            log::warn!("failed to configure backend stream: {err}");
        }

        let (token, guard) = self.inflight.register();
        Ok(PooledConn::new(stream, token, guard))
    }

    fn fail(&self) {
        self.inflight.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn health() -> HealthConfig {
        HealthConfig {
            username: "monitor".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
        }
    }

    #[test]
    fn rejects_addresses_without_a_port() {
        assert!(PostgresBackend::new("localhost", &health()).is_err());
        assert!(PostgresBackend::new("localhost:5432", &health()).is_ok());
    }

    #[tokio::test]
    async fn dial_failure_fails_inflight_connections() {
        // Bind a listener to learn a port, then close it so dialing fails.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = PostgresBackend::new(&addr.to_string(), &health()).unwrap();
        let result = backend.connect(Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_registers_and_fail_tears_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let backend = PostgresBackend::new(&addr.to_string(), &health()).unwrap();
        let conn = backend.connect(Duration::from_secs(1)).await.unwrap();
        let killed = conn.kill_switch();
        assert!(!killed.is_cancelled());

        backend.fail();
        assert!(killed.is_cancelled());
    }
}
