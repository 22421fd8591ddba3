//! TDS sessions over tiberius.
//!
//! The engine is synchronous and runs on rayon workers, so each session owns
//! a current-thread tokio runtime and blocks on it. Nothing is pooled: a
//! session is opened per probe or operation and closed when dropped.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryConfig};
use reconcile::{ConnectionFactory, Operation, Probe, ServerVersion, Session, Statement};
use std::future::Future;
use std::time::Duration;
use tiberius::{Client, Query};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type TdsClient = Client<Compat<TcpStream>>;

/// Opens sessions against one SQL Server instance.
#[derive(Debug, Clone)]
pub struct TdsFactory {
    config: ServerConfig,
}

impl TdsFactory {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open a session, retrying transient network failures.
    pub fn open(&self, database: &str) -> Result<TdsSession> {
        let retry = RetryConfig::with_attempts(self.config.connect_attempts);
        with_retry(&retry, || TdsSession::open(&self.config, database))
    }
}

impl ConnectionFactory for TdsFactory {
    fn connect(&self, database: &str) -> reconcile::Result<Box<dyn Session + '_>> {
        Ok(Box::new(self.open(database)?))
    }

    fn server_version(&self) -> reconcile::Result<String> {
        let mut session = self.open(reconcile::inspect::SERVER_DATABASE)?;
        let version =
            session.text("SELECT CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128))")?;
        Ok(version)
    }
}

/// One open connection plus the runtime driving it.
pub struct TdsSession {
    runtime: Runtime,
    client: TdsClient,
    timeout: Duration,
}

impl TdsSession {
    fn open(config: &ServerConfig, database: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;
        let timeout = config.timeout();
        let address = config.address();
        let tds = config.tiberius(database);

        let client = runtime.block_on(async {
            let tcp = tokio::time::timeout(timeout, TcpStream::connect(&address))
                .await
                .map_err(|_| Error::Timeout(timeout.as_secs()))?
                .map_err(|e| Error::network(&address, &e))?;
            tcp.set_nodelay(true)
                .map_err(|e| Error::network(&address, &e))?;

            tokio::time::timeout(timeout, Client::connect(tds, tcp.compat_write()))
                .await
                .map_err(|_| Error::Timeout(timeout.as_secs()))?
                .map_err(Error::from)
        })?;

        log::debug!("connected to {address}, database {database}");
        Ok(Self {
            runtime,
            client,
            timeout,
        })
    }

    /// First column of the first row as text.
    pub fn text(&mut self, sql: &str) -> Result<String> {
        let Self {
            runtime,
            client,
            timeout,
        } = self;
        let value = block_on(runtime, *timeout, async move {
            let row = Query::new(sql).query(client).await?.into_row().await?;
            match row {
                Some(row) => Ok(row.try_get::<&str, _>(0)?.map(str::to_string)),
                None => Ok(None),
            }
        })?;
        value.ok_or_else(|| Error::UnexpectedResult(format!("no value returned by: {sql}")))
    }

    fn flag_of(&mut self, statement: &Statement) -> Result<Option<bool>> {
        log::trace!("{}", statement.sql);
        let Self {
            runtime,
            client,
            timeout,
        } = self;
        block_on(runtime, *timeout, async move {
            let row = bind(statement).query(client).await?.into_row().await?;
            match row {
                Some(row) => row.try_get::<bool, _>(0),
                None => Ok(None),
            }
        })
    }

    fn names_of(&mut self, statement: &Statement) -> Result<Vec<String>> {
        log::trace!("{}", statement.sql);
        let Self {
            runtime,
            client,
            timeout,
        } = self;
        block_on(runtime, *timeout, async move {
            let rows = bind(statement).query(client).await?.into_first_result().await?;
            let mut names = Vec::with_capacity(rows.len());
            for row in &rows {
                if let Some(name) = row.try_get::<&str, _>(0)? {
                    names.push(name.to_string());
                }
            }
            Ok(names)
        })
    }

    /// Run a statement in its own transaction; roll back on failure.
    fn execute_in_transaction(&mut self, statement: &Statement) -> Result<()> {
        log::trace!("{}", statement.sql);
        let Self {
            runtime,
            client,
            timeout,
        } = self;
        // a timeout drops the session and the server rolls the transaction back
        block_on(runtime, *timeout, async move {
            client
                .simple_query("BEGIN TRANSACTION")
                .await?
                .into_results()
                .await?;

            match bind(statement).execute(&mut *client).await {
                Ok(_) => {
                    client
                        .simple_query("COMMIT TRANSACTION")
                        .await?
                        .into_results()
                        .await?;
                    Ok(())
                }
                Err(e) => {
                    match client
                        .simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
                        .await
                    {
                        Ok(stream) => {
                            if let Err(rollback) = stream.into_results().await {
                                log::warn!("rollback failed: {rollback}");
                            }
                        }
                        Err(rollback) => log::warn!("rollback failed: {rollback}"),
                    }
                    Err(e)
                }
            }
        })
    }
}

impl Session for TdsSession {
    fn flag(&mut self, probe: &Probe) -> reconcile::Result<Option<bool>> {
        Ok(self.flag_of(&probe.statement())?)
    }

    fn names(&mut self, probe: &Probe) -> reconcile::Result<Vec<String>> {
        Ok(self.names_of(&probe.statement())?)
    }

    fn apply(&mut self, operation: &Operation, version: &ServerVersion) -> reconcile::Result<()> {
        Ok(self.execute_in_transaction(&operation.statement(version))?)
    }
}

/// Build a driver query with every parameter bound positionally.
fn bind(statement: &Statement) -> Query<'static> {
    let mut query = Query::new(statement.sql.clone());
    for param in &statement.params {
        query.bind(param.value().to_string());
    }
    query
}

fn block_on<T>(
    runtime: &Runtime,
    timeout: Duration,
    future: impl Future<Output = tiberius::Result<T>>,
) -> Result<T> {
    runtime.block_on(async {
        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::Timeout(timeout.as_secs()))?
            .map_err(Error::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::Password;

    #[test]
    fn test_bind_keeps_secrets_out_of_sql() {
        let probe = Probe::PasswordMatches {
            login: "alice".into(),
            password: Password::new("hunter2"),
        };
        let statement = probe.statement();
        let _query = bind(&statement);
        assert!(!statement.sql.contains("hunter2"));
        assert_eq!(statement.params.len(), 2);
        assert_eq!(statement.params[1].value(), "hunter2");
    }

    #[test]
    fn test_unreachable_server_is_connection_error() {
        let mut config = ServerConfig::new("127.0.0.1");
        // reserved port, nothing listens
        config.port = 1;
        config.timeout_secs = 2;
        config.connect_attempts = 1;
        let factory = TdsFactory::new(config);

        let err = match factory.connect("master") {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert!(matches!(err, reconcile::Error::Connection(_)), "{err}");
    }
}
