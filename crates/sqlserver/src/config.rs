//! Connection settings.

use reconcile::Password;
use serde::Deserialize;
use std::time::Duration;

/// Where and how to connect.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Password,
    /// Applies to connecting and to every query
    pub timeout_secs: u64,
    /// Connection attempts before giving up on transient failures
    pub connect_attempts: u32,
    pub application_name: String,
    /// Accept any server certificate
    pub trust_server_certificate: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            user: "sa".to_string(),
            password: Password::new(""),
            timeout_secs: 60,
            connect_attempts: 3,
            application_name: "loginsync".to_string(),
            trust_server_certificate: false,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Driver configuration for a session scoped to `database`.
    pub(crate) fn tiberius(&self, database: &str) -> tiberius::Config {
        let mut config = tiberius::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(database);
        config.application_name(&self.application_name);
        config.authentication(tiberius::AuthMethod::sql_server(
            &self.user,
            self.password.expose(),
        ));
        if self.trust_server_certificate {
            config.trust_cert();
        }
        config
    }
}
