//! Read-only catalog checks.
//!
//! Every check is a [`Probe`]: a value naming what is asked, which database
//! it must run in and the parameterized statement that answers it. The
//! [`Inspector`] opens one scoped session per probe through the injected
//! [`ConnectionFactory`] and folds the raw answers into the semantics the
//! planner relies on.

use crate::context::ConnectionFactory;
use crate::error::{Error, Result};
use crate::model::{fold, LoginSpec, Password, RoleSet};
use crate::sql::{Param, ServerVersion, Statement};
use crate::types::{
    BindingStatus, ObservedBinding, ObservedLoginState, ObservedUserState, SkipReason,
};
use std::collections::BTreeSet;
use std::fmt;

/// Largest number of names sent in one bulk existence query.
pub const BULK_BATCH_SIZE: usize = 1000;

/// Database server-level checks run in.
pub const SERVER_DATABASE: &str = "master";

/// A single read-only question for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Which of these logins exist
    LoginsExist { names: Vec<String> },
    LoginExists { login: String },
    LoginEnabled { login: String },
    DefaultDatabase { login: String, database: String },
    DefaultLanguage { login: String, language: String },
    PasswordMatches { login: String, password: Password },
    /// Online and writable
    DatabaseAvailable { database: String },
    PrimaryReplica { database: String },
    MirroredSecondary { database: String },
    UserExists { database: String, user: String },
    /// User is mapped to the login's SID. While the login does not exist
    /// yet, an orphaned user carrying the planned `sid` counts as linked.
    UserLinked {
        database: String,
        user: String,
        login: String,
        sid: Option<String>,
    },
    RoleMemberships { database: String, user: String },
    AvailableRoles { database: String },
}

impl Probe {
    /// Short stable name of the check.
    pub fn kind(&self) -> &'static str {
        match self {
            Probe::LoginsExist { .. } => "logins_exist",
            Probe::LoginExists { .. } => "login_exists",
            Probe::LoginEnabled { .. } => "login_enabled",
            Probe::DefaultDatabase { .. } => "default_database",
            Probe::DefaultLanguage { .. } => "default_language",
            Probe::PasswordMatches { .. } => "password_matches",
            Probe::DatabaseAvailable { .. } => "database_available",
            Probe::PrimaryReplica { .. } => "primary_replica",
            Probe::MirroredSecondary { .. } => "mirrored_secondary",
            Probe::UserExists { .. } => "user_exists",
            Probe::UserLinked { .. } => "user_linked",
            Probe::RoleMemberships { .. } => "role_memberships",
            Probe::AvailableRoles { .. } => "available_roles",
        }
    }

    /// Database the probe's session must be scoped to.
    pub fn database(&self) -> &str {
        match self {
            Probe::UserExists { database, .. }
            | Probe::UserLinked { database, .. }
            | Probe::RoleMemberships { database, .. }
            | Probe::AvailableRoles { database } => database,
            _ => SERVER_DATABASE,
        }
    }

    /// The parameterized statement answering this probe.
    ///
    /// Flag probes select a single `bit` column; a missing row or NULL means
    /// the catalog has no answer. Name probes select one `sysname` column.
    pub fn statement(&self) -> Statement {
        match self {
            Probe::LoginsExist { names } => {
                let placeholders: Vec<String> =
                    (1..=names.len()).map(|i| format!("@P{i}")).collect();
                Statement {
                    sql: format!(
                        "SELECT name FROM sys.server_principals \
                         WHERE type IN ('S', 'U', 'G') AND name IN ({})",
                        placeholders.join(", ")
                    ),
                    params: names.iter().map(|n| Param::Text(n.clone())).collect(),
                }
            }
            Probe::LoginExists { login } => Statement::new(
                "SELECT CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.server_principals \
                 WHERE name = @P1 AND type IN ('S', 'U', 'G')) THEN 1 ELSE 0 END AS bit)",
                &[login.as_str()],
            ),
            Probe::LoginEnabled { login } => Statement::new(
                "SELECT CAST(CASE WHEN is_disabled = 0 THEN 1 ELSE 0 END AS bit) \
                 FROM sys.server_principals WHERE name = @P1",
                &[login.as_str()],
            ),
            Probe::DefaultDatabase { login, database } => Statement::new(
                "SELECT CAST(CASE WHEN default_database_name = @P2 THEN 1 ELSE 0 END AS bit) \
                 FROM sys.server_principals WHERE name = @P1",
                &[login.as_str(), database.as_str()],
            ),
            Probe::DefaultLanguage { login, language } => Statement::new(
                "SELECT CAST(CASE WHEN default_language_name = @P2 THEN 1 ELSE 0 END AS bit) \
                 FROM sys.server_principals WHERE name = @P1",
                &[login.as_str(), language.as_str()],
            ),
            Probe::PasswordMatches { login, password } => Statement {
                sql: "SELECT CAST(PWDCOMPARE(@P2, password_hash) AS bit) \
                      FROM sys.sql_logins WHERE name = @P1"
                    .to_string(),
                params: vec![Param::Text(login.clone()), Param::Secret(password.clone())],
            },
            Probe::DatabaseAvailable { database } => Statement::new(
                "SELECT CAST(CASE WHEN state = 0 AND is_read_only = 0 THEN 1 ELSE 0 END AS bit) \
                 FROM sys.databases WHERE name = @P1",
                &[database.as_str()],
            ),
            Probe::PrimaryReplica { database } => Statement::new(
                "SELECT CAST(COALESCE(sys.fn_hadr_is_primary_replica(@P1), 1) AS bit)",
                &[database.as_str()],
            ),
            Probe::MirroredSecondary { database } => Statement::new(
                "SELECT CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.database_mirroring AS m \
                 WHERE m.mirroring_guid IS NOT NULL AND DB_NAME(m.database_id) = @P1 \
                 AND m.mirroring_role = 2) THEN 1 ELSE 0 END AS bit)",
                &[database.as_str()],
            ),
            Probe::UserExists { user, .. } => Statement::new(
                "SELECT CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.database_principals \
                 WHERE name = @P1 AND type IN ('S', 'U', 'G')) THEN 1 ELSE 0 END AS bit)",
                &[user.as_str()],
            ),
            Probe::UserLinked {
                user,
                login,
                sid: None,
                ..
            } => Statement::new(
                "SELECT CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.database_principals AS dp \
                 INNER JOIN sys.server_principals AS sp ON sp.sid = dp.sid \
                 WHERE dp.name = @P1 AND sp.name = @P2) THEN 1 ELSE 0 END AS bit)",
                &[user.as_str(), login.as_str()],
            ),
            Probe::UserLinked {
                user,
                login,
                sid: Some(sid),
                ..
            } => Statement::new(
                "SELECT CAST(CASE WHEN EXISTS (SELECT 1 FROM sys.database_principals AS dp \
                 LEFT JOIN sys.server_principals AS sp ON sp.sid = dp.sid \
                 WHERE dp.name = @P1 AND (sp.name = @P2 OR (sp.sid IS NULL \
                 AND dp.sid = CONVERT(varbinary(85), @P3, 1) \
                 AND NOT EXISTS (SELECT 1 FROM sys.server_principals WHERE name = @P2)))) \
                 THEN 1 ELSE 0 END AS bit)",
                &[user.as_str(), login.as_str(), sid.as_str()],
            ),
            Probe::RoleMemberships { user, .. } => Statement::new(
                "SELECT rp.name FROM sys.database_role_members AS drm \
                 INNER JOIN sys.database_principals AS rp ON drm.role_principal_id = rp.principal_id \
                 INNER JOIN sys.database_principals AS mp ON drm.member_principal_id = mp.principal_id \
                 WHERE mp.name = @P1",
                &[user.as_str()],
            ),
            Probe::AvailableRoles { .. } => Statement::new(
                "SELECT name FROM sys.database_principals WHERE type = 'R' ORDER BY name",
                &[],
            ),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Probe::LoginsExist { names } => write!(f, "{kind} ({} logins)", names.len()),
            Probe::LoginExists { login }
            | Probe::LoginEnabled { login }
            | Probe::DefaultDatabase { login, .. }
            | Probe::DefaultLanguage { login, .. }
            | Probe::PasswordMatches { login, .. } => write!(f, "{kind} check for login {login}"),
            Probe::DatabaseAvailable { database }
            | Probe::PrimaryReplica { database }
            | Probe::MirroredSecondary { database }
            | Probe::AvailableRoles { database } => {
                write!(f, "{kind} check for database {database}")
            }
            Probe::UserExists { database, user }
            | Probe::UserLinked { database, user, .. }
            | Probe::RoleMemberships { database, user } => {
                write!(f, "{kind} check for user {user} in database {database}")
            }
        }
    }
}

/// Reads live catalog state through short-lived sessions.
pub struct Inspector<'a> {
    factory: &'a dyn ConnectionFactory,
    version: &'a ServerVersion,
}

impl<'a> Inspector<'a> {
    pub fn new(factory: &'a dyn ConnectionFactory, version: &'a ServerVersion) -> Self {
        Self { factory, version }
    }

    pub fn version(&self) -> &ServerVersion {
        self.version
    }

    fn flag(&self, probe: &Probe) -> Result<Option<bool>> {
        log::debug!("probe {probe}");
        let mut session = self
            .factory
            .connect(probe.database())
            .map_err(|e| Error::inspection(probe, e))?;
        session.flag(probe).map_err(|e| Error::inspection(probe, e))
    }

    fn names(&self, probe: &Probe) -> Result<Vec<String>> {
        log::debug!("probe {probe}");
        let mut session = self
            .factory
            .connect(probe.database())
            .map_err(|e| Error::inspection(probe, e))?;
        session.names(probe).map_err(|e| Error::inspection(probe, e))
    }

    /// Case-folded names of the given logins that exist, in batches.
    pub fn logins_exist(&self, names: &[&str]) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        for batch in names.chunks(BULK_BATCH_SIZE) {
            let probe = Probe::LoginsExist {
                names: batch.iter().map(|n| (*n).to_string()).collect(),
            };
            found.extend(self.names(&probe)?.iter().map(|n| fold(n)));
        }
        Ok(found)
    }

    pub fn login_exists(&self, login: &str) -> Result<bool> {
        let probe = Probe::LoginExists {
            login: login.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(false))
    }

    /// A login that does not exist reads as enabled.
    pub fn is_enabled(&self, login: &str) -> Result<bool> {
        let probe = Probe::LoginEnabled {
            login: login.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(true))
    }

    pub fn default_database_matches(&self, login: &str, database: Option<&str>) -> Result<bool> {
        let Some(database) = database else {
            return Ok(true);
        };
        let probe = Probe::DefaultDatabase {
            login: login.to_string(),
            database: database.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(true))
    }

    pub fn default_language_matches(&self, login: &str, language: Option<&str>) -> Result<bool> {
        let Some(language) = language else {
            return Ok(true);
        };
        let probe = Probe::DefaultLanguage {
            login: login.to_string(),
            language: language.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(true))
    }

    /// Windows logins and undeclared passwords always match.
    pub fn password_matches(&self, login: &str, password: Option<&Password>) -> Result<bool> {
        let Some(password) = password else {
            return Ok(true);
        };
        if crate::model::is_windows_login(login) {
            return Ok(true);
        }
        let probe = Probe::PasswordMatches {
            login: login.to_string(),
            password: password.clone(),
        };
        Ok(self.flag(&probe)?.unwrap_or(true))
    }

    /// A database that is not in the catalog is unavailable.
    pub fn database_available(&self, database: &str) -> Result<bool> {
        let probe = Probe::DatabaseAvailable {
            database: database.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(false))
    }

    /// Always true before 2014, where availability groups do not exist.
    pub fn is_primary_replica(&self, database: &str) -> Result<bool> {
        if !self.version.has_hadr() {
            return Ok(true);
        }
        let probe = Probe::PrimaryReplica {
            database: database.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(true))
    }

    /// Only consulted before 2014.
    pub fn is_mirrored_secondary(&self, database: &str) -> Result<bool> {
        if !self.version.checks_mirroring() {
            return Ok(false);
        }
        let probe = Probe::MirroredSecondary {
            database: database.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(false))
    }

    pub fn user_exists(&self, user: &str, database: &str) -> Result<bool> {
        let probe = Probe::UserExists {
            database: database.to_string(),
            user: user.to_string(),
        };
        Ok(self.flag(&probe)?.unwrap_or(false))
    }

    /// `sid` is the SID the login has or will be created with.
    pub fn user_linked(
        &self,
        user: &str,
        login: &str,
        sid: Option<&str>,
        database: &str,
    ) -> Result<bool> {
        let probe = Probe::UserLinked {
            database: database.to_string(),
            user: user.to_string(),
            login: login.to_string(),
            sid: sid.map(str::to_string),
        };
        Ok(self.flag(&probe)?.unwrap_or(false))
    }

    pub fn role_memberships(&self, user: &str, database: &str) -> Result<RoleSet> {
        let probe = Probe::RoleMemberships {
            database: database.to_string(),
            user: user.to_string(),
        };
        Ok(self.names(&probe)?.into_iter().collect())
    }

    pub fn available_roles(&self, database: &str) -> Result<RoleSet> {
        let probe = Probe::AvailableRoles {
            database: database.to_string(),
        };
        Ok(self.names(&probe)?.into_iter().collect())
    }

    /// Why a database must be left alone right now, if it must.
    pub fn skip_reason(&self, database: &str) -> Result<Option<SkipReason>> {
        if !self.database_available(database)? {
            return Ok(Some(SkipReason::Unavailable));
        }
        if !self.is_primary_replica(database)? {
            return Ok(Some(SkipReason::NotPrimaryReplica));
        }
        if self.is_mirrored_secondary(database)? {
            return Ok(Some(SkipReason::MirroredSecondary));
        }
        Ok(None)
    }

    /// Observe one user in one database. Role catalogs are read only when
    /// the binding is meant to be present.
    pub fn observe_user(
        &self,
        user: &str,
        login: &str,
        sid: Option<&str>,
        database: &str,
        with_roles: bool,
    ) -> Result<ObservedUserState> {
        let exists = self.user_exists(user, database)?;
        let linked = exists && self.user_linked(user, login, sid, database)?;

        let (memberships, available_roles) = if with_roles {
            let memberships = if exists {
                self.role_memberships(user, database)?
            } else {
                RoleSet::new()
            };
            (memberships, self.available_roles(database)?)
        } else {
            (RoleSet::new(), RoleSet::new())
        };

        Ok(ObservedUserState {
            exists,
            linked,
            memberships,
            available_roles,
        })
    }

    /// Snapshot everything the planner needs for one login.
    ///
    /// `exists` comes from the bulk check. Login attribute failures are
    /// returned; binding failures are recorded in the binding's status.
    pub fn observe(&self, spec: &LoginSpec, exists: bool) -> Result<ObservedLoginState> {
        let mut observed = if exists && !spec.state.is_absent() {
            ObservedLoginState {
                exists,
                enabled: self.is_enabled(&spec.name)?,
                default_database_matches: self
                    .default_database_matches(&spec.name, spec.default_database.as_deref())?,
                default_language_matches: self
                    .default_language_matches(&spec.name, spec.default_language.as_deref())?,
                password_matches: self.password_matches(&spec.name, spec.password.as_ref())?,
                bindings: Vec::new(),
            }
        } else {
            ObservedLoginState {
                exists,
                ..ObservedLoginState::missing()
            }
        };

        for (user, binding) in spec.bindings() {
            let status = match self.observe_binding(spec, &user.name, binding) {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("{e}");
                    BindingStatus::Failed(e.to_string())
                }
            };
            observed.bindings.push(ObservedBinding {
                user: user.name.clone(),
                database: binding.database.clone(),
                status,
            });
        }

        Ok(observed)
    }

    fn observe_binding(
        &self,
        login: &LoginSpec,
        user: &str,
        binding: &crate::model::DatabaseBinding,
    ) -> Result<BindingStatus> {
        if let Some(reason) = self.skip_reason(&binding.database)? {
            return Ok(BindingStatus::Skipped(reason));
        }
        let sid = login.effective_sid();
        let state = self.observe_user(
            user,
            &login.name,
            sid.as_deref(),
            &binding.database,
            !binding.state.is_absent(),
        )?;
        Ok(BindingStatus::Ready(state))
    }
}
