//! In-memory server catalog.
//!
//! Implements [`ConnectionFactory`] and [`Session`] over a small model of
//! logins, databases, users and role memberships. It answers probes and
//! applies operations semantically, records every applied operation in a
//! journal, counts probes and can be told to fail specific probes or
//! operations.

use crate::context::{ConnectionFactory, Session};
use crate::error::{Error, Result};
use crate::inspect::{Probe, SERVER_DATABASE};
use crate::model::{derive_sid, fold, RoleSet};
use crate::operation::Operation;
use crate::sql::ServerVersion;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Roles every new database carries.
pub const FIXED_DATABASE_ROLES: [&str; 10] = [
    "db_accessadmin",
    "db_backupoperator",
    "db_datareader",
    "db_datawriter",
    "db_ddladmin",
    "db_denydatareader",
    "db_denydatawriter",
    "db_owner",
    "db_securityadmin",
    "public",
];

#[derive(Debug, Clone)]
struct Login {
    name: String,
    sid: Option<String>,
    password: Option<String>,
    enabled: bool,
    default_database: String,
    default_language: String,
}

#[derive(Debug, Clone)]
struct User {
    name: String,
    /// SID of the mapped login, kept when the login is dropped
    sid: Option<String>,
    roles: RoleSet,
}

#[derive(Debug, Clone)]
struct Database {
    online: bool,
    read_only: bool,
    secondary: bool,
    mirrored: bool,
    roles: RoleSet,
    users: BTreeMap<String, User>,
}

impl Database {
    fn new() -> Self {
        Self {
            online: true,
            read_only: false,
            secondary: false,
            mirrored: false,
            roles: FIXED_DATABASE_ROLES.iter().copied().collect(),
            users: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    logins: BTreeMap<String, Login>,
    databases: BTreeMap<String, Database>,
    journal: Vec<String>,
    probes: usize,
    failing_probes: BTreeSet<String>,
    failing_operations: BTreeSet<String>,
}

impl Catalog {
    fn login_mut(&mut self, name: &str) -> Result<&mut Login> {
        self.logins
            .get_mut(&fold(name))
            .ok_or_else(|| Error::Query(format!("login {name} does not exist")))
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut Database> {
        self.databases
            .get_mut(&fold(name))
            .ok_or_else(|| Error::Query(format!("database {name} does not exist")))
    }

    fn user(&self, database: &str, user: &str) -> Option<&User> {
        self.databases
            .get(&fold(database))
            .and_then(|d| d.users.get(&fold(user)))
    }

    fn sid_owned(&self, sid: &str) -> bool {
        self.logins
            .values()
            .any(|l| same_sid(l.sid.as_deref(), Some(sid)))
    }

    fn user_linked(&self, database: &str, user: &str, login: &str, planned: Option<&str>) -> bool {
        let Some(user) = self.user(database, user) else {
            return false;
        };
        match (self.logins.get(&fold(login)), planned) {
            (Some(login), _) => same_sid(user.sid.as_deref(), login.sid.as_deref()),
            (None, Some(planned)) => {
                same_sid(user.sid.as_deref(), Some(planned)) && !self.sid_owned(planned)
            }
            (None, None) => false,
        }
    }
}

/// SIDs are hex strings; compare them without regard to case.
fn same_sid(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// A fake SQL Server for tests and dry runs.
#[derive(Debug)]
pub struct MemoryServer {
    version: String,
    catalog: Mutex<Catalog>,
}

impl MemoryServer {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            catalog: Mutex::new(Catalog::default()),
        }
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Add an enabled SQL login with a derived SID and no password.
    pub fn add_login(&self, name: &str) {
        self.catalog().logins.insert(
            fold(name),
            Login {
                name: name.to_string(),
                sid: Some(derive_sid(name)),
                password: None,
                enabled: true,
                default_database: SERVER_DATABASE.to_string(),
                default_language: "us_english".to_string(),
            },
        );
    }

    pub fn set_password(&self, login: &str, password: &str) {
        if let Some(login) = self.catalog().logins.get_mut(&fold(login)) {
            login.password = Some(password.to_string());
        }
    }

    pub fn set_enabled(&self, login: &str, enabled: bool) {
        if let Some(login) = self.catalog().logins.get_mut(&fold(login)) {
            login.enabled = enabled;
        }
    }

    /// Add an online, writable, primary database with the fixed roles.
    pub fn add_database(&self, name: &str) {
        self.catalog().databases.insert(fold(name), Database::new());
    }

    fn update_database(&self, name: &str, update: impl FnOnce(&mut Database)) {
        if let Some(database) = self.catalog().databases.get_mut(&fold(name)) {
            update(database);
        }
    }

    pub fn set_offline(&self, database: &str) {
        self.update_database(database, |d| d.online = false);
    }

    pub fn set_read_only(&self, database: &str) {
        self.update_database(database, |d| d.read_only = true);
    }

    pub fn set_secondary_replica(&self, database: &str) {
        self.update_database(database, |d| d.secondary = true);
    }

    pub fn set_mirrored_secondary(&self, database: &str) {
        self.update_database(database, |d| d.mirrored = true);
    }

    pub fn add_role(&self, database: &str, role: &str) {
        self.update_database(database, |d| {
            d.roles.insert(role);
        });
    }

    /// Add a user, optionally mapped to a login. A login that does not
    /// exist leaves the user orphaned with the login's derived SID.
    pub fn add_user(&self, database: &str, user: &str, login: Option<&str>) {
        let sid = login.map(|name| self.login_sid(name).unwrap_or_else(|| derive_sid(name)));
        self.update_database(database, |d| {
            d.users.insert(
                fold(user),
                User {
                    name: user.to_string(),
                    sid,
                    roles: RoleSet::new(),
                },
            );
        });
    }

    pub fn grant(&self, database: &str, user: &str, role: &str) {
        self.update_database(database, |d| {
            if let Some(user) = d.users.get_mut(&fold(user)) {
                user.roles.insert(role);
            }
        });
    }

    /// Make every probe of this kind fail.
    pub fn fail_probe(&self, kind: &str) {
        self.catalog().failing_probes.insert(kind.to_string());
    }

    /// Make every operation of this kind fail.
    pub fn fail_operation(&self, kind: &str) {
        self.catalog().failing_operations.insert(kind.to_string());
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Applied operations, in order.
    pub fn journal(&self) -> Vec<String> {
        self.catalog().journal.clone()
    }

    /// Number of probes answered so far.
    pub fn probe_count(&self) -> usize {
        self.catalog().probes
    }

    pub fn login_enabled(&self, login: &str) -> Option<bool> {
        self.catalog().logins.get(&fold(login)).map(|l| l.enabled)
    }

    pub fn login_sid(&self, login: &str) -> Option<String> {
        self.catalog()
            .logins
            .get(&fold(login))
            .and_then(|l| l.sid.clone())
    }

    pub fn user_exists(&self, database: &str, user: &str) -> bool {
        self.catalog().user(database, user).is_some()
    }

    /// Role memberships of a user, sorted.
    pub fn user_roles(&self, database: &str, user: &str) -> Vec<String> {
        self.catalog()
            .user(database, user)
            .map(|u| u.roles.iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl ConnectionFactory for MemoryServer {
    fn connect(&self, database: &str) -> Result<Box<dyn Session + '_>> {
        if fold(database) != SERVER_DATABASE && !self.catalog().databases.contains_key(&fold(database)) {
            return Err(Error::Connection(format!("cannot open database {database}")));
        }
        Ok(Box::new(MemorySession { server: self }))
    }

    fn server_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }
}

struct MemorySession<'a> {
    server: &'a MemoryServer,
}

impl MemorySession<'_> {
    fn begin_probe(&self, probe: &Probe) -> Result<MutexGuard<'_, Catalog>> {
        let mut catalog = self.server.catalog();
        catalog.probes += 1;
        if catalog.failing_probes.contains(probe.kind()) {
            return Err(Error::Query(format!("injected failure for {}", probe.kind())));
        }
        Ok(catalog)
    }
}

impl Session for MemorySession<'_> {
    fn flag(&mut self, probe: &Probe) -> Result<Option<bool>> {
        let catalog = self.begin_probe(probe)?;
        let login = |name: &str| catalog.logins.get(&fold(name));
        let database = |name: &str| catalog.databases.get(&fold(name));

        let answer = match probe {
            Probe::LoginExists { login: name } => Some(login(name).is_some()),
            Probe::LoginEnabled { login: name } => login(name).map(|l| l.enabled),
            Probe::DefaultDatabase {
                login: name,
                database: expected,
            } => login(name).map(|l| fold(&l.default_database) == fold(expected)),
            Probe::DefaultLanguage {
                login: name,
                language,
            } => login(name).map(|l| fold(&l.default_language) == fold(language)),
            Probe::PasswordMatches {
                login: name,
                password,
            } => login(name).map(|l| l.password.as_deref() == Some(password.expose())),
            Probe::DatabaseAvailable { database: name } => {
                database(name).map(|d| d.online && !d.read_only)
            }
            Probe::PrimaryReplica { database: name } => {
                Some(database(name).is_none_or(|d| !d.secondary))
            }
            Probe::MirroredSecondary { database: name } => {
                Some(database(name).is_some_and(|d| d.mirrored))
            }
            Probe::UserExists { database, user } => Some(catalog.user(database, user).is_some()),
            Probe::UserLinked {
                database,
                user,
                login,
                sid,
            } => Some(catalog.user_linked(database, user, login, sid.as_deref())),
            Probe::LoginsExist { .. }
            | Probe::RoleMemberships { .. }
            | Probe::AvailableRoles { .. } => {
                return Err(Error::Query(format!("{} is not a flag probe", probe.kind())));
            }
        };
        Ok(answer)
    }

    fn names(&mut self, probe: &Probe) -> Result<Vec<String>> {
        let catalog = self.begin_probe(probe)?;
        match probe {
            Probe::LoginsExist { names } => Ok(names
                .iter()
                .filter_map(|n| catalog.logins.get(&fold(n)))
                .map(|l| l.name.clone())
                .collect()),
            Probe::RoleMemberships { database, user } => Ok(catalog
                .user(database, user)
                .map(|u| u.roles.iter().map(str::to_string).collect())
                .unwrap_or_default()),
            Probe::AvailableRoles { database } => Ok(catalog
                .databases
                .get(&fold(database))
                .map(|d| d.roles.iter().map(str::to_string).collect())
                .unwrap_or_default()),
            _ => Err(Error::Query(format!("{} is not a name probe", probe.kind()))),
        }
    }

    fn apply(&mut self, operation: &Operation, _version: &ServerVersion) -> Result<()> {
        let mut catalog = self.server.catalog();
        if catalog.failing_operations.contains(operation.kind()) {
            return Err(Error::Query(format!(
                "injected failure for {}",
                operation.kind()
            )));
        }

        let mut entry = operation.to_string();
        match operation {
            Operation::CreateLogin {
                login,
                sid,
                password,
                default_database,
                default_language,
                ..
            } => {
                if catalog.logins.contains_key(&fold(login)) {
                    return Err(Error::Query(format!("login {login} already exists")));
                }
                catalog.logins.insert(
                    fold(login),
                    Login {
                        name: login.clone(),
                        sid: Some(sid.clone().unwrap_or_else(|| derive_sid(login))),
                        password: password.as_ref().map(|p| p.expose().to_string()),
                        enabled: true,
                        default_database: default_database
                            .clone()
                            .unwrap_or_else(|| SERVER_DATABASE.to_string()),
                        default_language: default_language
                            .clone()
                            .unwrap_or_else(|| "us_english".to_string()),
                    },
                );
            }
            Operation::AlterDefaultDatabase { login, database } => {
                catalog.login_mut(login)?.default_database = database.clone();
            }
            Operation::AlterDefaultLanguage { login, language } => {
                catalog.login_mut(login)?.default_language = language.clone();
            }
            Operation::AlterPassword { login, password } => {
                catalog.login_mut(login)?.password = Some(password.expose().to_string());
            }
            Operation::SetEnabled { login, enabled } => {
                catalog.login_mut(login)?.enabled = *enabled;
            }
            Operation::DropLogin { login } => {
                catalog
                    .logins
                    .remove(&fold(login))
                    .ok_or_else(|| Error::Query(format!("login {login} does not exist")))?;
            }
            Operation::CreateUser {
                database,
                user,
                login,
                reassociate,
                ..
            } => {
                let sid = catalog.login_mut(login)?.sid.clone();
                let db = catalog.database_mut(database)?;
                if *reassociate {
                    let existing = db
                        .users
                        .get_mut(&fold(user))
                        .ok_or_else(|| Error::Query(format!("user {user} does not exist")))?;
                    existing.sid = sid;
                    entry.push_str(" (remap)");
                } else {
                    if db.users.contains_key(&fold(user)) {
                        return Err(Error::Query(format!("user {user} already exists")));
                    }
                    db.users.insert(
                        fold(user),
                        User {
                            name: user.clone(),
                            sid,
                            roles: RoleSet::new(),
                        },
                    );
                }
            }
            Operation::DropUser { database, user } => {
                catalog
                    .database_mut(database)?
                    .users
                    .remove(&fold(user))
                    .ok_or_else(|| Error::Query(format!("user {user} does not exist")))?;
            }
            Operation::CreateRole { database, role } => {
                if !catalog.database_mut(database)?.roles.insert(role.clone()) {
                    return Err(Error::Query(format!("role {role} already exists")));
                }
            }
            Operation::AddRoleMember {
                database,
                user,
                role,
            } => {
                let db = catalog.database_mut(database)?;
                let name = db
                    .roles
                    .get(role)
                    .map(str::to_string)
                    .ok_or_else(|| Error::Query(format!("role {role} does not exist")))?;
                let member = db
                    .users
                    .get_mut(&fold(user))
                    .ok_or_else(|| Error::Query(format!("user {user} does not exist")))?;
                member.roles.insert(name);
            }
            Operation::RemoveRoleMember {
                database,
                user,
                role,
            } => {
                let db = catalog.database_mut(database)?;
                let member = db
                    .users
                    .get_mut(&fold(user))
                    .ok_or_else(|| Error::Query(format!("user {user} does not exist")))?;
                member.roles = member.roles.iter().filter(|r| fold(r) != fold(role)).collect();
            }
        }

        catalog.journal.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_unknown_database_fails() {
        let server = MemoryServer::new("15.0.2000.5");
        assert!(server.connect("master").is_ok());
        assert!(server.connect("nope").is_err());
        server.add_database("Sales");
        assert!(server.connect("sales").is_ok());
    }

    #[test]
    fn test_flag_probes() {
        let server = MemoryServer::new("15.0.2000.5");
        server.add_login("alice");
        server.set_enabled("alice", false);
        server.add_database("sales");
        server.set_read_only("sales");

        let mut session = server.connect("master").unwrap();
        let enabled = Probe::LoginEnabled {
            login: "ALICE".into(),
        };
        assert_eq!(session.flag(&enabled).unwrap(), Some(false));
        let missing = Probe::LoginEnabled {
            login: "bob".into(),
        };
        assert_eq!(session.flag(&missing).unwrap(), None);
        let available = Probe::DatabaseAvailable {
            database: "sales".into(),
        };
        assert_eq!(session.flag(&available).unwrap(), Some(false));
        assert_eq!(server.probe_count(), 3);
    }

    #[test]
    fn test_user_link_requires_live_login() {
        let server = MemoryServer::new("15.0.2000.5");
        server.add_database("sales");
        server.add_user("sales", "bob", Some("bob"));

        let mut session = server.connect("sales").unwrap();
        let linked = Probe::UserLinked {
            database: "sales".into(),
            user: "bob".into(),
            login: "bob".into(),
            sid: None,
        };
        assert_eq!(session.flag(&linked).unwrap(), Some(false));

        server.add_login("bob");
        assert_eq!(session.flag(&linked).unwrap(), Some(true));
    }

    #[test]
    fn test_orphan_links_to_planned_sid_until_login_exists() {
        let server = MemoryServer::new("15.0.2000.5");
        server.add_database("sales");
        server.add_user("sales", "bob", Some("bob"));
        let mut session = server.connect("sales").unwrap();

        let linked = |sid: &str| Probe::UserLinked {
            database: "sales".into(),
            user: "bob".into(),
            login: "bob".into(),
            sid: Some(sid.to_string()),
        };
        let derived = derive_sid("bob");
        assert_eq!(session.flag(&linked(&derived)).unwrap(), Some(true));
        assert_eq!(
            session.flag(&linked(&derived.to_uppercase())).unwrap(),
            Some(true)
        );
        assert_eq!(session.flag(&linked("0x01")).unwrap(), Some(false));

        // another login already owns the SID, so the user is not an orphan
        server.add_login("robert");
        server.add_user("sales", "rob", Some("robert"));
        let owned = Probe::UserLinked {
            database: "sales".into(),
            user: "rob".into(),
            login: "rob".into(),
            sid: Some(derive_sid("robert")),
        };
        assert_eq!(session.flag(&owned).unwrap(), Some(false));
    }

    #[test]
    fn test_apply_role_membership_uses_catalog_spelling() {
        let server = MemoryServer::new("15.0.2000.5");
        let version = ServerVersion::parse("15.0.2000.5").unwrap();
        server.add_database("sales");
        server.add_user("sales", "bob", None);

        let mut session = server.connect("sales").unwrap();
        session
            .apply(
                &Operation::AddRoleMember {
                    database: "sales".into(),
                    user: "bob".into(),
                    role: "DB_OWNER".into(),
                },
                &version,
            )
            .unwrap();
        assert_eq!(server.user_roles("sales", "bob"), vec!["db_owner"]);

        let missing = Operation::AddRoleMember {
            database: "sales".into(),
            user: "bob".into(),
            role: "ghost".into(),
        };
        assert!(session.apply(&missing, &version).is_err());
        assert_eq!(server.journal().len(), 1);
    }
}
