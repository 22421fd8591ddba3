//! Mutating operations and their rendering.

use crate::inspect::SERVER_DATABASE;
use crate::model::{Password, REDACTED};
use crate::sql::{DynamicSql, Param, ServerVersion, Statement};
use std::fmt;

/// One change to the server, carrying the identifiers it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateLogin {
        login: String,
        /// Authenticated by Windows; never carries password or SID
        windows: bool,
        sid: Option<String>,
        password: Option<Password>,
        default_database: Option<String>,
        default_language: Option<String>,
    },
    AlterDefaultDatabase {
        login: String,
        database: String,
    },
    AlterDefaultLanguage {
        login: String,
        language: String,
    },
    AlterPassword {
        login: String,
        password: Password,
    },
    SetEnabled {
        login: String,
        enabled: bool,
    },
    DropLogin {
        login: String,
    },
    CreateUser {
        database: String,
        user: String,
        login: String,
        /// SID the login has or will be created with
        sid: Option<String>,
        /// The user exists but is mapped elsewhere; remap instead of create
        reassociate: bool,
    },
    DropUser {
        database: String,
        user: String,
    },
    CreateRole {
        database: String,
        role: String,
    },
    AddRoleMember {
        database: String,
        user: String,
        role: String,
    },
    RemoveRoleMember {
        database: String,
        user: String,
        role: String,
    },
}

impl Operation {
    /// Short stable name of the operation.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateLogin { .. } => "create_login",
            Operation::AlterDefaultDatabase { .. } => "alter_default_database",
            Operation::AlterDefaultLanguage { .. } => "alter_default_language",
            Operation::AlterPassword { .. } => "alter_password",
            Operation::SetEnabled { .. } => "set_enabled",
            Operation::DropLogin { .. } => "drop_login",
            Operation::CreateUser { .. } => "create_user",
            Operation::DropUser { .. } => "drop_user",
            Operation::CreateRole { .. } => "create_role",
            Operation::AddRoleMember { .. } => "add_role_member",
            Operation::RemoveRoleMember { .. } => "remove_role_member",
        }
    }

    /// Database the operation's session must be scoped to.
    pub fn database(&self) -> &str {
        match self {
            Operation::CreateUser { database, .. }
            | Operation::DropUser { database, .. }
            | Operation::CreateRole { database, .. }
            | Operation::AddRoleMember { database, .. }
            | Operation::RemoveRoleMember { database, .. } => database,
            _ => SERVER_DATABASE,
        }
    }

    /// Failure of this operation ends the login's run.
    pub fn is_login_fatal(&self) -> bool {
        matches!(
            self,
            Operation::CreateLogin { .. } | Operation::DropLogin { .. }
        )
    }

    /// Change line reported when the operation takes effect.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateLogin {
                login,
                windows,
                sid,
                password,
                default_database,
                default_language,
            } => {
                let mut message = format!("login {login} created");
                if *windows {
                    message.push_str(" from windows");
                }
                let mut options = Vec::new();
                if let Some(sid) = sid {
                    options.push(format!("sid: {sid}"));
                }
                if password.is_some() {
                    options.push(format!("password: {REDACTED}"));
                }
                if let Some(language) = default_language {
                    options.push(format!("default_language: {language}"));
                }
                if let Some(database) = default_database {
                    options.push(format!("default_database: {database}"));
                }
                if !options.is_empty() {
                    message.push_str(" with ");
                    message.push_str(&options.join(", "));
                }
                message
            }
            Operation::AlterDefaultDatabase { database, .. } => {
                format!("default database changed to: {database}")
            }
            Operation::AlterDefaultLanguage { language, .. } => {
                format!("default language changed to: {language}")
            }
            Operation::AlterPassword { .. } => format!("password changed to: {REDACTED}"),
            Operation::SetEnabled { login, enabled } => {
                let verb = if *enabled { "enabled" } else { "disabled" };
                format!("login {login} {verb}")
            }
            Operation::DropLogin { login } => format!("login {login} dropped"),
            Operation::CreateUser { database, user, .. } => {
                format!("database {database}, user {user} created")
            }
            Operation::DropUser { database, user } => {
                format!("database: {database}, user {user} dropped")
            }
            Operation::CreateRole { database, role } => {
                format!("database {database}, role: {role} created")
            }
            Operation::AddRoleMember {
                database,
                user,
                role,
            } => format!("database {database}, user {user}, role: {role} added"),
            Operation::RemoveRoleMember {
                database,
                user,
                role,
            } => format!("database {database}, user {user}, role: {role} removed"),
        }
    }

    /// Prefix of the error line reported when the operation fails.
    pub fn failure_context(&self) -> String {
        match self {
            Operation::CreateLogin { .. } => "error occurred while creating login: ".to_string(),
            Operation::AlterDefaultDatabase { .. } => {
                "error occurred while changing the default database: ".to_string()
            }
            Operation::AlterDefaultLanguage { .. } => {
                "error occurred while changing the default language: ".to_string()
            }
            Operation::AlterPassword { .. } => "error occurred while changing password: ".to_string(),
            Operation::SetEnabled { login, enabled } => {
                let verb = if *enabled { "enabled" } else { "disabled" };
                format!("error occurred while {verb} login: {login} ")
            }
            Operation::DropLogin { login } => format!("error occurred while drop login {login}: "),
            Operation::CreateUser { database, user, .. } => {
                format!("error occurred while create user: {user}, database: {database}; ")
            }
            Operation::DropUser { database, user } => {
                format!("error occurred while drop user: {user}, database: {database}; ")
            }
            Operation::CreateRole { database, role } => {
                format!("error occurred while create role: {role}, database: {database}; ")
            }
            Operation::AddRoleMember {
                database,
                user,
                role,
            } => format!(
                "error occurred while add role: {role} to user: {user}, database: {database}; "
            ),
            Operation::RemoveRoleMember {
                database,
                user,
                role,
            } => format!(
                "error occurred while remove role: {role} user: {user}, database: {database}; "
            ),
        }
    }

    /// Render the statement for the given server version.
    pub fn statement(&self, version: &ServerVersion) -> Statement {
        match self {
            Operation::CreateLogin {
                login,
                windows,
                sid,
                password,
                default_database,
                default_language,
            } => {
                let mut sql = DynamicSql::new().text("CREATE LOGIN ").ident(login);
                let mut separator = " WITH ";
                if *windows {
                    sql = sql.text(" FROM WINDOWS");
                } else {
                    if let Some(password) = password {
                        sql = sql
                            .text(" WITH PASSWORD = ")
                            .literal(Param::Secret(password.clone()));
                        separator = ", ";
                    }
                    if let Some(sid) = sid {
                        // validated hex literal, the only interpolated token
                        sql = sql.text(&format!("{separator}SID = {sid}"));
                        separator = ", ";
                    }
                }
                if let Some(database) = default_database {
                    sql = sql
                        .text(&format!("{separator}DEFAULT_DATABASE = "))
                        .ident(database);
                    separator = ", ";
                }
                if let Some(language) = default_language {
                    sql = sql
                        .text(&format!("{separator}DEFAULT_LANGUAGE = "))
                        .ident(language);
                }
                sql.build()
            }
            Operation::AlterDefaultDatabase { login, database } => DynamicSql::new()
                .text("ALTER LOGIN ")
                .ident(login)
                .text(" WITH DEFAULT_DATABASE = ")
                .ident(database)
                .build(),
            Operation::AlterDefaultLanguage { login, language } => DynamicSql::new()
                .text("ALTER LOGIN ")
                .ident(login)
                .text(" WITH DEFAULT_LANGUAGE = ")
                .ident(language)
                .build(),
            Operation::AlterPassword { login, password } => DynamicSql::new()
                .text("ALTER LOGIN ")
                .ident(login)
                .text(" WITH PASSWORD = ")
                .literal(Param::Secret(password.clone()))
                .build(),
            Operation::SetEnabled { login, enabled } => DynamicSql::new()
                .text("ALTER LOGIN ")
                .ident(login)
                .text(if *enabled { " ENABLE" } else { " DISABLE" })
                .build(),
            Operation::DropLogin { login } => DynamicSql::new().text("DROP LOGIN ").ident(login).build(),
            Operation::CreateUser {
                user,
                login,
                reassociate,
                ..
            } => {
                if *reassociate {
                    DynamicSql::new()
                        .text("ALTER USER ")
                        .ident(user)
                        .text(" WITH LOGIN = ")
                        .ident(login)
                        .build()
                } else {
                    DynamicSql::new()
                        .text("CREATE USER ")
                        .ident(user)
                        .text(" FOR LOGIN ")
                        .ident(login)
                        .build()
                }
            }
            Operation::DropUser { user, .. } => DynamicSql::new().text("DROP USER ").ident(user).build(),
            Operation::CreateRole { role, .. } => DynamicSql::new().text("CREATE ROLE ").ident(role).build(),
            Operation::AddRoleMember { user, role, .. } => {
                if version.supports_alter_role() {
                    DynamicSql::new()
                        .text("ALTER ROLE ")
                        .ident(role)
                        .text(" ADD MEMBER ")
                        .ident(user)
                        .build()
                } else {
                    Statement::new("EXEC sp_addrolemember @P1, @P2", &[role.as_str(), user.as_str()])
                }
            }
            Operation::RemoveRoleMember { user, role, .. } => {
                if version.supports_alter_role() {
                    DynamicSql::new()
                        .text("ALTER ROLE ")
                        .ident(role)
                        .text(" DROP MEMBER ")
                        .ident(user)
                        .build()
                } else {
                    Statement::new("EXEC sp_droprolemember @P1, @P2", &[role.as_str(), user.as_str()])
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();
        match self {
            Operation::CreateLogin { login, .. }
            | Operation::AlterDefaultDatabase { login, .. }
            | Operation::AlterDefaultLanguage { login, .. }
            | Operation::AlterPassword { login, .. }
            | Operation::SetEnabled { login, .. }
            | Operation::DropLogin { login } => write!(f, "{kind} {login}"),
            Operation::CreateUser { database, user, .. }
            | Operation::DropUser { database, user } => write!(f, "{kind} {database}.{user}"),
            Operation::CreateRole { database, role } => write!(f, "{kind} {database}.{role}"),
            Operation::AddRoleMember {
                database,
                user,
                role,
            }
            | Operation::RemoveRoleMember {
                database,
                user,
                role,
            } => write!(f, "{kind} {database}.{user} {role}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_alice() -> Operation {
        Operation::CreateLogin {
            login: "alice".into(),
            windows: false,
            sid: Some("0xb6b818304a439f91fc90b3fe8dd35be8".into()),
            password: Some(Password::new("pw")),
            default_database: Some("sales".into()),
            default_language: Some("us_english".into()),
        }
    }

    #[test]
    fn test_create_login_describe() {
        assert_eq!(
            create_alice().describe(),
            "login alice created with sid: 0xb6b818304a439f91fc90b3fe8dd35be8, password: *****, \
             default_language: us_english, default_database: sales"
        );

        let windows = Operation::CreateLogin {
            login: "CORP\\svc".into(),
            windows: true,
            sid: None,
            password: None,
            default_database: None,
            default_language: None,
        };
        assert_eq!(windows.describe(), "login CORP\\svc created from windows");
    }

    #[test]
    fn test_create_login_statement() {
        let version = ServerVersion::parse("15.0.2000.5").unwrap();
        let statement = create_alice().statement(&version);
        assert!(statement.sql.contains("SID = 0xb6b818304a439f91fc90b3fe8dd35be8"));
        assert!(!statement.sql.contains("alice"));
        assert!(!statement.sql.contains("pw'"));
        // login, password, database, language
        assert_eq!(statement.params.len(), 4);
    }

    #[test]
    fn test_role_member_statement_by_version() {
        let op = Operation::AddRoleMember {
            database: "sales".into(),
            user: "bob".into(),
            role: "db_owner".into(),
        };
        let modern = op.statement(&ServerVersion::parse("13.0.1601.5").unwrap());
        assert!(modern.sql.contains("ALTER ROLE "));
        assert!(modern.sql.contains("ADD MEMBER "));

        let legacy = op.statement(&ServerVersion::parse("10.50.6000.34").unwrap());
        assert_eq!(legacy.sql, "EXEC sp_addrolemember @P1, @P2");
        assert_eq!(legacy.params[0].value(), "db_owner");
        assert_eq!(legacy.params[1].value(), "bob");
    }

    #[test]
    fn test_login_fatal_operations() {
        assert!(create_alice().is_login_fatal());
        assert!(Operation::DropLogin { login: "a".into() }.is_login_fatal());
        assert!(!Operation::SetEnabled {
            login: "a".into(),
            enabled: false
        }
        .is_login_fatal());
    }

    #[test]
    fn test_operation_scopes() {
        assert_eq!(create_alice().database(), "master");
        let op = Operation::DropUser {
            database: "hr".into(),
            user: "bob".into(),
        };
        assert_eq!(op.database(), "hr");
        assert_eq!(op.describe(), "database: hr, user bob dropped");
        assert_eq!(op.to_string(), "drop_user hr.bob");
    }

    #[test]
    fn test_password_change_is_redacted() {
        let op = Operation::AlterPassword {
            login: "alice".into(),
            password: Password::new("hunter2"),
        };
        assert_eq!(op.describe(), "password changed to: *****");
        assert!(!format!("{op:?}").contains("hunter2"));
    }
}
