//! Operation executor
//!
//! Re-checks each operation's precondition before acting, so a plan can be
//! replayed safely and check mode reports exactly what apply would change.

use crate::context::ConnectionFactory;
use crate::error::{Error, Result};
use crate::inspect::Inspector;
use crate::operation::Operation;
use crate::sql::ServerVersion;
use crate::types::Mode;

/// Runs operations against the server through scoped sessions.
pub struct Executor<'a> {
    factory: &'a dyn ConnectionFactory,
    inspector: Inspector<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(factory: &'a dyn ConnectionFactory, version: &'a ServerVersion) -> Self {
        Self {
            factory,
            inspector: Inspector::new(factory, version),
        }
    }

    /// Execute one operation. Returns whether it changed (or would change)
    /// the server.
    pub fn execute(&self, operation: &Operation, mode: Mode) -> Result<bool> {
        if !self.precondition_holds(operation)? {
            log::debug!("{operation}: already converged");
            return Ok(false);
        }
        if mode.is_check() {
            log::debug!("{operation}: would change");
            return Ok(true);
        }

        // The user may have appeared since planning; pick create or remap now.
        let refreshed;
        let operation = match operation {
            Operation::CreateUser {
                database,
                user,
                login,
                sid,
                ..
            } => {
                refreshed = Operation::CreateUser {
                    database: database.clone(),
                    user: user.clone(),
                    login: login.clone(),
                    sid: sid.clone(),
                    reassociate: self.inspector.user_exists(user, database)?,
                };
                &refreshed
            }
            other => other,
        };

        log::debug!("{operation}: applying");
        let mut session = self
            .factory
            .connect(operation.database())
            .map_err(|e| wrap(operation, e))?;
        session
            .apply(operation, self.inspector.version())
            .map_err(|e| wrap(operation, e))?;
        Ok(true)
    }

    /// The same predicate the planner used, read fresh.
    fn precondition_holds(&self, operation: &Operation) -> Result<bool> {
        let inspector = &self.inspector;
        match operation {
            Operation::CreateLogin { login, .. } => Ok(!inspector.login_exists(login)?),
            Operation::AlterDefaultDatabase { login, database } => Ok(inspector
                .login_exists(login)?
                && !inspector.default_database_matches(login, Some(database))?),
            Operation::AlterDefaultLanguage { login, language } => Ok(inspector
                .login_exists(login)?
                && !inspector.default_language_matches(login, Some(language))?),
            Operation::AlterPassword { login, password } => Ok(inspector.login_exists(login)?
                && !inspector.password_matches(login, Some(password))?),
            Operation::SetEnabled { login, enabled } => {
                Ok(inspector.is_enabled(login)? != *enabled)
            }
            Operation::DropLogin { login } => inspector.login_exists(login),
            Operation::CreateUser {
                database,
                user,
                login,
                sid,
                ..
            } => Ok(!inspector.user_exists(user, database)?
                || !inspector.user_linked(user, login, sid.as_deref(), database)?),
            Operation::DropUser { database, user } => inspector.user_exists(user, database),
            Operation::CreateRole { database, role } => {
                Ok(!inspector.available_roles(database)?.contains(role))
            }
            Operation::AddRoleMember {
                database,
                user,
                role,
            } => Ok(!inspector.role_memberships(user, database)?.contains(role)),
            Operation::RemoveRoleMember {
                database,
                user,
                role,
            } => Ok(inspector.role_memberships(user, database)?.contains(role)),
        }
    }
}

fn wrap(operation: &Operation, source: Error) -> Error {
    Error::Operation {
        operation: operation.to_string(),
        message: source.to_string(),
    }
}
