//! Plan builder: desired login plus observed state to ordered operations.
//!
//! This module has no side effects. The same plan drives check and apply
//! runs; the executor decides whether each operation is sent.

use crate::model::{fold, LoginSpec, RoleSet};
use crate::operation::Operation;
use crate::types::{BindingStatus, ObservedLoginState, ObservedUserState};

/// Role every database user belongs to implicitly.
const PUBLIC_ROLE: &str = "public";

/// Operations for one login, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub operations: Vec<Operation>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// Nothing can be done for this login
    pub halted: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Build the plan for one login.
pub fn plan_login(
    spec: &LoginSpec,
    observed: &ObservedLoginState,
    auto_create_roles: &RoleSet,
) -> Plan {
    let mut plan = Plan::default();

    if spec.state.is_absent() {
        plan_bindings(spec, observed, auto_create_roles, &mut plan);
        if observed.exists {
            plan.operations.push(Operation::DropLogin {
                login: spec.name.clone(),
            });
        }
        return plan;
    }

    if observed.exists {
        if !observed.default_database_matches
            && let Some(database) = &spec.default_database
        {
            plan.operations.push(Operation::AlterDefaultDatabase {
                login: spec.name.clone(),
                database: database.clone(),
            });
        }
        if !observed.default_language_matches
            && let Some(language) = &spec.default_language
        {
            plan.operations.push(Operation::AlterDefaultLanguage {
                login: spec.name.clone(),
                language: language.clone(),
            });
        }
        if !observed.password_matches
            && !spec.is_windows()
            && let Some(password) = &spec.password
        {
            plan.operations.push(Operation::AlterPassword {
                login: spec.name.clone(),
                password: password.clone(),
            });
        }
    } else {
        if !spec.is_windows() && spec.password.is_none() {
            plan.errors.push(format!(
                "error occurred while creating login: sql login {} needs a password",
                spec.name
            ));
            plan.halted = true;
            return plan;
        }
        plan.operations.push(Operation::CreateLogin {
            login: spec.name.clone(),
            windows: spec.is_windows(),
            sid: spec.effective_sid(),
            password: spec.password.clone(),
            default_database: spec.default_database.clone(),
            default_language: spec.default_language.clone(),
        });
    }

    if observed.enabled != spec.enabled {
        plan.operations.push(Operation::SetEnabled {
            login: spec.name.clone(),
            enabled: spec.enabled,
        });
    }

    plan_bindings(spec, observed, auto_create_roles, &mut plan);
    plan
}

fn plan_bindings(
    spec: &LoginSpec,
    observed: &ObservedLoginState,
    auto_create_roles: &RoleSet,
    plan: &mut Plan,
) {
    for ((user, binding), seen) in spec.bindings().zip(&observed.bindings) {
        let database = &binding.database;
        let state = match &seen.status {
            BindingStatus::Skipped(reason) => {
                plan.warnings.push(reason.warning(database));
                continue;
            }
            BindingStatus::Failed(message) => {
                plan.errors.push(message.clone());
                continue;
            }
            BindingStatus::Ready(state) => state,
        };

        if binding.state.is_absent() {
            if state.exists {
                plan.operations.push(Operation::DropUser {
                    database: database.clone(),
                    user: user.name.clone(),
                });
            }
            continue;
        }

        if !state.exists || !state.linked {
            plan.operations.push(Operation::CreateUser {
                database: database.clone(),
                user: user.name.clone(),
                login: spec.name.clone(),
                sid: spec.effective_sid(),
                reassociate: state.exists,
            });
        }

        let effective = effective_roles(
            &user.name,
            database,
            &binding.roles,
            state,
            auto_create_roles,
            plan,
        );

        for role in state.memberships.iter() {
            if !effective.contains(role) {
                plan.operations.push(Operation::RemoveRoleMember {
                    database: database.clone(),
                    user: user.name.clone(),
                    role: role.to_string(),
                });
            }
        }
        for role in effective.iter() {
            if !state.memberships.contains(role) {
                plan.operations.push(Operation::AddRoleMember {
                    database: database.clone(),
                    user: user.name.clone(),
                    role: role.to_string(),
                });
            }
        }
    }
}

/// Requested roles that exist, spelled as the catalog spells them. Missing
/// roles are warned about, unless they may be created.
fn effective_roles(
    user: &str,
    database: &str,
    requested: &RoleSet,
    state: &ObservedUserState,
    auto_create_roles: &RoleSet,
    plan: &mut Plan,
) -> RoleSet {
    let mut effective = RoleSet::new();

    for role in requested.iter() {
        if fold(role) == PUBLIC_ROLE {
            continue;
        }
        if let Some(name) = state.available_roles.get(role) {
            effective.insert(name);
        } else if auto_create_roles.contains(role) {
            plan.operations.push(Operation::CreateRole {
                database: database.to_string(),
                role: role.to_string(),
            });
            effective.insert(role);
        } else {
            let available: Vec<&str> = state.available_roles.iter().collect();
            plan.warnings.push(format!(
                "database {database}, user {user} sql role: {role} unavailable, available roles: {}",
                available.join(", ")
            ));
        }
    }

    effective
}
