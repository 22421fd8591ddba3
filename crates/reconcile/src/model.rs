//! Declared principals: input records and their validated form.
//!
//! Input documents deserialize into the `*Record` types, which mirror the
//! JSON contract. [`Specification`] merges documents and turns every record
//! into a validated [`LoginSpec`] with cascaded states, derived SIDs and
//! case-insensitive role sets.

use crate::error::{Error, Result};
use crate::sql::{validate_identifier, validate_sid};
use md5::{Digest, Md5};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// What a credential renders as anywhere outside the wire.
pub const REDACTED: &str = "*****";

/// Declared state of a principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalState {
    /// Principal should exist
    #[default]
    Present,
    /// Principal should not exist
    Absent,
}

impl PrincipalState {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// A login password. Never printed, serialized or logged in clear.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The clear-text value, for binding as a query parameter only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

// ============================================================================
// Input records
// ============================================================================

/// The members of a JSON object in document order, repeated keys included.
///
/// A map type would silently keep one value per key; duplicate handling is
/// left to [`Specification`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entries<T>(Vec<(String, T)>);

impl<T> Entries<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> FromIterator<(String, T)> for Entries<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T> IntoIterator for Entries<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

struct EntriesVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
    type Value = Entries<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object keyed by name")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::new();
        while let Some(entry) = map.next_entry::<String, T>()? {
            entries.push(entry);
        }
        Ok(Entries(entries))
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

/// One login as written in a source document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRecord {
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub password: Option<Password>,
    #[serde(default)]
    pub default_database: Option<String>,
    #[serde(default)]
    pub default_language: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub state: PrincipalState,
    #[serde(default)]
    pub users: Entries<UserRecord>,
}

fn default_enabled() -> bool {
    true
}

/// One database user as written under a login.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserRecord {
    #[serde(default)]
    pub state: PrincipalState,
    #[serde(default)]
    pub databases: Entries<DatabaseRecord>,
}

/// One database binding as written under a user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseRecord {
    #[serde(default)]
    pub state: PrincipalState,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A whole source document: login name to record.
pub type LoginDocument = Entries<LoginRecord>;

// ============================================================================
// Validated entities
// ============================================================================

/// Case-insensitive set of role names that remembers one spelling per role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet {
    roles: BTreeMap<String, String>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a role; returns false if a role with the same folded name exists.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        let key = fold(&name);
        if self.roles.contains_key(&key) {
            return false;
        }
        self.roles.insert(key, name);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(&fold(name))
    }

    /// The stored spelling of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.roles.get(&fold(name)).map(String::as_str)
    }

    /// Role names in case-insensitive order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.roles.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for RoleSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name);
        }
        set
    }
}

impl Serialize for RoleSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// A user's membership in one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseBinding {
    pub database: String,
    /// Effective state, after cascading from the user and login
    pub state: PrincipalState,
    pub roles: RoleSet,
}

/// A database user declared under a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSpec {
    pub name: String,
    /// Effective state, after cascading from the login
    pub state: PrincipalState,
    pub databases: Vec<DatabaseBinding>,
}

/// A validated login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginSpec {
    pub name: String,
    /// Source the definition came from
    pub origin: String,
    /// Declared SID; Windows logins never carry one
    pub sid: Option<String>,
    pub password: Option<Password>,
    pub default_database: Option<String>,
    pub default_language: Option<String>,
    pub enabled: bool,
    pub state: PrincipalState,
    pub users: Vec<UserSpec>,
    /// Problems found while validating that did not reject the login
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl LoginSpec {
    /// Validate a record and cascade absent states downwards. Users and
    /// databases repeated under the login go through `policy`.
    pub fn from_record(
        name: &str,
        origin: &str,
        record: LoginRecord,
        policy: DuplicatePolicy,
    ) -> Result<Self> {
        validate_identifier("login", name)?;

        let mut warnings = Vec::new();
        let windows = is_windows_login(name);

        let mut sid = record.sid;
        let mut password = record.password;
        if windows {
            if password.take().is_some() {
                warnings.push(format!(
                    "login {name} is a windows login, declared password ignored"
                ));
            }
            if sid.take().is_some() {
                warnings.push(format!("login {name} is a windows login, declared sid ignored"));
            }
        }
        if let Some(sid) = &sid {
            validate_sid(name, sid)?;
        }
        if let Some(database) = &record.default_database {
            validate_identifier("database", database)?;
        }
        if let Some(language) = &record.default_language {
            validate_identifier("language", language)?;
        }

        let mut users: Vec<UserSpec> = Vec::with_capacity(record.users.len());
        for (user_name, user) in record.users {
            validate_identifier("user", &user_name)?;
            let user_state = cascade(record.state, user.state);

            let mut databases: Vec<DatabaseBinding> = Vec::with_capacity(user.databases.len());
            for (database, binding) in user.databases {
                validate_identifier("database", &database)?;
                let mut roles = RoleSet::new();
                for role in binding.roles {
                    validate_identifier("role", &role)?;
                    roles.insert(role);
                }
                let binding = DatabaseBinding {
                    state: cascade(user_state, binding.state),
                    database,
                    roles,
                };
                let key = fold(&binding.database);
                match databases.iter().position(|d| fold(&d.database) == key) {
                    Some(index) => {
                        let what = format!("database {} of user {user_name}", binding.database);
                        repeated(policy, &what, name, origin, &mut warnings)?;
                        databases[index] = binding;
                    }
                    None => databases.push(binding),
                }
            }

            let user = UserSpec {
                name: user_name,
                state: user_state,
                databases,
            };
            let key = fold(&user.name);
            match users.iter().position(|u| fold(&u.name) == key) {
                Some(index) => {
                    repeated(policy, &format!("user {}", user.name), name, origin, &mut warnings)?;
                    users[index] = user;
                }
                None => users.push(user),
            }
        }

        Ok(Self {
            name: name.to_string(),
            origin: origin.to_string(),
            sid,
            password,
            default_database: record.default_database,
            default_language: record.default_language,
            enabled: record.enabled,
            state: record.state,
            users,
            warnings,
        })
    }

    pub fn is_windows(&self) -> bool {
        is_windows_login(&self.name)
    }

    /// SID to create the login with: declared, else derived from the name.
    pub fn effective_sid(&self) -> Option<String> {
        if self.is_windows() {
            return None;
        }
        Some(self.sid.clone().unwrap_or_else(|| derive_sid(&self.name)))
    }

    /// Every (user, binding) pair in declaration order.
    pub fn bindings(&self) -> impl Iterator<Item = (&UserSpec, &DatabaseBinding)> {
        self.users
            .iter()
            .flat_map(|user| user.databases.iter().map(move |binding| (user, binding)))
    }
}

/// Apply the duplicate policy to a key repeated under one login.
fn repeated(
    policy: DuplicatePolicy,
    what: &str,
    login: &str,
    origin: &str,
    warnings: &mut Vec<String>,
) -> Result<()> {
    if policy == DuplicatePolicy::Reject {
        return Err(Error::Specification {
            origin: origin.to_string(),
            message: format!("{what} declared more than once under login {login}"),
        });
    }
    log::warn!("{what} declared more than once under login {login} in {origin}");
    warnings.push(format!(
        "{what} declared more than once under login {login}, using the last definition"
    ));
    Ok(())
}

fn cascade(parent: PrincipalState, own: PrincipalState) -> PrincipalState {
    if parent.is_absent() {
        PrincipalState::Absent
    } else {
        own
    }
}

/// A name with a domain separator authenticates through Windows.
pub fn is_windows_login(name: &str) -> bool {
    name.contains('\\')
}

/// Deterministic SID for a SQL login: `0x` + MD5 of the upper-cased name.
pub fn derive_sid(login: &str) -> String {
    let digest = Md5::digest(login.to_uppercase().as_bytes());
    format!("0x{}", hex::encode(digest))
}

/// Case folding used for every name comparison.
pub(crate) fn fold(name: &str) -> String {
    name.to_lowercase()
}

// ============================================================================
// Merged specification
// ============================================================================

/// What to do when a login key appears in more than one place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the last definition and warn
    #[default]
    LastWins,
    /// Reject the whole specification
    Reject,
}

/// All declared logins, merged across sources.
#[derive(Debug, Clone, Default)]
pub struct Specification {
    logins: BTreeMap<String, LoginSpec>,
    policy: DuplicatePolicy,
}

impl Specification {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            logins: BTreeMap::new(),
            policy,
        }
    }

    /// Parse and merge one JSON document.
    pub fn add_json(&mut self, origin: &str, text: &str) -> Result<()> {
        let document: LoginDocument =
            serde_json::from_str(text).map_err(|e| Error::Specification {
                origin: origin.to_string(),
                message: e.to_string(),
            })?;
        self.add_document(origin, document)
    }

    /// Validate and merge one parsed document.
    pub fn add_document(&mut self, origin: &str, document: LoginDocument) -> Result<()> {
        for (name, record) in document {
            let mut login = LoginSpec::from_record(&name, origin, record, self.policy)?;
            let key = fold(&name);

            if let Some(previous) = self.logins.get(&key) {
                if self.policy == DuplicatePolicy::Reject {
                    return Err(Error::DuplicateLogin {
                        login: name,
                        origin: origin.to_string(),
                    });
                }
                log::warn!(
                    "login {name} in {origin} replaces the definition from {}",
                    previous.origin
                );
                login.warnings.push(format!(
                    "login {name} declared more than once, using definition from {origin} over {}",
                    previous.origin
                ));
            }
            self.logins.insert(key, login);
        }
        Ok(())
    }

    /// Logins in case-insensitive name order.
    pub fn logins(&self) -> impl Iterator<Item = &LoginSpec> {
        self.logins.values()
    }

    pub fn get(&self, name: &str) -> Option<&LoginSpec> {
        self.logins.get(&fold(name))
    }

    pub fn len(&self) -> usize {
        self.logins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> Specification {
        let mut spec = Specification::default();
        spec.add_json("test.json", json).unwrap();
        spec
    }

    #[test]
    fn test_derive_sid_is_md5_of_upper_name() {
        // md5("ALICE")
        assert_eq!(derive_sid("alice"), "0xb6b818304a439f91fc90b3fe8dd35be8");
        assert_eq!(derive_sid("alice"), derive_sid("ALICE"));
        assert_eq!(derive_sid("alice").len(), 34);
    }

    #[test]
    fn test_defaults() {
        let spec = spec(r#"{"alice": {}}"#);
        let alice = spec.get("alice").unwrap();
        assert!(alice.enabled);
        assert_eq!(alice.state, PrincipalState::Present);
        assert_eq!(alice.effective_sid(), Some(derive_sid("alice")));
        assert!(alice.users.is_empty());
    }

    #[test]
    fn test_unknown_state_is_rejected_with_origin() {
        let mut spec = Specification::default();
        let err = spec
            .add_json("logins/bad.json", r#"{"alice": {"state": "gone"}}"#)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("logins/bad.json"));
    }

    #[test]
    fn test_absent_login_cascades() {
        let spec = spec(
            r#"{"alice": {"state": "absent", "users": {"alice": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#,
        );
        let alice = spec.get("alice").unwrap();
        assert!(alice.bindings().all(|(user, binding)| {
            user.state.is_absent() && binding.state.is_absent()
        }));
    }

    #[test]
    fn test_absent_user_cascades_to_bindings() {
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"state": "absent", "databases": {"a": {}, "b": {"state": "present"}}}}}}"#,
        );
        let bob = spec.get("bob").unwrap();
        assert_eq!(bob.state, PrincipalState::Present);
        assert!(bob.bindings().all(|(_, binding)| binding.state.is_absent()));
    }

    #[test]
    fn test_windows_login_drops_credentials() {
        let spec = spec(r#"{"CORP\\svc": {"password": "x", "sid": "0x0123456789abcdef0123456789abcdef"}}"#);
        let login = spec.get("corp\\SVC").unwrap();
        assert!(login.is_windows());
        assert!(login.password.is_none());
        assert!(login.effective_sid().is_none());
        assert_eq!(login.warnings.len(), 2);
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let mut spec = Specification::default();
        let json = r#"{"alice": {"users": {"alice": {"databases": {"sales]; --": {}}}}}}"#;
        assert!(matches!(
            spec.add_json("x.json", json),
            Err(Error::InvalidIdentifier { kind: "database", .. })
        ));
    }

    #[test]
    fn test_duplicate_login_last_wins() {
        let mut spec = Specification::default();
        spec.add_json("a.json", r#"{"alice": {"enabled": true}}"#).unwrap();
        spec.add_json("b.json", r#"{"ALICE": {"enabled": false}}"#).unwrap();

        assert_eq!(spec.len(), 1);
        let alice = spec.get("alice").unwrap();
        assert!(!alice.enabled);
        assert_eq!(alice.origin, "b.json");
        assert_eq!(alice.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_login_rejected_when_strict() {
        let mut spec = Specification::new(DuplicatePolicy::Reject);
        spec.add_json("a.json", r#"{"alice": {}}"#).unwrap();
        let err = spec.add_json("b.json", r#"{"Alice": {}}"#).unwrap_err();
        assert!(matches!(err, Error::DuplicateLogin { .. }));
    }

    #[test]
    fn test_repeated_key_in_one_document() {
        let json = r#"{"alice":{"enabled":true},"alice":{"enabled":false}}"#;

        let mut strict = Specification::new(DuplicatePolicy::Reject);
        let err = strict.add_json("a.json", json).unwrap_err();
        assert!(matches!(err, Error::DuplicateLogin { ref origin, .. } if origin == "a.json"));

        let lax = spec(json);
        assert_eq!(lax.len(), 1);
        let alice = lax.get("alice").unwrap();
        assert!(!alice.enabled);
        assert_eq!(alice.warnings.len(), 1);
        assert!(alice.warnings[0].contains("declared more than once"));
    }

    #[test]
    fn test_repeated_user_and_database_keys() {
        let json = r#"{"bob": {"users": {
            "bob": {"databases": {"sales": {"roles": ["a"]}, "SALES": {"roles": ["b"]}}},
            "Bob": {"databases": {"sales": {}, "hr": {}}}
        }}}"#;

        let mut strict = Specification::new(DuplicatePolicy::Reject);
        let err = strict.add_json("b.json", json).unwrap_err();
        assert!(matches!(err, Error::Specification { .. }));
        assert!(err.to_string().contains("declared more than once under login bob"));

        let lax = spec(json);
        let bob = lax.get("bob").unwrap();
        assert_eq!(bob.users.len(), 1);
        assert_eq!(bob.users[0].name, "Bob");
        let databases: Vec<&str> = bob.bindings().map(|(_, b)| b.database.as_str()).collect();
        assert_eq!(databases, ["sales", "hr"]);
        // one warning for the database under bob, one for the user itself
        assert_eq!(bob.warnings.len(), 2);
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let spec = spec(
            r#"{"zed": {"users": {"zed": {"databases": {"zulu": {}, "alpha": {}, "mike": {}}}, "adm": {}}}}"#,
        );
        let zed = spec.get("zed").unwrap();
        let users: Vec<&str> = zed.users.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(users, ["zed", "adm"]);
        let databases: Vec<&str> = zed.bindings().map(|(_, b)| b.database.as_str()).collect();
        assert_eq!(databases, ["zulu", "alpha", "mike"]);
    }

    #[test]
    fn test_document_must_be_an_object() {
        let mut spec = Specification::default();
        let err = spec.add_json("x.json", r#"["alice"]"#).unwrap_err();
        assert!(err.to_string().contains("an object keyed by name"));
    }

    #[test]
    fn test_roles_deduplicated_case_insensitively() {
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"roles": ["db_owner", "DB_OWNER", "reader"]}}}}}}"#,
        );
        let (_, binding) = spec.get("bob").unwrap().bindings().next().unwrap();
        assert_eq!(binding.roles.len(), 2);
        assert_eq!(binding.roles.get("Db_Owner"), Some("db_owner"));
    }

    #[test]
    fn test_password_never_rendered() {
        let spec = spec(r#"{"alice": {"password": "hunter2"}}"#);
        let alice = spec.get("alice").unwrap();
        assert!(!format!("{alice:?}").contains("hunter2"));
        assert!(!serde_json::to_string(alice).unwrap().contains("hunter2"));
        assert_eq!(alice.password.as_ref().unwrap().expose(), "hunter2");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut spec = Specification::default();
        assert!(spec.add_json("x.json", r#"{"alice": {"passwd": "x"}}"#).is_err());
    }
}
