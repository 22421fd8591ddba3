//! T-SQL rendering primitives.
//!
//! Values are always bound as parameters (`@P1`, `@P2`, ...). Identifiers
//! cannot be bound inside DDL, so they are allow-listed by
//! [`validate_identifier`] and then quoted server-side with `QUOTENAME`
//! inside a dynamic batch built by [`DynamicSql`].

use crate::error::{Error, Result};
use crate::model::Password;
use serde::Serialize;
use std::fmt;

/// Longest identifier SQL Server accepts (`sysname`).
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Punctuation allowed in identifiers besides letters and digits.
const IDENTIFIER_PUNCTUATION: &str = "_-. \\@#$";

/// Check a principal, database, language or role name against the allow-list.
pub fn validate_identifier(kind: &'static str, name: &str) -> Result<()> {
    let reject = |reason| Error::InvalidIdentifier {
        kind,
        name: name.to_string(),
        reason,
    };

    if name.trim().is_empty() {
        return Err(reject("must not be empty"));
    }
    if name.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(reject("longer than 128 characters"));
    }
    if name.trim() != name {
        return Err(reject("leading or trailing whitespace"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || IDENTIFIER_PUNCTUATION.contains(c))
    {
        return Err(reject("contains characters outside [letters, digits, _-. \\@#$]"));
    }
    Ok(())
}

/// Check an explicit SQL login SID: `0x` plus 16 bytes of hex.
pub fn validate_sid(login: &str, sid: &str) -> Result<()> {
    let digits = sid
        .strip_prefix("0x")
        .or_else(|| sid.strip_prefix("0X"))
        .unwrap_or_default();

    if digits.len() == 32 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(Error::InvalidSid {
            login: login.to_string(),
            sid: sid.to_string(),
        })
    }
}

/// Parsed `SERVERPROPERTY('ProductVersion')`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerVersion {
    raw: String,
    major: u32,
}

impl ServerVersion {
    /// Parse a dotted version string such as `12.0.6024.0`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let major = raw
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok())
            .ok_or_else(|| Error::InvalidVersion(raw.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            major,
        })
    }

    /// Major version (10 = 2008, 11 = 2012, 12 = 2014, ...).
    pub fn major(&self) -> u32 {
        self.major
    }

    /// The version string as reported by the server.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `sys.fn_hadr_is_primary_replica` exists from 2014 on.
    pub fn has_hadr(&self) -> bool {
        self.major >= 12
    }

    /// Database mirroring is the availability story before 2014.
    pub fn checks_mirroring(&self) -> bool {
        self.major < 12
    }

    /// `ALTER ROLE ... ADD MEMBER` exists from 2012 on.
    pub fn supports_alter_role(&self) -> bool {
        self.major >= 11
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// Plain text (identifiers, names)
    Text(String),
    /// Credential; redacted in `Debug`
    Secret(Password),
}

impl Param {
    /// The value to bind.
    pub fn value(&self) -> &str {
        match self {
            Param::Text(text) => text,
            Param::Secret(password) => password.expose(),
        }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    /// A statement whose parameters are all plain text.
    pub fn new(sql: impl Into<String>, params: &[&str]) -> Self {
        Self {
            sql: sql.into(),
            params: params.iter().map(|p| Param::Text((*p).to_string())).collect(),
        }
    }
}

/// Builder for `DECLARE @stmt nvarchar(max) = ...; EXEC (@stmt);` batches.
///
/// Every identifier and value becomes a bound parameter; the server does the
/// quoting. Only [`DynamicSql::text`] fragments are embedded in the SQL and
/// they are compile-time keywords or already-validated tokens.
#[derive(Debug, Default)]
pub struct DynamicSql {
    parts: Vec<String>,
    params: Vec<Param>,
}

impl DynamicSql {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a keyword fragment.
    pub fn text(mut self, fragment: &str) -> Self {
        self.parts.push(nstring(fragment));
        self
    }

    /// Append an identifier, bracket-quoted by `QUOTENAME`.
    pub fn ident(mut self, name: &str) -> Self {
        let placeholder = self.bind(Param::Text(name.to_string()));
        self.parts.push(format!("QUOTENAME({placeholder})"));
        self
    }

    /// Append a string literal, quoted with `REPLACE` so long values survive.
    pub fn literal(mut self, value: Param) -> Self {
        let placeholder = self.bind(value);
        self.parts
            .push(format!("N'''' + REPLACE({placeholder}, N'''', N'''''') + N''''"));
        self
    }

    fn bind(&mut self, value: Param) -> String {
        self.params.push(value);
        format!("@P{}", self.params.len())
    }

    pub fn build(self) -> Statement {
        Statement {
            sql: format!(
                "DECLARE @stmt nvarchar(max) = {}; EXEC (@stmt);",
                self.parts.join(" + ")
            ),
            params: self.params,
        }
    }
}

/// Render a fragment as an N'' string literal.
fn nstring(fragment: &str) -> String {
    format!("N'{}'", fragment.replace('\'', "''"))
}
