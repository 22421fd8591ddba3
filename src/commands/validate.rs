//! `validate`: load and check sources without touching a server.

use anyhow::Result;
use colored::Colorize;
use reconcile::{LoginSpec, PrincipalState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::ExitCode;

use crate::Context;
use crate::cli::SourceArgs;
use crate::config::Settings;
use crate::sources::{self, Loaded};
use crate::ui;

#[derive(Serialize)]
struct ValidationOutput<'a> {
    sources: BTreeMap<&'a str, Vec<String>>,
    warnings: Vec<&'a str>,
    logins: Vec<&'a LoginSpec>,
}

pub fn run(ctx: &Context, settings: &Settings, args: &SourceArgs) -> Result<ExitCode> {
    let loaded = sources::load(&args.sources, settings.duplicate_policy())?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&output(&loaded))?);
        return Ok(ExitCode::SUCCESS);
    }
    if ctx.quiet {
        return Ok(ExitCode::SUCCESS);
    }

    ui::header("Sources");
    for source in &loaded.sources {
        ui::kv(&source.source, &format!("{} files", source.files.len()));
        for file in &source.files {
            ui::dim(&file.display().to_string());
        }
    }
    for warning in &loaded.warnings {
        ui::warn(warning);
    }

    ui::section(&format!("Logins ({})", loaded.spec.len()));
    for login in loaded.spec.logins() {
        print_login(login, ctx.verbose > 0);
    }

    println!();
    ui::success(&format!(
        "{} logins valid across {} files",
        loaded.spec.len(),
        loaded.file_count()
    ));
    Ok(ExitCode::SUCCESS)
}

fn output(loaded: &Loaded) -> ValidationOutput<'_> {
    let sources = loaded
        .sources
        .iter()
        .map(|s| {
            let files = s.files.iter().map(|f| f.display().to_string()).collect();
            (s.source.as_str(), files)
        })
        .collect();
    let mut warnings: Vec<&str> = loaded.warnings.iter().map(String::as_str).collect();
    for login in loaded.spec.logins() {
        warnings.extend(login.warnings.iter().map(String::as_str));
    }
    ValidationOutput {
        sources,
        warnings,
        logins: loaded.spec.logins().collect(),
    }
}

/// One-line summary of a login, e.g. `sql, enabled, 2 users`.
fn describe(login: &LoginSpec) -> String {
    if login.state.is_absent() {
        return "absent".to_string();
    }
    let kind = if login.is_windows() { "windows" } else { "sql" };
    let enabled = if login.enabled { "enabled" } else { "disabled" };
    format!("{kind}, {enabled}, {} users", login.users.len())
}

fn print_login(login: &LoginSpec, verbose: bool) {
    let name = if login.state.is_absent() {
        login.name.red()
    } else {
        login.name.bold()
    };
    println!("  {} {}", name, format!("({})", describe(login)).dimmed());

    if verbose {
        if let Some(password) = &login.password {
            ui::kv("    password", &password.to_string());
        }
        if let Some(sid) = login.effective_sid() {
            ui::kv("    sid", &sid);
        }
        if let Some(db) = &login.default_database {
            ui::kv("    default database", db);
        }
        if let Some(language) = &login.default_language {
            ui::kv("    default language", language);
        }
        ui::kv("    from", &login.origin);
    }

    for (user, binding) in login.bindings() {
        let roles: Vec<&str> = binding.roles.iter().collect();
        let line = match binding.state {
            PrincipalState::Absent => format!("{}.{} absent", binding.database, user.name),
            PrincipalState::Present if roles.is_empty() => {
                format!("{}.{}", binding.database, user.name)
            }
            PrincipalState::Present => {
                format!("{}.{} [{}]", binding.database, user.name, roles.join(", "))
            }
        };
        ui::dim(&format!("  {line}"));
    }
    for warning in &login.warnings {
        ui::warn(&format!("  {warning}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::DuplicatePolicy;
    use std::fs;
    use tempfile::TempDir;

    fn load(json: &str) -> (TempDir, Loaded) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("logins.json"), json).unwrap();
        let loaded = sources::load(
            &[tmp.path().display().to_string()],
            DuplicatePolicy::LastWins,
        )
        .unwrap();
        (tmp, loaded)
    }

    #[test]
    fn test_json_output_redacts_passwords() {
        let (_tmp, loaded) = load(r#"{"alice": {"password": "hunter2", "enabled": false}}"#);
        let json = serde_json::to_string(&output(&loaded)).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("*****"));
        assert!(json.contains("logins.json"));
    }

    #[test]
    fn test_json_output_collects_login_warnings() {
        let (_tmp, loaded) = load(r#"{"CORP\\carol": {"password": "pw"}}"#);
        let out = output(&loaded);
        assert_eq!(out.logins.len(), 1);
        assert!(!out.warnings.is_empty());
    }

    #[test]
    fn test_describe() {
        let (_tmp, loaded) = load(
            r#"{
                "alice": {"password": "pw", "enabled": false, "users": {"alice": {}}},
                "CORP\\dave": {},
                "old": {"state": "absent"}
            }"#,
        );
        let spec = &loaded.spec;
        assert_eq!(describe(spec.get("alice").unwrap()), "sql, disabled, 1 users");
        assert_eq!(describe(spec.get("corp\\dave").unwrap()), "windows, enabled, 0 users");
        assert_eq!(describe(spec.get("old").unwrap()), "absent");
    }
}
