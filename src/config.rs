//! Settings file and CLI overrides.

use anyhow::{Context, Result};
use reconcile::{DuplicatePolicy, Mode, Password, RoleSet, RunOptions};
use serde::Deserialize;
use sqlserver::ServerConfig;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::Cli;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("loginsync"))
}

/// Contents of `config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerConfig,
    pub run: RunSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    pub jobs: Option<usize>,
    pub strict: bool,
    /// Major versions; empty keeps the built-in range
    pub supported_versions: Vec<u32>,
    pub auto_create_roles: Vec<String>,
}

impl Settings {
    /// Load `path`, or the default location when it exists.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = config_dir()?.join("config.toml");
                if !default.exists() {
                    log::debug!("no settings at {}, using defaults", default.display());
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        log::debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Apply command-line overrides.
    pub fn merge_cli(&mut self, cli: &Cli) {
        let server = &cli.server;
        if let Some(host) = &server.host {
            self.server.host.clone_from(host);
        }
        if let Some(port) = server.port {
            self.server.port = port;
        }
        if let Some(user) = &server.user {
            self.server.user.clone_from(user);
        }
        if let Some(password) = &server.password {
            self.server.password = Password::new(password.as_str());
        }
        if cli.jobs.is_some() {
            self.run.jobs = cli.jobs;
        }
        self.run.strict |= cli.strict;
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        if self.run.strict {
            DuplicatePolicy::Reject
        } else {
            DuplicatePolicy::LastWins
        }
    }

    /// Engine options for a run in `mode`.
    pub fn run_options(&self, mode: Mode) -> RunOptions {
        let mut options = RunOptions::default().with_mode(mode);
        if let Some(jobs) = self.run.jobs {
            options.jobs = jobs;
        }
        if !self.run.supported_versions.is_empty() {
            options.supported_versions = self
                .run
                .supported_versions
                .iter()
                .copied()
                .collect::<BTreeSet<_>>();
        }
        options.auto_create_roles = self
            .run
            .auto_create_roles
            .iter()
            .cloned()
            .collect::<RoleSet>();
        options
    }
}
