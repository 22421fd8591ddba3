use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loginsync")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(
    about = "Reconcile SQL Server logins, users and role memberships",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (default: ~/.config/loginsync/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub server: ServerArgs,

    /// Worker threads (0 = one per core)
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,

    /// Reject logins declared in more than one place
    #[arg(long, global = true)]
    pub strict: bool,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Connection overrides; each wins over the settings file.
#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Server host name or address
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Server TCP port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// SQL authentication user
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// SQL authentication password
    #[arg(long, global = true, env = "LOGINSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Plan, confirm and apply the declared principals
    Apply(ApplyArgs),

    /// Show what apply would change without changing anything
    Plan(SourceArgs),

    /// Load and validate sources without connecting
    Validate(SourceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// JSON files, directories or glob patterns
    #[arg(required = true, value_name = "SOURCES")]
    pub sources: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Stop after showing the plan
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_with_global_overrides() {
        let cli = Cli::try_parse_from([
            "loginsync",
            "apply",
            "logins/",
            "extra.json",
            "--host",
            "db01",
            "--port",
            "14330",
            "-j",
            "4",
            "--yes",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.server.host.as_deref(), Some("db01"));
        assert_eq!(cli.server.port, Some(14330));
        assert_eq!(cli.jobs, Some(4));
        match cli.command {
            Command::Apply(args) => {
                assert!(args.yes);
                assert!(!args.check);
                assert_eq!(args.source.sources, ["logins/", "extra.json"]);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_sources_are_required() {
        assert!(Cli::try_parse_from(["loginsync", "plan"]).is_err());
    }
}
