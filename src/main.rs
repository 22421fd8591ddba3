mod cli;
mod commands;
mod config;
mod sources;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Settings;
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "loginsync", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
    };

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.merge_cli(&cli);

    let result = match &cli.command {
        Command::Apply(args) => commands::run::apply(&ctx, &settings, args),
        Command::Plan(args) => commands::run::plan(&ctx, &settings, args),
        Command::Validate(args) => commands::validate::run(&ctx, &settings, args),
        Command::Completions { .. } => Ok(ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => Ok(code),
        Err(e) if !ctx.json => {
            ui::error(&format!("{e:#}"));
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e),
    }
}
