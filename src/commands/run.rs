//! `plan` and `apply`: reconcile the declared principals against a server.

use anyhow::{Context as AnyhowContext, Result, bail};
use reconcile::{ConnectionFactory, Mode, Reconciler, RunOptions, RunReport, Specification};
use sqlserver::TdsFactory;
use std::process::ExitCode;

use crate::Context;
use crate::cli::{ApplyArgs, SourceArgs};
use crate::config::Settings;
use crate::sources::{self, Loaded};
use crate::ui;

/// Show what apply would change.
pub fn plan(ctx: &Context, settings: &Settings, args: &SourceArgs) -> Result<ExitCode> {
    let loaded = load_sources(ctx, settings, &args.sources)?;
    if loaded.spec.is_empty() {
        return Ok(nothing_declared(ctx));
    }

    let factory = TdsFactory::new(settings.server.clone());
    let version = server_version(&factory, settings)?;
    let report = execute(ctx, &factory, settings.run_options(Mode::Check), &loaded.spec, &version)?;
    render(ctx, &report)?;
    Ok(exit_code(&report))
}

/// Plan, confirm, then apply.
pub fn apply(ctx: &Context, settings: &Settings, args: &ApplyArgs) -> Result<ExitCode> {
    if ctx.json && !args.yes && !args.check {
        bail!("--json needs --yes (or --check): there is no prompt in JSON mode");
    }

    let loaded = load_sources(ctx, settings, &args.source.sources)?;
    if loaded.spec.is_empty() {
        return Ok(nothing_declared(ctx));
    }

    let factory = TdsFactory::new(settings.server.clone());
    let version = server_version(&factory, settings)?;
    let planned = execute(ctx, &factory, settings.run_options(Mode::Check), &loaded.spec, &version)?;

    if args.check || !planned.changed {
        render(ctx, &planned)?;
        if !planned.changed && !ctx.quiet && !ctx.json {
            ui::success("Server already matches the declared logins");
        }
        return Ok(exit_code(&planned));
    }

    if !ctx.json {
        render(ctx, &planned)?;
        if !args.yes {
            println!();
            if !ui::confirm("Apply these changes?")? {
                ui::info("Aborted, nothing was changed");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }

    let applied = execute(ctx, &factory, settings.run_options(Mode::Apply), &loaded.spec, &version)?;
    render(ctx, &applied)?;
    Ok(exit_code(&applied))
}

fn load_sources(ctx: &Context, settings: &Settings, sources: &[String]) -> Result<Loaded> {
    let loaded = sources::load(sources, settings.duplicate_policy())?;
    if !ctx.quiet && !ctx.json {
        for warning in &loaded.warnings {
            ui::warn(warning);
        }
        ui::info(&format!(
            "Loaded {} logins from {} files",
            loaded.spec.len(),
            loaded.file_count()
        ));
    }
    Ok(loaded)
}

fn nothing_declared(ctx: &Context) -> ExitCode {
    if !ctx.quiet && !ctx.json {
        ui::warn("No logins declared, nothing to do");
    }
    ExitCode::SUCCESS
}

fn server_version(factory: &dyn ConnectionFactory, settings: &Settings) -> Result<String> {
    let version = factory
        .server_version()
        .with_context(|| format!("Could not connect to {}", settings.server.address()))?;
    log::info!("connected to {}, version {version}", settings.server.address());
    Ok(version)
}

/// One reconciler pass with a progress bar.
pub fn execute(
    ctx: &Context,
    factory: &dyn ConnectionFactory,
    options: RunOptions,
    spec: &Specification,
    version: &str,
) -> Result<RunReport> {
    let check = options.mode.is_check();
    let label = if check { "planning" } else { "applying" };
    let progress = ui::LoginProgress::new(label, ctx.quiet || ctx.json);
    let result = Reconciler::new(factory, options)
        .with_progress(&progress)
        .run(spec, version);
    progress.finish();

    let report = result.with_context(|| {
        if check {
            "Plan aborted before any login was inspected"
        } else {
            "Apply aborted before any login was changed"
        }
    })?;
    Ok(report)
}

fn render(ctx: &Context, report: &RunReport) -> Result<()> {
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if ctx.quiet {
        return Ok(());
    }
    ui::print_report(report, ctx.verbose > 0);
    ui::print_summary(&report.summary(), report.check_mode, report.execution_time);
    Ok(())
}

/// Failure when any login failed or recorded an error.
pub fn exit_code(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{DuplicatePolicy, MemoryServer};

    const VERSION: &str = "15.0.2000.5";

    fn quiet() -> Context {
        Context {
            verbose: 0,
            quiet: true,
            json: false,
        }
    }

    fn spec(json: &str) -> Specification {
        let mut spec = Specification::new(DuplicatePolicy::LastWins);
        spec.add_json("logins.json", json).unwrap();
        spec
    }

    #[test]
    fn test_plan_then_apply_converges() {
        let server = MemoryServer::new(VERSION);
        server.add_database("sales");
        let spec = spec(
            r#"{"alice": {"password": "pw", "users": {"alice": {"databases": {"sales": {"roles": ["db_datareader"]}}}}}}"#,
        );

        let planned = execute(&quiet(), &server, RunOptions::check(), &spec, VERSION).unwrap();
        assert!(planned.changed);
        assert!(server.journal().is_empty());

        let applied = execute(
            &quiet(),
            &server,
            RunOptions::default().with_mode(Mode::Apply),
            &spec,
            VERSION,
        )
        .unwrap();
        assert_eq!(applied.changes["alice"].changes, planned.changes["alice"].changes);
        assert_eq!(server.user_roles("sales", "alice"), ["db_datareader"]);

        let again = execute(&quiet(), &server, RunOptions::check(), &spec, VERSION).unwrap();
        assert!(!again.changed);
        assert!(again.is_success());
    }

    #[test]
    fn test_unsupported_version_aborts_with_context() {
        let server = MemoryServer::new("9.0.5000");
        let spec = spec(r#"{"alice": {"password": "pw"}}"#);

        let err = execute(&quiet(), &server, RunOptions::check(), &spec, "9.0.5000").unwrap_err();
        assert!(format!("{err:#}").contains("before any login"));
        assert_eq!(server.probe_count(), 0);
    }

    #[test]
    fn test_failed_login_sets_failure_exit() {
        let server = MemoryServer::new(VERSION);
        server.fail_operation("create_login");
        let spec = spec(r#"{"alice": {"password": "pw"}}"#);

        let report = execute(
            &quiet(),
            &server,
            RunOptions::default().with_mode(Mode::Apply),
            &spec,
            VERSION,
        )
        .unwrap();
        assert!(!report.is_success());
        assert!(!report.changes["alice"].success);
    }
}
