//! Run orchestration: pre-flight, bulk existence check, fan-out, merge.

use crate::context::{ConnectionFactory, NoProgress, ProgressCallback};
use crate::coordinator::WorkerPool;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::inspect::Inspector;
use crate::model::{fold, LoginSpec, Specification};
use crate::plan::plan_login;
use crate::report::{LoginReport, RunReport};
use crate::sql::ServerVersion;
use crate::types::RunOptions;
use std::collections::BTreeSet;
use std::time::Instant;

/// Reconciles a specification against one server.
pub struct Reconciler<'a> {
    factory: &'a dyn ConnectionFactory,
    options: RunOptions,
    progress: &'a dyn ProgressCallback,
}

impl<'a> Reconciler<'a> {
    pub fn new(factory: &'a dyn ConnectionFactory, options: RunOptions) -> Self {
        Self {
            factory,
            options,
            progress: &NoProgress,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Parse the version and refuse unsupported servers. Runs no query.
    pub fn preflight(&self, version: &str) -> Result<ServerVersion> {
        let version = ServerVersion::parse(version)?;
        if !self.options.supported_versions.contains(&version.major()) {
            return Err(Error::UnsupportedVersion {
                version: version.to_string(),
            });
        }
        Ok(version)
    }

    /// Reconcile every login. Errors only on pre-flight failures; everything
    /// after that lands in the report.
    pub fn run(&self, spec: &Specification, version: &str) -> Result<RunReport> {
        let started = Instant::now();
        let version = self.preflight(version)?;
        let mode = self.options.mode;
        let mut report = RunReport::new(version.as_str(), mode.is_check());

        let logins: Vec<&LoginSpec> = spec.logins().collect();
        let names: Vec<&str> = logins.iter().map(|l| l.name.as_str()).collect();

        let inspector = Inspector::new(self.factory, &version);
        let existing = inspector.logins_exist(&names)?;

        let pool = WorkerPool::new(self.options.jobs)?;
        log::info!(
            "reconciling {} logins on sql server {version} with {} workers ({})",
            logins.len(),
            pool.threads(),
            if mode.is_check() { "check" } else { "apply" }
        );
        self.progress.on_run_start(logins.len());

        let results = pool.run(&logins, |login| {
            let result = self.reconcile_login(login, &version, &existing);
            self.progress.on_login_complete(&login.name, &result);
            result
        });

        for (login, result) in logins.iter().zip(results) {
            let login_report = result.unwrap_or_else(|panic| {
                log::error!("worker for login {} panicked: {panic}", login.name);
                let failed = LoginReport::failed(format!(
                    "error occurred while processing login {}: {panic}",
                    login.name
                ));
                self.progress.on_login_complete(&login.name, &failed);
                failed
            });
            report.aggregate(&login.name, login_report);
        }

        report.execution_time = started.elapsed().as_secs_f64();
        log::info!(
            "finished in {:.2}s, changed: {}",
            report.execution_time,
            report.changed
        );
        Ok(report)
    }

    /// Observe, plan and execute one login in plan order.
    fn reconcile_login(
        &self,
        spec: &LoginSpec,
        version: &ServerVersion,
        existing: &BTreeSet<String>,
    ) -> LoginReport {
        let mut report = LoginReport::new();
        for warning in &spec.warnings {
            report.warn(warning.clone());
        }

        let inspector = Inspector::new(self.factory, version);
        let exists = existing.contains(&fold(&spec.name));
        let observed = match inspector.observe(spec, exists) {
            Ok(observed) => observed,
            Err(e) => {
                report.fail(format!(
                    "error occurred while reading login {}: {e}",
                    spec.name
                ));
                return report;
            }
        };

        let plan = plan_login(spec, &observed, &self.options.auto_create_roles);
        for warning in plan.warnings {
            log::warn!("{}: {warning}", spec.name);
            report.warn(warning);
        }
        for error in plan.errors {
            report.error(error);
        }
        if plan.halted {
            report.success = false;
            return report;
        }

        let executor = Executor::new(self.factory, version);
        for operation in &plan.operations {
            match executor.execute(operation, self.options.mode) {
                Ok(true) => report.record_change(operation.describe()),
                Ok(false) => {}
                Err(e) => {
                    log::error!("{e}");
                    let message = format!("{}{e}", operation.failure_context());
                    if operation.is_login_fatal() {
                        report.fail(message);
                        break;
                    }
                    report.error(message);
                }
            }
        }

        log::info!(
            "login {}: {} changes, {} warnings, {} errors",
            spec.name,
            report.changes.len(),
            report.warnings.len(),
            report.errors.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use crate::model::derive_sid;
    use crate::types::Mode;
    use std::sync::Mutex;

    const VERSION: &str = "15.0.2000.5";

    fn spec(json: &str) -> Specification {
        let mut spec = Specification::default();
        spec.add_json("test.json", json).unwrap();
        spec
    }

    fn apply(server: &MemoryServer, spec: &Specification) -> RunReport {
        Reconciler::new(server, RunOptions::default().with_mode(Mode::Apply))
            .run(spec, VERSION)
            .unwrap()
    }

    fn check(server: &MemoryServer, spec: &Specification) -> RunReport {
        Reconciler::new(server, RunOptions::check())
            .run(spec, VERSION)
            .unwrap()
    }

    #[test]
    fn test_scenario_create_login_then_rerun() {
        let server = MemoryServer::new(VERSION);
        let spec = spec(r#"{"alice": {"password": "pw"}}"#);

        let first = apply(&server, &spec);
        assert!(first.changed);
        let alice = &first.changes["alice"];
        assert_eq!(alice.changes.len(), 1);
        assert!(alice.changes[0].starts_with("login alice created with sid: "));
        assert_eq!(server.login_sid("alice"), Some(derive_sid("alice")));
        assert_eq!(server.login_enabled("alice"), Some(true));

        let second = apply(&server, &spec);
        assert!(!second.changed);
        assert!(second.changes["alice"].changes.is_empty());
    }

    #[test]
    fn test_scenario_disable_login() {
        let server = MemoryServer::new(VERSION);
        server.add_login("alice");
        let spec = spec(r#"{"alice": {"enabled": false}}"#);

        let first = apply(&server, &spec);
        assert_eq!(first.changes["alice"].changes, vec!["login alice disabled"]);
        assert_eq!(server.login_enabled("alice"), Some(false));

        let second = apply(&server, &spec);
        assert!(!second.changed);
    }

    #[test]
    fn test_scenario_role_filtering() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"roles": ["db_owner", "ghost_role"]}}}}}}"#,
        );

        let report = apply(&server, &spec);
        let bob = &report.changes["bob"];
        assert!(report.changed);
        assert_eq!(
            bob.changes,
            vec![
                "database sales, user bob created",
                "database sales, user bob, role: db_owner added"
            ]
        );
        assert_eq!(bob.warnings.len(), 1);
        assert!(bob.warnings[0].contains("ghost_role unavailable"));
        assert_eq!(server.user_roles("sales", "bob"), vec!["db_owner"]);

        // the warning persists, but nothing changes
        let rerun = apply(&server, &spec);
        assert!(!rerun.changed);
        assert_eq!(rerun.changes["bob"].warnings.len(), 1);
    }

    #[test]
    fn test_scenario_secondary_replica_skipped() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        server.set_secondary_replica("sales");
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#,
        );

        let report = apply(&server, &spec);
        assert!(!report.changed);
        assert_eq!(
            report.changes["bob"].warnings,
            vec!["database: sales is not primary hadr replica"]
        );
        assert!(server.journal().is_empty());
    }

    #[test]
    fn test_check_matches_apply() {
        let server = MemoryServer::new(VERSION);
        server.add_login("carol");
        server.add_database("sales");
        server.add_database("hr");
        server.add_user("hr", "carol", Some("carol"));
        server.grant("hr", "carol", "db_datareader");
        let spec = spec(
            r#"{
                "alice": {"password": "pw", "enabled": false, "default_database": "sales",
                          "users": {"alice": {"databases": {"sales": {"roles": ["db_datareader"]}}}}},
                "carol": {"users": {"carol": {"databases": {"hr": {"roles": ["db_datawriter"]}}}}}
            }"#,
        );

        let planned = check(&server, &spec);
        assert!(server.journal().is_empty());
        assert!(planned.check_mode);

        let applied = apply(&server, &spec);
        for login in ["alice", "carol"] {
            assert_eq!(
                planned.changes[login].changes, applied.changes[login].changes,
                "{login}"
            );
        }
        assert!(applied.changed);
        assert!(!apply(&server, &spec).changed);
    }

    #[test]
    fn test_orphan_with_planned_sid_is_adopted() {
        let server = MemoryServer::new(VERSION);
        server.add_database("sales");
        server.add_user("sales", "alice", Some("alice"));
        let spec = spec(
            r#"{"alice": {"password": "pw", "users": {"alice": {"databases": {"sales": {}}}}}}"#,
        );

        let planned = check(&server, &spec);
        let applied = apply(&server, &spec);
        assert_eq!(planned.changes["alice"].changes, applied.changes["alice"].changes);
        assert_eq!(applied.changes["alice"].changes.len(), 1);
        assert!(applied.changes["alice"].changes[0].starts_with("login alice created"));
        assert_eq!(server.journal(), vec!["create_login alice"]);
        assert!(!check(&server, &spec).changed);
    }

    #[test]
    fn test_orphan_with_foreign_sid_is_remapped() {
        let server = MemoryServer::new(VERSION);
        server.add_database("sales");
        server.add_user("sales", "alice", Some("someone_else"));
        let spec = spec(
            r#"{"alice": {"password": "pw", "users": {"alice": {"databases": {"sales": {}}}}}}"#,
        );

        let planned = check(&server, &spec);
        let applied = apply(&server, &spec);
        assert_eq!(planned.changes["alice"].changes, applied.changes["alice"].changes);
        assert_eq!(
            server.journal(),
            vec!["create_login alice", "create_user sales.alice (remap)"]
        );
        assert!(!check(&server, &spec).changed);
    }

    #[test]
    fn test_offline_database_is_skipped() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        server.set_offline("sales");
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#,
        );

        let report = apply(&server, &spec);
        assert!(!report.changed);
        assert_eq!(
            report.changes["bob"].warnings,
            vec!["database: sales unavailable"]
        );
        assert!(server.journal().is_empty());
    }

    #[test]
    fn test_read_only_database_is_skipped() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        server.add_user("sales", "bob", Some("bob"));
        server.set_read_only("sales");
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"state": "absent"}}}}}}"#,
        );

        let report = apply(&server, &spec);
        assert!(!report.changed);
        assert_eq!(
            report.changes["bob"].warnings,
            vec!["database: sales unavailable"]
        );
        assert!(server.journal().is_empty());
        assert!(server.user_exists("sales", "bob"));
    }

    #[test]
    fn test_absent_cascade() {
        let server = MemoryServer::new(VERSION);
        server.add_login("dave");
        server.add_database("sales");
        server.add_database("hr");
        server.add_user("sales", "dave", Some("dave"));
        server.add_user("hr", "dave", Some("dave"));
        let spec = spec(
            r#"{"dave": {"state": "absent", "users": {"dave": {"databases": {
                "sales": {"state": "present", "roles": ["db_owner"]}, "hr": {}}}}}}"#,
        );

        let report = apply(&server, &spec);
        assert_eq!(
            report.changes["dave"].changes,
            vec![
                "database: hr, user dave dropped",
                "database: sales, user dave dropped",
                "login dave dropped"
            ]
        );
        assert!(server.login_sid("dave").is_none());
        assert!(!apply(&server, &spec).changed);
    }

    #[test]
    fn test_unsupported_version_runs_no_query() {
        let server = MemoryServer::new("9.0.5000.0");
        let spec = spec(r#"{"alice": {"password": "pw"}}"#);

        let err = Reconciler::new(&server, RunOptions::default())
            .run(&spec, "9.0.5000.0")
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
        assert_eq!(server.probe_count(), 0);
        assert!(server.journal().is_empty());
    }

    #[test]
    fn test_bulk_check_failure_is_fatal() {
        let server = MemoryServer::new(VERSION);
        server.fail_probe("logins_exist");
        let spec = spec(r#"{"alice": {"password": "pw"}}"#);

        let err = Reconciler::new(&server, RunOptions::default())
            .run(&spec, VERSION)
            .unwrap_err();
        assert!(matches!(err, Error::Inspection { .. }));
    }

    #[test]
    fn test_create_login_failure_is_login_fatal() {
        let server = MemoryServer::new(VERSION);
        server.add_database("sales");
        server.fail_operation("create_login");
        let spec = spec(
            r#"{"alice": {"password": "pw", "users": {"alice": {"databases": {"sales": {}}}}},
                "bob": {"password": "pw"}}"#,
        );

        let report = apply(&server, &spec);
        let alice = &report.changes["alice"];
        assert!(!alice.success);
        assert_eq!(alice.errors.len(), 1);
        assert!(alice.errors[0].starts_with("error occurred while creating login: "));
        assert!(alice.changes.is_empty());
        assert!(!report.is_success());
    }

    #[test]
    fn test_role_failure_does_not_stop_siblings() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        server.add_user("sales", "bob", Some("bob"));
        server.grant("sales", "bob", "db_datareader");
        server.fail_operation("remove_role_member");
        let spec = spec(
            r#"{"bob": {"users": {"bob": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#,
        );

        let report = apply(&server, &spec);
        let bob = &report.changes["bob"];
        assert!(bob.success);
        assert_eq!(bob.errors.len(), 1);
        assert_eq!(bob.changes, vec!["database sales, user bob, role: db_owner added"]);
        assert_eq!(
            server.user_roles("sales", "bob"),
            vec!["db_datareader", "db_owner"]
        );
    }

    #[test]
    fn test_binding_inspection_failure_skips_binding() {
        let server = MemoryServer::new(VERSION);
        server.add_login("bob");
        server.add_database("sales");
        server.fail_probe("available_roles");
        let spec = spec(r#"{"bob": {"enabled": false, "users": {"bob": {"databases": {"sales": {"roles": ["db_owner"]}}}}}}"#);

        let report = apply(&server, &spec);
        let bob = &report.changes["bob"];
        assert_eq!(bob.changes, vec!["login bob disabled"]);
        assert_eq!(bob.errors.len(), 1);
        assert!(bob.success);
    }

    #[test]
    fn test_progress_sees_every_login() {
        struct Recorder(Mutex<Vec<String>>);
        impl ProgressCallback for Recorder {
            fn on_login_complete(&self, login: &str, _report: &LoginReport) {
                self.0
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(login.to_string());
            }
        }

        let server = MemoryServer::new(VERSION);
        let spec = spec(r#"{"a": {"password": "pw"}, "b": {"password": "pw"}, "c": {"password": "pw"}}"#);
        let recorder = Recorder(Mutex::new(Vec::new()));

        let mut options = RunOptions::default();
        options.jobs = 2;
        Reconciler::new(&server, options)
            .with_progress(&recorder)
            .run(&spec, VERSION)
            .unwrap();

        let mut seen = recorder.0.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
    }
}
