#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

struct Workspace {
    db_path: PathBuf,
    config_path: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let id = Ulid::new();
        let db_path = std::env::temp_dir().join(format!("govctl-{label}-{id}.sqlite3"));
        let config_path = std::env::temp_dir().join(format!("govctl-{label}-{id}.json"));
        let config = r#"{
            "config_version": 1,
            "quorum": 1,
            "voting_window_secs": 3600,
            "resolution_rule": {"kind": "majority_with_quorum"},
            "privileged_actors": ["admin"],
            "resolution_retry_limit": 5
        }"#;
        if let Err(err) = std::fs::write(&config_path, config) {
            panic!("failed to write config fixture: {err}");
        }
        Self {
            db_path,
            config_path,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut command = Command::new(govctl_binary_path());
        command
            .arg("--db")
            .arg(&self.db_path)
            .arg("--config")
            .arg(&self.config_path);
        for arg in args {
            command.arg(arg);
        }

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run govctl command {:?}: {err}", args),
        }
    }

    fn run_ok(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "govctl {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        stdout_json(&output)
    }

    fn register_radius(&self) {
        self.run_ok(&[
            "admin",
            "register",
            "--id",
            "spawn.radius",
            "--name",
            "Spawn radius",
            "--value",
            "16",
            "--type",
            "integer",
            "--min",
            "0",
            "--max",
            "128",
            "--actor",
            "admin",
        ]);
    }

    fn submit_radius(&self, value: &str) -> String {
        let view = self.run_ok(&[
            "suggestion",
            "submit",
            "--parameter",
            "spawn.radius",
            "--value",
            value,
            "--author",
            "alice",
        ]);
        match view["suggestion"]["suggestion_id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("submit output missing suggestion id: {view}"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(&self.config_path);
    }
}

fn govctl_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_govctl") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/govctl");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "governance-cli", "--bin", "govctl"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build govctl binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn stderr_error_code(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .rev()
        .find(|line| line.starts_with('{'))
        .unwrap_or_default();
    match serde_json::from_str::<Value>(line) {
        Ok(value) => value["error"]["code"].as_str().unwrap_or_default().to_string(),
        Err(err) => panic!("failed to parse stderr error payload: {err}\nstderr={stderr}"),
    }
}

#[test]
fn help_lists_expected_command_groups() {
    let output = match Command::new(govctl_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "parameter",
        "suggestion",
        "vote",
        "comment",
        "history",
        "policy",
        "admin",
        "sweep",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain command {required}; output={stdout}"
        );
    }
}

#[test]
fn suggestion_vote_close_flow_updates_parameter_and_history() {
    let workspace = Workspace::new("flow");
    workspace.register_radius();
    let suggestion_id = workspace.submit_radius("32");

    let tally = workspace.run_ok(&[
        "vote",
        "cast",
        "--suggestion",
        &suggestion_id,
        "--voter",
        "bob",
        "--choice",
        "affirm",
    ]);
    assert_eq!(tally["affirm"], Value::from(1));
    assert_eq!(tally["distinct_voters"], Value::from(1));

    let open = workspace.run_ok(&["suggestion", "list"]);
    assert_eq!(open.as_array().map(Vec::len), Some(1));

    let report = workspace.run_ok(&[
        "suggestion",
        "close",
        "--id",
        &suggestion_id,
        "--actor",
        "admin",
    ]);
    assert_eq!(report["suggestion"]["state"], Value::from("accepted"));
    assert_eq!(report["history"]["outcome"], Value::from("accepted"));
    assert_eq!(
        report["history"]["subject"],
        Value::from(format!("suggestion:{suggestion_id}"))
    );

    let parameter = workspace.run_ok(&["parameter", "show", "--id", "spawn.radius"]);
    assert_eq!(parameter["value"], Value::from("32"));

    let history = workspace.run_ok(&["history", "list", "--parameter", "spawn.radius"]);
    let reasons = history
        .as_array()
        .map(|records| {
            records
                .iter()
                .filter_map(|record| record["reason"].as_str())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(reasons, vec!["registered", "majority-affirm"]);
}

#[test]
fn engine_errors_exit_non_zero_with_stable_codes() {
    let workspace = Workspace::new("errors");
    workspace.register_radius();
    let suggestion_id = workspace.submit_radius("40");

    let invalid_choice = workspace.run(&[
        "vote",
        "cast",
        "--suggestion",
        &suggestion_id,
        "--voter",
        "bob",
        "--choice",
        "maybe",
    ]);
    assert!(!invalid_choice.status.success());
    assert_eq!(stderr_error_code(&invalid_choice), "invalid_choice");

    let unknown = workspace.run(&[
        "suggestion",
        "submit",
        "--parameter",
        "missing.param",
        "--value",
        "1",
        "--author",
        "alice",
    ]);
    assert_eq!(stderr_error_code(&unknown), "unknown_parameter");

    let unauthorized = workspace.run(&["admin", "set", "--id", "spawn.radius", "--value", "1", "--actor", "bob"]);
    assert_eq!(stderr_error_code(&unauthorized), "unauthorized");

    workspace.run_ok(&["suggestion", "withdraw", "--id", &suggestion_id, "--actor", "alice"]);
    let closed = workspace.run(&["suggestion", "withdraw", "--id", &suggestion_id, "--actor", "alice"]);
    assert_eq!(stderr_error_code(&closed), "suggestion_closed");

    let malformed = workspace.run(&["suggestion", "show", "--id", "nope"]);
    assert_eq!(stderr_error_code(&malformed), "validation_error");
}

#[test]
fn blocking_policy_rejects_submission_and_is_logged() {
    let workspace = Workspace::new("policy");
    workspace.register_radius();

    let policy = workspace.run_ok(&[
        "policy",
        "create",
        "--predicate",
        "value=99",
        "--effect",
        "block",
        "--actor",
        "admin",
    ]);
    assert_eq!(policy["effect"], Value::from("block"));

    let view = workspace.run_ok(&[
        "suggestion",
        "submit",
        "--parameter",
        "spawn.radius",
        "--value",
        "99",
        "--author",
        "alice",
    ]);
    assert_eq!(view["suggestion"]["state"], Value::from("rejected"));
    assert_eq!(
        view["suggestion"]["resolution_reason"],
        Value::from("policy-blocked")
    );
    assert_eq!(view["suggestion"]["voting_deadline"], Value::Null);

    let changes = workspace.run_ok(&["policy", "changes"]);
    assert_eq!(changes.as_array().map(Vec::len), Some(1));
    assert_eq!(changes[0]["action"], Value::from("created"));
}

#[test]
fn admin_set_and_rollback_round_through_the_ledger() {
    let workspace = Workspace::new("rollback");
    workspace.register_radius();

    let change = workspace.run_ok(&[
        "admin", "set", "--id", "spawn.radius", "--value", "77", "--actor", "admin",
    ]);
    let record_id = match change["history"]["record_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("set output missing record id: {change}"),
    };

    let restored = workspace.run_ok(&["admin", "rollback", "--record", &record_id, "--actor", "admin"]);
    assert_eq!(restored["parameter"]["value"], Value::from("16"));
    assert_eq!(
        restored["history"]["reason"],
        Value::from(format!("rollback:{record_id}"))
    );

    let shown = workspace.run_ok(&["history", "show", "--record", &record_id]);
    assert_eq!(shown["requested_value"], Value::from("77"));
}

#[test]
fn commands_migrate_the_database_on_first_use() {
    let workspace = Workspace::new("migrate");
    let parameters = workspace.run_ok(&["parameter", "list"]);
    assert_eq!(parameters, Value::Array(Vec::new()));

    let conn = match Connection::open(&workspace.db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open migrated db: {err}"),
    };
    let version: i64 = match conn.query_row(
        "SELECT MAX(version) FROM schema_migrations",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to read schema version: {err}"),
    };
    assert_eq!(version, 1);

    let sweep = workspace.run_ok(&["sweep"]);
    assert_eq!(sweep["resolved"], Value::Array(Vec::new()));
}
