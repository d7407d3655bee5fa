#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn incidents_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_incidents") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/incidents");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "incident-lifecycle-cli", "--bin", "incidents"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build incidents binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn incidents_output(db_path: &Path, outbox: Option<&Path>, args: &[&str]) -> Output {
    let mut command = Command::new(incidents_binary_path());
    command.env_remove("RUST_LOG");
    command.arg("--db").arg(db_path);
    if let Some(outbox) = outbox {
        command.arg("--outbox").arg(outbox);
    }
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run incidents command {:?}: {err}", args),
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

fn success_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(output)
}

fn stderr_envelope(output: &Output) -> Value {
    assert!(!output.status.success(), "command unexpectedly succeeded");
    let stderr = String::from_utf8_lossy(&output.stderr);
    let last = match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => line.to_string(),
        None => panic!("expected an error envelope on stderr"),
    };
    match serde_json::from_str::<Value>(&last) {
        Ok(value) => value,
        Err(err) => panic!("stderr tail is not JSON: {err}\nstderr={stderr}"),
    }
}

fn id_of(value: &Value) -> String {
    match value["id"].as_str() {
        Some(id) => id.to_string(),
        None => panic!("missing id in {value}"),
    }
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
}

struct Org {
    department_id: String,
    crew_id: String,
    type_id: String,
}

fn seed_org(db: &Path) -> Org {
    let department = success_json(&incidents_output(
        db,
        None,
        &[
            "org",
            "department",
            "add",
            "--name",
            "Water Services",
            "--responsible",
            "dept-head",
            "--contact-email",
            "water@city.example",
        ],
    ));
    let department_id = id_of(&department);

    let crew = success_json(&incidents_output(
        db,
        None,
        &[
            "org",
            "crew",
            "add",
            "--name",
            "Crew North",
            "--department-id",
            &department_id,
            "--member",
            "crew-north",
        ],
    ));
    let incident_type = success_json(&incidents_output(
        db,
        None,
        &[
            "org",
            "type",
            "add",
            "--name",
            "Water leak",
            "--severity",
            "high",
        ],
    ));

    Org {
        department_id,
        crew_id: id_of(&crew),
        type_id: id_of(&incident_type),
    }
}

fn create_incident(db: &Path, org: &Org, title: &str) -> Value {
    success_json(&incidents_output(
        db,
        None,
        &[
            "incident",
            "create",
            "--title",
            title,
            "--description",
            "Water running down the street",
            "--latitude",
            "-33.45",
            "--longitude",
            "-70.66",
            "--reporter-name",
            "Ana",
            "--reporter-email",
            "ana@example.com",
            "--department-id",
            &org.department_id,
            "--type-id",
            &org.type_id,
        ],
    ))
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(incidents_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["incident", "evidence", "org", "config", "check"] {
        assert!(stdout.contains(required), "missing `{required}` in help");
    }

    let output = match Command::new(incidents_binary_path())
        .args(["incident", "--help"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["create", "show", "list", "transition", "assign", "history"] {
        assert!(stdout.contains(required), "missing `{required}` in incident help");
    }
}

#[test]
fn full_lifecycle_through_the_binary() {
    let db = temp_path("incidents-cli", "sqlite3");
    let outbox = temp_path("incidents-outbox", "jsonl");
    let org = seed_org(&db);

    let incident = create_incident(&db, &org, "Burst main on 5th");
    let incident_id = id_of(&incident);
    assert_eq!(incident["status"], "pending");
    assert_eq!(incident["priority"], "high");
    assert_eq!(incident["version"], 1);

    let started = success_json(&incidents_output(
        &db,
        Some(&outbox),
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "in_progress",
            "--actor",
            "dept-head",
            "--role",
            "Departamento",
            "--crew-id",
            &org.crew_id,
            "--expected-version",
            "1",
        ],
    ));
    assert_eq!(started["incident"]["status"], "in_progress");
    assert_eq!(started["incident"]["crew_id"], org.crew_id.as_str());
    assert_eq!(started["incident"]["version"], 2);
    assert_eq!(started["notification_delivered"], true);

    let premature = incidents_output(
        &db,
        Some(&outbox),
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "completed",
            "--actor",
            "crew-north",
            "--role",
            "crew_lead",
            "--expected-version",
            "2",
        ],
    );
    assert_eq!(stderr_envelope(&premature)["code"], "missing_evidence");

    let evidence = success_json(&incidents_output(
        &db,
        None,
        &[
            "evidence",
            "attach",
            "--incident-id",
            &incident_id,
            "--actor",
            "crew-north",
            "--role",
            "crew_lead",
            "--file-name",
            "Repair.JPG",
            "--content-type",
            "image/jpeg",
            "--size-bytes",
            "2048",
            "--storage-ref",
            "media/repair.jpg",
        ],
    ));
    assert_eq!(evidence["kind"], "image");
    assert_eq!(evidence["format"], "jpg");

    let completed = success_json(&incidents_output(
        &db,
        Some(&outbox),
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "completed",
            "--actor",
            "crew-north",
            "--role",
            "crew_lead",
            "--expected-version",
            "2",
        ],
    ));
    assert_eq!(completed["incident"]["status"], "completed");

    let no_reason = incidents_output(
        &db,
        Some(&outbox),
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "rejected",
            "--actor",
            "inspector",
            "--role",
            "territorial",
            "--expected-version",
            "3",
        ],
    );
    assert_eq!(
        stderr_envelope(&no_reason)["code"],
        "missing_rejection_reason"
    );

    let rejected = success_json(&incidents_output(
        &db,
        Some(&outbox),
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "rejected",
            "--actor",
            "inspector",
            "--role",
            "territorial",
            "--reason",
            "leak still visible",
            "--expected-version",
            "3",
        ],
    ));
    assert_eq!(rejected["incident"]["status"], "rejected");
    assert_eq!(rejected["incident"]["rejection_reason"], "leak still visible");
    assert_eq!(rejected["incident"]["crew_id"], Value::Null);

    let history = success_json(&incidents_output(
        &db,
        None,
        &[
            "incident",
            "history",
            "--id",
            &incident_id,
            "--actor",
            "dept-head",
            "--role",
            "department",
        ],
    ));
    assert_eq!(history["transitions"].as_array().map(Vec::len), Some(3));
    assert_eq!(history["dispatches"].as_array().map(Vec::len), Some(1));

    let outbox_body = match std::fs::read_to_string(&outbox) {
        Ok(value) => value,
        Err(err) => panic!("failed to read outbox: {err}"),
    };
    let records: Vec<Value> = outbox_body
        .lines()
        .map(|line| match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => panic!("bad outbox line: {err}"),
        })
        .collect();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["message"]["to"], "water@city.example");
    assert_eq!(records[2]["intent"]["new_status"], "rejected");

    let _ = std::fs::remove_file(&db);
    let _ = std::fs::remove_file(&outbox);
}

#[test]
fn role_gating_surfaces_error_envelope() {
    let db = temp_path("incidents-cli-gating", "sqlite3");
    let org = seed_org(&db);
    let incident_id = id_of(&create_incident(&db, &org, "Pothole on Main"));

    let output = incidents_output(
        &db,
        None,
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "in_progress",
            "--actor",
            "inspector",
            "--role",
            "territorial",
            "--crew-id",
            &org.crew_id,
            "--expected-version",
            "1",
        ],
    );
    let envelope = stderr_envelope(&output);
    assert_eq!(envelope["code"], "unauthorized");
    assert!(envelope["message"].as_str().is_some_and(|m| !m.is_empty()));

    let illegal = incidents_output(
        &db,
        None,
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "validated",
            "--actor",
            "root",
            "--superuser",
            "--expected-version",
            "1",
        ],
    );
    assert_eq!(stderr_envelope(&illegal)["code"], "invalid_transition");

    let stale = incidents_output(
        &db,
        None,
        &[
            "incident",
            "assign",
            "--id",
            &incident_id,
            "--crew-id",
            &org.crew_id,
            "--actor",
            "dept-head",
            "--role",
            "department",
            "--expected-version",
            "7",
        ],
    );
    assert_eq!(stderr_envelope(&stale)["code"], "stale_state");

    let stale_transition = incidents_output(
        &db,
        None,
        &[
            "incident",
            "transition",
            "--id",
            &incident_id,
            "--to",
            "in_progress",
            "--actor",
            "dept-head",
            "--role",
            "department",
            "--crew-id",
            &org.crew_id,
            "--expected-version",
            "2",
        ],
    );
    assert_eq!(stderr_envelope(&stale_transition)["code"], "stale_state");

    let unknown_role = incidents_output(
        &db,
        None,
        &[
            "incident",
            "list",
            "--actor",
            "someone",
            "--role",
            "mayor",
        ],
    );
    assert_eq!(stderr_envelope(&unknown_role)["code"], "validation");

    let _ = std::fs::remove_file(&db);
}

#[test]
fn reporter_only_sees_own_incidents() {
    let db = temp_path("incidents-cli-visibility", "sqlite3");
    let org = seed_org(&db);
    let incident_id = id_of(&create_incident(&db, &org, "Fallen tree"));

    let mine = success_json(&incidents_output(
        &db,
        None,
        &["incident", "list", "--actor", "ANA@example.com"],
    ));
    assert_eq!(mine.as_array().map(Vec::len), Some(1));

    let theirs = success_json(&incidents_output(
        &db,
        None,
        &["incident", "list", "--actor", "bob@example.com"],
    ));
    assert_eq!(theirs.as_array().map(Vec::len), Some(0));

    for args in [
        ["incident", "show", "--id"],
        ["incident", "history", "--id"],
        ["evidence", "list", "--incident-id"],
    ] {
        let denied = incidents_output(
            &db,
            None,
            &[args[0], args[1], args[2], &incident_id, "--actor", "bob@example.com"],
        );
        assert_eq!(
            stderr_envelope(&denied)["code"],
            "unauthorized",
            "{args:?} leaked to another reporter"
        );

        let allowed = incidents_output(
            &db,
            None,
            &[args[0], args[1], args[2], &incident_id, "--actor", "ana@example.com"],
        );
        assert!(
            allowed.status.success(),
            "{args:?} hidden from the reporter: {}",
            String::from_utf8_lossy(&allowed.stderr)
        );
    }

    let check = success_json(&incidents_output(&db, None, &["check", "--json"]));
    assert_eq!(check["contract_version"], "integrity_check.v1");
    assert_eq!(check["healthy"], true);

    let _ = std::fs::remove_file(&db);
}
