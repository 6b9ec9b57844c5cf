use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const MAPPING_YAML: &str = "\
resources:
  - kind: ec2_instance
    port:
      entity:
        mappings:
          identifier: .detail.instance-id
          title: .detail.instance-id
";

fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

fn fixture() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    write_file(
        dir.path(),
        "event.json",
        r#"{"identifier": "awsEvent", "title": "AWS Event", "schema": {"properties": {}}}"#,
    );
    write_file(dir.path(), "mapping.yaml", MAPPING_YAML);
    write_file(dir.path(), "template.yaml", "Resources: {}\n");
    let config = write_file(
        dir.path(),
        "pprov.yaml",
        "\
registry:
  schemas: [event.json]
  mapping: mapping.yaml
stack:
  template: template.yaml
fanout:
  organizational_units: [ou-root-1]
  regions: [us-east-1, us-west-2]
",
    );
    (dir, config)
}

fn pprov(args: &[&str], extra: &[&Path]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pprov"))
        .args(args)
        .args(extra)
        .env("RUST_LOG", "warn")
        .env_remove("PORT_API_TOKEN")
        .env_remove("PORT_CLIENT_ID")
        .env_remove("PORT_CLIENT_SECRET")
        .output()
        .expect("run pprov")
}

fn stdout_report(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("report json on stdout")
}

#[test]
fn check_accepts_valid_config() {
    let (_dir, config) = fixture();
    let output = pprov(&["check", "--config"], &[&config]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_report(&output);
    assert_eq!(report["mode"], "check");
    assert_eq!(report["outcome"], "succeeded");
}

#[test]
fn check_rejects_unknown_keys_with_exit_2() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = write_file(dir.path(), "bad.yaml", "stack:\n  templte: t.yaml\n");
    let output = pprov(&["check", "--config"], &[&config]);
    assert_eq!(output.status.code(), Some(2));
    let report = stdout_report(&output);
    assert_eq!(report["outcome"], "aborted");
    assert_eq!(report["error"]["kind"], "validation");
}

#[test]
fn check_writes_report_to_out() {
    let (dir, config) = fixture();
    let out = dir.path().join("reports/check.json");
    let output = pprov(&["check", "--config"], &[&config, Path::new("--out"), &out]);
    assert!(output.status.success());
    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read report")).expect("json");
    assert_eq!(saved["outcome"], "succeeded");
}

#[test]
fn drift_against_matching_live_file_is_clean() {
    let (dir, config) = fixture();
    let live = write_file(
        dir.path(),
        "live.json",
        r#"{"integration": {"identifier": "aws-serverless", "config": {"resources": [
            {"kind": "ec2_instance", "port": {"entity": {"mappings": {
                "title": " .detail.instance-id ", "identifier": ".detail.instance-id"}}}}
        ]}}}"#,
    );
    let output = pprov(&["drift", "--config"], &[&config, Path::new("--live-file"), &live]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    let report = stdout_report(&output);
    assert_eq!(report["mode"], "drift");
    assert!(report["drift"]["entries"].as_array().is_some_and(Vec::is_empty));
}

#[test]
fn drift_reports_changed_mapping_and_fails() {
    let (dir, config) = fixture();
    let live = write_file(
        dir.path(),
        "live.json",
        r#"{"resources": [{"kind": "ec2_instance", "port": {"entity": {"mappings": {
            "title": ".detail.state", "identifier": ".detail.instance-id"}}}}]}"#,
    );
    let output = pprov(&["drift", "--config"], &[&config, Path::new("--live-file"), &live]);
    assert_eq!(output.status.code(), Some(1));
    let report = stdout_report(&output);
    assert_eq!(report["outcome"], "failed");
    let entries = report["drift"]["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert!(entries[0]["field"]
        .as_str()
        .is_some_and(|field| field.ends_with("mappings.title")));
}

#[test]
fn reconcile_without_credentials_aborts_before_any_call() {
    let (_dir, config) = fixture();
    let output = pprov(&["reconcile", "--dry-run", "--config"], &[&config]);
    assert_eq!(output.status.code(), Some(2));
    let report = stdout_report(&output);
    assert_eq!(report["mode"], "dry_run");
    assert_eq!(report["error"]["kind"], "auth");
    assert!(report.get("registry").is_none());
}
