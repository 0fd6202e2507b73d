use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use jsonschema::JSONSchema;
use provider_migrate_core::{MigrationDocument, ReconciliationReport};
use serde_json::Value;
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn assert_schema_rejects(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    assert!(
        !compiled.is_valid(value),
        "expected {} to reject {value}",
        schema_path.display()
    );
}

#[test]
fn interchange_contract_pack_validates_fixtures() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/interchange/v1/schemas");
    let fixture_dir = repo.join("contracts/interchange/v1/fixtures");
    let document_schema = schema_dir.join("migration-document.schema.json");

    for fixture in ["extract.sample.json", "load.sample.json"] {
        let value = read_json(&fixture_dir.join(fixture));
        assert_schema(&document_schema, &value);

        let decoded: MigrationDocument = serde_json::from_value(value)
            .unwrap_or_else(|err| panic!("{fixture} does not decode: {err}"));
        assert!(!decoded.authenticators.is_empty());
    }

    let report = read_json(&fixture_dir.join("reconciliation-report.sample.json"));
    assert_schema(&schema_dir.join("reconciliation-report.schema.json"), &report);
    let decoded: ReconciliationReport = serde_json::from_value(report)
        .unwrap_or_else(|err| panic!("report fixture does not decode: {err}"));
    assert_eq!(decoded.contract_version, "reconciliation_report.v1");
}

#[test]
fn document_schema_rejects_internal_identifiers_and_unknown_collections() {
    let schema = repo_root().join("contracts/interchange/v1/schemas/migration-document.schema.json");

    assert_schema_rejects(
        &schema,
        &serde_json::json!({"authenticators": [{"id": 7, "name": "Azure"}]}),
    );
    assert_schema_rejects(&schema, &serde_json::json!({"webhooks": []}));
}

#[test]
fn live_load_report_matches_published_schema() {
    let repo = repo_root();
    let dir = std::env::temp_dir().join(format!("pmig-integration-{}", Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create {}: {err}", dir.display()));
    let target = dir.join("target.sqlite3").display().to_string();
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_pmig"));

    let seeded = Command::new(&binary)
        .args(["users", "add", "--target-db", &target, "--username", "ops", "--superuser"])
        .output()
        .unwrap_or_else(|err| panic!("failed to run users add: {err}"));
    assert!(seeded.status.success());

    let input = repo
        .join("contracts/interchange/v1/fixtures/load.sample.json")
        .display()
        .to_string();
    let output = Command::new(&binary)
        .args(["load", "-i", &input, "--target-db", &target, "-d", "--delete-sp", "--json"])
        .output()
        .unwrap_or_else(|err| panic!("failed to run load: {err}"));
    assert!(
        output.status.success(),
        "load failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("load stdout is not JSON: {err}"));
    assert_schema(
        &repo.join("contracts/interchange/v1/schemas/reconciliation-report.schema.json"),
        &report,
    );
    assert_eq!(report["owner"], "ops");
    assert_eq!(report["plan"]["kinds"][0]["decision"], "not_selected");
    assert_eq!(report["plan"]["kinds"][1]["decision"], "selected_by_kind_flag");
}
