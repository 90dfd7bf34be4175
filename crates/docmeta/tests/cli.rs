use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const AZURE_VARS: &[&str] = &[
    "AZURE_OPENAI_ENDPOINT",
    "AZURE_OPENAI_KEY",
    "AZURE_OPENAI_AD_TOKEN",
    "AZURE_OPENAI_SLM",
    "AZURE_OPENAI_SLM_API_VERSION",
    "AZURE_OPENAI_LLM",
    "AZURE_OPENAI_LLM_API_VERSION",
    "ENABLE_LLM",
];

/// Command with no model configuration inherited from the environment.
fn docmeta() -> Command {
    let mut cmd: Command = cargo_bin_cmd!("docmeta").into();
    for var in AZURE_VARS {
        cmd.env_remove(var);
    }
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Command configured against an endpoint nothing listens on.
fn configured() -> Command {
    let mut cmd = docmeta();
    cmd.env("AZURE_OPENAI_ENDPOINT", "http://127.0.0.1:9")
        .env("AZURE_OPENAI_KEY", "test-key")
        .env("AZURE_OPENAI_SLM", "small")
        .env("AZURE_OPENAI_SLM_API_VERSION", "2024-08-01-preview")
        .env("SLM_EXTRACTION_ATTEMPTS", "1")
        .env("DOCMETA_REQUEST_TIMEOUT_SECS", "5");
    cmd
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

// --- Binary startup ---

#[test]
fn binary_runs() {
    docmeta()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("docmeta"));
}

#[test]
fn families_lists_builtins() {
    docmeta()
        .arg("families")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"["generic","sop"]"#));
}

#[test]
fn extract_requires_files() {
    docmeta().arg("extract").assert().failure();
}

// --- Abort-class errors ---

#[test]
fn unknown_family_reports_error_json() {
    let tmp = TempDir::new().unwrap();
    let file = write_file(tmp.path(), "a.txt", "text");

    docmeta()
        .args(["extract", "--family", "invoices"])
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""kind":"unknown_family""#))
        .stdout(predicate::str::contains("invoices"));
}

#[test]
fn missing_model_configuration_is_config_error() {
    let tmp = TempDir::new().unwrap();
    let file = write_file(tmp.path(), "a.txt", "text");

    docmeta()
        .arg("extract")
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""kind":"config""#));
}

#[test]
fn malformed_meta_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let file = write_file(tmp.path(), "a.txt", "text");

    configured()
        .args(["extract", "--meta", "no-equals-sign"])
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""kind":"config""#));
}

#[test]
fn unsupported_file_reports_error_json() {
    let tmp = TempDir::new().unwrap();
    let file = write_file(tmp.path(), "scan.pdf", "%PDF-1.7");

    configured()
        .arg("extract")
        .arg(&file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""kind":"unsupported_format""#))
        .stdout(predicate::str::contains("scan.pdf"));
}

#[test]
fn missing_file_reports_error_json() {
    let tmp = TempDir::new().unwrap();

    configured()
        .arg("extract")
        .arg(tmp.path().join("absent.txt"))
        .assert()
        .code(1)
        .stdout(predicate::str::contains(r#""kind":"io""#));
}

// --- Extraction ---

#[test]
fn unreachable_model_still_yields_seeded_metadata() {
    let tmp = TempDir::new().unwrap();
    let file = write_file(tmp.path(), "notes_v1.2.txt", "See https://x.example/a");

    configured()
        .args(["extract", "--annotate", "--meta", "status=Effective"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""name":"notes""#))
        .stdout(predicate::str::contains(r#""version":"1.2""#))
        .stdout(predicate::str::contains(r#""status":"Effective""#))
        .stdout(predicate::str::contains(r#""references":["https://x.example/a"]"#))
        .stdout(predicate::str::contains("failed_units"));
}

#[test]
fn multiple_files_report_in_input_order() {
    let tmp = TempDir::new().unwrap();
    let first = write_file(tmp.path(), "first.txt", "one");
    let second = write_file(tmp.path(), "second.pdf", "%PDF");

    let output = configured()
        .args(["extract", "--jobs", "2"])
        .arg(&first)
        .arg(&second)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("first.txt") && lines[0].contains("metadata"));
    assert!(lines[1].contains("second.pdf") && lines[1].contains("unsupported_format"));
}
