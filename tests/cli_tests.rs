//! CLI tests for condense
//!
//! Every test runs in its own temp project with provider credentials removed,
//! so nothing here reaches the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const TRANSCRIPT: &str = r#"{
    "title": "Fixing the build",
    "turns": [
        {"role": "user", "text": "Why does the release build fail?"},
        {"role": "assistant", "text": "The feature flag for rustls is missing."},
        {"role": "user", "text": "Add it and rerun."}
    ]
}"#;

/// A condense command isolated in `dir`, with no credentials visible.
fn condense(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("condense");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("CONDENSE_LOG")
        .env_remove("RUST_LOG")
        .env_remove("CONDENSE_CHUNK_TOKENS")
        .env_remove("CONDENSE_MAP_CONCURRENCY");
    cmd
}

fn temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_transcript(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, TRANSCRIPT).unwrap();
    path
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = temp_project();
        condense(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("compact"))
            .stdout(predicate::str::contains("overview"))
            .stdout(predicate::str::contains("session"));
    }

    #[test]
    fn test_version() {
        let dir = temp_project();
        condense(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = temp_project();
        condense(&dir).arg("explode").assert().failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_writes_defaults() {
        let dir = temp_project();
        condense(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created condense.toml"));

        let content = fs::read_to_string(dir.path().join(".condense/condense.toml")).unwrap();
        assert!(content.contains("[thresholds]"));
        assert!(content.contains("[[providers]]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = temp_project();
        condense(&dir).args(["config", "init"]).assert().success();
        condense(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_without_file_uses_defaults() {
        let dir = temp_project();
        condense(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"))
            .stdout(predicate::str::contains("target_chunk_tokens = 8000"));
    }

    #[test]
    fn test_cli_override_reaches_effective_config() {
        let dir = temp_project();
        condense(&dir)
            .env("CONDENSE_MAP_CONCURRENCY", "4")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("map_concurrency = 4"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = temp_project();
        fs::create_dir_all(dir.path().join(".condense")).unwrap();
        fs::write(
            dir.path().join(".condense/condense.toml"),
            "[thresholds]\nchunked = 500000\nhierarchical = 100000\n",
        )
        .unwrap();

        condense(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"));
    }

    #[test]
    fn test_config_invalid_toml_fails() {
        let dir = temp_project();
        fs::create_dir_all(dir.path().join(".condense")).unwrap();
        fs::write(dir.path().join(".condense/condense.toml"), "[thresholds\n").unwrap();

        condense(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("condense.toml"));
    }
}

mod providers {
    use super::*;

    #[test]
    fn test_providers_without_credentials() {
        let dir = temp_project();
        condense(&dir)
            .arg("providers")
            .assert()
            .success()
            .stdout(predicate::str::contains("anthropic"))
            .stdout(predicate::str::contains("openai"))
            .stdout(predicate::str::contains("missing credential"));
    }

    #[test]
    fn test_project_dotenv_supplies_credential() {
        let dir = temp_project();
        fs::write(dir.path().join(".env"), "OPENAI_API_KEY=sk-test\n").unwrap();
        condense(&dir)
            .arg("providers")
            .assert()
            .success()
            .stdout(predicate::str::contains("1 of 2 providers ready"));
    }
}

mod sessions {
    use super::*;

    #[test]
    fn test_session_list_empty() {
        let dir = temp_project();
        condense(&dir)
            .args(["session", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No compaction sessions"));
    }

    #[test]
    fn test_session_show_unknown_fails() {
        let dir = temp_project();
        condense(&dir)
            .args(["session", "show", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_session_cancel_unknown_fails() {
        let dir = temp_project();
        condense(&dir)
            .args(["session", "cancel", "nope"])
            .assert()
            .failure();
    }

    #[test]
    fn test_active_session_none() {
        let dir = temp_project();
        condense(&dir)
            .args(["session", "active", "default", "conv"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No active session"));
    }

    #[test]
    fn test_result_show_none() {
        let dir = temp_project();
        condense(&dir)
            .args(["result", "show", "default", "conv"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No result for default/conv"));
    }
}

mod compaction {
    use super::*;

    #[test]
    fn test_compact_missing_transcript_fails() {
        let dir = temp_project();
        condense(&dir)
            .args(["compact", "missing.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load transcript"));
    }

    #[test]
    fn test_compact_without_provider_records_failed_session() {
        let dir = temp_project();
        let transcript = write_transcript(&dir, "build.json");

        condense(&dir)
            .arg("compact")
            .arg(&transcript)
            .assert()
            .failure();

        condense(&dir)
            .args(["session", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("default/build"));

        // A failed session is not active, so a new attempt is allowed.
        condense(&dir)
            .args(["session", "active", "default", "build"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No active session"));
    }

    #[test]
    fn test_compact_empty_transcript_creates_no_session() {
        let dir = temp_project();
        let path = dir.path().join("empty.json");
        fs::write(&path, r#"{"turns": []}"#).unwrap();

        condense(&dir)
            .arg("compact")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("no turns"));

        condense(&dir)
            .args(["session", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No compaction sessions"));
    }

    #[test]
    fn test_overview_without_provider_fails() {
        let dir = temp_project();
        let transcript = write_transcript(&dir, "build.json");

        condense(&dir)
            .args(["overview", "--no-diagrams"])
            .arg(&transcript)
            .assert()
            .failure();
    }

    #[test]
    fn test_overview_run_is_recorded_as_session() {
        let dir = temp_project();
        let transcript = write_transcript(&dir, "build.json");

        condense(&dir)
            .args(["overview", "--no-diagrams"])
            .arg(&transcript)
            .assert()
            .failure();

        condense(&dir)
            .args(["session", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("overview"))
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("default/build"));

        // Overview sessions do not count as active compactions.
        condense(&dir)
            .args(["session", "active", "default", "build"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No active session"));
    }
}
