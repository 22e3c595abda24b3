//! Integration tests for buildhist

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from any user configuration
    fn buildhist(config_dir: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("buildhist");
        cmd.env("BUILDHIST_CONFIG", config_dir.join("config.toml"));
        cmd
    }

    fn write_build(dir: &Path, number: u64, branch: &str, result: &str) {
        let record = json!({
            "schema_version": 3,
            "number": number,
            "builder": "linux",
            "finished": true,
            "result": result,
            "sourcestamps": [{"codebase": "app", "branch": branch, "revision": "abc123"}],
            "started_at": format!("2026-03-0{}T10:00:00Z", number + 1),
            "finished_at": format!("2026-03-0{}T10:05:00Z", number + 1),
            "steps": [{"name": "compile", "started_at": null, "finished_at": null, "waiting": false}],
            "reason": "push",
            "responsible_users": ["ada"]
        });
        std::fs::write(dir.join(number.to_string()), record.to_string()).unwrap();
    }

    fn seeded_builder() -> TempDir {
        let temp = TempDir::new().unwrap();
        write_build(temp.path(), 0, "main", "success");
        write_build(temp.path(), 1, "dev", "failure");
        write_build(temp.path(), 2, "main", "warnings");
        temp
    }

    #[test]
    fn help_displays() {
        let config = TempDir::new().unwrap();
        buildhist(config.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("inspect a builder's build history"));
    }

    #[test]
    fn version_displays() {
        let config = TempDir::new().unwrap();
        buildhist(config.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("buildhist"));
    }

    #[test]
    fn config_path() {
        let config = TempDir::new().unwrap();
        buildhist(config.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let config = TempDir::new().unwrap();
        buildhist(config.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[status]"))
            .stdout(predicate::str::contains("build_cache_size = 15"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let config = TempDir::new().unwrap();
        std::fs::write(config.path().join("config.toml"), "[status\n").unwrap();
        buildhist(config.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn list_plain_newest_first() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        buildhist(config.path())
            .args(["list", "--format", "plain", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout("2 warnings\n1 failure\n0 success\n");
    }

    #[test]
    fn list_filters_by_branch_and_result() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        buildhist(config.path())
            .args(["list", "--format", "plain", "-b", "main", "-r", "success", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout("0 success\n");
    }

    #[test]
    fn list_json() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        let output = buildhist(config.path())
            .args(["list", "--format", "json", "-n", "1", "--dir"])
            .arg(builder.path())
            .output()
            .unwrap();
        assert!(output.status.success());

        let builds: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(builds.as_array().unwrap().len(), 1);
        assert_eq!(builds[0]["number"], 2);
        assert_eq!(builds[0]["result"], "warnings");
    }

    #[test]
    fn list_empty_directory() {
        let config = TempDir::new().unwrap();
        let builder = TempDir::new().unwrap();
        buildhist(config.path())
            .args(["list", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("No finished builds"));
    }

    #[test]
    fn show_negative_index() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        buildhist(config.path())
            .args(["show", "-2", "--name", "linux", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("linux #1"))
            .stdout(predicate::str::contains("compile"));
    }

    #[test]
    fn show_missing_build() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        buildhist(config.path())
            .args(["show", "9", "--dir"])
            .arg(builder.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Build not found"));
    }

    #[test]
    fn missing_directory() {
        let config = TempDir::new().unwrap();
        buildhist(config.path())
            .args(["next-number", "--dir", "/nonexistent/buildhist/linux"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Builder directory not found"));
    }

    #[test]
    fn next_number_follows_highest_file() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        std::fs::write(builder.path().join("6-stdio"), "").unwrap();
        buildhist(config.path())
            .args(["next-number", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout("7\n");
    }

    #[test]
    fn prune_applies_horizons() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        std::fs::write(builder.path().join("0-stdio"), "log").unwrap();

        buildhist(config.path())
            .args(["prune", "--builds", "2", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Pruned 2 file(s)"));

        assert!(!builder.path().join("0").exists());
        assert!(!builder.path().join("0-stdio").exists());
        assert!(builder.path().join("1").exists());
    }

    #[test]
    fn prune_without_horizons_is_a_no_op() {
        let config = TempDir::new().unwrap();
        let builder = seeded_builder();
        buildhist(config.path())
            .args(["prune", "--dir"])
            .arg(builder.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("No retention horizons"));
        assert!(builder.path().join("0").exists());
    }
}
