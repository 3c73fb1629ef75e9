use assert_cmd::Command;
use predicates::prelude::*;

fn vibebox() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("vibebox").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    vibebox().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    vibebox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vibebox"));
}

#[test]
fn test_no_args_shows_usage() {
    vibebox()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    vibebox()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = vibebox().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["init", "probe", "exec", "start"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_probe_off_bridge_object() {
    let assert = vibebox().args(["probe", "off", "--json"]).assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();

    assert_eq!(json["ok"], true);
    assert_eq!(json["selected"], "off");
    assert_eq!(json["wasFallback"], false);
    assert_eq!(json["diagnostics"]["off"]["available"], true);
    // Diagnostics are complete even for an explicit request.
    assert!(json["diagnostics"].get("apple-vm").is_some());
    assert!(json["diagnostics"].get("docker").is_some());
}

#[test]
fn test_probe_unknown_provider_fails_with_ok_false() {
    let assert = vibebox()
        .args(["probe", "vmware", "--json"])
        .assert()
        .failure();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(json["ok"], false);
    assert!(json["error"].as_str().unwrap().contains("vmware"));
}

#[test]
fn test_exec_echo_on_off_backend() {
    let dir = tempfile::tempdir().unwrap();
    let assert = vibebox()
        .current_dir(dir.path())
        .args(["exec", "echo vibebox-off", "--provider", "off", "--json"])
        .assert()
        .success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();

    assert_eq!(json["ok"], true);
    assert_eq!(json["selected"], "off");
    assert_eq!(json["exitCode"], 0);
    assert_eq!(json["stdout"], "vibebox-off\n");
    assert_eq!(json["stderr"], "");
}

#[test]
fn test_exec_exit_code_is_mirrored() {
    let dir = tempfile::tempdir().unwrap();
    let assert = vibebox()
        .current_dir(dir.path())
        .args(["exec", "exit 7", "--provider", "off", "--json"])
        .assert()
        .code(7);
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["exitCode"], 7);
}

#[test]
fn test_exec_env_flag_reaches_command() {
    let dir = tempfile::tempdir().unwrap();
    let assert = vibebox()
        .current_dir(dir.path())
        .args([
            "exec",
            "echo $VIBEBOX_GREETING",
            "--provider",
            "off",
            "-e",
            "VIBEBOX_GREETING=hello",
            "--json",
        ])
        .assert()
        .success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(json["stdout"], "hello\n");
}

#[test]
fn test_init_with_unknown_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    vibebox()
        .current_dir(dir.path())
        .args(["init", "--image", "no-such-image"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-image"));
}
