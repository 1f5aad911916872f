use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use std::fs;

fn bin() -> Command {
    cargo_bin_cmd!("pypi-mirror")
}

#[test]
fn help_lists_core_commands() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("mirror"))
        .stdout(contains("verify"))
        .stdout(contains("sync"))
        .stdout(contains("delete"));
}

#[test]
fn version_is_reported() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn subcommand_help_is_available() {
    for sub in ["mirror", "verify", "sync", "delete"] {
        bin().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn missing_config_file_exits_with_usage_error() {
    let temp = tempfile::tempdir().unwrap();
    bin()
        .current_dir(temp.path())
        .args(["--config", "does-not-exist.conf", "mirror"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn delete_without_a_project_name_is_a_usage_error() {
    bin().args(["delete"]).assert().failure();
}

#[test]
fn sync_against_an_unwritable_mirror_directory_reports_a_failure() {
    let temp = tempfile::tempdir().unwrap();
    let conf = temp.path().join("mirror.conf");
    fs::write(
        &conf,
        format!(
            "[mirror]\ndirectory = {}/does/not/exist\nmaster = https://pypi.org\n",
            temp.path().display()
        ),
    )
    .unwrap();

    bin()
        .args(["--config", conf.to_str().unwrap(), "sync", "peerme"])
        .assert()
        .failure();
}
