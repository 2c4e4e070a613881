use std::process::Command;

fn expected_tag() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn run(arg: &str) -> (bool, String) {
    let exe = env!("CARGO_BIN_EXE_dealership-api");
    let output = Command::new(exe)
        .arg(arg)
        .env_remove("DEALER_JWT_SECRET")
        .output()
        .unwrap_or_else(|err| panic!("failed to run dealership-api {arg}: {err}"));
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    )
}

#[test]
fn version_flag_outputs_current_release_tag() {
    let (ok, stdout) = run("--version");
    assert!(ok, "exit code should be 0");
    assert_eq!(stdout, expected_tag());
}

#[test]
fn version_subcommand_outputs_current_release_tag() {
    let (ok, stdout) = run("version");
    assert!(ok, "exit code should be 0");
    assert_eq!(stdout, expected_tag());
}

#[test]
fn help_goes_to_stderr_and_succeeds() {
    let (ok, stdout) = run("help");
    assert!(ok);
    assert!(stdout.is_empty());
}
