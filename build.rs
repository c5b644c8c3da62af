//! Sets DIALSERVER_VERSION and DIALSERVER_GIT_SHA for `--version` and the startup log.

use std::env;
use std::process::Command;

fn main() {
    for var in ["DIALSERVER_VERSION", "DIALSERVER_GIT_SHA", "GITHUB_SHA"] {
        println!("cargo:rerun-if-env-changed={}", var);
    }

    let version = env::var("DIALSERVER_VERSION")
        .or_else(|_| env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "unknown".into());
    println!("cargo:rustc-env=DIALSERVER_VERSION={}", version);

    let git_sha = env::var("DIALSERVER_GIT_SHA")
        .or_else(|_| env::var("GITHUB_SHA").map(|sha| sha.chars().take(7).collect()))
        .ok()
        .or_else(short_head)
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=DIALSERVER_GIT_SHA={}", git_sha);
}

fn short_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
