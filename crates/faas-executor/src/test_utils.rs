/// Test utilities for conditional test execution
use std::process::Command;

pub fn has_docker() -> bool {
    // Check if docker command exists
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// A local `python3` to run the launcher outside a container.
pub fn has_python3() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// gVisor is usable only on Linux with `runsc` on PATH and registered with Docker.
pub fn has_gvisor() -> bool {
    if !cfg!(target_os = "linux") || !has_docker() {
        return false;
    }

    let runsc = Command::new("runsc")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    runsc
        && Command::new("docker")
            .args(["info", "--format", "{{json .Runtimes}}"])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).contains("runsc"))
            .unwrap_or(false)
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_gvisor {
    () => {
        if !$crate::test_utils::has_gvisor() {
            eprintln!("Test ignored: gVisor (runsc) not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_python3 {
    () => {
        if !$crate::test_utils::has_python3() {
            eprintln!("Test ignored: python3 not available");
            return;
        }
    };
}
