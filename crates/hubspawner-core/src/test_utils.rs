//! Probes that let Docker-backed tests skip themselves on hosts without a daemon.
use std::process::Command;

/// One field of `docker info`, `None` when the daemon cannot be reached.
fn docker_info(format: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["info", "--format", format])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn has_docker() -> bool {
    docker_info("{{.ServerVersion}}").is_some_and(|version| !version.is_empty())
}

/// Swarm mode is active on the local daemon.
pub fn has_swarm() -> bool {
    docker_info("{{.Swarm.LocalNodeState}}").as_deref() == Some("active")
}

/// Return early from a test when the local Docker daemon is unreachable.
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("skipping: no reachable Docker daemon");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_swarm {
    () => {
        if !$crate::test_utils::has_swarm() {
            eprintln!("skipping: Docker swarm mode is not active");
            return;
        }
    };
}
