//! Resolves a container id to its network-namespace path (component P).
//!
//! Grounded on the teacher's `docker.rs` (`get_container_id_from_pid`'s
//! cgroup-path parsing for docker/containerd/podman, including the
//! systemd-cgroup naming variants) plus
//! `original_source/pkg/ovs/pod_linux.go`'s `getContainerNetnsPath`, which
//! resolves a container id the other direction: id → pid → `/proc/<pid>/ns/net`.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerInspectorError {
    #[error("container {0} not found among running processes")]
    NotFound(String),
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
}

/// Resolves `container_id` to the `/proc/<pid>/ns/net` path of its owning
/// process, by scanning `/proc/*/cgroup` for a matching docker/containerd/
/// podman cgroup path. Used by PodManager's `UPDATE` fallback (§4.K) when
/// the CNI caller didn't supply a netns path.
pub struct ContainerInspector;

impl ContainerInspector {
    pub fn new() -> Self {
        Self
    }

    pub fn netns_path(&self, container_id: &str) -> Result<PathBuf, ContainerInspectorError> {
        let pid = self.pid_for_container(container_id)?;
        Ok(PathBuf::from(format!("/proc/{pid}/ns/net")))
    }

    fn pid_for_container(&self, container_id: &str) -> Result<u32, ContainerInspectorError> {
        let proc = PathBuf::from("/proc");
        let entries = fs::read_dir(&proc)
            .map_err(|e| ContainerInspectorError::Io(proc.display().to_string(), e))?;

        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            let cgroup_path = format!("/proc/{pid}/cgroup");
            let Ok(content) = fs::read_to_string(&cgroup_path) else {
                continue;
            };

            if cgroup_matches(&content, container_id) {
                return Ok(pid);
            }
        }

        Err(ContainerInspectorError::NotFound(container_id.to_string()))
    }
}

impl Default for ContainerInspector {
    fn default() -> Self {
        Self::new()
    }
}

/// True if any cgroup line for this process names `container_id`, under any
/// of the docker/containerd/podman conventions (plain or systemd-scoped).
fn cgroup_matches(cgroup_content: &str, container_id: &str) -> bool {
    for line in cgroup_content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 {
            continue;
        }
        let path = parts[2];

        if let Some(stripped) = path.strip_prefix("/docker/") {
            if stripped == container_id {
                return true;
            }
        }

        for prefix in ["docker-", "containerd-", "cri-containerd-", "libpod-"] {
            if let Some(id) = extract_scoped_id(path, prefix) {
                if id == container_id || id.starts_with(container_id) {
                    return true;
                }
            }
        }
    }
    false
}

/// Extracts `<id>` out of a systemd-scoped cgroup path component like
/// `.../<prefix><id>.scope`.
fn extract_scoped_id<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if !path.contains(prefix) || !path.ends_with(".scope") {
        return None;
    }
    let id = path.rsplit(prefix).next()?;
    let id = id.strip_suffix(".scope")?;
    if id.len() >= 12 {
        Some(id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_plain_docker_cgroup() {
        let content = "1:name=systemd:/docker/abcdef0123456789\n";
        assert!(cgroup_matches(content, "abcdef0123456789"));
    }

    #[test]
    fn matches_systemd_docker_scope() {
        let content = "1:name=systemd:/system.slice/docker-abcdef012345.scope\n";
        assert!(cgroup_matches(content, "abcdef012345"));
    }

    #[test]
    fn matches_cri_containerd_scope() {
        let content =
            "1:name=systemd:/kubepods/burstable/pod1/cri-containerd-abcdef012345.scope\n";
        assert!(cgroup_matches(content, "abcdef012345"));
    }

    #[test]
    fn matches_podman_scope() {
        let content = "1:name=systemd:/user.slice/user-1000.slice/libpod-abcdef012345.scope\n";
        assert!(cgroup_matches(content, "abcdef012345"));
    }

    #[test]
    fn does_not_match_unrelated_container() {
        let content = "1:name=systemd:/docker/zzzzzz0123456789\n";
        assert!(!cgroup_matches(content, "abcdef0123456789"));
    }

    #[test]
    fn rejects_short_ids_below_the_scope_length_floor() {
        assert_eq!(extract_scoped_id("/system.slice/docker-ab.scope", "docker-"), None);
    }
}
