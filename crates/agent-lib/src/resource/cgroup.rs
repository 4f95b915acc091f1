//! Container and pod identification from cgroup paths
//!
//! Supported layouts:
//! - Docker: /docker/<container_id> or /system.slice/docker-<container_id>.scope
//! - containerd: /kubepods/burstable/pod<uid>/<container_id>
//!   or /kubepods.slice/.../cri-containerd-<container_id>.scope
//! - CRI-O: /kubepods.slice/kubepods-...-pod<pod_id>.slice/crio-<container_id>.scope

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Containerd,
    Crio,
    Unknown,
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Containerd => "containerd",
            ContainerRuntime::Crio => "crio",
            ContainerRuntime::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Extract a 64-char container ID and its runtime from a cgroup path
pub fn extract_container_id(cgroup_path: &str) -> Option<(String, ContainerRuntime)> {
    let path_parts: Vec<&str> = cgroup_path.split('/').collect();
    let in_docker_tree = path_parts.iter().any(|p| *p == "docker");

    for part in path_parts.iter().rev() {
        let part = part.strip_suffix(".scope").unwrap_or(part);

        for (prefix, runtime) in [
            ("crio-", ContainerRuntime::Crio),
            ("cri-containerd-", ContainerRuntime::Containerd),
            ("docker-", ContainerRuntime::Docker),
        ] {
            if let Some(id) = part.strip_prefix(prefix) {
                if is_container_id(id) {
                    return Some((id.to_string(), runtime));
                }
            }
        }

        // Plain 64-char hex ID
        if is_container_id(part) {
            let runtime = if in_docker_tree {
                ContainerRuntime::Docker
            } else if cgroup_path.contains("kubepods") {
                ContainerRuntime::Containerd
            } else {
                ContainerRuntime::Unknown
            };
            return Some((part.to_string(), runtime));
        }
    }

    None
}

/// Extract the pod UID from a kubepods cgroup path
pub fn extract_pod_id(cgroup_path: &str) -> Option<String> {
    if !cgroup_path.contains("kubepods") {
        return None;
    }

    for part in cgroup_path.split('/').rev() {
        let part = part.strip_suffix(".slice").unwrap_or(part);
        // systemd driver: kubepods-besteffort-pod<uid_with_underscores>
        // cgroupfs driver: pod<uid>
        let candidate = match part.rfind("-pod") {
            Some(pos) => &part[pos + 4..],
            None => match part.strip_prefix("pod") {
                Some(rest) => rest,
                None => continue,
            },
        };
        if !candidate.is_empty() {
            return Some(candidate.replace('_', "-"));
        }
    }

    None
}

/// Select the cgroup path from `/proc/<pid>/cgroup` contents.
///
/// cgroup v2 uses the single `0::/path` entry; on v1 the first entry whose
/// path carries a container ID wins, falling back to the first entry.
pub fn parse_cgroup_path(content: &str) -> Option<String> {
    let mut first = None;
    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            continue;
        }
        if parts[0] == "0" && parts[1].is_empty() {
            return Some(parts[2].to_string());
        }
        if extract_container_id(parts[2]).is_some() {
            return Some(parts[2].to_string());
        }
        if first.is_none() {
            first = Some(parts[2].to_string());
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "abc123def456789012345678901234567890123456789012345678901234abcd";

    #[test]
    fn test_extract_container_id_docker() {
        let path = format!("/docker/{}", ID);
        assert_eq!(
            extract_container_id(&path),
            Some((ID.to_string(), ContainerRuntime::Docker))
        );

        let path = format!("/system.slice/docker-{}.scope", ID);
        assert_eq!(
            extract_container_id(&path),
            Some((ID.to_string(), ContainerRuntime::Docker))
        );
    }

    #[test]
    fn test_extract_container_id_crio() {
        let path = format!(
            "/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod123.slice/crio-{}.scope",
            ID
        );
        assert_eq!(
            extract_container_id(&path),
            Some((ID.to_string(), ContainerRuntime::Crio))
        );
    }

    #[test]
    fn test_extract_container_id_containerd() {
        let path = format!("/kubepods/burstable/pod1234-5678/{}", ID);
        assert_eq!(
            extract_container_id(&path),
            Some((ID.to_string(), ContainerRuntime::Containerd))
        );
    }

    #[test]
    fn test_extract_container_id_none_for_host_process() {
        assert_eq!(extract_container_id("/user.slice/user-1000.slice/session-2.scope"), None);
        assert_eq!(extract_container_id("/"), None);
    }

    #[test]
    fn test_extract_pod_id() {
        let path = format!(
            "/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod1a2b3c4d_5e6f_7a8b_9c0d_1e2f3a4b5c6d.slice/crio-{}.scope",
            ID
        );
        assert_eq!(
            extract_pod_id(&path),
            Some("1a2b3c4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d".to_string())
        );

        let path = format!("/kubepods/burstable/pod1234-5678/{}", ID);
        assert_eq!(extract_pod_id(&path), Some("1234-5678".to_string()));

        assert_eq!(extract_pod_id(&format!("/docker/{}", ID)), None);
    }

    #[test]
    fn test_parse_cgroup_path_v2() {
        assert_eq!(
            parse_cgroup_path("0::/system.slice/sshd.service\n"),
            Some("/system.slice/sshd.service".to_string())
        );
    }

    #[test]
    fn test_parse_cgroup_path_v1_prefers_container() {
        let content = format!(
            "12:memory:/user.slice\n11:cpu,cpuacct:/docker/{}\n",
            ID
        );
        assert_eq!(parse_cgroup_path(&content), Some(format!("/docker/{}", ID)));
        assert_eq!(
            parse_cgroup_path("12:memory:/user.slice\n"),
            Some("/user.slice".to_string())
        );
        assert_eq!(parse_cgroup_path(""), None);
    }
}
