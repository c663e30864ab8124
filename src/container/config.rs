//! Hardened container specification.
//!
//! Every sandbox execution runs in a single-use container built from this
//! spec: scratch directory bind-mounted read-write at `/workspace`, no
//! network, read-only rootfs with a small /tmp tmpfs, all capabilities
//! dropped, no privilege escalation, optional seccomp profile, memory and
//! CPU caps.

use crate::env::sandbox::CONTAINER_WORKSPACE;
use bollard::container::Config;
use bollard::service::HostConfig;
use std::collections::HashMap;
use std::path::Path;

/// Specification for one sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxContainerSpec {
    pub image: String,
    /// Host scratch directory mounted at [`CONTAINER_WORKSPACE`]
    pub scratch_dir: String,
    /// Memory cap in bytes (0 = unlimited)
    pub memory_bytes: u64,
    /// CPU quota in microseconds per 100 ms period (0 = unlimited)
    pub cpu_quota: i64,
    /// Seccomp profile JSON to apply, when the runtime supports it
    pub seccomp_profile: Option<String>,
    /// Cap on concurrent pids inside the container
    pub pids_limit: i64,
}

impl SandboxContainerSpec {
    pub fn new(image: impl Into<String>, scratch_dir: &Path) -> Self {
        Self {
            image: image.into(),
            scratch_dir: scratch_dir.display().to_string(),
            memory_bytes: 0,
            cpu_quota: 0,
            seccomp_profile: None,
            pids_limit: 256,
        }
    }

    pub fn with_memory(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_cpu_quota(mut self, cpu_quota: i64) -> Self {
        self.cpu_quota = cpu_quota;
        self
    }

    pub fn with_seccomp(mut self, profile: Option<String>) -> Self {
        self.seccomp_profile = profile;
        self
    }

    /// Lower into the bollard container config. The container idles on
    /// `sleep infinity`; compile and run happen through exec.
    pub fn to_container_config(&self) -> Config<String> {
        let mut security_opt = vec!["no-new-privileges:true".to_string()];
        if let Some(profile) = &self.seccomp_profile {
            security_opt.push(format!("seccomp={profile}"));
        }

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                self.scratch_dir, CONTAINER_WORKSPACE
            )]),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(security_opt),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,size=64m".to_string(),
            )])),
            memory: (self.memory_bytes > 0).then_some(self.memory_bytes as i64),
            memory_swap: (self.memory_bytes > 0).then_some(self.memory_bytes as i64),
            cpu_period: (self.cpu_quota > 0).then_some(100_000),
            cpu_quota: (self.cpu_quota > 0).then_some(self.cpu_quota),
            pids_limit: Some(self.pids_limit),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            env: Some(vec![
                format!("HOME={CONTAINER_WORKSPACE}"),
                "LANG=C.UTF-8".to_string(),
            ]),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardened_defaults() {
        let spec = SandboxContainerSpec::new("python:3.12-alpine", Path::new("/tmp/apex-exec-1"))
            .with_memory(256 * 1024 * 1024)
            .with_cpu_quota(50_000);

        let config = spec.to_container_config();
        let host = config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(
            host.binds,
            Some(vec!["/tmp/apex-exec-1:/workspace:rw".to_string()])
        );
        assert!(
            host.security_opt
                .unwrap()
                .contains(&"no-new-privileges:true".to_string())
        );
    }

    #[test]
    fn test_unlimited_when_zero() {
        let spec = SandboxContainerSpec::new("node:20-alpine", Path::new("/scratch"));
        let host = spec.to_container_config().host_config.unwrap();
        assert_eq!(host.memory, None);
        assert_eq!(host.cpu_quota, None);
    }

    #[test]
    fn test_seccomp_option() {
        let spec = SandboxContainerSpec::new("node:20-alpine", Path::new("/scratch"))
            .with_seccomp(Some("/etc/apex/seccomp.json".to_string()));
        let host = spec.to_container_config().host_config.unwrap();
        assert!(
            host.security_opt
                .unwrap()
                .iter()
                .any(|o| o.starts_with("seccomp="))
        );
    }
}
