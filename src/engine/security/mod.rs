pub mod cgroup;
pub mod confine;
pub mod quota;
pub mod seccomp;
mod syscalls;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use caps::Capability;
use dashmap::DashMap;
use seccompiler::BpfProgram;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::{config::SecurityConfig, models::RunLimits};

pub use cgroup::{CgroupController, CgroupLimits};
pub use confine::Confinement;
pub use quota::QuotaManager;
pub use seccomp::{PolicySummary, SyscallPolicy};

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid security configuration: {0}")]
    InvalidConfig(String),
    #[error("cgroup error: {0}")]
    Cgroup(String),
    #[error("disk quota error: {0}")]
    Quota(String),
    #[error("seccomp error: {0}")]
    Seccomp(String),
}

/// Kernel-level resources held on behalf of one slot.
#[derive(Debug, Clone, Default)]
struct SlotResources {
    cgroup: Option<PathBuf>,
    quota_uid: Option<u32>,
}

/// Result of preparing one slot. The confinement is applied by the sandbox to each child.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    pub slot: u32,
    pub sandbox_path: PathBuf,
    pub cgroup: Option<PathBuf>,
    pub quota_uid: Option<u32>,
    confinement: Arc<Confinement>,
}

impl SecurityContext {
    /// `None` when no mechanism needs to run inside the child.
    pub fn confinement(&self) -> Option<Arc<Confinement>> {
        (!self.confinement.is_empty()).then(|| Arc::clone(&self.confinement))
    }

    pub fn children(&self) -> ChildConfinement {
        let compile = self.confinement.for_compilation();
        ChildConfinement {
            compile: (!compile.is_empty()).then(|| Arc::new(compile)),
            run: self.confinement(),
        }
    }
}

/// What the compiler and the submitted program each apply to themselves.
#[derive(Debug, Clone, Default)]
pub struct ChildConfinement {
    pub compile: Option<Arc<Confinement>>,
    pub run: Option<Arc<Confinement>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityStatus {
    pub cgroups: bool,
    pub cgroup_root: Option<String>,
    pub disk_quota: bool,
    pub seccomp: Option<PolicySummary>,
    pub dropped_capabilities: Vec<String>,
    pub no_new_privs: bool,
    pub namespaces: Vec<&'static str>,
    pub active_sessions: usize,
}

/// Prepares and tears down per-slot isolation. Slots are caller-unique.
pub struct SecurityManager {
    config: SecurityConfig,
    cgroups: Option<CgroupController>,
    quota: Option<QuotaManager>,
    seccomp: Option<(Arc<BpfProgram>, PolicySummary)>,
    capabilities: Vec<Capability>,
    active: DashMap<u32, SlotResources>,
}

impl SecurityManager {
    /// Validates the static configuration and compiles the syscall filter once.
    pub fn new(config: SecurityConfig) -> Result<Self, SecurityError> {
        validate_config(&config)?;

        let cgroups = config.cgroups_enabled.then(|| {
            CgroupController::new(
                config.cgroup_root.clone(),
                config.cgroup_parent.clone(),
                config.device_allow.clone(),
            )
        });

        let quota = match (&config.quota_filesystem, config.quota_base_uid) {
            (Some(filesystem), Some(base_uid)) if config.quota_enabled => Some(QuotaManager::new(
                config.setquota_path.clone(),
                filesystem.clone(),
                base_uid,
                config.quota_block_kb,
                config.quota_inodes,
            )),
            _ => None,
        };

        let seccomp = if config.seccomp_enabled {
            let policy = match &config.seccomp_profile {
                Some(path) => SyscallPolicy::from_profile(path)?,
                None => SyscallPolicy::from_lists(&config.syscall_allow, &config.syscall_deny),
            };
            let (program, summary) = policy.compile()?;
            info!(
                rules = summary.rules,
                denied = summary.denied,
                skipped = summary.skipped.len(),
                "seccomp filter compiled"
            );
            Some((Arc::new(program), summary))
        } else {
            None
        };

        let capabilities = config
            .drop_capabilities
            .iter()
            .map(|name| {
                Capability::from_str(name).map_err(|_| {
                    SecurityError::InvalidConfig(format!("unknown capability: {name}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            cgroups,
            quota,
            seccomp,
            capabilities,
            active: DashMap::new(),
        })
    }

    pub fn disabled() -> Self {
        Self {
            config: SecurityConfig::disabled(),
            cgroups: None,
            quota: None,
            seccomp: None,
            capabilities: Vec::new(),
            active: DashMap::new(),
        }
    }

    /// Creates the slot's cgroup and quota, then assembles the child confinement.
    /// On failure everything acquired so far is released before returning.
    pub async fn initialize(
        &self,
        slot: u32,
        sandbox_path: &Path,
        limits: &RunLimits,
    ) -> Result<SecurityContext, SecurityError> {
        validate_limits(limits)?;
        self.active.insert(slot, SlotResources::default());

        match self.acquire(slot, sandbox_path, limits).await {
            Ok(context) => {
                debug!(
                    slot,
                    sandbox = %sandbox_path.display(),
                    cgroup = context.cgroup.is_some(),
                    quota = context.quota_uid.is_some(),
                    "security context ready"
                );
                Ok(context)
            }
            Err(err) => {
                if let Err(cleanup_err) = self.cleanup(slot).await {
                    warn!(slot, error = %cleanup_err, "rollback after failed security init");
                }
                Err(err)
            }
        }
    }

    async fn acquire(
        &self,
        slot: u32,
        sandbox_path: &Path,
        limits: &RunLimits,
    ) -> Result<SecurityContext, SecurityError> {
        let mut cgroup = None;
        if let Some(controller) = &self.cgroups {
            let cgroup_limits = CgroupLimits {
                memory_bytes: limits.enforced_memory_kb().saturating_mul(1024),
                cpu_quota_us: self.config.cpu_period_us * self.config.cpu_quota_percent / 100,
                cpu_period_us: self.config.cpu_period_us,
                pids_max: limits.max_processes.min(self.config.pids_max),
            };
            let path = controller.create(slot, &cgroup_limits).await?;
            self.record(slot, |res| res.cgroup = Some(path.clone()));
            cgroup = Some(path);
        }

        let mut quota_uid = None;
        if let Some(quota) = &self.quota {
            let uid = quota.assign(slot).await?;
            self.record(slot, |res| res.quota_uid = Some(uid));
            quota_uid = Some(uid);
        }

        let mut builder = Confinement::builder();
        if let Some(dir) = &cgroup {
            builder = builder.cgroup(dir)?;
        }
        let confinement = builder
            .seccomp(self.seccomp.as_ref().map(|(program, _)| Arc::clone(program)))
            .drop_capabilities(self.capabilities.clone())
            .no_new_privs(self.config.no_new_privs)
            .namespaces(confine::namespace_flags(&self.config.namespaces))
            .build();

        Ok(SecurityContext {
            slot,
            sandbox_path: sandbox_path.to_path_buf(),
            cgroup,
            quota_uid,
            confinement: Arc::new(confinement),
        })
    }

    fn record(&self, slot: u32, update: impl FnOnce(&mut SlotResources)) {
        if let Some(mut entry) = self.active.get_mut(&slot) {
            update(&mut entry);
        }
    }

    /// Releases the slot's cgroup and quota. Safe to call repeatedly or for unknown slots.
    pub async fn cleanup(&self, slot: u32) -> Result<(), SecurityError> {
        let Some((_, resources)) = self.active.remove(&slot) else {
            return Ok(());
        };

        let mut first_error = None;
        if let Some(controller) = &self.cgroups {
            // The group may exist even if initialization failed before recording it.
            if let Err(err) = controller.remove(slot).await {
                first_error.get_or_insert(err);
            }
        }
        if let (Some(quota), Some(_)) = (&self.quota, resources.quota_uid) {
            if let Err(err) = quota.reset(slot).await {
                first_error.get_or_insert(err);
            }
        }
        debug!(slot, "security context released");
        first_error.map_or(Ok(()), Err)
    }

    pub fn status(&self) -> SecurityStatus {
        SecurityStatus {
            cgroups: self.cgroups.is_some(),
            cgroup_root: self
                .cgroups
                .as_ref()
                .map(|c| c.root().display().to_string()),
            disk_quota: self.quota.is_some(),
            seccomp: self.seccomp.as_ref().map(|(_, summary)| summary.clone()),
            dropped_capabilities: self.capabilities.iter().map(|c| c.to_string()).collect(),
            no_new_privs: self.config.no_new_privs,
            namespaces: confine::namespace_names(confine::namespace_flags(&self.config.namespaces)),
            active_sessions: self.active.len(),
        }
    }
}

fn validate_config(config: &SecurityConfig) -> Result<(), SecurityError> {
    if config.cgroups_enabled {
        if config.cpu_quota_percent == 0 || config.cpu_period_us == 0 {
            return Err(SecurityError::InvalidConfig(
                "cpu quota and period must be positive".to_string(),
            ));
        }
        if config.pids_max == 0 {
            return Err(SecurityError::InvalidConfig(
                "pids_max must be positive".to_string(),
            ));
        }
    }
    if config.quota_enabled {
        if config.quota_filesystem.as_deref().is_none_or(str::is_empty) {
            return Err(SecurityError::InvalidConfig(
                "disk quota enabled without a filesystem".to_string(),
            ));
        }
        if config.quota_base_uid.is_none() {
            return Err(SecurityError::InvalidConfig(
                "disk quota enabled without a base uid".to_string(),
            ));
        }
        if config.quota_block_kb == 0 || config.quota_inodes == 0 {
            return Err(SecurityError::InvalidConfig(
                "disk quota limits must be positive".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_limits(limits: &RunLimits) -> Result<(), SecurityError> {
    if limits.memory_limit_mb == 0 {
        return Err(SecurityError::InvalidConfig(
            "memory limit must be positive".to_string(),
        ));
    }
    if limits.time_limit_ms == 0 {
        return Err(SecurityError::InvalidConfig(
            "cpu time limit must be positive".to_string(),
        ));
    }
    if limits.max_processes == 0 {
        return Err(SecurityError::InvalidConfig(
            "process limit must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::tests::limits;

    fn cgroup_config(root: &Path) -> SecurityConfig {
        SecurityConfig {
            cgroups_enabled: true,
            cgroup_root: root.to_path_buf(),
            cpu_quota_percent: 50,
            ..SecurityConfig::disabled()
        }
    }

    #[tokio::test]
    async fn prepares_and_releases_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(cgroup_config(dir.path())).unwrap();

        let context = manager
            .initialize(5, Path::new("/tmp/box-5"), &limits(1000))
            .await
            .unwrap();
        let group = context.cgroup.clone().unwrap();
        assert_eq!(std::fs::read_to_string(group.join("cpu.max")).unwrap(), "50000 100000");
        assert_eq!(
            std::fs::read_to_string(group.join("memory.max")).unwrap(),
            (limits(1000).enforced_memory_kb() * 1024).to_string()
        );
        assert!(context.confinement().unwrap().has_cgroup());
        let children = context.children();
        assert!(children.run.unwrap().has_cgroup());
        assert!(children.compile.is_none());
        assert_eq!(manager.status().active_sessions, 1);

        manager.cleanup(5).await.unwrap();
        assert!(!group.exists());
        assert_eq!(manager.status().active_sessions, 0);
        manager.cleanup(5).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_limits_before_touching_the_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(cgroup_config(dir.path())).unwrap();
        let mut bad = limits(1000);
        bad.memory_limit_mb = 0;

        assert!(matches!(
            manager.initialize(1, Path::new("/tmp/box-1"), &bad).await,
            Err(SecurityError::InvalidConfig(_))
        ));
        assert!(!dir.path().join("judge").exists());
        assert_eq!(manager.status().active_sessions, 0);
    }

    #[test]
    fn quota_requires_filesystem_and_uid() {
        let mut config = SecurityConfig {
            quota_enabled: true,
            quota_base_uid: Some(60_000),
            ..SecurityConfig::disabled()
        };
        assert!(matches!(
            SecurityManager::new(config.clone()),
            Err(SecurityError::InvalidConfig(_))
        ));
        config.quota_filesystem = Some("/".to_string());
        config.quota_base_uid = None;
        assert!(SecurityManager::new(config).is_err());
    }

    #[tokio::test]
    async fn failed_quota_rolls_back_the_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let config = SecurityConfig {
            quota_enabled: true,
            quota_filesystem: Some("/".to_string()),
            quota_base_uid: Some(60_000),
            setquota_path: PathBuf::from("/bin/false"),
            ..cgroup_config(dir.path())
        };
        let manager = SecurityManager::new(config).unwrap();
        let result = manager.initialize(3, Path::new("/tmp/box-3"), &limits(1000)).await;
        assert!(matches!(result, Err(SecurityError::Quota(_))));
        assert!(!dir.path().join("judge/box-3").exists());
        assert_eq!(manager.status().active_sessions, 0);
    }

    #[test]
    fn status_reports_enabled_mechanisms() {
        let config = SecurityConfig {
            seccomp_enabled: true,
            syscall_allow: ["read", "write", "exit_group", "ptrace"]
                .map(str::to_string)
                .to_vec(),
            syscall_deny: vec!["ptrace".to_string(), "bpf".to_string()],
            drop_capabilities: vec!["CAP_SYS_ADMIN".to_string()],
            no_new_privs: true,
            ..SecurityConfig::disabled()
        };
        let manager = SecurityManager::new(config).unwrap();
        let status = manager.status();
        assert!(!status.cgroups);
        let seccomp = status.seccomp.unwrap();
        assert_eq!(seccomp.rules, 3);
        assert_eq!(seccomp.denied, 1);
        assert_eq!(status.dropped_capabilities, vec!["CAP_SYS_ADMIN"]);
        assert!(status.no_new_privs);

        let bad = SecurityConfig {
            drop_capabilities: vec!["CAP_MAKE_COFFEE".to_string()],
            ..SecurityConfig::disabled()
        };
        assert!(SecurityManager::new(bad).is_err());
    }

    #[tokio::test]
    async fn disabled_manager_yields_no_confinement() {
        let manager = SecurityManager::disabled();
        let context = manager
            .initialize(0, Path::new("/tmp/box-0"), &limits(1000))
            .await
            .unwrap();
        assert!(context.confinement().is_none());
        assert!(context.children().compile.is_none());
        manager.cleanup(0).await.unwrap();
    }
}
