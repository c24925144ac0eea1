use std::{collections::BTreeMap, path::Path};

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::security::{SecurityError, syscalls};

/// Syscall policy as stored in a profile file: `{"allow": [...], "deny": [...]}`.
///
/// Only `allow` entries pass the filter; everything else fails with `EPERM`. `deny`
/// removes names from `allow` and never widens the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// What a compiled policy ended up covering.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicySummary {
    /// Syscalls the filter lets through.
    pub rules: usize,
    /// Allow-list entries removed because the deny list names them.
    pub denied: usize,
    pub skipped: Vec<String>,
}

impl SyscallPolicy {
    pub fn from_lists(allow: &[String], deny: &[String]) -> Self {
        Self {
            allow: allow.to_vec(),
            deny: deny.to_vec(),
        }
    }

    pub fn from_profile(path: &Path) -> Result<Self, SecurityError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SecurityError::Seccomp(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SecurityError::Seccomp(format!("invalid profile {}: {e}", path.display())))
    }

    pub fn compile(&self) -> Result<(BpfProgram, PolicySummary), SecurityError> {
        let arch = TargetArch::try_from(std::env::consts::ARCH)
            .map_err(|e| SecurityError::Seccomp(e.to_string()))?;
        let errno = SeccompAction::Errno(libc::EPERM as u32);

        if self.allow.is_empty() {
            return Err(SecurityError::Seccomp(
                "seccomp policy has an empty allow list".to_string(),
            ));
        }

        let mut skipped = Vec::new();
        let mut denied = 0;
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for name in &self.allow {
            if self.deny.contains(name) {
                denied += 1;
                continue;
            }
            match syscalls::number(name) {
                Some(nr) => {
                    rules.insert(nr, Vec::new());
                }
                None => {
                    warn!(syscall = %name, "unknown syscall in seccomp policy, skipped");
                    skipped.push(name.clone());
                }
            }
        }
        if rules.is_empty() {
            return Err(SecurityError::Seccomp(
                "seccomp policy resolves to no syscalls".to_string(),
            ));
        }

        let summary = PolicySummary {
            rules: rules.len(),
            denied,
            skipped,
        };
        let filter = SeccompFilter::new(rules, errno, SeccompAction::Allow, arch)
            .map_err(|e| SecurityError::Seccomp(e.to_string()))?;
        let program =
            BpfProgram::try_from(filter).map_err(|e| SecurityError::Seccomp(e.to_string()))?;
        Ok((program, summary))
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::process::CommandExt, process::Command, sync::Arc};

    use super::*;
    use crate::engine::{config::DEFAULT_SYSCALL_ALLOW, security::Confinement};

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn default_allow() -> Vec<String> {
        DEFAULT_SYSCALL_ALLOW.split(',').map(str::to_string).collect()
    }

    /// Spawns `program` with the compiled policy installed between fork and exec.
    fn spawn_filtered(policy: &SyscallPolicy, program: &str) -> std::io::Result<std::process::ExitStatus> {
        let (bpf, _) = policy.compile().unwrap();
        let confinement = Confinement::builder().seccomp(Some(Arc::new(bpf))).build();
        let mut cmd = Command::new(program);
        // SAFETY: `apply` only issues raw syscalls on data prepared before fork.
        unsafe {
            cmd.pre_exec(move || confinement.apply());
        }
        cmd.status()
    }

    #[test]
    fn unknown_names_are_skipped() {
        let policy = SyscallPolicy::from_lists(
            &names(&["read", "write", "exit_group", "no_such_call"]),
            &[],
        );
        let (program, summary) = policy.compile().unwrap();
        assert!(!program.is_empty());
        assert_eq!(summary.rules, 3);
        assert_eq!(summary.skipped, vec!["no_such_call"]);
    }

    #[test]
    fn denied_names_are_removed_from_the_allow_list() {
        let policy = SyscallPolicy::from_lists(
            &names(&["read", "write", "execve", "exit_group", "ptrace"]),
            &names(&["ptrace"]),
        );
        let (_, summary) = policy.compile().unwrap();
        assert_eq!(summary.rules, 4);
        assert_eq!(summary.denied, 1);
    }

    #[test]
    fn deny_list_alone_is_rejected() {
        assert!(SyscallPolicy::default().compile().is_err());
        let deny_only = SyscallPolicy::from_lists(&[], &names(&["ptrace", "mount"]));
        assert!(deny_only.compile().is_err());
        let all_denied = SyscallPolicy::from_lists(&names(&["ptrace"]), &names(&["ptrace"]));
        assert!(all_denied.compile().is_err());
    }

    #[test]
    fn syscalls_outside_the_allow_list_fail() {
        // No execve: the exec after the filter is installed must be refused.
        let policy = SyscallPolicy::from_lists(
            &names(&["read", "write", "close", "exit", "exit_group"]),
            &[],
        );
        let err = spawn_filtered(&policy, "/bin/true").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
    }

    #[test]
    fn default_allow_list_runs_a_dynamic_binary() {
        let policy = SyscallPolicy::from_lists(&default_allow(), &[]);
        let (_, summary) = policy.compile().unwrap();
        assert!(summary.rules > 50);
        assert!(spawn_filtered(&policy, "/bin/true").unwrap().success());
    }

    #[test]
    fn loads_profile_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, r#"{"allow": ["read", "write"], "deny": ["bpf"]}"#).unwrap();
        let policy = SyscallPolicy::from_profile(&path).unwrap();
        assert_eq!(policy.allow, names(&["read", "write"]));
        assert_eq!(policy.deny, names(&["bpf"]));

        std::fs::write(&path, "not json").unwrap();
        assert!(SyscallPolicy::from_profile(&path).is_err());
    }
}
