use std::{
    ffi::CString,
    fmt,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use caps::{CapSet, Capability};
use nix::sched::{CloneFlags, unshare};
use seccompiler::BpfProgram;

use crate::engine::{config::NamespaceConfig, security::SecurityError};

/// Everything a sandboxed child applies to itself between fork and exec.
///
/// Preparation happens in the parent; `apply` only issues syscalls on data that is
/// already in place, in the order the kernel requires: cgroup attach, namespaces,
/// capabilities, no-new-privs, seccomp.
pub struct Confinement {
    cgroup_dir: Option<PathBuf>,
    cgroup_procs: Option<CString>,
    namespaces: CloneFlags,
    drop_capabilities: Vec<Capability>,
    no_new_privs: bool,
    seccomp: Option<Arc<BpfProgram>>,
}

impl fmt::Debug for Confinement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confinement")
            .field("cgroup_dir", &self.cgroup_dir)
            .field("namespaces", &namespace_names(self.namespaces))
            .field("drop_capabilities", &self.drop_capabilities)
            .field("no_new_privs", &self.no_new_privs)
            .field("seccomp_instructions", &self.seccomp.as_ref().map(|p| p.len()))
            .finish()
    }
}

impl Confinement {
    pub fn builder() -> ConfinementBuilder {
        ConfinementBuilder {
            inner: Confinement {
                cgroup_dir: None,
                cgroup_procs: None,
                namespaces: CloneFlags::empty(),
                drop_capabilities: Vec::new(),
                no_new_privs: false,
                seccomp: None,
            },
        }
    }

    pub fn cgroup_dir(&self) -> Option<&Path> {
        self.cgroup_dir.as_deref()
    }

    pub fn has_cgroup(&self) -> bool {
        self.cgroup_procs.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.cgroup_procs.is_none()
            && self.namespaces.is_empty()
            && self.drop_capabilities.is_empty()
            && !self.no_new_privs
            && self.seccomp.is_none()
    }

    /// Confinement for a compiler run. Namespaces (except pid), dropped capabilities and
    /// no-new-privs carry over. The slot's cgroup and syscall filter belong to the program.
    pub fn for_compilation(&self) -> Self {
        Self {
            cgroup_dir: None,
            cgroup_procs: None,
            namespaces: self.namespaces.difference(CloneFlags::CLONE_NEWPID),
            drop_capabilities: self.drop_capabilities.clone(),
            no_new_privs: self.no_new_privs,
            seccomp: None,
        }
    }

    /// Called in the forked child. Must not touch tracing or take locks.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(procs) = &self.cgroup_procs {
            join_cgroup(procs)?;
        }
        if !self.namespaces.is_empty() {
            unshare(self.namespaces)?;
        }
        // The bounding set needs CAP_SETPCAP, so it goes before the effective set shrinks.
        for cap in &self.drop_capabilities {
            let _ = caps::drop(None, CapSet::Bounding, *cap);
        }
        for set in [CapSet::Inheritable, CapSet::Effective, CapSet::Permitted] {
            for cap in &self.drop_capabilities {
                caps::drop(None, set, *cap).map_err(|e| io::Error::other(e.to_string()))?;
            }
        }
        // Installing a filter without CAP_SYS_ADMIN requires no-new-privs.
        if self.no_new_privs || self.seccomp.is_some() {
            nix::sys::prctl::set_no_new_privs()?;
        }
        if let Some(program) = &self.seccomp {
            seccompiler::apply_filter(program).map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(())
    }
}

/// Writes "0" (the calling process) into `cgroup.procs` with raw syscalls.
fn join_cgroup(procs: &CString) -> io::Result<()> {
    // SAFETY: `procs` is a valid NUL-terminated path; the fd is closed on every path.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written != 1 {
            return Err(err);
        }
    }
    Ok(())
}

pub struct ConfinementBuilder {
    inner: Confinement,
}

impl ConfinementBuilder {
    pub fn cgroup(mut self, dir: &Path) -> Result<Self, SecurityError> {
        let procs = dir.join("cgroup.procs");
        let procs = CString::new(procs.as_os_str().as_bytes())
            .map_err(|_| SecurityError::Cgroup(format!("{} contains NUL", procs.display())))?;
        self.inner.cgroup_dir = Some(dir.to_path_buf());
        self.inner.cgroup_procs = Some(procs);
        Ok(self)
    }

    pub fn namespaces(mut self, flags: CloneFlags) -> Self {
        self.inner.namespaces = flags;
        self
    }

    pub fn drop_capabilities(mut self, caps: Vec<Capability>) -> Self {
        self.inner.drop_capabilities = caps;
        self
    }

    pub fn no_new_privs(mut self, enabled: bool) -> Self {
        self.inner.no_new_privs = enabled;
        self
    }

    pub fn seccomp(mut self, program: Option<Arc<BpfProgram>>) -> Self {
        self.inner.seccomp = program;
        self
    }

    pub fn build(self) -> Confinement {
        self.inner
    }
}

pub fn namespace_flags(config: &NamespaceConfig) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    let wanted = [
        (config.pid, CloneFlags::CLONE_NEWPID),
        (config.net, CloneFlags::CLONE_NEWNET),
        (config.mount, CloneFlags::CLONE_NEWNS),
        (config.uts, CloneFlags::CLONE_NEWUTS),
        (config.ipc, CloneFlags::CLONE_NEWIPC),
        (config.user, CloneFlags::CLONE_NEWUSER),
    ];
    for (enabled, flag) in wanted {
        if enabled {
            flags |= flag;
        }
    }
    flags
}

pub fn namespace_names(flags: CloneFlags) -> Vec<&'static str> {
    [
        (CloneFlags::CLONE_NEWPID, "pid"),
        (CloneFlags::CLONE_NEWNET, "net"),
        (CloneFlags::CLONE_NEWNS, "mount"),
        (CloneFlags::CLONE_NEWUTS, "uts"),
        (CloneFlags::CLONE_NEWIPC, "ipc"),
        (CloneFlags::CLONE_NEWUSER, "user"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_namespace_switches_to_clone_flags() {
        let config = NamespaceConfig {
            pid: true,
            net: true,
            ipc: true,
            ..NamespaceConfig::default()
        };
        let flags = namespace_flags(&config);
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
        assert_eq!(namespace_names(flags), vec!["pid", "net", "ipc"]);
    }

    #[test]
    fn empty_confinement_is_detected() {
        assert!(Confinement::builder().build().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let confinement = Confinement::builder()
            .cgroup(dir.path())
            .unwrap()
            .no_new_privs(true)
            .build();
        assert!(!confinement.is_empty());
        assert!(confinement.has_cgroup());
        assert_eq!(confinement.cgroup_dir(), Some(dir.path()));
    }

    #[test]
    fn compilation_keeps_privilege_drops_but_not_the_run_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let run = Confinement::builder()
            .cgroup(dir.path())
            .unwrap()
            .namespaces(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNET)
            .drop_capabilities(vec![Capability::CAP_SYS_ADMIN])
            .no_new_privs(true)
            .seccomp(Some(Arc::new(Vec::new())))
            .build();
        let compile = run.for_compilation();
        assert!(!compile.has_cgroup());
        assert!(compile.seccomp.is_none());
        assert_eq!(namespace_names(compile.namespaces), vec!["net"]);
        assert_eq!(compile.drop_capabilities, vec![Capability::CAP_SYS_ADMIN]);
        assert!(compile.no_new_privs);

        assert!(Confinement::builder().cgroup(dir.path()).unwrap().build().for_compilation().is_empty());
    }

    #[test]
    fn joins_a_cgroup_by_writing_procs() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();
        let confinement = Confinement::builder().cgroup(dir.path()).unwrap().build();
        confinement.apply().unwrap();
        assert_eq!(std::fs::read_to_string(&procs).unwrap(), "0");
    }
}
