use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub role: Role,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub workers: WorkerConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub sandbox: SandboxConfig,
    pub security: SecurityConfig,
    pub monitor: MonitorConfig,
    pub testcases_root: PathBuf,
    pub webhook_url: Option<String>,
    pub webhook_timeout_ms: u64,
    pub max_source_bytes: usize,
    pub max_time_limit_ms: u64,
    pub max_memory_limit_mb: u64,
    /// Test cases assumed per problem when computing the time-to-verdict bound.
    pub verdict_bound_cases: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Api,
    Worker,
    Standalone,
}

impl Role {
    pub fn runs_api(&self) -> bool {
        matches!(self, Role::Api | Role::Standalone)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Role::Worker | Role::Standalone)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "worker" => Ok(Self::Worker),
            "standalone" | "all" => Ok(Self::Standalone),
            _ => Err(format!("unsupported JUDGE_ROLE: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    /// Stable consumer name; unacknowledged jobs are reclaimed under it on restart.
    pub name: String,
    /// First sandbox slot used by this process. Slots must not overlap across processes.
    pub slot_offset: u32,
    /// Slot for single runs served by the API. Must sit outside every worker's range.
    pub scratch_slot: u32,
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn owns_slot(&self, slot: u32) -> bool {
        let end = self.slot_offset.saturating_add(self.count as u32);
        (self.slot_offset..end).contains(&slot)
    }
}

#[derive(Debug, Clone)]
pub enum QueueBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackendConfig,
}

#[derive(Debug, Clone)]
pub enum StoreConfig {
    InMemory { journal_path: Option<PathBuf> },
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackendKind {
    #[default]
    Auto,
    Isolate,
    Fallback,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "isolate" => Ok(Self::Isolate),
            "fallback" | "process" => Ok(Self::Fallback),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    pub isolate_path: PathBuf,
    pub isolate_cgroups: bool,
    /// Session root of the unprivileged variant. Created at start-up under either variant.
    pub fallback_root: PathBuf,
    pub languages_path: Option<PathBuf>,
    pub compile_time_limit_ms: u64,
    pub compile_memory_limit_mb: u64,
    pub compile_max_processes: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
    pub max_file_size_kb: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    pub pid: bool,
    pub net: bool,
    pub mount: bool,
    pub uts: bool,
    pub ipc: bool,
    pub user: bool,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub cgroups_enabled: bool,
    pub cgroup_root: PathBuf,
    pub cgroup_parent: String,
    pub cpu_quota_percent: u64,
    pub cpu_period_us: u64,
    pub pids_max: u64,
    pub device_allow: Vec<String>,
    pub quota_enabled: bool,
    pub quota_filesystem: Option<String>,
    pub quota_base_uid: Option<u32>,
    pub quota_block_kb: u64,
    pub quota_inodes: u64,
    pub setquota_path: PathBuf,
    pub seccomp_enabled: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub syscall_allow: Vec<String>,
    pub syscall_deny: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub no_new_privs: bool,
    pub namespaces: NamespaceConfig,
}

#[derive(Debug, Clone)]
pub struct MonitorThresholds {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub load_per_core: f64,
    pub disk_percent: f64,
    pub inode_percent: f64,
    pub max_processes: u64,
    pub max_open_files: u64,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub proc_root: PathBuf,
    pub disk_path: PathBuf,
    pub max_violations: usize,
    pub thresholds: MonitorThresholds,
}

/// Enough for dynamically linked programs, shells and interpreters to start, fork and exit.
pub(crate) const DEFAULT_SYSCALL_ALLOW: &str = "read,write,readv,writev,pread64,pwrite64,\
open,openat,close,close_range,fstat,stat,lstat,newfstatat,statx,lseek,access,faccessat,faccessat2,\
mmap,mprotect,munmap,mremap,madvise,mincore,msync,brk,rt_sigaction,rt_sigprocmask,rt_sigreturn,\
sigaltstack,ioctl,fcntl,dup,dup2,dup3,pipe,pipe2,getdents,getdents64,getcwd,chdir,fchdir,\
readlink,readlinkat,unlink,unlinkat,mkdir,mkdirat,rename,renameat,ftruncate,umask,statfs,fstatfs,\
uname,arch_prctl,prctl,set_tid_address,set_robust_list,get_robust_list,rseq,futex,\
clone,clone3,fork,vfork,execve,wait4,waitid,kill,tgkill,tkill,exit,exit_group,restart_syscall,\
getpid,getppid,gettid,getuid,geteuid,getgid,getegid,getpgid,setpgid,getrlimit,prlimit64,getrusage,\
sysinfo,times,clock_gettime,clock_getres,clock_nanosleep,nanosleep,gettimeofday,time,getrandom,\
sched_yield,sched_getaffinity,poll,ppoll,select,pselect6,epoll_create,epoll_create1,epoll_ctl,\
epoll_wait,epoll_pwait,eventfd2,membarrier";

const DEFAULT_SYSCALL_DENY: &str = "ptrace,mount,umount2,pivot_root,setns,unshare,reboot,\
kexec_load,init_module,finit_module,delete_module,swapon,swapoff,bpf,perf_event_open,userfaultfd";

const DEFAULT_DROP_CAPABILITIES: &str = "CAP_SYS_ADMIN,CAP_SYS_PTRACE,CAP_SYS_MODULE,\
CAP_SYS_RAWIO,CAP_SYS_BOOT,CAP_NET_ADMIN,CAP_NET_RAW,CAP_MKNOD,CAP_SETUID,CAP_SETGID,\
CAP_SETPCAP,CAP_DAC_OVERRIDE,CAP_CHOWN,CAP_FOWNER";

const DEFAULT_DEVICE_ALLOW: &str = "c 1:3 rwm,c 1:5 rwm,c 1:7 rwm,c 1:8 rwm,c 1:9 rwm,c 5:0 rwm";

impl JudgeConfig {
    pub fn from_env() -> Result<Self> {
        let role = env::var("JUDGE_ROLE")
            .unwrap_or_else(|_| "standalone".to_string())
            .parse::<Role>()
            .map_err(|e| anyhow!(e))?;

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let key_prefix = env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "judge".to_string());

        let queue_backend = match env::var("QUEUE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => QueueBackendConfig::InMemory,
            "redis" => QueueBackendConfig::Redis {
                url: redis_url.clone(),
                key_prefix: key_prefix.clone(),
            },
            other => return Err(anyhow!("unsupported QUEUE_BACKEND: {other}")),
        };

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StoreConfig::InMemory {
                journal_path: env::var("STORE_JOURNAL_PATH").ok().map(PathBuf::from),
            },
            "redis" => StoreConfig::Redis {
                url: redis_url,
                key_prefix,
            },
            other => return Err(anyhow!("unsupported STORE_BACKEND: {other}")),
        };

        let backend = env::var("SANDBOX_BACKEND")
            .unwrap_or_else(|_| "auto".to_string())
            .parse::<SandboxBackendKind>()
            .map_err(|e| anyhow!(e))?;

        let sandbox = SandboxConfig {
            backend,
            isolate_path: PathBuf::from(
                env::var("ISOLATE_PATH").unwrap_or_else(|_| "/usr/local/bin/isolate".to_string()),
            ),
            isolate_cgroups: parse_env("ISOLATE_CGROUPS", true),
            fallback_root: env::var("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("judge-sandbox")),
            languages_path: env::var("LANGUAGES_PATH").ok().map(PathBuf::from),
            compile_time_limit_ms: parse_env("COMPILE_TIME_LIMIT_MS", 10_000u64),
            compile_memory_limit_mb: parse_env("COMPILE_MEMORY_LIMIT_MB", 1024u64),
            compile_max_processes: parse_env("COMPILE_MAX_PROCESSES", 64u64),
            max_processes: parse_env("SANDBOX_MAX_PROCESSES", 16u64),
            max_output_bytes: parse_env("SANDBOX_MAX_OUTPUT_BYTES", 8 * 1024 * 1024usize),
            max_file_size_kb: parse_env("SANDBOX_MAX_FILE_SIZE_KB", 64 * 1024u64),
        };

        let security = SecurityConfig {
            cgroups_enabled: parse_env("SECURITY_CGROUPS", false),
            cgroup_root: PathBuf::from(
                env::var("CGROUP_ROOT").unwrap_or_else(|_| "/sys/fs/cgroup".to_string()),
            ),
            cgroup_parent: env::var("CGROUP_PARENT").unwrap_or_else(|_| "judge".to_string()),
            cpu_quota_percent: parse_env("CGROUP_CPU_PERCENT", 100u64),
            cpu_period_us: parse_env("CGROUP_CPU_PERIOD_US", 100_000u64),
            pids_max: parse_env("CGROUP_PIDS_MAX", 64u64),
            device_allow: parse_csv("CGROUP_DEVICE_ALLOW", DEFAULT_DEVICE_ALLOW),
            quota_enabled: parse_env("SECURITY_QUOTA", false),
            quota_filesystem: env::var("QUOTA_FILESYSTEM").ok(),
            quota_base_uid: env::var("QUOTA_BASE_UID").ok().and_then(|v| v.parse().ok()),
            quota_block_kb: parse_env("QUOTA_BLOCK_KB", 64 * 1024u64),
            quota_inodes: parse_env("QUOTA_INODES", 256u64),
            setquota_path: PathBuf::from(
                env::var("SETQUOTA_PATH").unwrap_or_else(|_| "setquota".to_string()),
            ),
            seccomp_enabled: parse_env("SECURITY_SECCOMP", false),
            seccomp_profile: env::var("SECCOMP_PROFILE").ok().map(PathBuf::from),
            syscall_allow: parse_csv("SECCOMP_ALLOW", DEFAULT_SYSCALL_ALLOW),
            syscall_deny: parse_csv("SECCOMP_DENY", DEFAULT_SYSCALL_DENY),
            drop_capabilities: parse_csv("DROP_CAPABILITIES", DEFAULT_DROP_CAPABILITIES),
            no_new_privs: parse_env("SECURITY_NO_NEW_PRIVS", true),
            namespaces: NamespaceConfig {
                pid: parse_env("NAMESPACE_PID", false),
                net: parse_env("NAMESPACE_NET", false),
                mount: parse_env("NAMESPACE_MOUNT", false),
                uts: parse_env("NAMESPACE_UTS", false),
                ipc: parse_env("NAMESPACE_IPC", false),
                user: parse_env("NAMESPACE_USER", false),
            },
        };

        let monitor = MonitorConfig {
            enabled: parse_env("MONITOR_ENABLED", true),
            interval_ms: parse_env("MONITOR_INTERVAL_MS", 5_000u64).max(100),
            proc_root: PathBuf::from(env::var("PROC_ROOT").unwrap_or_else(|_| "/proc".to_string())),
            disk_path: env::var("MONITOR_DISK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| sandbox.fallback_root.clone()),
            max_violations: parse_env("MONITOR_MAX_VIOLATIONS", 256usize).max(1),
            thresholds: MonitorThresholds {
                memory_percent: parse_env("MONITOR_MEMORY_PERCENT", 90.0f64),
                cpu_percent: parse_env("MONITOR_CPU_PERCENT", 95.0f64),
                load_per_core: parse_env("MONITOR_LOAD_PER_CORE", 2.0f64),
                disk_percent: parse_env("MONITOR_DISK_PERCENT", 90.0f64),
                inode_percent: parse_env("MONITOR_INODE_PERCENT", 90.0f64),
                max_processes: parse_env("MONITOR_MAX_PROCESSES", 4096u64),
                max_open_files: parse_env("MONITOR_MAX_OPEN_FILES", 65_536u64),
            },
        };

        let workers = WorkerConfig {
            count: parse_env("WORKER_COUNT", 4usize).max(1),
            name: env::var("WORKER_NAME")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| "judge".to_string()),
            slot_offset: parse_env("SLOT_OFFSET", 0u32),
            scratch_slot: parse_env("SCRATCH_SLOT", 999u32),
            poll_interval_ms: parse_env("WORKER_POLL_INTERVAL_MS", 200u64).max(10),
        };
        if workers.owns_slot(workers.scratch_slot) {
            return Err(anyhow!(
                "SCRATCH_SLOT {} overlaps the worker slots",
                workers.scratch_slot
            ));
        }

        Ok(Self {
            role,
            bind_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers,
            queue: QueueConfig {
                backend: queue_backend,
            },
            store,
            sandbox,
            security,
            monitor,
            testcases_root: PathBuf::from(
                env::var("TESTCASES_ROOT").unwrap_or_else(|_| "/var/lib/judge/problems".to_string()),
            ),
            webhook_url: env::var("VERDICT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            webhook_timeout_ms: parse_env("VERDICT_WEBHOOK_TIMEOUT_MS", 3_000u64),
            max_source_bytes: parse_env("MAX_SOURCE_BYTES", 256 * 1024usize),
            max_time_limit_ms: parse_env("MAX_TIME_LIMIT_MS", 10_000u64),
            max_memory_limit_mb: parse_env("MAX_MEMORY_LIMIT_MB", 1024u64),
            verdict_bound_cases: parse_env("VERDICT_BOUND_CASES", 50u64).max(1),
        })
    }
}

impl SecurityConfig {
    /// Every mechanism off; the baseline for tests and unprivileged hosts.
    pub fn disabled() -> Self {
        Self {
            cgroups_enabled: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_parent: "judge".to_string(),
            cpu_quota_percent: 100,
            cpu_period_us: 100_000,
            pids_max: 64,
            device_allow: Vec::new(),
            quota_enabled: false,
            quota_filesystem: None,
            quota_base_uid: None,
            quota_block_kb: 64 * 1024,
            quota_inodes: 256,
            setquota_path: PathBuf::from("setquota"),
            seccomp_enabled: false,
            seccomp_profile: None,
            syscall_allow: Vec::new(),
            syscall_deny: Vec::new(),
            drop_capabilities: Vec::new(),
            no_new_privs: false,
            namespaces: NamespaceConfig::default(),
        }
    }
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roles_and_backends() {
        assert_eq!("worker".parse::<Role>().unwrap(), Role::Worker);
        assert_eq!("ALL".parse::<Role>().unwrap(), Role::Standalone);
        assert!("scheduler".parse::<Role>().is_err());
        assert!(Role::Standalone.runs_api() && Role::Standalone.runs_workers());
        assert!(!Role::Api.runs_workers());

        assert_eq!(
            "process".parse::<SandboxBackendKind>().unwrap(),
            SandboxBackendKind::Fallback
        );
        assert!("docker".parse::<SandboxBackendKind>().is_err());
    }

    #[test]
    fn default_lists_split_cleanly() {
        let deny: Vec<&str> = DEFAULT_SYSCALL_DENY.split(',').collect();
        assert!(deny.contains(&"ptrace"));
        assert!(deny.iter().all(|name| !name.trim().is_empty()));

        let allow: Vec<&str> = DEFAULT_SYSCALL_ALLOW.split(',').collect();
        assert!(allow.contains(&"execve") && allow.contains(&"exit_group"));
        assert!(allow.iter().all(|name| !deny.contains(name)));

        let devices: Vec<&str> = DEFAULT_DEVICE_ALLOW.split(',').collect();
        assert!(devices.contains(&"c 1:3 rwm"));
    }

    #[test]
    fn scratch_slot_is_checked_against_worker_slots() {
        let workers = WorkerConfig {
            count: 4,
            name: "w".to_string(),
            slot_offset: 10,
            scratch_slot: 14,
            poll_interval_ms: 10,
        };
        assert!(workers.owns_slot(10) && workers.owns_slot(13));
        assert!(!workers.owns_slot(workers.scratch_slot));
        assert!(!workers.owns_slot(9));
    }
}
