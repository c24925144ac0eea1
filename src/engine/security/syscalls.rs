//! Syscall names accepted in seccomp profiles, mapped to this architecture's numbers.

/// Looks up a syscall by name. Names unknown on this architecture return `None`.
pub fn number(name: &str) -> Option<i64> {
    COMMON
        .iter()
        .chain(ARCH_SPECIFIC)
        .find(|(known, _)| *known == name)
        .map(|(_, nr)| *nr)
}

#[allow(clippy::unnecessary_cast)]
const COMMON: &[(&str, i64)] = &[
    ("read", libc::SYS_read as i64),
    ("write", libc::SYS_write as i64),
    ("openat", libc::SYS_openat as i64),
    ("close", libc::SYS_close as i64),
    ("fstat", libc::SYS_fstat as i64),
    ("lseek", libc::SYS_lseek as i64),
    ("mmap", libc::SYS_mmap as i64),
    ("mprotect", libc::SYS_mprotect as i64),
    ("munmap", libc::SYS_munmap as i64),
    ("brk", libc::SYS_brk as i64),
    ("rt_sigaction", libc::SYS_rt_sigaction as i64),
    ("rt_sigprocmask", libc::SYS_rt_sigprocmask as i64),
    ("rt_sigreturn", libc::SYS_rt_sigreturn as i64),
    ("ioctl", libc::SYS_ioctl as i64),
    ("pread64", libc::SYS_pread64 as i64),
    ("pwrite64", libc::SYS_pwrite64 as i64),
    ("readv", libc::SYS_readv as i64),
    ("writev", libc::SYS_writev as i64),
    ("sched_yield", libc::SYS_sched_yield as i64),
    ("mremap", libc::SYS_mremap as i64),
    ("msync", libc::SYS_msync as i64),
    ("mincore", libc::SYS_mincore as i64),
    ("madvise", libc::SYS_madvise as i64),
    ("dup", libc::SYS_dup as i64),
    ("dup3", libc::SYS_dup3 as i64),
    ("nanosleep", libc::SYS_nanosleep as i64),
    ("getitimer", libc::SYS_getitimer as i64),
    ("setitimer", libc::SYS_setitimer as i64),
    ("getpid", libc::SYS_getpid as i64),
    ("sendfile", libc::SYS_sendfile as i64),
    ("socket", libc::SYS_socket as i64),
    ("connect", libc::SYS_connect as i64),
    ("accept", libc::SYS_accept as i64),
    ("accept4", libc::SYS_accept4 as i64),
    ("sendto", libc::SYS_sendto as i64),
    ("recvfrom", libc::SYS_recvfrom as i64),
    ("sendmsg", libc::SYS_sendmsg as i64),
    ("recvmsg", libc::SYS_recvmsg as i64),
    ("shutdown", libc::SYS_shutdown as i64),
    ("bind", libc::SYS_bind as i64),
    ("listen", libc::SYS_listen as i64),
    ("getsockname", libc::SYS_getsockname as i64),
    ("getpeername", libc::SYS_getpeername as i64),
    ("socketpair", libc::SYS_socketpair as i64),
    ("setsockopt", libc::SYS_setsockopt as i64),
    ("getsockopt", libc::SYS_getsockopt as i64),
    ("clone", libc::SYS_clone as i64),
    ("clone3", libc::SYS_clone3 as i64),
    ("execve", libc::SYS_execve as i64),
    ("execveat", libc::SYS_execveat as i64),
    ("exit", libc::SYS_exit as i64),
    ("wait4", libc::SYS_wait4 as i64),
    ("kill", libc::SYS_kill as i64),
    ("uname", libc::SYS_uname as i64),
    ("fcntl", libc::SYS_fcntl as i64),
    ("flock", libc::SYS_flock as i64),
    ("fsync", libc::SYS_fsync as i64),
    ("fdatasync", libc::SYS_fdatasync as i64),
    ("truncate", libc::SYS_truncate as i64),
    ("ftruncate", libc::SYS_ftruncate as i64),
    ("getcwd", libc::SYS_getcwd as i64),
    ("chdir", libc::SYS_chdir as i64),
    ("fchdir", libc::SYS_fchdir as i64),
    ("fchmod", libc::SYS_fchmod as i64),
    ("fchmodat", libc::SYS_fchmodat as i64),
    ("fchown", libc::SYS_fchown as i64),
    ("fchownat", libc::SYS_fchownat as i64),
    ("umask", libc::SYS_umask as i64),
    ("gettimeofday", libc::SYS_gettimeofday as i64),
    ("getrlimit", libc::SYS_getrlimit as i64),
    ("setrlimit", libc::SYS_setrlimit as i64),
    ("prlimit64", libc::SYS_prlimit64 as i64),
    ("getrusage", libc::SYS_getrusage as i64),
    ("sysinfo", libc::SYS_sysinfo as i64),
    ("times", libc::SYS_times as i64),
    ("ptrace", libc::SYS_ptrace as i64),
    ("getuid", libc::SYS_getuid as i64),
    ("getgid", libc::SYS_getgid as i64),
    ("setuid", libc::SYS_setuid as i64),
    ("setgid", libc::SYS_setgid as i64),
    ("geteuid", libc::SYS_geteuid as i64),
    ("getegid", libc::SYS_getegid as i64),
    ("setpgid", libc::SYS_setpgid as i64),
    ("getppid", libc::SYS_getppid as i64),
    ("setsid", libc::SYS_setsid as i64),
    ("getpgid", libc::SYS_getpgid as i64),
    ("getsid", libc::SYS_getsid as i64),
    ("gettid", libc::SYS_gettid as i64),
    ("tkill", libc::SYS_tkill as i64),
    ("tgkill", libc::SYS_tgkill as i64),
    ("capget", libc::SYS_capget as i64),
    ("capset", libc::SYS_capset as i64),
    ("sigaltstack", libc::SYS_sigaltstack as i64),
    ("personality", libc::SYS_personality as i64),
    ("statfs", libc::SYS_statfs as i64),
    ("fstatfs", libc::SYS_fstatfs as i64),
    ("getpriority", libc::SYS_getpriority as i64),
    ("setpriority", libc::SYS_setpriority as i64),
    ("sched_setaffinity", libc::SYS_sched_setaffinity as i64),
    ("sched_getaffinity", libc::SYS_sched_getaffinity as i64),
    ("prctl", libc::SYS_prctl as i64),
    ("chroot", libc::SYS_chroot as i64),
    ("sync", libc::SYS_sync as i64),
    ("mount", libc::SYS_mount as i64),
    ("umount2", libc::SYS_umount2 as i64),
    ("pivot_root", libc::SYS_pivot_root as i64),
    ("swapon", libc::SYS_swapon as i64),
    ("swapoff", libc::SYS_swapoff as i64),
    ("reboot", libc::SYS_reboot as i64),
    ("sethostname", libc::SYS_sethostname as i64),
    ("setdomainname", libc::SYS_setdomainname as i64),
    ("init_module", libc::SYS_init_module as i64),
    ("finit_module", libc::SYS_finit_module as i64),
    ("delete_module", libc::SYS_delete_module as i64),
    ("kexec_load", libc::SYS_kexec_load as i64),
    ("quotactl", libc::SYS_quotactl as i64),
    ("futex", libc::SYS_futex as i64),
    ("set_tid_address", libc::SYS_set_tid_address as i64),
    ("set_robust_list", libc::SYS_set_robust_list as i64),
    ("get_robust_list", libc::SYS_get_robust_list as i64),
    ("restart_syscall", libc::SYS_restart_syscall as i64),
    ("clock_gettime", libc::SYS_clock_gettime as i64),
    ("clock_getres", libc::SYS_clock_getres as i64),
    ("clock_nanosleep", libc::SYS_clock_nanosleep as i64),
    ("exit_group", libc::SYS_exit_group as i64),
    ("epoll_ctl", libc::SYS_epoll_ctl as i64),
    ("epoll_pwait", libc::SYS_epoll_pwait as i64),
    ("epoll_create1", libc::SYS_epoll_create1 as i64),
    ("waitid", libc::SYS_waitid as i64),
    ("inotify_init1", libc::SYS_inotify_init1 as i64),
    ("mkdirat", libc::SYS_mkdirat as i64),
    ("mknodat", libc::SYS_mknodat as i64),
    ("unlinkat", libc::SYS_unlinkat as i64),
    ("renameat", libc::SYS_renameat as i64),
    ("renameat2", libc::SYS_renameat2 as i64),
    ("linkat", libc::SYS_linkat as i64),
    ("symlinkat", libc::SYS_symlinkat as i64),
    ("readlinkat", libc::SYS_readlinkat as i64),
    ("faccessat", libc::SYS_faccessat as i64),
    ("faccessat2", libc::SYS_faccessat2 as i64),
    ("close_range", libc::SYS_close_range as i64),
    ("newfstatat", libc::SYS_newfstatat as i64),
    ("statx", libc::SYS_statx as i64),
    ("pipe2", libc::SYS_pipe2 as i64),
    ("getdents64", libc::SYS_getdents64 as i64),
    ("eventfd2", libc::SYS_eventfd2 as i64),
    ("timerfd_create", libc::SYS_timerfd_create as i64),
    ("signalfd4", libc::SYS_signalfd4 as i64),
    ("ppoll", libc::SYS_ppoll as i64),
    ("pselect6", libc::SYS_pselect6 as i64),
    ("getrandom", libc::SYS_getrandom as i64),
    ("memfd_create", libc::SYS_memfd_create as i64),
    ("rseq", libc::SYS_rseq as i64),
    ("membarrier", libc::SYS_membarrier as i64),
    ("mlock", libc::SYS_mlock as i64),
    ("munlock", libc::SYS_munlock as i64),
    ("bpf", libc::SYS_bpf as i64),
    ("perf_event_open", libc::SYS_perf_event_open as i64),
    ("userfaultfd", libc::SYS_userfaultfd as i64),
    ("setns", libc::SYS_setns as i64),
    ("unshare", libc::SYS_unshare as i64),
    ("process_vm_readv", libc::SYS_process_vm_readv as i64),
    ("process_vm_writev", libc::SYS_process_vm_writev as i64),
    ("keyctl", libc::SYS_keyctl as i64),
    ("add_key", libc::SYS_add_key as i64),
    ("request_key", libc::SYS_request_key as i64),
];

#[cfg(target_arch = "x86_64")]
#[allow(clippy::unnecessary_cast)]
const ARCH_SPECIFIC: &[(&str, i64)] = &[
    ("open", libc::SYS_open as i64),
    ("stat", libc::SYS_stat as i64),
    ("lstat", libc::SYS_lstat as i64),
    ("poll", libc::SYS_poll as i64),
    ("access", libc::SYS_access as i64),
    ("pipe", libc::SYS_pipe as i64),
    ("select", libc::SYS_select as i64),
    ("dup2", libc::SYS_dup2 as i64),
    ("pause", libc::SYS_pause as i64),
    ("alarm", libc::SYS_alarm as i64),
    ("fork", libc::SYS_fork as i64),
    ("vfork", libc::SYS_vfork as i64),
    ("getdents", libc::SYS_getdents as i64),
    ("rename", libc::SYS_rename as i64),
    ("mkdir", libc::SYS_mkdir as i64),
    ("rmdir", libc::SYS_rmdir as i64),
    ("creat", libc::SYS_creat as i64),
    ("link", libc::SYS_link as i64),
    ("unlink", libc::SYS_unlink as i64),
    ("symlink", libc::SYS_symlink as i64),
    ("readlink", libc::SYS_readlink as i64),
    ("chmod", libc::SYS_chmod as i64),
    ("chown", libc::SYS_chown as i64),
    ("lchown", libc::SYS_lchown as i64),
    ("time", libc::SYS_time as i64),
    ("arch_prctl", libc::SYS_arch_prctl as i64),
    ("iopl", libc::SYS_iopl as i64),
    ("ioperm", libc::SYS_ioperm as i64),
    ("epoll_wait", libc::SYS_epoll_wait as i64),
    ("epoll_create", libc::SYS_epoll_create as i64),
    ("inotify_init", libc::SYS_inotify_init as i64),
    ("uselib", libc::SYS_uselib as i64),
    ("modify_ldt", libc::SYS_modify_ldt as i64),
];

#[cfg(not(target_arch = "x86_64"))]
const ARCH_SPECIFIC: &[(&str, i64)] = &[];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_common_names() {
        assert_eq!(number("read"), Some(libc::SYS_read as i64));
        assert_eq!(number("ptrace"), Some(libc::SYS_ptrace as i64));
        assert_eq!(number("definitely_not_a_syscall"), None);
    }
}
