use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use nix::{
    sys::{
        resource::{Resource, setrlimit},
        signal::{Signal, kill, killpg},
    },
    unistd::Pid,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::watch,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{
    models::{ExecStatus, ExecutionResult, RunLimits},
    sandbox::{ExecRequest, Sandbox, SandboxError, SandboxSession},
    security::Confinement,
};

/// Unprivileged variant: a plain scratch directory per session. Limits are enforced
/// with rlimits and a wall-clock kill; kernel isolation only exists when the security
/// manager hands over a confinement for the child.
pub struct FallbackSandbox {
    root: PathBuf,
}

impl FallbackSandbox {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn program_path(session: &SandboxSession, program: &str) -> Result<PathBuf, SandboxError> {
        match program.strip_prefix("./") {
            Some(local) => session.resolve(local),
            None => Ok(PathBuf::from(program)),
        }
    }
}

#[async_trait]
impl Sandbox for FallbackSandbox {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn privileged(&self) -> bool {
        false
    }

    async fn initialize(&self, slot: u32) -> Result<SandboxSession, SandboxError> {
        let root = self
            .root
            .join(format!("slot-{slot}-{}", Uuid::new_v4().as_simple()));
        let work_dir = root.join("box");
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| SandboxError::Init {
                slot,
                message: format!("{}: {e}", work_dir.display()),
            })?;
        debug!(slot, root = %root.display(), "fallback sandbox initialized");
        Ok(SandboxSession {
            slot,
            root,
            work_dir,
        })
    }

    async fn cleanup(&self, session: &SandboxSession) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&session.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        request: ExecRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let program = Self::program_path(session, &request.program)?;
        let limits = request.limits.clone();
        let cgroup = request
            .confinement
            .as_ref()
            .and_then(|c| c.cgroup_dir().map(Path::to_path_buf));
        if let Some(dir) = &cgroup {
            reset_peak(dir).await;
        }

        let mut cmd = Command::new(&program);
        cmd.args(&request.args)
            .current_dir(&session.work_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &session.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let nproc = process_ceiling(limits.max_processes).await;
        install_child_setup(&mut cmd, &request, nproc);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let stdin_bytes = request.stdin.into_bytes();
            tokio::spawn(async move {
                let _ = stdin.write_all(&stdin_bytes).await;
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::Helper("missing stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SandboxError::Helper("missing stderr pipe".to_string())
        })?;
        let limit = limits.max_output_bytes;
        let (drain_by, drain_deadline) = watch::channel(None);
        let stdout_task = tokio::spawn(read_limited(stdout, limit, drain_deadline.clone()));
        let stderr_task = tokio::spawn(read_limited(stderr, limit, drain_deadline));

        let waited = tokio::time::timeout(limits.wall_time(), child.wait()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match waited {
            Ok(Ok(exit)) => Ok(classify_exit(exit, elapsed_ms, &limits)),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                let _ = child.kill().await;
                warn!(slot = session.slot, elapsed_ms, "wall-clock limit hit, child killed");
                Ok((ExecStatus::Timeout, -1))
            }
        };
        terminate_run(pid, cgroup.as_deref(), &session.work_dir, session.slot).await;

        // Descendants that slipped every kill still hold the pipes; stop waiting for them.
        let _ = drain_by.send(Some(tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE));
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let (status, exit_code) = outcome?;
        let memory_kb = match &cgroup {
            Some(dir) => read_peak_kb(dir).await,
            None => None,
        };

        Ok(ExecutionResult {
            status,
            exit_code,
            time_ms: elapsed_ms,
            memory_kb,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

fn classify_exit(
    exit: std::process::ExitStatus,
    elapsed_ms: u64,
    limits: &RunLimits,
) -> (ExecStatus, i32) {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = exit.signal() {
        // RLIMIT_CPU delivers SIGXCPU first.
        if signal == libc::SIGXCPU {
            return (ExecStatus::Timeout, 128 + signal);
        }
        return (ExecStatus::Signaled, 128 + signal);
    }
    let code = exit.code().unwrap_or(-1);
    if elapsed_ms > limits.time_limit_ms {
        return (ExecStatus::Timeout, code);
    }
    if code != 0 {
        return (ExecStatus::RuntimeError, code);
    }
    (ExecStatus::Ok, 0)
}

/// How long output readers keep draining once the run itself is over.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runs between fork and exec: rlimits first, then the optional kernel confinement.
fn install_child_setup(cmd: &mut Command, request: &ExecRequest, nproc: u64) {
    let limits = &request.limits;
    let cpu_secs = limits.time_limit_ms.div_ceil(1000) + 1;
    let fsize = limits.max_file_size_kb.saturating_mul(1024);
    // A cgroup already caps memory and measures it; an rlimit would only turn breaches into crashes.
    let memory = match &request.confinement {
        Some(confinement) if confinement.has_cgroup() => None,
        _ => {
            let bytes = limits.enforced_memory_kb().saturating_mul(1024);
            let resource = if request.limit_address_space {
                Resource::RLIMIT_AS
            } else {
                Resource::RLIMIT_DATA
            };
            Some((resource, bytes))
        }
    };
    let confinement = request.confinement.clone();

    // SAFETY: the closure only issues raw syscalls on values captured before fork.
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
            setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize)?;
            setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
            setrlimit(Resource::RLIMIT_NPROC, nproc, nproc)?;
            if let Some((resource, bytes)) = memory {
                setrlimit(resource, bytes, bytes)?;
            }
            if let Some(confinement) = &confinement {
                confinement.apply()?;
            }
            Ok(())
        });
    }
}

/// `RLIMIT_NPROC` counts every process of the real uid, so the run's allowance sits on top
/// of what the uid already has running.
async fn process_ceiling(max_processes: u64) -> u64 {
    let uid = nix::unistd::getuid().as_raw();
    let owned = scan_processes(|status| owner_uid(status) == Some(uid)).await.len() as u64;
    owned.saturating_add(max_processes)
}

fn owner_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .and_then(|real| real.parse().ok())
}

/// Pids from `/proc` whose status text satisfies `matches`. The engine's own pid is skipped.
async fn scan_processes<F>(mut matches: F) -> Vec<i32>
where
    F: FnMut(&str) -> bool,
{
    let own = std::process::id() as i32;
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir("/proc").await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(status) = tokio::fs::read_to_string(entry.path().join("status")).await else {
            continue;
        };
        if matches(&status) {
            found.push(pid);
        }
    }
    found
}

/// Kills everything the run left behind: its process group, its cgroup if it has one, and
/// any process still working inside the session (a `setsid` daemon leaves both the group
/// and the session of the child).
async fn terminate_run(pid: Option<u32>, cgroup: Option<&Path>, work_dir: &Path, slot: u32) {
    kill_group(pid);
    if let Some(dir) = cgroup {
        let _ = tokio::fs::write(dir.join("cgroup.kill"), "1").await;
    }
    let strays = kill_strays(work_dir).await;
    if strays > 0 {
        warn!(slot, strays, "killed processes that escaped the run's process group");
    }
}

/// The child leads its own process group, so ordinary descendants die with it.
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

async fn kill_strays(work_dir: &Path) -> usize {
    let work_dir = tokio::fs::canonicalize(work_dir)
        .await
        .unwrap_or_else(|_| work_dir.to_path_buf());
    let mut candidates = Vec::new();
    for pid in scan_processes(|_| true).await {
        if let Ok(cwd) = tokio::fs::read_link(format!("/proc/{pid}/cwd")).await {
            if cwd.starts_with(&work_dir) {
                candidates.push(pid);
            }
        }
    }
    candidates
        .into_iter()
        .filter(|pid| kill(Pid::from_raw(*pid), Signal::SIGKILL).is_ok())
        .count()
}

async fn reset_peak(cgroup: &Path) {
    let _ = tokio::fs::write(cgroup.join("memory.peak"), "0").await;
}

async fn read_peak_kb(cgroup: &Path) -> Option<u64> {
    let raw = tokio::fs::read_to_string(cgroup.join("memory.peak")).await.ok()?;
    raw.trim().parse::<u64>().ok().map(|bytes| bytes / 1024)
}

/// Reads until EOF, keeping at most `limit` bytes. Once a deadline is published the reader
/// gives up at that instant and returns what it has.
async fn read_limited<R>(
    mut reader: R,
    limit: usize,
    mut deadline: watch::Receiver<Option<tokio::time::Instant>>,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        let until = *deadline.borrow();
        let read = match until {
            Some(at) => match tokio::time::timeout_at(at, reader.read(&mut chunk)).await {
                Ok(read) => read,
                Err(_) => break,
            },
            None => tokio::select! {
                read = reader.read(&mut chunk) => read,
                changed = deadline.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            },
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}
