use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{
    models::{ExecStatus, ExecutionResult, RunLimits},
    sandbox::{ExecRequest, Sandbox, SandboxError, SandboxSession},
};

const STDIN_FILE: &str = ".judge.stdin";
const STDOUT_FILE: &str = ".judge.stdout";
const STDERR_FILE: &str = ".judge.stderr";

/// Read-only host directories mapped into every box.
const BOX_DIRS: [&str; 5] = ["/usr", "/lib", "/lib64:maybe", "/etc:noexec", "/tmp:tmp"];

/// Privileged variant: every box is created, run and destroyed by the `isolate` helper.
pub struct IsolateSandbox {
    binary: PathBuf,
    use_cgroups: bool,
}

impl IsolateSandbox {
    pub fn new(binary: PathBuf, use_cgroups: bool) -> Self {
        Self {
            binary,
            use_cgroups,
        }
    }

    /// Succeeds when `<binary> --version` can be invoked.
    pub async fn probe(binary: &Path) -> Result<(), SandboxError> {
        let output = Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("{}: {e}", binary.display())))?;
        if !output.status.success() {
            return Err(SandboxError::Unavailable(format!(
                "{} --version exited with {}",
                binary.display(),
                output.status
            )));
        }
        Ok(())
    }

    fn box_args(&self, slot: u32) -> Vec<String> {
        let mut args = vec!["--box-id".to_string(), slot.to_string()];
        if self.use_cgroups {
            args.push("--cg".to_string());
        }
        args
    }

    async fn helper(&self, args: &[String]) -> Result<std::process::Output, SandboxError> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })
    }

    fn run_args(&self, slot: u32, request: &ExecRequest, meta_path: &Path) -> Vec<String> {
        let limits = &request.limits;
        let time_secs = limits.time_limit_ms as f64 / 1000.0;
        let wall_secs = limits.wall_time().as_millis() as f64 / 1000.0 + 1.0;

        let mut args = self.box_args(slot);
        if self.use_cgroups {
            args.push(format!("--cg-mem={}", limits.enforced_memory_kb()));
        } else if request.limit_address_space {
            args.push(format!("--mem={}", limits.enforced_memory_kb()));
        }
        args.extend([
            format!("--time={time_secs}"),
            format!("--wall-time={wall_secs}"),
            format!("--extra-time={}", time_secs.min(1.0)),
            format!("--processes={}", limits.max_processes),
            format!("--fsize={}", limits.max_file_size_kb),
            format!("--meta={}", meta_path.display()),
            format!("--stdin={STDIN_FILE}"),
            format!("--stdout={STDOUT_FILE}"),
            format!("--stderr={STDERR_FILE}"),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ]);
        args.extend(BOX_DIRS.iter().map(|dir| format!("--dir={dir}")));
        args.push("--run".to_string());
        args.push("--".to_string());
        args.push(request.program.clone());
        args.extend(request.args.iter().cloned());
        args
    }
}

#[async_trait]
impl Sandbox for IsolateSandbox {
    fn name(&self) -> &'static str {
        "isolate"
    }

    fn privileged(&self) -> bool {
        true
    }

    async fn initialize(&self, slot: u32) -> Result<SandboxSession, SandboxError> {
        // A box left behind by a crashed worker would make --init fail.
        let mut stale = self.box_args(slot);
        stale.push("--cleanup".to_string());
        let _ = self.helper(&stale).await;

        let mut init = self.box_args(slot);
        init.push("--init".to_string());
        let output = self.helper(&init).await?;
        if !output.status.success() {
            return Err(SandboxError::Init {
                slot,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let root = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if root.as_os_str().is_empty() {
            return Err(SandboxError::Init {
                slot,
                message: "isolate --init printed no box path".to_string(),
            });
        }
        info!(slot, root = %root.display(), cgroups = self.use_cgroups, "isolate box initialized");
        Ok(SandboxSession {
            slot,
            work_dir: root.join("box"),
            root,
        })
    }

    async fn cleanup(&self, session: &SandboxSession) -> Result<(), SandboxError> {
        let mut args = self.box_args(session.slot);
        args.push("--cleanup".to_string());
        let output = self.helper(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::Helper(format!(
                "cleanup of box {} failed: {}",
                session.slot,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(slot = session.slot, "isolate box cleaned up");
        Ok(())
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        request: ExecRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        self.write_file(session, STDIN_FILE, request.stdin.as_bytes())
            .await?;
        for name in [STDOUT_FILE, STDERR_FILE] {
            if let Ok(path) = session.resolve(name) {
                let _ = tokio::fs::remove_file(path).await;
            }
        }

        let meta_path = std::env::temp_dir().join(format!(
            "judge-isolate-{}-{}.meta",
            session.slot,
            Uuid::new_v4().as_simple()
        ));
        let args = self.run_args(session.slot, &request, &meta_path);
        debug!(slot = session.slot, ?args, "running isolate");

        let output = self.helper(&args).await?;
        let raw_meta = tokio::fs::read_to_string(&meta_path).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&meta_path).await;

        // Exit status 0/1 means the box ran; anything else is a helper failure.
        if raw_meta.trim().is_empty() && output.status.code().is_none_or(|code| code > 1) {
            return Err(SandboxError::Helper(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let meta = IsolateMeta::parse(&raw_meta);
        let limit = request.limits.max_output_bytes;
        let stdout = read_capped(session, STDOUT_FILE, limit).await;
        let mut stderr = read_capped(session, STDERR_FILE, limit).await;
        if meta.status.as_deref() == Some("XX") {
            let message = meta.message.clone().unwrap_or_default();
            warn!(slot = session.slot, message = %message, "isolate reported an internal error");
            stderr = message;
        }

        Ok(meta.into_result(&request.limits, stdout, stderr))
    }
}

async fn read_capped(session: &SandboxSession, name: &str, limit: usize) -> String {
    let Ok(path) = session.resolve(name) else {
        return String::new();
    };
    let mut bytes = tokio::fs::read(path).await.unwrap_or_default();
    bytes.truncate(limit);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Key/value metadata written by `isolate --meta`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsolateMeta {
    pub time_ms: u64,
    pub wall_ms: u64,
    pub max_rss_kb: Option<u64>,
    pub cg_mem_kb: Option<u64>,
    pub cg_oom_killed: bool,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub killed: bool,
    pub status: Option<String>,
    pub message: Option<String>,
}

impl IsolateMeta {
    pub fn parse(raw: &str) -> Self {
        let fields: HashMap<&str, &str> = raw
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();

        let seconds = |key: &str| {
            fields
                .get(key)
                .and_then(|v| v.parse::<f64>().ok())
                .map(|secs| (secs * 1000.0).round() as u64)
                .unwrap_or(0)
        };
        let number = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            time_ms: seconds("time"),
            wall_ms: seconds("time-wall"),
            max_rss_kb: number("max-rss"),
            cg_mem_kb: number("cg-mem"),
            cg_oom_killed: fields.contains_key("cg-oom-killed"),
            exit_code: fields.get("exitcode").and_then(|v| v.parse().ok()),
            exit_signal: fields.get("exitsig").and_then(|v| v.parse().ok()),
            killed: fields.contains_key("killed"),
            status: fields.get("status").map(|v| v.to_string()),
            message: fields.get("message").map(|v| v.to_string()),
        }
    }

    /// Control-group peak when available, otherwise the resident set high-water mark.
    pub fn memory_kb(&self) -> Option<u64> {
        self.cg_mem_kb.or(self.max_rss_kb)
    }

    pub fn into_result(self, limits: &RunLimits, stdout: String, stderr: String) -> ExecutionResult {
        let mut memory_kb = self.memory_kb();
        if self.cg_oom_killed {
            // The kernel stopped the program at the ceiling, so it ran past the declared limit.
            memory_kb = Some(memory_kb.unwrap_or(0).max(limits.enforced_memory_kb()));
        }

        let status = match self.status.as_deref() {
            None => ExecStatus::Ok,
            Some("TO") => ExecStatus::Timeout,
            Some("SG") => ExecStatus::Signaled,
            Some("RE") => ExecStatus::RuntimeError,
            Some(_) => ExecStatus::InternalError,
        };
        let exit_code = match (self.exit_code, self.exit_signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) if status == ExecStatus::Ok => 0,
            (None, None) => -1,
        };

        ExecutionResult {
            status,
            exit_code,
            time_ms: self.time_ms,
            memory_kb,
            stdout,
            stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sandbox::tests::limits;

    #[test]
    fn parses_successful_run() {
        let meta = IsolateMeta::parse(
            "time:0.123\ntime-wall:0.200\nmax-rss:10240\ncg-mem:8192\nexitcode:0\ncsw-voluntary:3\n",
        );
        assert_eq!(meta.time_ms, 123);
        assert_eq!(meta.wall_ms, 200);
        assert_eq!(meta.memory_kb(), Some(8192));

        let result = meta.into_result(&limits(1000), "42\n".to_string(), String::new());
        assert_eq!(result.status, ExecStatus::Ok);
        assert!(result.succeeded());
        assert_eq!(result.stdout, "42\n");
    }

    #[test]
    fn maps_helper_statuses() {
        let timeout = IsolateMeta::parse("time:1.010\nstatus:TO\nkilled:1\nmessage:Time limit exceeded\n");
        assert!(timeout.killed);
        let result = timeout.into_result(&limits(1000), String::new(), String::new());
        assert_eq!(result.status, ExecStatus::Timeout);

        let signaled = IsolateMeta::parse("status:SG\nexitsig:11\nmessage:Caught fatal signal 11\n");
        let result = signaled.into_result(&limits(1000), String::new(), String::new());
        assert_eq!(result.status, ExecStatus::Signaled);
        assert_eq!(result.exit_code, 139);

        let crashed = IsolateMeta::parse("status:RE\nexitcode:3\n");
        let result = crashed.into_result(&limits(1000), String::new(), String::new());
        assert_eq!(result.status, ExecStatus::RuntimeError);
        assert_eq!(result.exit_code, 3);

        let broken = IsolateMeta::parse("status:XX\nmessage:Cannot run proxy\n");
        let result = broken.into_result(&limits(1000), String::new(), String::new());
        assert_eq!(result.status, ExecStatus::InternalError);
    }

    #[test]
    fn oom_kill_reports_usage_past_the_declared_limit() {
        let limits = limits(1000);
        let meta = IsolateMeta::parse("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        let result = meta.into_result(&limits, String::new(), String::new());
        assert!(result.memory_kb.unwrap() > limits.memory_limit_kb());
    }

    #[test]
    fn run_arguments_carry_every_limit() {
        let sandbox = IsolateSandbox::new(PathBuf::from("/usr/local/bin/isolate"), true);
        let request = ExecRequest {
            program: "./main".to_string(),
            args: vec!["--fast".to_string()],
            stdin: String::new(),
            limits: limits(500),
            confinement: None,
            limit_address_space: true,
        };
        let args = sandbox.run_args(4, &request, Path::new("/tmp/meta"));
        assert_eq!(&args[..3], ["--box-id", "4", "--cg"]);
        assert!(args.contains(&"--time=0.5".to_string()));
        assert!(args.contains(&"--wall-time=2".to_string()));
        assert!(args.contains(&format!("--cg-mem={}", 256 * 1024 + 64 * 1024)));
        assert!(args.contains(&"--processes=16".to_string()));
        assert!(args.contains(&"--meta=/tmp/meta".to_string()));
        assert_eq!(&args[args.len() - 3..], ["--", "./main", "--fast"]);

        let plain = IsolateSandbox::new(PathBuf::from("/usr/local/bin/isolate"), false);
        let jvm = ExecRequest {
            limit_address_space: false,
            ..request
        };
        let args = plain.run_args(4, &jvm, Path::new("/tmp/meta"));
        assert!(!args.iter().any(|arg| arg.starts_with("--mem") || arg.starts_with("--cg-mem")));
    }
}
