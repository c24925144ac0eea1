pub mod fallback;
pub mod isolate;
pub mod language;

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{
    config::{SandboxBackendKind, SandboxConfig},
    models::{ExecStatus, ExecutionResult, RunLimits, RunReport, Verdict},
    security::{ChildConfinement, Confinement, SecurityContext, SecurityError, SecurityManager},
};

pub use fallback::FallbackSandbox;
pub use isolate::IsolateSandbox;
pub use language::{CommandLine, LanguageProfile, LanguageTable};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox helper unavailable: {0}")]
    Unavailable(String),
    #[error("failed to initialize sandbox slot {slot}: {message}")]
    Init { slot: u32, message: String },
    #[error("sandbox helper failed: {0}")]
    Helper(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("path escapes the sandbox root: {0}")]
    InvalidPath(String),
    #[error("invalid language profile: {0}")]
    Profile(String),
    #[error("sandbox i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// One isolated working root, owned by a single worker until cleaned up.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    pub slot: u32,
    /// Everything under here is removed on cleanup.
    pub root: PathBuf,
    /// Current directory of every process run in this session.
    pub work_dir: PathBuf,
}

impl SandboxSession {
    /// Maps a relative file name onto the work dir. Absolute paths and `..` are refused.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let relative = Path::new(name);
        let clean = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(SandboxError::InvalidPath(name.to_string()));
        }
        Ok(self.work_dir.join(relative))
    }
}

#[derive(Clone)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: String,
    pub limits: RunLimits,
    /// Per-child kernel confinement prepared by the security manager.
    pub confinement: Option<Arc<Confinement>>,
    /// Whether the unprivileged variant caps the address space or only the data segment.
    pub limit_address_space: bool,
}

impl ExecRequest {
    pub fn new(command: &CommandLine, stdin: impl Into<String>, limits: RunLimits) -> Self {
        Self {
            program: command.program.clone(),
            args: command.args.clone(),
            stdin: stdin.into(),
            limits,
            confinement: None,
            limit_address_space: true,
        }
    }

    pub fn confined(mut self, confinement: Option<Arc<Confinement>>) -> Self {
        self.confinement = confinement;
        self
    }

    pub fn for_profile(mut self, profile: &LanguageProfile) -> Self {
        self.limit_address_space = profile.limit_address_space;
        self
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the variant enforces limits inside the kernel on its own.
    fn privileged(&self) -> bool;

    async fn initialize(&self, slot: u32) -> Result<SandboxSession, SandboxError>;

    /// Must tolerate a session whose root is already gone.
    async fn cleanup(&self, session: &SandboxSession) -> Result<(), SandboxError>;

    async fn write_file(
        &self,
        session: &SandboxSession,
        name: &str,
        contents: &[u8],
    ) -> Result<(), SandboxError> {
        let path = session.resolve(name)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_file(&self, session: &SandboxSession, name: &str) -> Result<String, SandboxError> {
        let path = session.resolve(name)?;
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn execute(
        &self,
        session: &SandboxSession,
        request: ExecRequest,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Picks the sandbox variant once for the lifetime of the process.
pub async fn select(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    // The disk monitor watches this root whichever variant wins.
    tokio::fs::create_dir_all(&config.fallback_root).await?;
    let fallback = || -> Arc<dyn Sandbox> {
        Arc::new(FallbackSandbox::new(config.fallback_root.clone()))
    };
    let isolate = || -> Arc<dyn Sandbox> {
        Arc::new(IsolateSandbox::new(
            config.isolate_path.clone(),
            config.isolate_cgroups,
        ))
    };

    let sandbox = match config.backend {
        SandboxBackendKind::Fallback => fallback(),
        SandboxBackendKind::Isolate => {
            IsolateSandbox::probe(&config.isolate_path).await?;
            isolate()
        }
        SandboxBackendKind::Auto => match IsolateSandbox::probe(&config.isolate_path).await {
            Ok(()) => isolate(),
            Err(err) => {
                warn!(error = %err, "isolate helper not invocable, using unprivileged fallback sandbox");
                fallback()
            }
        },
    };
    info!(backend = sandbox.name(), "sandbox selected");
    Ok(sandbox)
}

/// The privileged helper confines its own children.
pub fn child_confinement(sandbox: &dyn Sandbox, context: &SecurityContext) -> ChildConfinement {
    if sandbox.privileged() {
        ChildConfinement::default()
    } else {
        context.children()
    }
}

/// Limits for the compile step, independent of the submission's declared limits.
pub fn compile_limits(config: &SandboxConfig) -> RunLimits {
    RunLimits {
        time_limit_ms: config.compile_time_limit_ms,
        memory_limit_mb: config.compile_memory_limit_mb,
        max_processes: config.compile_max_processes,
        max_output_bytes: config.max_output_bytes,
        max_file_size_kb: config.max_file_size_kb,
    }
    .normalized()
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// The program is ready to run with this command line.
    Ready(CommandLine),
    /// Compiler rejected the source (or ran out of time). Carries the diagnostics.
    Failed(String),
}

/// Writes the source into the session and runs the profile's compile step, if any.
pub async fn compile(
    sandbox: &dyn Sandbox,
    session: &SandboxSession,
    profile: &LanguageProfile,
    source_code: &str,
    limits: RunLimits,
    confinement: Option<Arc<Confinement>>,
) -> Result<CompileOutcome, SandboxError> {
    sandbox
        .write_file(session, &profile.source_name(), source_code.as_bytes())
        .await?;

    let run = profile.run_command().map_err(SandboxError::Profile)?;
    let Some(compile) = profile.compile_command().map_err(SandboxError::Profile)? else {
        return Ok(CompileOutcome::Ready(run));
    };

    let request = ExecRequest::new(&compile, "", limits)
        .for_profile(profile)
        .confined(confinement);
    let result = sandbox.execute(session, request).await?;
    if result.status == ExecStatus::InternalError {
        return Err(SandboxError::Helper(format!(
            "compiler run failed: {}",
            result.stderr.trim()
        )));
    }
    if result.status == ExecStatus::Timeout {
        let stderr = result.stderr.trim();
        let message = if stderr.is_empty() {
            "compilation timed out".to_string()
        } else {
            format!("compilation timed out\n{stderr}")
        };
        return Ok(CompileOutcome::Failed(message));
    }
    if !result.succeeded() {
        let diagnostics = if result.stderr.trim().is_empty() {
            result.stdout
        } else {
            result.stderr
        };
        return Ok(CompileOutcome::Failed(diagnostics));
    }
    Ok(CompileOutcome::Ready(run))
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    CompilationError(String),
    /// `verdict` is `None` when the run was clean and only output comparison remains.
    Completed {
        verdict: Option<Verdict>,
        result: ExecutionResult,
    },
}

impl From<ExecutionOutcome> for RunReport {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::CompilationError(diagnostics) => RunReport {
                verdict: Some(Verdict::CompilationError),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                time_ms: None,
                memory_kb: None,
                compile_output: Some(diagnostics),
            },
            ExecutionOutcome::Completed { verdict, result } => RunReport {
                verdict,
                stdout: result.stdout,
                stderr: result.stderr,
                exit_code: Some(result.exit_code),
                time_ms: Some(result.time_ms),
                memory_kb: result.memory_kb,
                compile_output: None,
            },
        }
    }
}

/// Classifies one finished run against its declared limits.
pub fn classify(result: &ExecutionResult, limits: &RunLimits) -> Option<Verdict> {
    if result.status == ExecStatus::Timeout {
        return Some(Verdict::TimeLimitExceeded);
    }
    if result
        .memory_kb
        .is_some_and(|used| used > limits.memory_limit_kb())
    {
        return Some(Verdict::MemoryLimitExceeded);
    }
    match result.status {
        ExecStatus::InternalError => Some(Verdict::InternalError),
        _ if !result.succeeded() => Some(Verdict::RuntimeError),
        _ => None,
    }
}

/// One program against one input, outside any submission.
#[derive(Debug, Clone)]
pub struct SingleRun {
    pub slot: u32,
    pub language: String,
    pub source_code: String,
    pub input: String,
    pub limits: RunLimits,
}

/// Compile and run one program inside a fresh session and security context. Both are
/// released before returning, whatever the outcome.
pub async fn compile_and_execute(
    sandbox: &dyn Sandbox,
    security: &SecurityManager,
    languages: &LanguageTable,
    config: &SandboxConfig,
    run: &SingleRun,
) -> Result<ExecutionOutcome, SandboxError> {
    let Some(profile) = languages.get(&run.language) else {
        return Ok(ExecutionOutcome::CompilationError(format!(
            "unsupported language: {}",
            run.language
        )));
    };

    let session = sandbox.initialize(run.slot).await?;
    let outcome = match security.initialize(run.slot, &session.root, &run.limits).await {
        Ok(context) => {
            let confinement = child_confinement(sandbox, &context);
            let outcome = run_once(sandbox, &session, profile, config, run, confinement).await;
            if let Err(err) = security.cleanup(run.slot).await {
                warn!(slot = run.slot, error = %err, "security cleanup failed");
            }
            outcome
        }
        Err(err) => Err(err.into()),
    };
    if let Err(err) = sandbox.cleanup(&session).await {
        warn!(slot = run.slot, error = %err, "sandbox cleanup failed");
    }
    outcome
}

async fn run_once(
    sandbox: &dyn Sandbox,
    session: &SandboxSession,
    profile: &LanguageProfile,
    config: &SandboxConfig,
    run: &SingleRun,
    confinement: ChildConfinement,
) -> Result<ExecutionOutcome, SandboxError> {
    let compiled = compile(
        sandbox,
        session,
        profile,
        &run.source_code,
        compile_limits(config),
        confinement.compile,
    )
    .await?;
    let command = match compiled {
        CompileOutcome::Ready(command) => command,
        CompileOutcome::Failed(diagnostics) => {
            return Ok(ExecutionOutcome::CompilationError(diagnostics));
        }
    };
    let request = ExecRequest::new(&command, run.input.clone(), run.limits.clone())
        .for_profile(profile)
        .confined(confinement.run);
    let result = sandbox.execute(session, request).await?;
    Ok(ExecutionOutcome::Completed {
        verdict: classify(&result, &run.limits),
        result,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::VecDeque, path::PathBuf, sync::Mutex};

    use super::*;
    use crate::engine::config::SandboxBackendKind;

    /// Remembers every request and answers with queued results, then with clean silent runs.
    pub(crate) struct RecordingSandbox {
        root: tempfile::TempDir,
        pub(crate) requests: Mutex<Vec<ExecRequest>>,
        responses: Mutex<VecDeque<ExecutionResult>>,
    }

    impl RecordingSandbox {
        pub(crate) fn new(responses: Vec<ExecutionResult>) -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
            }
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            let requests = self.requests.lock().unwrap();
            requests.iter().map(|r| r.program.clone()).collect()
        }
    }

    pub(crate) fn clean_run(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            status: ExecStatus::Ok,
            exit_code: 0,
            time_ms: 5,
            memory_kb: Some(1024),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn privileged(&self) -> bool {
            false
        }

        async fn initialize(&self, slot: u32) -> Result<SandboxSession, SandboxError> {
            let root = self.root.path().join(format!("slot-{slot}"));
            let work_dir = root.join("box");
            tokio::fs::create_dir_all(&work_dir).await?;
            Ok(SandboxSession { slot, root, work_dir })
        }

        async fn cleanup(&self, session: &SandboxSession) -> Result<(), SandboxError> {
            let _ = tokio::fs::remove_dir_all(&session.root).await;
            Ok(())
        }

        async fn execute(
            &self,
            _session: &SandboxSession,
            request: ExecRequest,
        ) -> Result<ExecutionResult, SandboxError> {
            self.requests.lock().unwrap().push(request);
            let queued = self.responses.lock().unwrap().pop_front();
            Ok(queued.unwrap_or_else(|| clean_run("")))
        }
    }

    pub(crate) fn shell_table() -> LanguageTable {
        LanguageTable::from_profiles([(
            "sh".to_string(),
            LanguageProfile {
                name: "POSIX shell".to_string(),
                extension: "sh".to_string(),
                source_stem: "main".to_string(),
                compile: Some(vec!["/bin/sh".to_string(), "-n".to_string(), "{source}".to_string()]),
                run: vec!["/bin/sh".to_string(), "{source}".to_string()],
                limit_address_space: true,
            },
        )])
    }

    pub(crate) fn sandbox_config(root: PathBuf) -> SandboxConfig {
        SandboxConfig {
            backend: SandboxBackendKind::Fallback,
            isolate_path: PathBuf::from("/nonexistent/isolate"),
            isolate_cgroups: false,
            fallback_root: root,
            languages_path: None,
            compile_time_limit_ms: 5_000,
            compile_memory_limit_mb: 256,
            compile_max_processes: 16,
            max_processes: 16,
            max_output_bytes: 64 * 1024,
            max_file_size_kb: 1024,
        }
    }

    pub(crate) fn limits(time_limit_ms: u64) -> RunLimits {
        RunLimits {
            time_limit_ms,
            memory_limit_mb: 256,
            max_processes: 16,
            max_output_bytes: 64 * 1024,
            max_file_size_kb: 1024,
        }
    }

    fn session() -> SandboxSession {
        SandboxSession {
            slot: 0,
            root: PathBuf::from("/tmp/box"),
            work_dir: PathBuf::from("/tmp/box/box"),
        }
    }

    #[test]
    fn session_paths_stay_inside_work_dir() {
        let session = session();
        assert_eq!(
            session.resolve("main.cpp").unwrap(),
            PathBuf::from("/tmp/box/box/main.cpp")
        );
        assert!(session.resolve("../etc/passwd").is_err());
        assert!(session.resolve("/etc/passwd").is_err());
        assert!(session.resolve("").is_err());
    }

    #[test]
    fn classification_prefers_timeout_then_memory() {
        let limits = limits(1000);
        let mut result = ExecutionResult {
            status: ExecStatus::Timeout,
            exit_code: -1,
            time_ms: 2000,
            memory_kb: Some(limits.memory_limit_kb() + 1),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(classify(&result, &limits), Some(Verdict::TimeLimitExceeded));

        result.status = ExecStatus::Signaled;
        assert_eq!(classify(&result, &limits), Some(Verdict::MemoryLimitExceeded));

        result.memory_kb = None;
        assert_eq!(classify(&result, &limits), Some(Verdict::RuntimeError));

        result.status = ExecStatus::Ok;
        result.exit_code = 0;
        assert_eq!(classify(&result, &limits), None);
    }

    #[tokio::test]
    async fn forced_isolate_without_helper_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sandbox_config(dir.path().join("scratch"));
        config.backend = SandboxBackendKind::Isolate;
        assert!(matches!(
            select(&config).await,
            Err(SandboxError::Unavailable(_))
        ));
        assert!(config.fallback_root.is_dir());

        config.backend = SandboxBackendKind::Auto;
        assert_eq!(select(&config).await.unwrap().name(), "fallback");
    }

    #[tokio::test]
    async fn unsupported_language_never_touches_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let config = sandbox_config(dir.path().join("never-created"));
        let sandbox = FallbackSandbox::new(config.fallback_root.clone());
        let run = single_run(1, "cobol", "DISPLAY 'HI'.", "");
        let outcome = compile_and_execute(
            &sandbox,
            &SecurityManager::disabled(),
            &shell_table(),
            &config,
            &run,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::CompilationError(msg) if msg.contains("cobol")));
        assert!(!config.fallback_root.exists());
    }

    fn single_run(slot: u32, language: &str, source: &str, input: &str) -> SingleRun {
        SingleRun {
            slot,
            language: language.to_string(),
            source_code: source.to_string(),
            input: input.to_string(),
            limits: limits(2000),
        }
    }

    #[tokio::test]
    async fn compile_and_execute_reports_each_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = sandbox_config(dir.path().to_path_buf());
        let sandbox = FallbackSandbox::new(config.fallback_root.clone());
        let security = SecurityManager::disabled();
        let table = shell_table();
        let run = |slot, source: &str, input: &str| single_run(slot, "sh", source, input);

        let ok = compile_and_execute(
            &sandbox,
            &security,
            &table,
            &config,
            &run(1, "read x; echo \"got $x\"", "7\n"),
        )
        .await
        .unwrap();
        match ok {
            ExecutionOutcome::Completed { verdict, result } => {
                assert_eq!(verdict, None);
                assert_eq!(result.stdout, "got 7\n");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let crashed = compile_and_execute(&sandbox, &security, &table, &config, &run(2, "exit 3", ""))
            .await
            .unwrap();
        assert!(matches!(
            crashed,
            ExecutionOutcome::Completed { verdict: Some(Verdict::RuntimeError), .. }
        ));

        let broken =
            compile_and_execute(&sandbox, &security, &table, &config, &run(3, "if then fi (", ""))
                .await
                .unwrap();
        assert!(matches!(broken, ExecutionOutcome::CompilationError(_)));

        let mut leftovers = std::fs::read_dir(dir.path()).unwrap();
        assert!(leftovers.next().is_none());
        assert_eq!(security.status().active_sessions, 0);
    }

    #[tokio::test]
    async fn compiler_timeout_keeps_its_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = FallbackSandbox::new(dir.path().to_path_buf());
        let session = sandbox.initialize(4).await.unwrap();
        let profile = LanguageProfile {
            compile: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo still linking >&2; sleep 5".to_string(),
            ]),
            ..shell_table().get("sh").unwrap().clone()
        };

        let outcome = compile(&sandbox, &session, &profile, "true", limits(200), None)
            .await
            .unwrap();
        match outcome {
            CompileOutcome::Failed(message) => {
                assert_eq!(message, "compilation timed out\nstill linking");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        sandbox.cleanup(&session).await.unwrap();
    }

    #[tokio::test]
    async fn compile_step_carries_the_confinement_and_profile() {
        let sandbox = RecordingSandbox::new(Vec::new());
        let session = sandbox.initialize(0).await.unwrap();
        let profile = LanguageProfile {
            limit_address_space: false,
            ..shell_table().get("sh").unwrap().clone()
        };
        let confinement = Arc::new(Confinement::builder().no_new_privs(true).build());

        let outcome = compile(
            &sandbox,
            &session,
            &profile,
            "echo hi",
            limits(1000),
            Some(confinement.clone()),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CompileOutcome::Ready(_)));

        let requests = sandbox.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let sent = requests[0].confinement.as_ref().unwrap();
        assert!(Arc::ptr_eq(sent, &confinement));
        assert!(!requests[0].limit_address_space);
    }
}
