use std::sync::Arc;

use tracing::debug;

use crate::engine::{
    config::SandboxConfig,
    models::{ExecutionResult, JudgeOutcome, RunLimits, TestCase, Verdict},
    sandbox::{
        self, CompileOutcome, ExecRequest, LanguageProfile, Sandbox, SandboxError, SandboxSession,
    },
    security::ChildConfinement,
};

/// Runs one compiled submission through its test cases and folds the runs into a verdict.
///
/// The caller owns the session: it initializes it before and cleans it up after, whatever
/// this returns. An `Err` is an infrastructure failure, never a verdict about the program.
pub struct TestCaseManager {
    sandbox: Arc<dyn Sandbox>,
    compile_limits: RunLimits,
}

/// Worst-case usage across the runs seen so far.
#[derive(Debug, Default)]
struct Usage {
    time_ms: Option<u64>,
    memory_kb: Option<u64>,
}

impl Usage {
    fn record(&mut self, result: &ExecutionResult) {
        self.time_ms = Some(self.time_ms.unwrap_or(0).max(result.time_ms));
        if let Some(memory) = result.memory_kb {
            self.memory_kb = Some(self.memory_kb.unwrap_or(0).max(memory));
        }
    }
}

impl TestCaseManager {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &SandboxConfig) -> Self {
        Self {
            sandbox,
            compile_limits: sandbox::compile_limits(config),
        }
    }

    pub async fn evaluate(
        &self,
        session: &SandboxSession,
        profile: &LanguageProfile,
        source_code: &str,
        cases: &[TestCase],
        limits: &RunLimits,
        confinement: &ChildConfinement,
    ) -> Result<JudgeOutcome, SandboxError> {
        let total = cases.len() as u32;
        let run = match sandbox::compile(
            self.sandbox.as_ref(),
            session,
            profile,
            source_code,
            self.compile_limits.clone(),
            confinement.compile.clone(),
        )
        .await?
        {
            CompileOutcome::Ready(run) => run,
            CompileOutcome::Failed(diagnostics) => {
                return Ok(JudgeOutcome {
                    total_test_cases: total,
                    ..JudgeOutcome::failed(Verdict::CompilationError, diagnostics)
                });
            }
        };

        let mut usage = Usage::default();
        let mut passed = 0u32;
        for case in cases {
            let request = ExecRequest::new(&run, case.input.clone(), limits.clone())
                .for_profile(profile)
                .confined(confinement.run.clone());
            let result = self.sandbox.execute(session, request).await?;
            usage.record(&result);

            let verdict = match sandbox::classify(&result, limits) {
                Some(Verdict::InternalError) => {
                    return Err(SandboxError::Helper(format!(
                        "test case {}: {}",
                        case.id,
                        result.stderr.trim()
                    )));
                }
                Some(verdict) => Some(verdict),
                None if outputs_match(&result.stdout, &case.expected_output) => None,
                None => Some(Verdict::WrongAnswer),
            };
            debug!(
                slot = session.slot,
                case = %case.id,
                time_ms = result.time_ms,
                memory_kb = ?result.memory_kb,
                verdict = verdict.map(|v| v.code()).unwrap_or("pass"),
                "test case finished"
            );

            if let Some(verdict) = verdict {
                return Ok(JudgeOutcome {
                    verdict,
                    execution_time_ms: usage.time_ms,
                    memory_usage_kb: usage.memory_kb,
                    test_cases_run: passed,
                    total_test_cases: total,
                    error_message: failure_message(verdict, case, &result),
                });
            }
            passed += 1;
        }

        Ok(JudgeOutcome {
            verdict: Verdict::Accepted,
            execution_time_ms: usage.time_ms,
            memory_usage_kb: usage.memory_kb,
            test_cases_run: passed,
            total_test_cases: total,
            error_message: None,
        })
    }
}

fn failure_message(verdict: Verdict, case: &TestCase, result: &ExecutionResult) -> Option<String> {
    let at = format!("test case {}", case.id);
    match verdict {
        Verdict::RuntimeError => {
            let stderr = result.stderr.trim();
            Some(if stderr.is_empty() {
                format!("{at}: exit code {}", result.exit_code)
            } else {
                format!("{at}: exit code {}: {stderr}", result.exit_code)
            })
        }
        _ => Some(at),
    }
}

/// Trailing whitespace on each line and trailing blank lines are ignored.
pub fn normalize_output(output: &str) -> String {
    let lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    lines.join("\n").trim_end().to_string()
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}
