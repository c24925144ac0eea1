use std::{collections::HashMap, io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::engine::models::TestCase;

#[derive(Debug, Error)]
pub enum TestCaseError {
    #[error("no test data for problem {0}")]
    NotFound(i64),
    #[error("malformed test data for problem {problem_id}: {message}")]
    Malformed { problem_id: i64, message: String },
    #[error("test data i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of a problem's ordered test cases.
#[async_trait]
pub trait TestCaseProvider: Send + Sync {
    async fn load(&self, problem_id: i64) -> Result<Vec<TestCase>, TestCaseError>;
}

/// `<root>/<problem_id>/{N.in,N.out}` pairs. Stems starting with `sample` are public.
pub struct DirectoryTestCases {
    root: PathBuf,
}

impl DirectoryTestCases {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

/// Numeric part of a stem such as `3` or `sample1`.
fn ordinal(stem: &str) -> Option<u64> {
    stem.strip_prefix("sample").unwrap_or(stem).parse().ok()
}

#[async_trait]
impl TestCaseProvider for DirectoryTestCases {
    async fn load(&self, problem_id: i64) -> Result<Vec<TestCase>, TestCaseError> {
        let dir = self.root.join(problem_id.to_string());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TestCaseError::NotFound(problem_id));
            }
            Err(err) => return Err(err.into()),
        };

        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".in")) else {
                continue;
            };
            let order = ordinal(stem).ok_or_else(|| TestCaseError::Malformed {
                problem_id,
                message: format!("input file {stem}.in has no case number"),
            })?;
            stems.push((order, stem.to_string()));
        }
        stems.sort();

        let mut cases = Vec::with_capacity(stems.len());
        for (_, stem) in stems {
            let input = tokio::fs::read_to_string(dir.join(format!("{stem}.in"))).await?;
            let expected_output = match tokio::fs::read_to_string(dir.join(format!("{stem}.out"))).await {
                Ok(out) => out,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(TestCaseError::Malformed {
                        problem_id,
                        message: format!("{stem}.in has no matching {stem}.out"),
                    });
                }
                Err(err) => return Err(err.into()),
            };
            cases.push(TestCase {
                sample: stem.starts_with("sample"),
                id: stem,
                input,
                expected_output,
            });
        }
        debug!(problem_id, cases = cases.len(), "test cases loaded");
        Ok(cases)
    }
}

/// Fixed in-memory cases, keyed by problem id.
#[derive(Debug, Clone, Default)]
pub struct StaticTestCases {
    problems: HashMap<i64, Vec<TestCase>>,
}

impl StaticTestCases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_problem(mut self, problem_id: i64, cases: Vec<TestCase>) -> Self {
        self.problems.insert(problem_id, cases);
        self
    }
}

#[async_trait]
impl TestCaseProvider for StaticTestCases {
    async fn load(&self, problem_id: i64) -> Result<Vec<TestCase>, TestCaseError> {
        self.problems
            .get(&problem_id)
            .cloned()
            .ok_or(TestCaseError::NotFound(problem_id))
    }
}
