use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CorelockError, Result};

/// High-level outcome of one prover invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Sat,
    Unsat,
    Unknown,
    Timeout,
    Error,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Sat => write!(f, "sat"),
            Classification::Unsat => write!(f, "unsat"),
            Classification::Unknown => write!(f, "unknown"),
            Classification::Timeout => write!(f, "timeout"),
            Classification::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for Classification {
    type Err = CorelockError;

    /// `fail` is accepted as an alias for `error`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sat" => Ok(Classification::Sat),
            "unsat" => Ok(Classification::Unsat),
            "unknown" => Ok(Classification::Unknown),
            "timeout" => Ok(Classification::Timeout),
            "error" | "fail" => Ok(Classification::Error),
            other => Err(CorelockError::Config(format!(
                "not a classification: {other}"
            ))),
        }
    }
}

/// Description of an external prover: how to invoke it and how to read its
/// verdict out of the output streams. Content-addressable; two descriptors
/// with the same fields fingerprint identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProverSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Command template; `$file`, `$timeout` and `$memory` are substituted
    /// textually before the string goes to the shell.
    pub cmd: String,
    pub sat: String,
    pub unsat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ProverSpec {
    /// Compile every regex once so bad patterns surface at configuration
    /// time instead of disappearing into non-matches at run time.
    pub fn validate(&self) -> Result<()> {
        let patterns = [
            Some(&self.sat),
            Some(&self.unsat),
            self.unknown.as_ref(),
            self.timeout.as_ref(),
            self.memory.as_ref(),
        ];
        for pattern in patterns.into_iter().flatten() {
            Regex::new(pattern).map_err(|source| CorelockError::ProverRegex {
                prover: self.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn hash_fields(&self, hasher: &mut Sha256) {
        for field in [&self.name, &self.cmd, &self.sat, &self.unsat] {
            hasher.update(field.as_bytes());
            hasher.update([0]);
        }
        if let Some(binary) = &self.binary {
            hasher.update(binary.as_os_str().as_encoded_bytes());
        }
        hasher.update([0]);
        for field in [&self.unknown, &self.timeout, &self.memory] {
            if let Some(pattern) = field {
                hasher.update(pattern.as_bytes());
            }
            hasher.update([0]);
        }
    }
}

/// One input file together with the outcome its author expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub path: PathBuf,
    pub expected: Classification,
}

/// Everything the operating system told us about one child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status; a negative value is the negated signal number.
    pub errcode: i32,
    pub rtime: f64,
    pub utime: f64,
    pub stime: f64,
}

/// One classified prover invocation; the event type of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub program: ProverSpec,
    pub problem: Problem,
    pub res: Classification,
    pub raw: RawOutput,
}

impl RunResult {
    /// Result for an invocation that never produced a usable child, e.g. a
    /// spawn failure. Execution failures are values, not errors.
    pub fn failed(program: ProverSpec, problem: Problem, message: String) -> Self {
        Self {
            program,
            problem,
            res: Classification::Error,
            raw: RawOutput {
                stdout: String::new(),
                stderr: message,
                errcode: -1,
                rtime: 0.0,
                utime: 0.0,
                stime: 0.0,
            },
        }
    }

    /// A run disagrees with its problem when it produced a definite verdict
    /// different from the expected one. Inconclusive runs (unknown,
    /// timeout) never disagree; the prover may simply have been too slow.
    pub fn disagrees(&self) -> bool {
        match self.res {
            Classification::Unknown | Classification::Timeout => false,
            res => res != self.problem.expected,
        }
    }
}

/// Derive the classification from what the child did.
///
/// Precedence: a fired watchdog wins outright; `sat` is tested before
/// `unsat` on a clean exit; the `timeout`/`unknown`/`memory` patterns can
/// rescue any remaining case to `Unknown`; everything else is an `Error`.
pub fn classify(
    prover: &ProverSpec,
    timed_out: bool,
    errcode: i32,
    stdout: &str,
    stderr: &str,
) -> Classification {
    if timed_out {
        return Classification::Timeout;
    }
    if errcode == 0 {
        if matches(&prover.sat, stdout, stderr) {
            return Classification::Sat;
        }
        if matches(&prover.unsat, stdout, stderr) {
            return Classification::Unsat;
        }
    }
    let inconclusive = [&prover.timeout, &prover.unknown, &prover.memory];
    if inconclusive
        .into_iter()
        .flatten()
        .any(|pattern| matches(pattern, stdout, stderr))
    {
        return Classification::Unknown;
    }
    Classification::Error
}

fn matches(pattern: &str, stdout: &str, stderr: &str) -> bool {
    // Patterns are validated at configuration time.
    match Regex::new(pattern) {
        Ok(re) => re.is_match(stdout) || re.is_match(stderr),
        Err(_) => false,
    }
}

/// Stable content hash identifying one cacheable execution: the prover
/// descriptor, the problem (path and content), and the limits.
pub fn fingerprint(
    prover: &ProverSpec,
    problem_path: &Path,
    problem_content: &[u8],
    timeout_s: u64,
    memory_mb: u64,
) -> String {
    let mut hasher = Sha256::new();
    prover.hash_fields(&mut hasher);
    hasher.update(problem_path.as_os_str().as_encoded_bytes());
    hasher.update([0]);
    hasher.update(problem_content);
    hasher.update([0]);
    hasher.update(timeout_s.to_le_bytes());
    hasher.update(memory_mb.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
