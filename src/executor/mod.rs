pub mod cache;
pub mod prover;
pub mod run;

pub use cache::ResultCache;
pub use prover::{classify, fingerprint, Classification, Problem, ProverSpec, RawOutput, RunResult};
pub use run::Limits;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{CorelockError, Result};

/// Runs provers against problems under a process-wide parallelism bound.
///
/// The semaphore is the executor's sole concurrency primitive; everything
/// else (batch ordering, locks) belongs to the caller. External-process
/// failures come back as `Error`-classified results, never as `Err`.
pub struct Executor {
    semaphore: Arc<Semaphore>,
    cache: Option<ResultCache>,
}

impl Executor {
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run `prover` on `problem`, or return a fresh cached result for the
    /// same fingerprint without spawning anything.
    pub async fn run(
        &self,
        prover: &ProverSpec,
        problem: &Problem,
        limits: Limits,
    ) -> Result<RunResult> {
        let Some(cache) = &self.cache else {
            return self.spawn(prover, problem, limits).await;
        };

        let content = match tokio::fs::read(&problem.path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %problem.path.display(), error = %e, "Problem unreadable");
                Vec::new()
            }
        };
        let key = fingerprint(
            prover,
            &problem.path,
            &content,
            limits.timeout_s,
            limits.memory_mb,
        );

        // Hold the per-key lock across lookup and spawn so concurrent
        // misses coalesce into a single producer.
        let _flight = cache.lock_key(&key).await;
        if let Some(hit) = cache.lookup(&key).await {
            tracing::debug!(prover = %prover.name, problem = %problem.path.display(), "Cache hit");
            return Ok(hit);
        }
        let result = self.spawn(prover, problem, limits).await?;
        cache.store(&key, &result).await;
        Ok(result)
    }

    async fn spawn(
        &self,
        prover: &ProverSpec,
        problem: &Problem,
        limits: Limits,
    ) -> Result<RunResult> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CorelockError::Internal("executor semaphore closed".into()))?;

        let command = run::render_command(&prover.cmd, &problem.path, limits);
        tracing::debug!(
            prover = %prover.name,
            problem = %problem.path.display(),
            command = %command,
            "Spawning prover"
        );

        let output = tokio::task::spawn_blocking(move || run::run_child(&command, limits))
            .await
            .map_err(|e| CorelockError::Internal(format!("executor task panicked: {e}")))?;
        drop(permit);

        match output {
            Ok(child) => {
                let raw = RawOutput {
                    stdout: String::from_utf8_lossy(&child.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&child.stderr).into_owned(),
                    errcode: child.errcode,
                    rtime: child.rtime,
                    utime: child.utime,
                    stime: child.stime,
                };
                let res = classify(prover, child.timed_out, raw.errcode, &raw.stdout, &raw.stderr);
                tracing::info!(
                    prover = %prover.name,
                    problem = %problem.path.display(),
                    res = %res,
                    rtime = raw.rtime,
                    "Prover finished"
                );
                Ok(RunResult {
                    program: prover.clone(),
                    problem: problem.clone(),
                    res,
                    raw,
                })
            }
            Err(e) => {
                tracing::warn!(
                    prover = %prover.name,
                    problem = %problem.path.display(),
                    error = %e,
                    "Spawn failed"
                );
                Ok(RunResult::failed(
                    prover.clone(),
                    problem.clone(),
                    e.to_string(),
                ))
            }
        }
    }
}
