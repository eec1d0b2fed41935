use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::arbiter::client::ArbiterClient;
use crate::arbiter::protocol::{JobRequest, DEFAULT_PORT};
use crate::batch::expect::{resolve_expect, ExpectSource};
use crate::error::{CorelockError, Result};
use crate::executor::{Classification, Executor, Limits, Problem, ProverSpec, ResultCache, RunResult};
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub timeout_s: u64,
    pub memory_mb: u64,
    pub parallelism: usize,
    /// Hold a daemon grant of `parallelism` cores around the whole batch.
    pub with_lock: bool,
    pub port: u16,
    pub expect: ExpectSource,
    pub default_expect: Option<Classification>,
    pub cache_dir: Option<PathBuf>,
    pub meta: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            memory_mb: 2048,
            parallelism: 1,
            with_lock: false,
            port: DEFAULT_PORT,
            expect: ExpectSource::Auto,
            default_expect: None,
            cache_dir: None,
            meta: None,
        }
    }
}

/// What a batch produced: the persisted snapshot plus the problems that
/// never made it into the cross product.
pub struct BatchOutcome {
    pub snapshot: Snapshot,
    pub missing_expect: Vec<PathBuf>,
}

impl BatchOutcome {
    pub fn disagreements(&self) -> Vec<&RunResult> {
        self.snapshot
            .events
            .iter()
            .filter(|event| event.disagrees())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.missing_expect.is_empty() && self.disagreements().is_empty()
    }
}

/// Run every prover against every problem, stream each completed result to
/// `on_result`, and persist the collected events as a snapshot.
///
/// Individual failures are events, not errors: a prover blowing up fails
/// that pair, a problem without a resolvable expectation is skipped and
/// reported, and the batch always runs to the end.
pub async fn run_batch<F>(
    provers: &[ProverSpec],
    paths: &[PathBuf],
    options: &BatchOptions,
    store: &SnapshotStore,
    mut on_result: F,
) -> Result<BatchOutcome>
where
    F: FnMut(&RunResult),
{
    for prover in provers {
        prover.validate()?;
    }

    let mut problems = Vec::new();
    let mut missing_expect = Vec::new();
    for path in paths {
        match resolve_expect(&options.expect, path, options.default_expect).await {
            Ok(expected) => problems.push(Problem {
                path: path.clone(),
                expected,
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping problem");
                missing_expect.push(path.clone());
            }
        }
    }

    let lock = if options.with_lock {
        let mut client = ArbiterClient::connect_or_spawn(options.port).await?;
        let request = JobRequest::new(options.parallelism as i32, 0)
            .with_info(options.meta.clone().unwrap_or_else(|| "batch".into()));
        if !client.acquire(request).await? {
            return Err(CorelockError::Rejected);
        }
        Some(client)
    } else {
        None
    };

    let mut executor = Executor::new(options.parallelism);
    if let Some(dir) = &options.cache_dir {
        executor = executor.with_cache(ResultCache::new(dir));
    }
    let executor = Arc::new(executor);

    let limits = Limits {
        timeout_s: options.timeout_s,
        memory_mb: options.memory_mb,
    };
    tracing::info!(
        provers = provers.len(),
        problems = problems.len(),
        parallelism = options.parallelism,
        "Starting batch"
    );

    let mut tasks = JoinSet::new();
    for prover in provers {
        for problem in &problems {
            let executor = Arc::clone(&executor);
            let prover = prover.clone();
            let problem = problem.clone();
            tasks.spawn(async move { executor.run(&prover, &problem, limits).await });
        }
    }

    let mut events = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(result)) => {
                on_result(&result);
                events.push(result);
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Executor failure"),
            Err(e) => tracing::error!(error = %e, "Run task panicked"),
        }
    }

    let snapshot = Snapshot::new(events, options.meta.clone());
    store.save(&snapshot).await?;

    if let Some(mut client) = lock {
        if let Err(e) = client.release().await {
            tracing::warn!(error = %e, "Release failed");
        } else if let Err(e) = client.end().await {
            tracing::warn!(error = %e, "Session close failed");
        }
    }

    Ok(BatchOutcome {
        snapshot,
        missing_expect,
    })
}
