//! Caller-side task dispatch. The executor itself has no notion of parallelism (§4.3); this
//! module is the optional convenience the CLI/caller collaborator would otherwise have to
//! write itself, grounded on the thread-pool dispatch pattern the teacher uses for its own
//! per-blob copy step.

use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{error::BridgeResult, execute::execute, plan::Task};

/// Executes every task in order on the calling thread, stopping at the first failure.
pub fn run_sequential(tasks: &[Task]) -> BridgeResult<()> {
    tasks.iter().try_for_each(execute)
}

/// Executes every task on the global rayon pool, stopping (eventually) at the first
/// failure. Task order and inter-task isolation are both irrelevant to the executor, so
/// callers that don't care about a specific thread count should prefer this.
pub fn run_parallel(tasks: &[Task]) -> BridgeResult<()> {
    tasks.par_iter().try_for_each(execute)
}

/// Executes every task on a freshly built pool capped at `num_threads`, useful when the
/// caller wants to bound concurrency below the global default (e.g. to cap open remote
/// connections).
pub fn run_with_pool(tasks: &[Task], num_threads: usize) -> BridgeResult<()> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| crate::error::execute_error("building thread pool").attach_context("cause", e.to_string()))?;
    pool.install(|| tasks.par_iter().try_for_each(execute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn run_sequential_executes_all_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let src = dir.path().join(format!("src{i}.bin"));
            fs::write(&src, format!("payload-{i}")).unwrap();
            tasks.push(Task { src: src.display().to_string(), dest: dir.path().join(format!("dest{i}.bin")), offset: None, size: None });
        }
        run_sequential(&tasks).unwrap();
        for i in 0..3 {
            assert_eq!(fs::read_to_string(dir.path().join(format!("dest{i}.bin"))).unwrap(), format!("payload-{i}"));
        }
    }

    #[test]
    fn run_parallel_executes_all_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let src = dir.path().join(format!("src{i}.bin"));
            fs::write(&src, format!("payload-{i}")).unwrap();
            tasks.push(Task { src: src.display().to_string(), dest: dir.path().join(format!("dest{i}.bin")), offset: None, size: None });
        }
        run_parallel(&tasks).unwrap();
        for i in 0..8 {
            assert_eq!(fs::read_to_string(dir.path().join(format!("dest{i}.bin"))).unwrap(), format!("payload-{i}"));
        }
    }

    #[test]
    fn run_sequential_surfaces_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task { src: "/no/such/file".to_owned(), dest: dir.path().join("dest.bin"), offset: None, size: None };
        assert!(run_sequential(&[task]).is_err());
    }
}
