use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    config::{clamp_concurrency, ExternalContext},
    errors::{PipelineError, Result},
    job::Job,
    progress_reporter::ProgressReporter,
};

/// Shared flag a caller flips to stop a running batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancels the token from a background thread once `after` has elapsed.
    pub fn cancel_after(&self, after: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(after);
            token.cancel();
        });
    }
}

/// Runs batches of external processes, at most `max_concurrency` at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_concurrency: usize,
    grace: Duration,
    show_progress: bool,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: clamp_concurrency(max_concurrency),
            grace: Duration::from_secs(2),
            show_progress: false,
        }
    }

    pub fn from_ctxt(ctxt: &ExternalContext) -> Self {
        Self {
            max_concurrency: ctxt.effective_threads(),
            grace: ctxt.kill_grace(),
            show_progress: ctxt.show_progress,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs every job and hands them back in submission order, each in a
    /// terminal state. Jobs are started in submission order. On cancellation,
    /// in-flight processes are terminated, unstarted jobs are marked failed,
    /// and `Cancelled` is returned once nothing is left running.
    pub fn run_all(&self, jobs: Vec<Job>, stage: &str, cancel: &CancellationToken) -> Result<Vec<Job>> {
        let n = jobs.len();
        if n == 0 {
            return Ok(jobs);
        }
        let workers = self.max_concurrency.min(n);
        info!(stage, jobs = n, workers, "running external jobs");
        let t = Instant::now();
        let slots: Vec<Mutex<Job>> = jobs.into_iter().map(Mutex::new).collect();
        let next = AtomicUsize::new(0);
        let progress = self
            .show_progress
            .then(|| ProgressReporter::start(stage, n, Duration::from_secs(10)));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("job-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build worker pool: {}", e)))?;
        pool.scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= n {
                        break;
                    }
                    let mut job = slots[i].lock().unwrap_or_else(PoisonError::into_inner);
                    job.run(cancel, self.grace);
                    debug!(job = %job.id, status = ?job.status(), "job done");
                    if let Some(p) = &progress {
                        p.tick();
                    }
                });
            }
        });
        if let Some(p) = progress {
            p.finish();
        }
        let mut jobs: Vec<Job> = slots
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .collect();
        if cancel.is_cancelled() {
            jobs.iter_mut().for_each(Job::mark_cancelled);
            info!(stage, "cancelled after {:?}", t.elapsed());
            return Err(PipelineError::Cancelled);
        }
        info!(stage, "all {} jobs finished in {:?}", n, t.elapsed());
        Ok(jobs)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::JobStatus;

    fn sh(id: &str, script: &str, dir: &std::path::Path) -> Job {
        Job::new(
            id,
            vec!["sh".into(), "-c".into(), script.into()],
            dir.to_path_buf(),
        )
    }

    #[test]
    fn every_job_comes_back_terminal_and_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut jobs = vec![];
        for i in 0..12 {
            jobs.push(sh(&format!("j{}", i), &format!("echo {}", i), dir.path()));
        }
        jobs.push(Job::new(
            "missing",
            vec!["/no/such/tool".into()],
            dir.path().into(),
        ));
        jobs.push(sh("fails", "exit 1", dir.path()));
        let done = WorkerPool::new(3)
            .run_all(jobs, "test", &CancellationToken::new())
            .unwrap();
        assert_eq!(done.len(), 14);
        assert!(done.iter().all(|j| j.status().is_terminal()));
        for i in 0..12 {
            assert_eq!(done[i].id, format!("j{}", i));
            assert_eq!(done[i].stdout().trim(), i.to_string());
            assert_eq!(done[i].status(), JobStatus::Succeeded);
        }
        assert_eq!(done[12].status(), JobStatus::Failed);
        assert_eq!(done[13].exit_code(), Some(1));
    }

    #[test]
    fn concurrency_never_exceeds_limit() {
        let dir = tempfile::tempdir().unwrap();
        // each job records how many siblings are alive while it runs
        let script = "touch \"$$.live\"; n=$(ls *.live | wc -l); echo $n; sleep 0.2; rm \"$$.live\"";
        let jobs = (0..8).map(|i| sh(&i.to_string(), script, dir.path())).collect();
        let pool = WorkerPool::new(2);
        let limit = pool.max_concurrency();
        let done = pool.run_all(jobs, "test", &CancellationToken::new()).unwrap();
        for j in &done {
            let live: usize = j.stdout().trim().parse().unwrap();
            assert!(live <= limit, "saw {} live jobs", live);
        }
    }

    #[test]
    fn cancellation_kills_in_flight_processes() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = (0..4)
            .map(|i| sh(&i.to_string(), "sleep 30", dir.path()))
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel_after(Duration::from_millis(200));
        let t = Instant::now();
        let res = WorkerPool::new(2)
            .with_grace(Duration::from_millis(200))
            .run_all(jobs, "test", &cancel);
        assert!(matches!(res, Err(PipelineError::Cancelled)));
        assert!(t.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn ignored_sigterm_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = (0..2)
            .map(|i| sh(&i.to_string(), "trap '' TERM; sleep 30", dir.path()))
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel_after(Duration::from_millis(200));
        let grace = Duration::from_millis(300);
        let t = Instant::now();
        let res = WorkerPool::new(2).with_grace(grace).run_all(jobs, "test", &cancel);
        let elapsed = t.elapsed();
        assert!(matches!(res, Err(PipelineError::Cancelled)));
        assert!(elapsed >= grace, "returned before the grace period: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let done = WorkerPool::new(4)
            .run_all(vec![], "test", &CancellationToken::new())
            .unwrap();
        assert!(done.is_empty());
    }
}
