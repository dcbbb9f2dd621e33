use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    errors::{PipelineError, Result},
    external::reports_error,
    pool::CancellationToken,
};

/// Exit code recorded for a job whose process never started.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// the process was never spawned
    pub launch_failed: bool,
}

/// One external-process invocation. The description is fixed at construction;
/// the outcome is written once, by the worker that ran it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    pub sample: Option<String>,
    pub allele: Option<String>,
    status: JobStatus,
    outcome: Option<JobOutcome>,
}

impl Job {
    pub fn new(id: impl Into<String>, command: Vec<String>, working_directory: PathBuf) -> Self {
        Self {
            id: id.into(),
            command,
            working_directory,
            sample: None,
            allele: None,
            status: JobStatus::Pending,
            outcome: None,
        }
    }

    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    pub fn with_allele(mut self, allele: impl Into<String>) -> Self {
        self.allele = Some(allele.into());
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn stdout(&self) -> &str {
        self.outcome.as_ref().map_or("", |o| o.stdout.as_str())
    }

    pub fn stderr(&self) -> &str {
        self.outcome.as_ref().map_or("", |o| o.stderr.as_str())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.as_ref().and_then(|o| o.exit_code)
    }

    pub fn program(&self) -> &str {
        self.command.first().map_or("", |s| s.as_str())
    }

    fn record(&mut self, outcome: JobOutcome, status: JobStatus) {
        debug_assert!(self.outcome.is_none(), "job {} completed twice", self.id);
        self.outcome = Some(outcome);
        self.status = status;
    }

    fn fail_without_process(&mut self, started_at: DateTime<Utc>, message: String) {
        self.record(
            JobOutcome {
                exit_code: Some(LAUNCH_FAILURE_EXIT_CODE),
                stdout: String::new(),
                stderr: message,
                started_at,
                finished_at: Utc::now(),
                launch_failed: true,
            },
            JobStatus::Failed,
        );
    }

    /// Marks a job that was never started because the run got cancelled.
    pub(crate) fn mark_cancelled(&mut self) {
        if self.outcome.is_none() {
            self.fail_without_process(Utc::now(), "cancelled before launch".to_string());
        }
    }

    /// Runs the process to completion. Never panics on process errors; every
    /// failure ends up in the outcome with status `Failed`.
    pub fn run(&mut self, cancel: &CancellationToken, grace: Duration) {
        let started_at = Utc::now();
        if cancel.is_cancelled() {
            self.fail_without_process(started_at, "cancelled before launch".to_string());
            return;
        }
        let Some((program, args)) = self.command.split_first() else {
            self.fail_without_process(started_at, "empty command line".to_string());
            return;
        };
        self.status = JobStatus::Running;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // own process group, so cancellation reaches wrapper scripts' children
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let spawned = command.spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(job = %self.id, program = %program, "could not launch: {}", e);
                self.fail_without_process(started_at, e.to_string());
                return;
            }
        };
        match supervise(child, cancel, grace) {
            Ok((status, stdout, stderr)) => {
                let exit_code = status.code();
                debug!(job = %self.id, ?exit_code, "job finished");
                self.record(
                    JobOutcome {
                        exit_code,
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        started_at,
                        finished_at: Utc::now(),
                        launch_failed: false,
                    },
                    if status.success() {
                        JobStatus::Succeeded
                    } else {
                        JobStatus::Failed
                    },
                );
            }
            Err(e) => {
                warn!(job = %self.id, "lost track of process: {}", e);
                self.record(
                    JobOutcome {
                        exit_code: None,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        started_at,
                        finished_at: Utc::now(),
                        launch_failed: false,
                    },
                    JobStatus::Failed,
                );
            }
        }
    }

    /// Turns the recorded outcome into the error taxonomy. A clean exit whose
    /// output tail carries `error_marker` still counts as an execution failure.
    pub fn ensure_success(&self, error_marker: &str) -> Result<()> {
        let Some(outcome) = &self.outcome else {
            return Err(PipelineError::ProcessExecution {
                job_id: self.id.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: "job never ran".to_string(),
            });
        };
        if outcome.launch_failed {
            return Err(PipelineError::ProcessLaunch {
                job_id: self.id.clone(),
                program: self.program().to_string(),
                message: outcome.stderr.clone(),
            });
        }
        if self.status != JobStatus::Succeeded
            || reports_error(&outcome.stdout, &outcome.stderr, error_marker)
        {
            return Err(PipelineError::ProcessExecution {
                job_id: self.id.clone(),
                exit_code: outcome.exit_code,
                stdout: outcome.stdout.clone(),
                stderr: outcome.stderr.clone(),
            });
        }
        Ok(())
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            p.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_drain(handle: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))?
}

/// Waits for the child while draining both pipes; on cancellation the child
/// gets SIGTERM, then SIGKILL once `grace` has elapsed. Returns only after the
/// process has exited and both streams hit EOF.
fn supervise(
    mut child: Child,
    cancel: &CancellationToken,
    grace: Duration,
) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_cancelled() {
            break terminate(&mut child, grace)?;
        }
        thread::sleep(POLL_INTERVAL);
    };
    let out = join_drain(stdout)?;
    let err = join_drain(stderr)?;
    Ok((status, out, err))
}

fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    signal_group(child, GroupSignal::Term);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }
    signal_group(child, GroupSignal::Kill);
    // already-exited races surface as InvalidInput; wait() below still reaps it
    let _ = child.kill();
    child.wait()
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, sig: GroupSignal) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };
    let signal = match sig {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), signal) {
        debug!(pid = child.id(), "{:?} failed: {}", signal, e);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _sig: GroupSignal) {}
