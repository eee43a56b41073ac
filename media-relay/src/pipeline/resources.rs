//! The owned-resource list of one pipeline attempt.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Lines of engine stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Everything a pipeline opened: the engine process, the tasks feeding it and
/// draining its stderr, and the directory holding its named pipes.
///
/// [`teardown`](Self::teardown) releases all of it exactly once, from
/// whichever trigger gets there first.
pub struct PipelineResources {
    label: String,
    torn_down: AtomicBool,
    cancel: CancellationToken,
    kill_grace: Duration,
    child: tokio::sync::Mutex<Option<Child>>,
    feeders: tokio::sync::Mutex<Vec<JoinHandle<Result<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pipe_dir: Mutex<Option<TempDir>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl PipelineResources {
    pub fn new(label: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            label: label.into(),
            torn_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            kill_grace,
            child: tokio::sync::Mutex::new(None),
            feeders: tokio::sync::Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            pipe_dir: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        }
    }

    /// Token cancelled on teardown. Feeders select on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn set_pipe_dir(&self, dir: TempDir) {
        *self.pipe_dir.lock() = Some(dir);
    }

    pub async fn set_child(&self, child: Child) {
        *self.child.lock().await = Some(child);
    }

    pub async fn add_feeder(&self, handle: JoinHandle<Result<()>>) {
        self.feeders.lock().await.push(handle);
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Shared buffer the stderr drain appends to.
    pub fn stderr_sink(&self) -> Arc<Mutex<VecDeque<String>>> {
        self.stderr_tail.clone()
    }

    pub fn push_stderr_line(sink: &Mutex<VecDeque<String>>, line: String) {
        let mut tail = sink.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn stderr_summary(&self) -> String {
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            "no diagnostics".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
        }
    }

    /// Wait for a cleanly ended pipeline to wind down.
    ///
    /// Called after the output reached EOF. Fails when a feeder failed (the
    /// engine may have seen a truncated input), the engine exited non-zero, or
    /// it was still running one grace period after closing its output.
    /// Always tears down afterwards.
    pub async fn finish(&self) -> Result<()> {
        let result = self.wait_clean_exit().await;
        self.teardown().await;
        result
    }

    async fn wait_clean_exit(&self) -> Result<()> {
        // Engine first: when it failed, the feeders only saw a broken pipe.
        if let Some(status) = self.wait_engine_exit().await? {
            if !status.success() {
                return Err(Error::process(format!(
                    "engine exited with {status}: {}",
                    self.stderr_summary()
                )));
            }
        }

        let feeders: Vec<_> = self.feeders.lock().await.drain(..).collect();
        for feeder in feeders {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Other(format!("source feeder task failed: {e}"))),
            }
        }
        Ok(())
    }

    /// Poll the engine for up to one grace period, then stop it.
    ///
    /// The child lock is only held between polls so a concurrent teardown can
    /// always take the child. `None` means there was no engine to wait for.
    async fn wait_engine_exit(&self) -> Result<Option<ExitStatus>> {
        let deadline = tokio::time::Instant::now() + self.kill_grace;
        loop {
            {
                let mut slot = self.child.lock().await;
                let Some(child) = slot.as_mut() else {
                    if self.is_torn_down() {
                        return Err(Error::process("pipeline stopped before the engine exited"));
                    }
                    return Ok(None);
                };
                if let Some(status) = child
                    .try_wait()
                    .map_err(|e| Error::process(format!("waiting for engine: {e}")))?
                {
                    return Ok(Some(status));
                }
                if tokio::time::Instant::now() >= deadline {
                    let stuck = slot.take();
                    drop(slot);
                    if let Some(mut child) = stuck {
                        warn!(pipeline = %self.label, "Engine still running after closing its output, stopping it");
                        if let Err(e) = process_utils::terminate(&mut child, self.kill_grace).await {
                            warn!(pipeline = %self.label, error = %e, "Failed to stop engine");
                        }
                    }
                    return Err(Error::process("engine did not exit after closing its output"));
                }
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Release everything. Idempotent; later calls return immediately.
    ///
    /// Errors are logged, never returned: this runs on cleanup paths.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pipeline = %self.label, "Tearing down pipeline");

        self.cancel.cancel();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match process_utils::terminate(&mut child, self.kill_grace).await {
                Ok(status) => debug!(pipeline = %self.label, ?status, "Engine stopped"),
                Err(e) => warn!(pipeline = %self.label, error = %e, "Failed to stop engine"),
            }
        }

        for feeder in self.feeders.lock().await.drain(..) {
            feeder.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // Dropping the TempDir removes the named pipes.
        let pipe_dir = self.pipe_dir.lock().take();
        if let Some(dir) = pipe_dir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                debug!(pipeline = %self.label, path = %path.display(), error = %e, "Failed to remove pipe directory");
            }
        }
    }
}

impl Drop for PipelineResources {
    fn drop(&mut self) {
        // Children are spawned with kill_on_drop, so only tasks need aborting.
        self.cancel.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for feeder in self.feeders.get_mut().drain(..) {
            feeder.abort();
        }
    }
}
