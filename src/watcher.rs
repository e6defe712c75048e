/// Log activity watcher for one managed process.
///
/// Follows the process's output log like `tail -F`: survives truncation and
/// rotation, sleeps between polls when there is no new data, and records the
/// wall-clock time of the most recent complete line. The timestamp is an
/// atomic written only by the follow loop and read by the orchestrator.
use crate::pm2::ProcessManager;
use crate::process::ManagedProcess;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("cannot open log {} for process {process}: {source}", path.display())]
    Open {
        process: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Shared activity state of one watcher.
#[derive(Debug)]
pub struct ActivityState {
    last_line_ms: AtomicI64,
    lines: AtomicU64,
    alive: AtomicBool,
}

impl ActivityState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            last_line_ms: AtomicI64::new(started_at.timestamp_millis()),
            lines: AtomicU64::new(0),
            alive: AtomicBool::new(false),
        }
    }

    pub fn record_lines_at(&self, count: u64, at: DateTime<Utc>) {
        self.lines.fetch_add(count, Ordering::Relaxed);
        self.last_line_ms
            .store(at.timestamp_millis(), Ordering::Release);
    }

    pub fn last_line_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_line_ms.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }
}

/// Point-in-time view of a watcher.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStats {
    pub process: ManagedProcess,
    pub last_line_at: DateTime<Utc>,
    pub lines: u64,
    pub alive: bool,
}

impl WatcherStats {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Read-side handle of a watcher, held by the orchestrator.
pub struct LogWatcher {
    process: ManagedProcess,
    state: Arc<ActivityState>,
    directory: Arc<dyn ProcessManager>,
}

impl LogWatcher {
    /// Open the process's output log.
    ///
    /// Returns the read-side handle plus the follower that must be spawned to
    /// keep the activity state current.
    pub async fn open(
        process: ManagedProcess,
        directory: Arc<dyn ProcessManager>,
        poll_interval: Duration,
    ) -> Result<(LogWatcher, LogFollower), WatcherError> {
        let path = process.out_log_path.clone();
        let file = File::open(&path).await.map_err(|e| WatcherError::Open {
            process: process.name.clone(),
            path: path.clone(),
            source: e,
        })?;
        tracing::info!(process = %process.name, log = %path.display(), "watching log");

        let state = Arc::new(ActivityState::new(Utc::now()));
        let follower = LogFollower {
            name: process.name.clone(),
            path,
            file: Some(file),
            inode: None,
            position: 0,
            state: Arc::clone(&state),
            poll_interval,
        };
        let watcher = LogWatcher {
            process,
            state,
            directory,
        };
        Ok((watcher, follower))
    }

    /// Handle over an existing state, without a follower.
    #[cfg(test)]
    pub fn with_state(
        process: ManagedProcess,
        state: Arc<ActivityState>,
        directory: Arc<dyn ProcessManager>,
    ) -> Self {
        Self {
            process,
            state,
            directory,
        }
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn name(&self) -> &str {
        &self.process.name
    }

    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    pub fn stats(&self) -> WatcherStats {
        WatcherStats {
            process: self.process.clone(),
            last_line_at: self.state.last_line_at(),
            lines: self.state.lines(),
            alive: self.state.is_alive(),
        }
    }

    pub async fn restart(&self) {
        self.directory.restart(&self.process.name).await;
    }

    /// Re-query the process manager for this process's status.
    #[allow(dead_code)]
    pub async fn is_running(&self) -> bool {
        matches!(
            self.directory.status_of(&self.process.name).await.as_deref(),
            Some("online")
        )
    }
}

/// Write-side of a watcher: the follow loop.
pub struct LogFollower {
    name: String,
    path: PathBuf,
    file: Option<File>,
    inode: Option<u64>,
    position: u64,
    state: Arc<ActivityState>,
    poll_interval: Duration,
}

impl LogFollower {
    /// Follow the log until `cancel` fires. Existing content is skipped.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.seek_to_end().await {
            tracing::warn!(process = %self.name, error = %e, "failed to seek log, reading from start");
        }
        self.state.set_alive(true);
        let mut buf = vec![0u8; 8192];

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.read_available(&mut buf).await {
                Ok(0) => {
                    self.check_rotation().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(process = %self.name, error = %e, "error reading log");
                    self.file = None;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    self.reopen().await;
                }
            }
        }

        // Dropping the handle releases the log file.
        self.file = None;
        self.state.set_alive(false);
        tracing::debug!(process = %self.name, "log watcher stopped");
    }

    async fn seek_to_end(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            self.inode = Some(file.metadata().await?.ino());
            self.position = file.seek(SeekFrom::End(0)).await?;
        }
        Ok(())
    }

    /// Read everything currently available; returns bytes read.
    async fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let mut total = 0;
        let mut newlines = 0u64;
        loop {
            let n = file.read(buf).await?;
            if n == 0 {
                break;
            }
            newlines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
            total += n;
            self.position += n as u64;
        }
        if newlines > 0 {
            self.state.record_lines_at(newlines, Utc::now());
        }
        Ok(total)
    }

    /// Detect truncation (rewind) and rotation (reopen by path).
    async fn check_rotation(&mut self) {
        let on_disk = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            // Log moved away and not yet recreated; keep the old handle.
            Err(_) => return,
        };

        if self.file.is_none() || self.inode != Some(on_disk.ino()) {
            tracing::info!(process = %self.name, "log rotated, reopening");
            self.reopen().await;
            return;
        }

        if on_disk.len() < self.position {
            tracing::info!(process = %self.name, "log truncated, rewinding");
            if let Some(file) = self.file.as_mut() {
                match file.seek(SeekFrom::Start(0)).await {
                    Ok(_) => self.position = 0,
                    Err(e) => {
                        tracing::warn!(process = %self.name, error = %e, "failed to rewind log")
                    }
                }
            }
        }
    }

    /// Open the path afresh. A new file is read from its start; the same
    /// file resumes at the last read position unless it shrank below it.
    async fn reopen(&mut self) {
        match File::open(&self.path).await {
            Ok(mut file) => {
                let metadata = file.metadata().await.ok();
                let inode = metadata.as_ref().map(|m| m.ino());
                let len = metadata.as_ref().map_or(0, |m| m.len());
                let same_file = inode.is_some() && inode == self.inode;
                let resume_at = if same_file && len >= self.position {
                    self.position
                } else {
                    0
                };
                self.position = match file.seek(SeekFrom::Start(resume_at)).await {
                    Ok(position) => position,
                    Err(e) => {
                        tracing::warn!(process = %self.name, error = %e, "failed to seek reopened log");
                        0
                    }
                };
                self.inode = inode;
                self.file = Some(file);
            }
            Err(e) => {
                tracing::debug!(process = %self.name, error = %e, "log not available yet");
                self.file = None;
                self.inode = None;
            }
        }
    }
}
