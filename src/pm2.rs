/// Managed-process directory backed by the pm2 CLI.
///
/// Discovery and restart never propagate failures: an unreachable pm2 or a
/// malformed `jlist` degrades to an empty process set, and a failed restart is
/// logged and left for the next monitoring cycle.
use crate::process::ManagedProcess;
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum Pm2Error {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("malformed pm2 output: {0}")]
    Malformed(String),
}

/// Contract with the external process manager.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Discover every managed process. Never fails; errors yield an empty list.
    async fn list(&self) -> Vec<ManagedProcess>;

    /// Ask the process manager to restart `name`. Never fails; errors are logged.
    async fn restart(&self, name: &str);

    /// Current status string of `name`, if the process manager knows it.
    async fn status_of(&self, name: &str) -> Option<String> {
        self.list()
            .await
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.status)
    }
}

/// Runs the `pm2` binary.
#[derive(Debug, Clone)]
pub struct Pm2Cli {
    command: String,
}

impl Pm2Cli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, Pm2Error> {
        let cmdline = format!("{} {}", self.command, args.join(" "));
        tracing::debug!(command = %cmdline, "running pm2");

        let output = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Pm2Error::Spawn {
                command: cmdline.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(Pm2Error::Failed {
                command: cmdline,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn try_list(&self) -> Result<Vec<ManagedProcess>, Pm2Error> {
        let stdout = self.run(&["jlist"]).await?;
        parse_jlist(&stdout)
    }
}

#[async_trait]
impl ProcessManager for Pm2Cli {
    async fn list(&self) -> Vec<ManagedProcess> {
        match self.try_list().await {
            Ok(processes) => processes,
            Err(e) => {
                tracing::error!(error = %e, "failed to list pm2 processes");
                Vec::new()
            }
        }
    }

    async fn restart(&self, name: &str) {
        match self.run(&["restart", name]).await {
            Ok(_) => tracing::info!(process = name, "pm2 restart issued"),
            Err(e) => tracing::error!(process = name, error = %e, "pm2 restart failed"),
        }
    }
}

/// Parse `pm2 jlist` output. Records missing required fields are skipped.
pub fn parse_jlist(stdout: &str) -> Result<Vec<ManagedProcess>, Pm2Error> {
    let records = find_payload(stdout)?;
    let processes = records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| match ManagedProcess::from_pm2_record(record) {
            Ok(process) => Some(process),
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping malformed pm2 process record");
                None
            }
        })
        .collect();
    Ok(processes)
}

/// Locate the JSON array of process records.
///
/// pm2 may print warnings or `[PM2] ...` daemon banners before the payload,
/// so every `[` is tried until one starts an array of objects.
fn find_payload(stdout: &str) -> Result<Vec<Value>, Pm2Error> {
    let mut last_error = "no JSON array in output".to_string();
    for (start, _) in stdout.match_indices('[') {
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Array(records))) if records.iter().all(Value::is_object) => {
                return Ok(records)
            }
            Some(Ok(_)) => last_error = "expected a JSON array of objects".to_string(),
            Some(Err(e)) => last_error = e.to_string(),
            None => {}
        }
    }
    Err(Pm2Error::Malformed(last_error))
}

/// Restrict `processes` to `names`. An empty allow-list keeps everything.
pub fn filter_processes(processes: Vec<ManagedProcess>, names: &[String]) -> Vec<ManagedProcess> {
    if names.is_empty() {
        return processes;
    }
    for name in names {
        if !processes.iter().any(|p| &p.name == name) {
            tracing::warn!(process = %name, "requested process not found in pm2");
        }
    }
    processes
        .into_iter()
        .filter(|p| names.contains(&p.name))
        .collect()
}
