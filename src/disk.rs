/// One-shot disk usage probe.
///
/// Emits a warning string for every physical partition that is larger than
/// the size floor and fuller than the configured percentage.
use nix::sys::statvfs::statvfs;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A mounted partition as listed in the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

/// Byte counts for one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl Usage {
    /// Used share of the space available to unprivileged users, as `df` reports it.
    pub fn percent(&self) -> f64 {
        let denominator = self.used + self.free;
        if denominator == 0 {
            return 0.0;
        }
        let percent = self.used as f64 / denominator as f64 * 100.0;
        (percent * 10.0).round() / 10.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("statvfs failed for {}: {source}", path.display())]
    Stat { path: PathBuf, source: nix::Error },
}

/// Check every physical partition and return one warning per full partition.
///
/// Failures to stat an individual partition are logged and skipped.
pub fn check_disk_space(limit_percent: u8, min_partition_gb: f64) -> Vec<String> {
    let partitions = match physical_partitions() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate partitions");
            return Vec::new();
        }
    };

    let mut warnings = Vec::new();
    for partition in &partitions {
        match usage(&partition.mountpoint) {
            Ok(u) => {
                if let Some(msg) = evaluate(partition, &u, limit_percent, min_partition_gb) {
                    warnings.push(msg);
                }
            }
            Err(e) => tracing::warn!(
                device = %partition.device,
                fstype = %partition.fstype,
                error = %e,
                "skipping partition"
            ),
        }
    }
    warnings
}

/// Warning for a single partition, or None if it is small or has room.
pub fn evaluate(
    partition: &Partition,
    usage: &Usage,
    limit_percent: u8,
    min_partition_gb: f64,
) -> Option<String> {
    let total = usage.total as f64 / GIB;
    if total <= min_partition_gb {
        return None;
    }
    let percent = usage.percent();
    if percent <= f64::from(limit_percent) {
        return None;
    }
    Some(format!(
        "Partition: {}, Total: {:.2} GB, Used: {:.2} GB, Free: {:.2} GB, Percentage used: {:.1}%",
        partition.device,
        total,
        usage.used as f64 / GIB,
        usage.free as f64 / GIB,
        percent
    ))
}

fn usage(mountpoint: &Path) -> Result<Usage, DiskError> {
    let stat = statvfs(mountpoint).map_err(|e| DiskError::Stat {
        path: mountpoint.to_path_buf(),
        source: e,
    })?;
    let frsize = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;
    let bfree = stat.blocks_free() as u64;
    let bavail = stat.blocks_available() as u64;
    Ok(Usage {
        total: blocks * frsize,
        used: blocks.saturating_sub(bfree) * frsize,
        free: bavail * frsize,
    })
}

fn read(path: &str) -> Result<String, DiskError> {
    std::fs::read_to_string(path).map_err(|e| DiskError::Read {
        path: PathBuf::from(path),
        source: e,
    })
}

fn physical_partitions() -> Result<Vec<Partition>, DiskError> {
    let filesystems = read("/proc/filesystems")?;
    let mounts = read("/proc/self/mounts")?;
    Ok(parse_mounts(&mounts, &physical_fstypes(&filesystems)))
}

/// Filesystem types not flagged `nodev` in /proc/filesystems.
fn physical_fstypes(filesystems: &str) -> HashSet<String> {
    filesystems
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(|line| line.trim().to_string())
        .filter(|fstype| !fstype.is_empty())
        .collect()
}

fn parse_mounts(mounts: &str, physical: &HashSet<String>) -> Vec<Partition> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            if !physical.contains(fstype) {
                return None;
            }
            Some(Partition {
                device: device.to_string(),
                mountpoint: PathBuf::from(unescape_mount(mountpoint)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// The mount table escapes spaces and tabs as octal (`\040`).
fn unescape_mount(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
