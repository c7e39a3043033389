//! Error types for the oemstick core library.
//!
//! Every failure that can gate a destructive step has its own variant and a
//! stable process exit code, so that scripted callers can distinguish "the
//! device was too small" from "the partition never appeared" without parsing
//! message text.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Raw device access and partitioning require an effective uid of 0.
    #[error("this operation requires root privileges")]
    NotRoot,

    /// A required external tool is not present in `PATH`.
    #[error("required tool `{0}` not found in PATH")]
    MissingTool(&'static str),

    /// The given path does not name a block device.
    #[error("`{0}` is not a block device")]
    NotBlockDevice(PathBuf),

    /// The device (or one of its partitions) is currently mounted.
    #[error("`{path}` is mounted at {mount_point}; unmount it first")]
    DeviceBusy { path: PathBuf, mount_point: String },

    /// The device backs the running system's root filesystem. Never bypassable.
    #[error("refusing `{0}`: it backs the running system's root filesystem")]
    RootDeviceConflict(PathBuf),

    /// The device cannot hold the image plus the reserved headroom.
    #[error("device too small: {required} bytes required, {available} available")]
    InsufficientCapacity { required: u64, available: u64 },

    /// The raw image write (or its verification pass) failed.
    #[error("image write failed: {0}")]
    WriteFailed(String),

    /// Not enough free space left on the device after the image.
    #[error("no usable free space after the image: {available} bytes free, {required} required")]
    NoFreeSpace { available: u64, required: u64 },

    /// The partitioning tool refused to create the configuration partition.
    #[error("creating the configuration partition failed: {0}")]
    PartitionCreateFailed(String),

    /// The before/after partition listing did not differ by exactly one node.
    #[error("expected exactly one new partition node, found {found}")]
    PartitionNotDetected { found: usize },

    /// Formatting the new partition failed.
    #[error("formatting the configuration partition failed: {0}")]
    FormatFailed(String),

    /// Manual target mode was chosen without a device name.
    #[error("manual target mode selected but no device name was given")]
    MissingTargetName,

    /// Automatic single-disk selection found zero or several eligible disks.
    #[error("cannot pick a target disk automatically: {} eligible candidates [{}]", .0.len(), .0.join(", "))]
    AmbiguousTarget(Vec<String>),

    /// No disk on the machine passed the eligibility scan.
    #[error("no eligible internal disks found")]
    NoEligibleDisk,

    /// The operation was cancelled via the shared cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    /// An external tool ran but reported failure.
    #[error("`{tool}` failed: {message}")]
    Tool { tool: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable, documented exit code for each failure class.
    ///
    /// Precondition failures are 10-19, capacity 20-29, write/provisioning
    /// 30-39, policy 40-49, tool plumbing 50. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotRoot => 10,
            Error::MissingTool(_) => 11,
            Error::NotBlockDevice(_) => 12,
            Error::DeviceBusy { .. } => 13,
            Error::RootDeviceConflict(_) => 14,
            Error::InsufficientCapacity { .. } => 20,
            Error::WriteFailed(_) => 30,
            Error::NoFreeSpace { .. } => 31,
            Error::PartitionCreateFailed(_) => 32,
            Error::PartitionNotDetected { .. } => 33,
            Error::FormatFailed(_) => 34,
            Error::MissingTargetName => 40,
            Error::AmbiguousTarget(_) => 41,
            Error::NoEligibleDisk => 42,
            Error::Cancelled => 2,
            Error::Tool { .. } => 50,
            Error::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let errs = [
            Error::NotRoot,
            Error::MissingTool("parted"),
            Error::InsufficientCapacity {
                required: 2,
                available: 1,
            },
            Error::PartitionNotDetected { found: 0 },
            Error::AmbiguousTarget(vec!["sda".into(), "sdb".into()]),
            Error::NoEligibleDisk,
        ];
        let mut codes: Vec<i32> = errs.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn ambiguous_target_names_all_candidates() {
        let err = Error::AmbiguousTarget(vec!["sda".into(), "nvme0n1".into()]);
        let msg = err.to_string();
        assert!(msg.contains("sda"));
        assert!(msg.contains("nvme0n1"));
        assert!(msg.contains("2 eligible"));
    }
}
