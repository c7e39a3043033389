//! Provisions the OEMDRV configuration partition from the space left after
//! the image write.
//!
//! Free space is measured, never assumed: image sizes vary release to
//! release. The new partition's device node is found by diffing a before and
//! after listing of the device's partition nodes rather than by hard-coding
//! partition numbering, which differs between whole-disk (`sdb1`) and
//! NVMe-style (`nvme0n1p1`) naming schemes. An ambiguous diff is a hard
//! failure, never resolved by guessing.

use crate::capacity::CapacityBudget;
use crate::cmd;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Volume label of the configuration partition. The install engine discovers
/// the partition by this label, not by position; the string is a hard
/// external contract.
pub const VOLUME_LABEL: &str = "OEMDRV";

const MIB: u64 = 1024 * 1024;

/// The formatted configuration partition, ready to receive the manifest.
#[derive(Debug)]
pub struct PartitionHandle {
    /// Device node of the new partition (e.g. `/dev/sdb4`).
    pub node: PathBuf,
}

/// A free byte range on the device, as reported by the partitioning tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRegion {
    start: u64,
    end: u64,
}

impl FreeRegion {
    fn size(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }
}

/// Verifies all external tools the provisioning stage needs are present.
/// Called before anything destructive so a missing tool surfaces as a
/// precondition failure.
pub fn check_tools() -> Result<()> {
    for tool in ["parted", "mkfs.vfat", "udevadm", "mount", "umount"] {
        cmd::require(tool)?;
    }
    Ok(())
}

/// Parses `parted -ms <dev> unit B print free` machine output into the free
/// regions it reports.
///
/// Machine-readable lines are `;`-terminated and `:`-separated:
/// `1:9927000064B:15931539455B:6004539392B:free;`. The header line and
/// partition lines are skipped.
fn parse_free_regions(parted_output: &str) -> Vec<FreeRegion> {
    let mut regions = Vec::new();
    for line in parted_output.lines() {
        let line = line.trim().trim_end_matches(';');
        if line.is_empty() || line == "BYT" || line.starts_with('/') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 5 || fields[4] != "free" {
            continue;
        }
        let parse = |s: &str| s.trim_end_matches('B').parse::<u64>().ok();
        if let (Some(start), Some(end)) = (parse(fields[1]), parse(fields[2])) {
            regions.push(FreeRegion { start, end });
        }
    }
    regions
}

/// The single new node is the set difference (after − before). Zero or
/// several new nodes means something else touched the device between the
/// snapshots; fail rather than guess.
fn detect_new_node(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Result<String> {
    let new: Vec<&String> = after.difference(before).collect();
    match new.as_slice() {
        [node] => Ok((*node).clone()),
        other => Err(Error::PartitionNotDetected { found: other.len() }),
    }
}

/// Lists the partition device nodes currently visible under a disk.
fn partition_nodes(device_name: &str) -> Result<BTreeSet<String>> {
    let disk_dir = PathBuf::from("/sys/block").join(device_name);
    let mut nodes = BTreeSet::new();
    for entry in fs::read_dir(disk_dir)?.filter_map(std::result::Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        // Partitions are the subdirectories carrying a `partition` attribute.
        if entry.path().join("partition").exists() {
            nodes.insert(name);
        }
    }
    Ok(nodes)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Picks the largest reported free region and gates it against the reserved
/// minimum, returning the 1 MiB-aligned partition start and the usable size.
/// The partition created from this can never be smaller than `reserved_min`.
fn plan_region(regions: &[FreeRegion], reserved_min: u64) -> Result<(u64, u64)> {
    let region = regions
        .iter()
        .max_by_key(|r| r.size())
        .copied()
        .ok_or(Error::NoFreeSpace {
            available: 0,
            required: reserved_min,
        })?;

    let start = align_up(region.start, MIB);
    if start > region.end {
        return Err(Error::NoFreeSpace {
            available: 0,
            required: reserved_min,
        });
    }
    let available = region.end - start + 1;
    if available < reserved_min {
        return Err(Error::NoFreeSpace {
            available,
            required: reserved_min,
        });
    }
    Ok((start, available))
}

/// Creates and formats the configuration partition in the free space left
/// after the image.
///
/// Steps: measure free space (gate against the budget's reserved minimum),
/// snapshot partition nodes, create one partition spanning the free space,
/// re-read the partition table and settle, diff the snapshots for the new
/// node, and format it FAT32 with the fixed label.
pub fn provision(device: &Device, budget: &CapacityBudget) -> Result<PartitionHandle> {
    check_tools()?;
    let dev = device.path.to_string_lossy().into_owned();

    let parted_out = cmd::output("parted", &["-ms", &dev, "unit", "B", "print", "free"])?;
    let regions = parse_free_regions(&parted_out);
    let (start, available) = plan_region(&regions, budget.reserved_min)?;

    tracing::debug!(
        device = %dev,
        start,
        available,
        "creating configuration partition in trailing free space"
    );

    let before = partition_nodes(&device.name)?;

    let start_arg = format!("{start}B");
    cmd::run(
        "parted",
        &["-s", &dev, "mkpart", "primary", "fat32", &start_arg, "100%"],
    )
    .map_err(|e| Error::PartitionCreateFailed(e.to_string()))?;

    platform::reread_partition_table(&device.path)?;
    platform::udev_settle()?;

    let after = partition_nodes(&device.name)?;
    let new_node = detect_new_node(&before, &after)?;
    let node = PathBuf::from("/dev").join(&new_node);

    let node_str = node.to_string_lossy().into_owned();
    cmd::run("mkfs.vfat", &["-F", "32", "-n", VOLUME_LABEL, &node_str])
        .map_err(|e| Error::FormatFailed(e.to_string()))?;
    platform::udev_settle()?;

    Ok(PartitionHandle { node })
}

/// Unmounts the mount point on drop, so a failed manifest write still leaves
/// the partition unmounted.
struct MountGuard<'a> {
    mount_point: &'a Path,
    armed: bool,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mp = self.mount_point.to_string_lossy().into_owned();
            if let Err(err) = cmd::run("umount", &[&mp]) {
                tracing::warn!(mount_point = %mp, %err, "unmount failed");
            }
        }
    }
}

impl PartitionHandle {
    /// Mounts the partition on a temporary directory, writes the manifest as
    /// the single file at its root, syncs, and unmounts.
    pub fn write_manifest(&self, file_name: &str, contents: &str) -> Result<()> {
        let mount_dir = tempfile::tempdir()?;
        let node = self.node.to_string_lossy().into_owned();
        let mp = mount_dir.path().to_string_lossy().into_owned();

        cmd::run("mount", &[&node, &mp])?;
        let mut guard = MountGuard {
            mount_point: mount_dir.path(),
            armed: true,
        };

        let target = mount_dir.path().join(file_name);
        let write_result = (|| -> Result<()> {
            let mut file = fs::File::create(&target)?;
            use std::io::Write as _;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();

        // Unmount explicitly so a failure there is reported, not swallowed
        // by the guard.
        guard.armed = false;
        let umount_result = cmd::run("umount", &[&mp]);

        write_result?;
        umount_result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_free_regions_from_machine_output() {
        let out = indoc! {"
            BYT;
            /dev/sdb:15931539456B:scsi:512:512:msdos:Generic Flash Disk:;
            1:1048576B:9927000063B:9925951488B:::;
            1:9927000064B:15931539455B:6004539392B:free;
        "};
        let regions = parse_free_regions(out);
        assert_eq!(
            regions,
            vec![FreeRegion {
                start: 9_927_000_064,
                end: 15_931_539_455,
            }]
        );
        assert_eq!(regions[0].size(), 6_004_539_392);
    }

    #[test]
    fn ignores_output_without_free_regions() {
        let out = indoc! {"
            BYT;
            /dev/sdb:15931539456B:scsi:512:512:msdos::;
            1:1048576B:15931539455B:15930490880B:::;
        "};
        assert!(parse_free_regions(out).is_empty());
    }

    #[test]
    fn detects_the_single_new_node() {
        let before: BTreeSet<String> = ["sdb1".to_string()].into();
        let after: BTreeSet<String> = ["sdb1".to_string(), "sdb2".to_string()].into();
        assert_eq!(detect_new_node(&before, &after).unwrap(), "sdb2");
    }

    #[test]
    fn no_new_node_is_a_hard_failure() {
        let nodes: BTreeSet<String> = ["sdb1".to_string()].into();
        let err = detect_new_node(&nodes, &nodes.clone()).unwrap_err();
        assert!(matches!(err, Error::PartitionNotDetected { found: 0 }));
    }

    #[test]
    fn ambiguous_diff_is_never_resolved_by_guessing() {
        let before: BTreeSet<String> = ["nvme0n1p1".to_string()].into();
        let after: BTreeSet<String> = [
            "nvme0n1p1".to_string(),
            "nvme0n1p2".to_string(),
            "nvme0n1p3".to_string(),
        ]
        .into();
        let err = detect_new_node(&before, &after).unwrap_err();
        assert!(matches!(err, Error::PartitionNotDetected { found: 2 }));
    }

    #[test]
    fn region_gate_enforces_the_reserved_minimum() {
        let reserved = 128 * MIB;

        // Plenty of space: aligned start, full remainder usable.
        let big = vec![FreeRegion {
            start: 10 * MIB + 7,
            end: 10 * MIB + 7 + 2048 * MIB,
        }];
        let (start, available) = plan_region(&big, reserved).unwrap();
        assert_eq!(start % MIB, 0);
        assert!(available >= reserved);

        // Too small after alignment: hard failure, nothing created.
        let small = vec![FreeRegion {
            start: 1,
            end: 64 * MIB,
        }];
        let err = plan_region(&small, reserved).unwrap_err();
        assert!(matches!(err, Error::NoFreeSpace { .. }));

        // No free region at all.
        assert!(matches!(
            plan_region(&[], reserved),
            Err(Error::NoFreeSpace {
                available: 0,
                required,
            }) if required == reserved
        ));
    }

    #[test]
    fn largest_region_wins() {
        let regions = vec![
            FreeRegion {
                start: 0,
                end: 4 * MIB - 1,
            },
            FreeRegion {
                start: 100 * MIB,
                end: 1100 * MIB - 1,
            },
        ];
        let (start, available) = plan_region(&regions, 128 * MIB).unwrap();
        assert_eq!(start, 100 * MIB);
        assert_eq!(available, 1000 * MIB);
    }

    #[test]
    fn alignment_rounds_up_to_mib() {
        assert_eq!(align_up(0, MIB), 0);
        assert_eq!(align_up(1, MIB), MIB);
        assert_eq!(align_up(MIB, MIB), MIB);
        assert_eq!(align_up(MIB + 1, MIB), 2 * MIB);
    }
}
