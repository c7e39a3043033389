use crate::cmd;
use crate::device::{Device, Transport};
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::ioctl_none;

// BLKRRPART: ask the kernel to re-read the partition table.
ioctl_none!(blkrrpart, 0x12, 95);

/// Helper to read a specific attribute from the /sys/class/block filesystem.
fn read_sys_attr(device_name: &str, attr: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/class/block")
        .join(device_name)
        .join(attr);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Strips a trailing partition-number suffix (e.g. "sda1" -> "sda",
/// "nvme0n1p2" -> "nvme0n1"). Whole-disk names pass through unchanged.
fn parent_disk_name(name: &str) -> String {
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        if let Some(idx) = name.rfind('p') {
            let suffix = &name[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                return name[..idx].to_string();
            }
        }
        name.to_string()
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
            .to_string()
    }
}

/// Classifies a device's bus by resolving its sysfs path. USB devices have a
/// `/usb` hop in their device chain; virtual devices live under `/virtual/`.
fn transport_of(device_name: &str) -> Transport {
    let link = PathBuf::from("/sys/block").join(device_name);
    match fs::canonicalize(&link) {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy();
            if resolved.contains("/usb") {
                Transport::Usb
            } else if resolved.contains("/virtual/") {
                Transport::Other
            } else {
                Transport::Internal
            }
        }
        Err(_) => Transport::Other,
    }
}

/// Loop, ram and optical devices are never candidates for anything.
fn is_pseudo_device(name: &str) -> bool {
    ["loop", "ram", "zram", "sr", "dm-", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Finds the mount point of the device or any of its partitions.
fn mount_point_for(disks: &sysinfo::Disks, device_name: &str) -> Option<String> {
    for disk in disks.iter() {
        let dev = disk.name().to_string_lossy();
        let dev = dev.strip_prefix("/dev/").unwrap_or(&dev);
        if dev.starts_with(device_name) {
            let mp = disk.mount_point().to_string_lossy();
            if !mp.is_empty() {
                return Some(mp.into_owned());
            }
        }
    }
    None
}

/// Resolves the whole-disk device backing the running system's root
/// filesystem (e.g. `/dev/nvme0n1` when `/` lives on `/dev/nvme0n1p2`).
fn root_backing_device(disks: &sysinfo::Disks) -> Result<PathBuf> {
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let name = disk.name().to_string_lossy();
            let name = name.strip_prefix("/dev/").unwrap_or(&name);
            return Ok(PathBuf::from("/dev").join(parent_disk_name(name)));
        }
    }
    Err(Error::Io(io::Error::other(
        "could not determine the system drive",
    )))
}

/// Effective-uid precondition check. Called once at the entry of the
/// pipeline; raw device writes and partitioning need root.
pub fn require_root() -> Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(Error::NotRoot)
    }
}

fn device_from_name(device_name: &str, disks: &sysinfo::Disks) -> Option<Device> {
    let size_sectors = read_sys_attr(device_name, "size")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    // A size of zero usually means an empty card reader.
    if size_sectors == 0 {
        return None;
    }

    let removable = read_sys_attr(device_name, "removable")
        .map(|s| s == "1")
        .unwrap_or(false);

    Some(Device {
        path: PathBuf::from("/dev").join(device_name),
        name: device_name.to_string(),
        size_bytes: size_sectors * 512,
        transport: transport_of(device_name),
        removable,
        mount_point: mount_point_for(disks, device_name),
    })
}

/// Enumerates all candidate block devices, excluding loop/ram pseudo-devices,
/// optical drives and empty readers. Reports size, bus, removability and
/// mount state for each.
pub fn list() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")?.filter_map(std::result::Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        if is_pseudo_device(&device_name) {
            continue;
        }
        if let Some(device) = device_from_name(&device_name, &disks) {
            devices.push(device);
        }
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Scans for removable devices suitable as install media, excluding the
/// system drive.
pub fn removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk = root_backing_device(&disks)?;

    let devices = list()?
        .into_iter()
        .filter(|d| d.removable && d.path != system_disk)
        .collect();
    Ok(devices)
}

/// Looks up a single device by path.
///
/// Fails with [`Error::NotBlockDevice`] if the path does not exist or names
/// something other than a block device.
pub fn inspect(path: &Path) -> Result<Device> {
    let meta =
        fs::metadata(path).map_err(|_| Error::NotBlockDevice(path.to_path_buf()))?;
    if !meta.file_type().is_block_device() {
        return Err(Error::NotBlockDevice(path.to_path_buf()));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::NotBlockDevice(path.to_path_buf()))?;

    // Whole disks only: partitions have no /sys/block entry of their own.
    if !PathBuf::from("/sys/block").join(&name).exists() {
        return Err(Error::NotBlockDevice(path.to_path_buf()));
    }

    let disks = sysinfo::Disks::new_with_refreshed_list();
    device_from_name(&name, &disks).ok_or_else(|| Error::NotBlockDevice(path.to_path_buf()))
}

/// The guard's decision, separated from the live system queries so the
/// refusal paths can be checked against synthetic state.
fn check_target(device: &Device, system_disk: &Path, mount_point: Option<String>) -> Result<()> {
    if device.path == system_disk {
        return Err(Error::RootDeviceConflict(device.path.clone()));
    }

    if let Some(mount_point) = mount_point {
        return Err(Error::DeviceBusy {
            path: device.path.clone(),
            mount_point,
        });
    }

    Ok(())
}

/// Hard safety gate, checked before anything destructive.
///
/// Refuses the device backing `/` ([`Error::RootDeviceConflict`]) and any
/// device with a mounted filesystem ([`Error::DeviceBusy`]). The root check
/// is never bypassable.
pub fn ensure_safe_target(device: &Device) -> Result<()> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk = root_backing_device(&disks)?;
    check_target(device, &system_disk, mount_point_for(&disks, &device.name))
}

/// Forces the kernel to re-read the device's partition table.
///
/// The ioctl sometimes fails transiently right after a large write, so it is
/// retried before giving up.
pub fn reread_partition_table(device_path: &Path) -> Result<()> {
    let file = fs::File::open(device_path)?;
    let fd = file.as_raw_fd();

    let max_tries = 20;
    for attempt in 0..max_tries {
        match unsafe { blkrrpart(fd) } {
            Ok(_) => return Ok(()),
            Err(errno) if attempt + 1 == max_tries => {
                return Err(Error::Io(io::Error::from_raw_os_error(errno as i32)));
            }
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    Ok(())
}

/// Blocks until udev has processed pending device events.
///
/// There is a window after a partition-table re-read where udev has not yet
/// seen the kernel's updates and `settle` would return immediately, so sleep
/// briefly first.
pub fn udev_settle() -> Result<()> {
    std::thread::sleep(Duration::from_millis(200));
    cmd::run("udevadm", &["settle"])
}
