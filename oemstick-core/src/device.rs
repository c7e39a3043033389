use std::fmt;
use std::path::PathBuf;

/// Bus class of a block device, derived from its sysfs device path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Attached over USB. Never a valid install target at install time.
    Usb,
    /// A fixed internal bus (SATA, NVMe, virtio, ...).
    Internal,
    /// Anything the classifier could not place (virtual devices and the like).
    Other,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Usb => "usb",
            Transport::Internal => "internal",
            Transport::Other => "other",
        };
        f.write_str(s)
    }
}

/// A block device discovered on the build machine.
///
/// Populated by the discovery functions in [`crate::platform`]. A `Device`
/// selected for writing must not be mounted and must not back the running
/// system's root filesystem; [`crate::platform::ensure_safe_target`] enforces
/// both before anything destructive happens.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb").
    pub name: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Bus class.
    pub transport: Transport,
    /// The sysfs removable flag.
    pub removable: bool,
    /// Mount point of the device or one of its partitions, if any.
    pub mount_point: Option<String>,
}

impl Device {
    /// Size in gigabytes, for display.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match &self.mount_point {
            Some(mp) => format!("[Mounted at {mp}]"),
            None => "[Not mounted]".to_string(),
        };

        write!(
            f,
            "{:<15} {:.1} GB ({}) {}",
            self.path.display(),
            self.size_gb(),
            self.transport,
            mount_info
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_mount_state() {
        let dev = Device {
            path: PathBuf::from("/dev/sdb"),
            name: "sdb".into(),
            size_bytes: 16 * 1024 * 1024 * 1024,
            transport: Transport::Usb,
            removable: true,
            mount_point: Some("/run/media/usb".into()),
        };
        let s = dev.to_string();
        assert!(s.contains("/dev/sdb"));
        assert!(s.contains("usb"));
        assert!(s.contains("Mounted at /run/media/usb"));
        assert!(dev.is_mounted());
    }
}
