//! Capacity planning for the removable device.
//!
//! The plan is computed, and must succeed, before any byte is written: the
//! device has to hold the raw image plus a reserved minimum of trailing free
//! space for the configuration partition.

use crate::error::{Error, Result};

/// Default headroom reserved for the configuration partition: 128 MiB.
pub const RESERVED_MIN_BYTES: u64 = 128 * 1024 * 1024;

/// The byte budget for one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityBudget {
    /// Size of the (decompressed) installer image.
    pub image_size: u64,
    /// Smallest acceptable size for the configuration partition.
    pub reserved_min: u64,
    /// `image_size + reserved_min`.
    pub required_total: u64,
}

/// Checks that a device of `device_size` bytes can hold `image_size` bytes of
/// image plus `reserved_min` bytes of headroom.
///
/// Pure function with no side effects; callers must not touch the device
/// before this succeeds.
pub fn plan(device_size: u64, image_size: u64, reserved_min: u64) -> Result<CapacityBudget> {
    let required_total =
        image_size
            .checked_add(reserved_min)
            .ok_or(Error::InsufficientCapacity {
                required: u64::MAX,
                available: device_size,
            })?;

    if required_total > device_size {
        return Err(Error::InsufficientCapacity {
            required: required_total,
            available: device_size,
        });
    }

    Ok(CapacityBudget {
        image_size,
        reserved_min,
        required_total,
    })
}
