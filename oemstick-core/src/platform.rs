//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system:
//! discovering block devices, classifying their bus, resolving the device
//! backing the root filesystem, and forcing the kernel to re-read a partition
//! table. The tool provisions install media for Linux installers and drives
//! Linux-only partitioning tools, so only a Linux implementation exists.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
