//! The core, UI-agnostic library for the `oemstick` unattended-install USB
//! builder.
//!
//! `oemstick-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `oemstick`) or a graphical
//! user interface. It handles device discovery and the safety gates around
//! it, capacity planning, the raw image write, provisioning of the
//! label-discovered `OEMDRV` configuration partition, and composition of the
//! kickstart manifest with its embedded disk-target policy.
//!
//! The library is structured into several key modules:
//! - [`device`]: The cross-platform `Device` struct.
//! - [`platform`]: Device discovery, the mounted/root-device safety gates,
//!   and kernel partition-table plumbing.
//! - [`capacity`]: The byte budget computed, and checked, before any write.
//! - [`mod@write`]: Streaming the installer image raw onto the device.
//! - [`partition`]: Carving and formatting the configuration partition out
//!   of the space left after the image.
//! - [`policy`]: The disk-target policy, authored here at build time and
//!   evaluated later inside the booted installer with no operator present.
//! - [`manifest`]: Pure assembly of the kickstart document.
//!
//! The build pipeline is strictly sequential: inspect, plan, write,
//! provision, compose. Each stage depends on the side effects of the one
//! before it, and any failure aborts the rest. Long-running stages report
//! progress via callbacks and honor a shared cancellation flag, so the
//! calling application can render progress however it chooses.
//!
//! ## Example: composing a manifest
//!
//! ```rust
//! use oemstick_core::manifest::{self, InstallOptions};
//! use oemstick_core::policy::{self, TargetMode};
//!
//! # fn main() -> oemstick_core::Result<()> {
//! let options = InstallOptions {
//!     hostname: "rack7".into(),
//!     username: "ops".into(),
//!     password_hash: "$6$...".into(),
//!     ..InstallOptions::default()
//! };
//!
//! let pre_script = policy::render_pre_script(&TargetMode::AutoSingle)?;
//! let kickstart = manifest::compose(&options, &pre_script);
//! assert!(kickstart.contains("%include /tmp/disk-target.ks"));
//! # Ok(())
//! # }
//! ```

pub mod capacity;
mod cmd;
pub mod device;
pub mod error;
pub mod manifest;
pub mod partition;
pub mod platform;
pub mod policy;
pub mod write;

pub use error::{Error, Result};
