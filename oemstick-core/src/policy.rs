//! The disk-target policy: authored at build time, evaluated at install time.
//!
//! The policy is a genuinely two-phase, two-machine construct. At build time
//! it is nothing but data: a [`TargetMode`] plus an optional device name. That
//! data is serialized into the head of a self-contained `%pre` script whose
//! fixed body re-enumerates the *target* machine's disks at install time and
//! resolves the mode against them, with no operator present and no state
//! shared with the build. [`resolve`] is the same decision procedure expressed
//! in Rust, used for dry runs and for testing the selection semantics.

use crate::error::{Error, Result};

/// Path of the file the `%pre` script writes and the manifest `%include`s.
pub const DISK_TARGET_INCLUDE: &str = "/tmp/disk-target.ks";

/// How install-time disk selection is resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetMode {
    /// Require exactly one eligible internal disk; abort on any ambiguity.
    AutoSingle,
    /// Erase every eligible internal disk; abort if there are none.
    AllInternal,
    /// Erase exactly the named disk, eligibility scan ignored.
    Manual(String),
}

/// A disk as seen by the install-time environment.
///
/// Computed fresh on every evaluation, never persisted. A candidate is
/// eligible iff it is not removable, not on a USB bus, and not a loop/ram
/// pseudo-device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCandidate {
    pub name: String,
    pub eligible: bool,
}

impl DiskCandidate {
    pub fn new(name: impl Into<String>, eligible: bool) -> Self {
        Self {
            name: name.into(),
            eligible,
        }
    }
}

/// Resolves `mode` against `candidates` into the list of disks the installer
/// may erase. The returned list is never empty.
///
/// Order is stable: disks come out in the order they were scanned in.
pub fn resolve(mode: &TargetMode, candidates: &[DiskCandidate]) -> Result<Vec<String>> {
    let eligible: Vec<&str> = candidates
        .iter()
        .filter(|c| c.eligible)
        .map(|c| c.name.as_str())
        .collect();

    match mode {
        TargetMode::AutoSingle => {
            if eligible.len() == 1 {
                Ok(vec![eligible[0].to_string()])
            } else if eligible.is_empty() {
                Err(Error::NoEligibleDisk)
            } else {
                Err(Error::AmbiguousTarget(
                    eligible.iter().map(|s| s.to_string()).collect(),
                ))
            }
        }
        TargetMode::AllInternal => {
            if eligible.is_empty() {
                return Err(Error::NoEligibleDisk);
            }
            Ok(eligible.iter().map(|s| s.to_string()).collect())
        }
        TargetMode::Manual(name) => {
            if name.is_empty() {
                return Err(Error::MissingTargetName);
            }
            Ok(vec![name.clone()])
        }
    }
}

// The interpreter body is fixed; only the two data lines at the top vary.
// Failures go to tty3 and the console rather than the installer transcript,
// because on a headless run nobody is watching the transcript.
const PRE_SCRIPT_TEMPLATE: &str = r#"%pre --interpreter=/bin/bash --erroronfail
# Disk-target policy. Decides which disks the installer may erase,
# using only live hardware state on this machine.
MODE="@MODE@"
TARGET="@TARGET@"

fail() {
    echo "disk-target: $1" > /dev/tty3 2>/dev/null || true
    echo "disk-target: $1" > /dev/console 2>/dev/null || true
    exit 1
}

eligible=()
for sys in /sys/block/*; do
    name="$(basename "$sys")"
    case "$name" in
        loop*|ram*|zram*|sr*|dm-*|md*) continue ;;
    esac
    [ "$(cat "$sys/removable" 2>/dev/null)" = "1" ] && continue
    case "$(readlink -f "$sys")" in
        */usb*) continue ;;
    esac
    eligible+=("$name")
done

case "$MODE" in
    auto-single)
        if [ "${#eligible[@]}" -ne 1 ]; then
            fail "need exactly one internal disk, found ${#eligible[@]}: ${eligible[*]}"
        fi
        disks="${eligible[0]}"
        ;;
    all-internal)
        if [ "${#eligible[@]}" -eq 0 ]; then
            fail "no eligible internal disks found"
        fi
        disks="$(IFS=,; echo "${eligible[*]}")"
        ;;
    manual)
        disks="$TARGET"
        ;;
    *)
        fail "unknown target mode: $MODE"
        ;;
esac

cat > @INCLUDE@ <<EOF
ignoredisk --only-use=$disks
clearpart --all --initlabel --drives=$disks
autopart
EOF
%end"#;

/// Serializes `mode` into the embedded `%pre` script.
///
/// Fails only at authoring time, and only when manual mode was chosen with an
/// empty device name; every other failure path lives inside the script, on the
/// target machine.
pub fn render_pre_script(mode: &TargetMode) -> Result<String> {
    let (token, target) = match mode {
        TargetMode::AutoSingle => ("auto-single", ""),
        TargetMode::AllInternal => ("all-internal", ""),
        TargetMode::Manual(name) => {
            if name.is_empty() {
                return Err(Error::MissingTargetName);
            }
            ("manual", name.as_str())
        }
    };

    Ok(PRE_SCRIPT_TEMPLATE
        .replace("@MODE@", token)
        .replace("@TARGET@", target)
        .replace("@INCLUDE@", DISK_TARGET_INCLUDE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internal(name: &str) -> DiskCandidate {
        DiskCandidate::new(name, true)
    }

    fn usb(name: &str) -> DiskCandidate {
        DiskCandidate::new(name, false)
    }

    #[test]
    fn auto_single_with_one_candidate_selects_it() {
        let got = resolve(&TargetMode::AutoSingle, &[usb("sdb"), internal("sda")]).unwrap();
        assert_eq!(got, vec!["sda".to_string()]);
    }

    #[test]
    fn auto_single_with_no_candidates_aborts() {
        let err = resolve(&TargetMode::AutoSingle, &[usb("sdb")]).unwrap_err();
        assert!(matches!(err, Error::NoEligibleDisk));
    }

    #[test]
    fn auto_single_with_two_candidates_aborts_naming_both() {
        let err =
            resolve(&TargetMode::AutoSingle, &[internal("sda"), internal("nvme0n1")]).unwrap_err();
        match err {
            Error::AmbiguousTarget(names) => {
                assert_eq!(names, vec!["sda".to_string(), "nvme0n1".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn all_internal_selects_every_candidate_in_scan_order() {
        let got = resolve(
            &TargetMode::AllInternal,
            &[internal("sda"), usb("sdc"), internal("nvme0n1")],
        )
        .unwrap();
        assert_eq!(got, vec!["sda".to_string(), "nvme0n1".to_string()]);
    }

    #[test]
    fn all_internal_with_no_candidates_aborts() {
        let err = resolve(&TargetMode::AllInternal, &[]).unwrap_err();
        assert!(matches!(err, Error::NoEligibleDisk));
    }

    #[test]
    fn manual_ignores_the_eligibility_scan() {
        let got = resolve(&TargetMode::Manual("sdb".into()), &[internal("sda")]).unwrap();
        assert_eq!(got, vec!["sdb".to_string()]);
    }

    #[test]
    fn manual_without_a_name_fails_at_authoring_time() {
        assert!(matches!(
            resolve(&TargetMode::Manual(String::new()), &[]),
            Err(Error::MissingTargetName)
        ));
        assert!(matches!(
            render_pre_script(&TargetMode::Manual(String::new())),
            Err(Error::MissingTargetName)
        ));
    }

    #[test]
    fn script_serializes_mode_and_target_as_data() {
        let script = render_pre_script(&TargetMode::Manual("sdb".into())).unwrap();
        assert!(script.contains("MODE=\"manual\""));
        assert!(script.contains("TARGET=\"sdb\""));
        assert!(script.starts_with("%pre --interpreter=/bin/bash --erroronfail"));
        assert!(script.ends_with("%end"));
        assert!(script.contains(DISK_TARGET_INCLUDE));

        let auto = render_pre_script(&TargetMode::AutoSingle).unwrap();
        assert!(auto.contains("MODE=\"auto-single\""));
        assert!(auto.contains("TARGET=\"\""));
    }

    #[test]
    fn script_skips_the_same_pseudo_devices_as_the_build_side_scan() {
        // An installer that auto-assembles RAID leaves md/dm nodes in
        // /sys/block; they are neither removable nor USB, so only the skip
        // list keeps them out of the candidate set.
        let script = render_pre_script(&TargetMode::AutoSingle).unwrap();
        assert!(script.contains("loop*|ram*|zram*|sr*|dm-*|md*) continue"));
    }

    #[test]
    fn script_diagnoses_on_the_alternate_console() {
        let script = render_pre_script(&TargetMode::AutoSingle).unwrap();
        assert!(script.contains("/dev/tty3"));
        assert!(script.contains("/dev/console"));
    }
}
