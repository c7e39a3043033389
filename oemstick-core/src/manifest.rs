//! Kickstart manifest assembly.
//!
//! Pure string composition: the composer takes an immutable options struct
//! and the rendered disk-target `%pre` script and returns one self-consistent
//! kickstart document. It never touches the filesystem; writing the result
//! onto the formatted partition is the caller's job.

use std::fmt::Write as _;

use crate::policy;

/// Name of the manifest file at the root of the configuration partition.
/// The install engine looks for exactly this file on the label-discovered
/// partition, so the name is a hard contract.
pub const MANIFEST_FILE_NAME: &str = "ks.cfg";

/// Network addressing chosen by the administrator at build time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkConfig {
    Dhcp,
    Static {
        address: String,
        netmask: String,
        gateway: String,
        nameserver: String,
    },
}

impl NetworkConfig {
    fn directive(&self, hostname: &str) -> String {
        match self {
            NetworkConfig::Dhcp => format!(
                "network --bootproto=dhcp --device=link --activate --onboot=on --hostname={hostname}"
            ),
            NetworkConfig::Static {
                address,
                netmask,
                gateway,
                nameserver,
            } => format!(
                "network --bootproto=static --ip={address} --netmask={netmask} \
                 --gateway={gateway} --nameserver={nameserver} --device=link \
                 --activate --onboot=on --hostname={hostname}"
            ),
        }
    }
}

/// Everything the composer needs, collected once and passed by value.
///
/// `password_hash` is an irreversible salted crypt hash (`$6$...`); the
/// plaintext never enters this crate.
#[derive(Clone, Debug)]
pub struct InstallOptions {
    pub lang: String,
    pub keyboard: String,
    pub timezone: String,
    pub hostname: String,
    pub network: NetworkConfig,
    pub username: String,
    pub password_hash: String,
    /// Services enabled at first boot.
    pub services: Vec<String>,
    /// Kernel modules to deny-list post-install. Empty means no `%post` block.
    pub module_denylist: Vec<String>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            lang: "en_US.UTF-8".into(),
            keyboard: "us".into(),
            timezone: "Etc/UTC".into(),
            hostname: "unattended".into(),
            network: NetworkConfig::Dhcp,
            username: "admin".into(),
            password_hash: String::new(),
            services: vec!["sshd".into()],
            module_denylist: Vec::new(),
        }
    }
}

/// Assembles the full manifest: fixed directives, the network descriptor, the
/// credential block, exactly one disk-selection `%include`, the policy's
/// `%pre` script verbatim, and a conditional deny-list `%post`.
pub fn compose(options: &InstallOptions, pre_script: &str) -> String {
    let mut out = String::new();

    out.push_str("# Generated by oemstick. Consumed unattended; edit with care.\n");
    out.push_str("text\n");
    out.push_str("skipx\n");
    let _ = writeln!(out, "lang {}", options.lang);
    let _ = writeln!(out, "keyboard {}", options.keyboard);
    let _ = writeln!(out, "timezone {} --utc", options.timezone);
    out.push_str(&options.network.directive(&options.hostname));
    out.push('\n');
    out.push_str("rootpw --lock\n");
    let _ = writeln!(
        out,
        "user --name={} --password={} --iscrypted --groups=wheel",
        options.username, options.password_hash
    );
    out.push_str("firstboot --disable\n");
    out.push_str("selinux --enforcing\n");
    out.push_str("firewall --enabled --service=ssh\n");
    if !options.services.is_empty() {
        let _ = writeln!(out, "services --enabled={}", options.services.join(","));
    }
    let _ = writeln!(out, "%include {}", policy::DISK_TARGET_INCLUDE);
    out.push_str("reboot\n");

    out.push('\n');
    out.push_str(pre_script);
    out.push('\n');

    if !options.module_denylist.is_empty() {
        out.push('\n');
        out.push_str("%post\n");
        out.push_str("cat > /etc/modprobe.d/oemstick-deny.conf <<'EOF'\n");
        for module in &options.module_denylist {
            let _ = writeln!(out, "blacklist {module}");
        }
        out.push_str("EOF\n");
        out.push_str("%end\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{render_pre_script, TargetMode};
    use indoc::indoc;

    fn options() -> InstallOptions {
        InstallOptions {
            hostname: "rack7".into(),
            username: "ops".into(),
            password_hash: "$6$saltsalt$hashhashhash".into(),
            ..InstallOptions::default()
        }
    }

    #[test]
    fn dhcp_manifest_has_expected_directives() {
        let pre = render_pre_script(&TargetMode::AutoSingle).unwrap();
        let ks = compose(&options(), &pre);

        assert!(ks.contains("lang en_US.UTF-8\n"));
        assert!(ks.contains(
            "network --bootproto=dhcp --device=link --activate --onboot=on --hostname=rack7\n"
        ));
        assert!(ks.contains("user --name=ops --password=$6$saltsalt$hashhashhash --iscrypted"));
        assert!(ks.contains("services --enabled=sshd\n"));
        assert!(ks.contains("%include /tmp/disk-target.ks\n"));
        // No plaintext password anywhere, and the hash only in the user line.
        assert_eq!(ks.matches("$6$saltsalt$hashhashhash").count(), 1);
    }

    #[test]
    fn exactly_one_disk_selection_include() {
        let pre = render_pre_script(&TargetMode::AllInternal).unwrap();
        let ks = compose(&options(), &pre);
        assert_eq!(ks.matches("%include").count(), 1);
    }

    #[test]
    fn static_network_uses_the_second_descriptor_form() {
        let mut opts = options();
        opts.network = NetworkConfig::Static {
            address: "192.0.2.10".into(),
            netmask: "255.255.255.0".into(),
            gateway: "192.0.2.1".into(),
            nameserver: "192.0.2.53".into(),
        };
        let pre = render_pre_script(&TargetMode::AutoSingle).unwrap();
        let ks = compose(&opts, &pre);
        assert!(ks.contains("--bootproto=static"));
        assert!(ks.contains("--ip=192.0.2.10"));
        assert!(ks.contains("--nameserver=192.0.2.53"));
        assert!(!ks.contains("--bootproto=dhcp"));
    }

    #[test]
    fn pre_script_is_embedded_verbatim() {
        let pre = render_pre_script(&TargetMode::Manual("sdb".into())).unwrap();
        let ks = compose(&options(), &pre);
        assert!(ks.contains(&pre));
    }

    #[test]
    fn denylist_post_block_is_conditional() {
        let pre = render_pre_script(&TargetMode::AutoSingle).unwrap();

        let without = compose(&options(), &pre);
        assert!(!without.contains("%post"));

        let mut opts = options();
        opts.module_denylist = vec!["nouveau".into(), "pcspkr".into()];
        let with = compose(&opts, &pre);
        let expected = indoc! {"
            %post
            cat > /etc/modprobe.d/oemstick-deny.conf <<'EOF'
            blacklist nouveau
            blacklist pcspkr
            EOF
            %end
        "};
        assert!(with.contains(expected));
    }
}
