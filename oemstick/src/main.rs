use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use oemstick_core::capacity;
use oemstick_core::device::Device;
use oemstick_core::manifest::{self, InstallOptions, NetworkConfig};
use oemstick_core::partition;
use oemstick_core::platform;
use oemstick_core::policy::{self, TargetMode};
use oemstick_core::write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "oemstick")]
#[command(
    about = "Builds unattended-install USB media: image plus OEMDRV kickstart partition",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a removable device end to end: write the installer image,
    /// carve and format the OEMDRV partition, and place the kickstart on it
    Build {
        /// Installer image to write (raw, or .gz/.xz/.zst compressed)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device (e.g. /dev/sdb); selected interactively if omitted
        #[arg(long)]
        device: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        manifest: ManifestArgs,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Minimum size of the OEMDRV partition, in MiB
        #[arg(long, default_value_t = 128)]
        headroom_mib: u64,
    },
    /// Compose the kickstart manifest and print it without touching hardware
    Render {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        manifest: ManifestArgs,
    },
    /// List block devices visible on this machine
    List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    /// Erase the single internal disk; abort if there isn't exactly one
    AutoSingle,
    /// Erase every internal disk
    AllInternal,
    /// Erase exactly the disk named by --target-disk
    Manual,
}

#[derive(Args)]
struct TargetArgs {
    /// How the installer picks the disk(s) to erase on the target machine
    #[arg(long, value_enum, default_value_t = ModeArg::AutoSingle)]
    mode: ModeArg,

    /// Disk name on the target machine (e.g. sda); only with --mode manual
    #[arg(long)]
    target_disk: Option<String>,
}

impl TargetArgs {
    fn to_mode(&self) -> Result<TargetMode> {
        match self.mode {
            ModeArg::AutoSingle => Ok(TargetMode::AutoSingle),
            ModeArg::AllInternal => Ok(TargetMode::AllInternal),
            ModeArg::Manual => {
                let name = self
                    .target_disk
                    .clone()
                    .ok_or(oemstick_core::Error::MissingTargetName)?;
                Ok(TargetMode::Manual(name))
            }
        }
    }
}

#[derive(Args)]
struct ManifestArgs {
    /// Hostname for the installed system
    #[arg(long, default_value = "unattended")]
    hostname: String,

    /// Administrative user to create
    #[arg(long, default_value = "admin")]
    username: String,

    /// Salted crypt hash of the user's password ($6$...); never the plaintext
    #[arg(long)]
    password_hash: String,

    #[arg(long, default_value = "Etc/UTC")]
    timezone: String,

    #[arg(long, default_value = "en_US.UTF-8")]
    lang: String,

    #[arg(long, default_value = "us")]
    keyboard: String,

    /// Static address; enables static addressing (requires the three below)
    #[arg(long)]
    static_ip: Option<String>,

    #[arg(long, requires = "static_ip")]
    netmask: Option<String>,

    #[arg(long, requires = "static_ip")]
    gateway: Option<String>,

    #[arg(long, requires = "static_ip")]
    nameserver: Option<String>,

    /// Service to enable at first boot (repeatable; default sshd)
    #[arg(long = "enable-service")]
    services: Vec<String>,

    /// Kernel module to deny-list post-install (repeatable)
    #[arg(long = "deny-module")]
    deny_modules: Vec<String>,
}

impl ManifestArgs {
    fn to_options(&self) -> Result<InstallOptions> {
        let network = match &self.static_ip {
            None => NetworkConfig::Dhcp,
            Some(address) => {
                let missing = || anyhow!("--static-ip needs --netmask, --gateway and --nameserver");
                NetworkConfig::Static {
                    address: address.clone(),
                    netmask: self.netmask.clone().ok_or_else(missing)?,
                    gateway: self.gateway.clone().ok_or_else(missing)?,
                    nameserver: self.nameserver.clone().ok_or_else(missing)?,
                }
            }
        };

        let services = if self.services.is_empty() {
            vec!["sshd".to_string()]
        } else {
            self.services.clone()
        };

        Ok(InstallOptions {
            lang: self.lang.clone(),
            keyboard: self.keyboard.clone(),
            timezone: self.timezone.clone(),
            hostname: self.hostname.clone(),
            network,
            username: self.username.clone(),
            password_hash: self.password_hash.clone(),
            services,
            module_denylist: self.deny_modules.clone(),
        })
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn byte_bar(prefix: &'static str, color: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_prefix(prefix);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))
            .unwrap()
            .progress_chars("■ "),
    );
    pb
}

#[allow(clippy::too_many_arguments)]
fn build(
    image: PathBuf,
    device_path: Option<PathBuf>,
    target: TargetArgs,
    manifest_args: ManifestArgs,
    yes: bool,
    no_verify: bool,
    headroom_mib: u64,
    running: Arc<AtomicBool>,
) -> Result<()> {
    // Preconditions first: nothing destructive may happen after a failure
    // here, and all of these fail before anything destructive exists.
    platform::require_root()?;
    partition::check_tools()?;
    let mode = target.to_mode()?;
    let options = manifest_args.to_options()?;
    // Author the policy up front so an authoring-time error (a missing
    // manual disk name) cannot surface after the device has been erased.
    let pre_script = policy::render_pre_script(&mode)?;

    let device = match device_path {
        Some(path) => platform::inspect(&path)?,
        None => select_device(
            &platform::removable_devices()?,
            "Select the target device to provision",
        )?,
    };
    platform::ensure_safe_target(&device)?;

    // Decompress (if needed) before the capacity gate, since the gate needs
    // the final image size.
    let decompress_pb = if write::is_compressed(&image) {
        let pb = ProgressBar::new_spinner();
        pb.set_prefix("Decompress");
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec}) {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    } else {
        ProgressBar::hidden()
    };
    let prepared = write::prepare(&image, running.clone(), || {}, |bytes| {
        decompress_pb.set_position(bytes)
    })?;
    decompress_pb.finish_and_clear();

    let budget = capacity::plan(device.size_bytes, prepared.size_bytes, headroom_mib * MIB)?;

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb(),
    );
    println!("  Device:   {}", style(device.path.display()).cyan());
    println!("  Image:    {}", style(image.display()).cyan());
    println!(
        "  OEMDRV:   at least {} MiB, label {}",
        budget.reserved_min / MIB,
        style(partition::VOLUME_LABEL).cyan()
    );
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Build cancelled.");
        return Ok(());
    }
    println!();

    let write_pb = byte_bar("Writing", "green");
    let verify_pb = if no_verify {
        ProgressBar::hidden()
    } else {
        byte_bar("Verifying", "magenta")
    };

    let result = write::run(
        &prepared,
        &device.path,
        !no_verify,
        running,
        |len| write_pb.set_length(len),
        |bytes| write_pb.set_position(bytes),
        |len| {
            write_pb.finish_with_message("Write complete.");
            verify_pb.set_length(len);
        },
        |bytes| verify_pb.set_position(bytes),
    );
    if let Err(e) = result {
        write_pb.finish_and_clear();
        verify_pb.finish_and_clear();
        return Err(e.into());
    }
    if no_verify {
        write_pb.finish_with_message("Write complete (verification skipped).");
    } else {
        verify_pb.finish_with_message("Verification successful.");
    }

    println!("Provisioning the {} partition...", partition::VOLUME_LABEL);
    let handle = partition::provision(&device, &budget)?;

    let kickstart = manifest::compose(&options, &pre_script);
    handle.write_manifest(manifest::MANIFEST_FILE_NAME, &kickstart)?;

    println!(
        "\n✨ {} is ready: boot the target machine from it for an unattended install.",
        style(device.path.display()).cyan()
    );
    println!(
        "   Manifest {} written to {} (label {}).",
        style(manifest::MANIFEST_FILE_NAME).cyan(),
        style(handle.node.display()).cyan(),
        partition::VOLUME_LABEL
    );
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = platform::list()?;
    if devices.is_empty() {
        println!("No block devices found.");
        return Ok(());
    }

    println!(
        "\n  {:<14} {:<10} {:<10} {:<10} {}",
        "DEVICE", "SIZE", "BUS", "REMOVABLE", "MOUNTED"
    );
    println!("  {:-<14} {:-<10} {:-<10} {:-<10} {:-<20}", "", "", "", "", "");
    for device in devices {
        let mounted = device
            .mount_point
            .clone()
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<14} {:>6.1} GB  {:<10} {:<10} {}",
            device.path.display(),
            device.size_gb(),
            device.transport.to_string(),
            if device.removable { "yes" } else { "no" },
            mounted
        );
    }
    Ok(())
}

fn run() -> Result<()> {
    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            image,
            device,
            target,
            manifest,
            yes,
            no_verify,
            headroom_mib,
        } => build(
            image,
            device,
            target,
            manifest,
            yes,
            no_verify,
            headroom_mib,
            running,
        ),
        Commands::Render {
            target,
            manifest: manifest_args,
        } => {
            let pre_script = policy::render_pre_script(&target.to_mode()?)?;
            let options = manifest_args.to_options()?;
            print!("{}", manifest::compose(&options, &pre_script));
            Ok(())
        }
        Commands::List => list_devices(),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("{} {err:#}", style("error:").red().bold());
        // Each core failure class has a stable exit code; anything else is 1.
        let code = err
            .downcast_ref::<oemstick_core::Error>()
            .map(oemstick_core::Error::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
