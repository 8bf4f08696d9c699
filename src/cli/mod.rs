//! Command-line grammar for the `flexvol` FlexVolume driver.
//!
//! The kubelet invokes the driver with the operation name as the first
//! argument, followed by positional arguments and, for most operations, a
//! JSON-encoded option blob. The parser structures live here so both the
//! binary and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `flexvol` binary.
#[derive(Debug, Parser)]
#[command(
    name = "flexvol",
    about = "Attach OpenStack block volumes to KVM and PowerVM guests for the kubelet",
    arg_required_else_help = true,
    disable_help_subcommand = true
)]
pub enum Cli {
    /// Report driver capabilities.
    #[command(name = "init")]
    Init,
    /// Return the unique volume name for the given options.
    #[command(name = "getvolumename")]
    GetVolumeName {
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: Option<String>,
    },
    /// Report whether the volume is attached to the node.
    #[command(name = "isattached")]
    IsAttached {
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: String,
        /// Node name or IPv4 address.
        #[arg(value_name = "NODE")]
        node: String,
    },
    /// Attach the volume to the node's virtual machine.
    #[command(name = "attach")]
    Attach {
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: String,
        /// Node name or IPv4 address.
        #[arg(value_name = "NODE")]
        node: String,
    },
    /// Wait for the attached device to appear on the node.
    #[command(name = "waitforattach")]
    WaitForAttach {
        /// Device path returned by `attach`.
        #[arg(value_name = "DEVICE")]
        device: String,
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: Option<String>,
    },
    /// Format (when needed) and mount the device at the global mount path.
    #[command(name = "mountdevice")]
    MountDevice {
        /// Global mount path for the device.
        #[arg(value_name = "MOUNT_PATH")]
        mount_path: String,
        /// Device path returned by `waitforattach`.
        #[arg(value_name = "DEVICE")]
        device: String,
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: Option<String>,
    },
    /// Bind mount the global mount into the pod directory.
    #[command(name = "mount")]
    Mount {
        /// Pod mount directory.
        #[arg(value_name = "MOUNT_DIR")]
        mount_dir: String,
        /// JSON-encoded driver options.
        #[arg(value_name = "JSON")]
        json: Option<String>,
    },
    /// Detach the named volume from the node's virtual machine.
    #[command(name = "detach")]
    Detach {
        /// Kubernetes volume name recorded at attach time.
        #[arg(value_name = "VOLUME_NAME")]
        volume_name: String,
        /// Node name or IPv4 address.
        #[arg(value_name = "NODE")]
        node: String,
    },
    /// Wait for the device to disappear (no-op).
    #[command(name = "waitfordetach")]
    WaitForDetach {
        /// Device path.
        #[arg(value_name = "DEVICE")]
        device: String,
    },
    /// Unmount the global mount path and release the device.
    #[command(name = "unmountdevice")]
    UnmountDevice {
        /// Global mount path for the device.
        #[arg(value_name = "MOUNT_PATH")]
        mount_path: String,
    },
    /// Unmount the pod bind mount.
    #[command(name = "unmount")]
    Unmount {
        /// Pod mount directory.
        #[arg(value_name = "MOUNT_DIR")]
        mount_dir: String,
    },
}
