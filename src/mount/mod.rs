//! Formats, mounts, and unmounts attached volumes on the node.
//!
//! `mountdevice` mounts the block device on kubelet's global mount path and
//! `mount` bind-mounts that path into the pod. Unmounting the global path
//! can also tear down the multipath map and remove the SCSI devices so a
//! later detach leaves no stale paths behind.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, SudoRunner};
use crate::discovery::{DeviceLayout, SysfsTree};
use crate::protocol::FlexOptions;

/// Block device listing tool.
pub const LSBLK: &str = "/bin/lsblk";
/// Prefix of the per-filesystem mkfs helpers.
pub const MKFS_PREFIX: &str = "/sbin/mkfs.";
/// Directory creation tool.
pub const MKDIR: &str = "/bin/mkdir";
/// Mount tool.
pub const MOUNT: &str = "/bin/mount";
/// Unmount tool.
pub const UMOUNT: &str = "/bin/umount";
/// Device-mapper multipath administration tool.
pub const MULTIPATH: &str = "/usr/sbin/multipath";

/// Linux filesystems whose presence prevents reformatting.
pub const KNOWN_FILESYSTEMS: [&str; 7] = ["ext2", "ext3", "ext4", "jfs", "ReiserFS", "XFS", "Btrfs"];

const MULTIPATH_MAPPER_PREFIX: &str = "/dev/mapper/mpath";

/// Errors raised by mount handling.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MountError {
    /// Wrapper for command failures.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Raised when the bind mount needs a volume name and none was given.
    #[error("missing kubernetes.io/pvOrVolumeName option")]
    MissingVolumeName,
    /// Raised when nothing is mounted at the path.
    #[error("{path} is not a mount point")]
    MountPointNotFound {
        /// Path that was looked up.
        path: Utf8PathBuf,
    },
    /// Raised when several mount entries match the path.
    #[error("{count} mount entries found for {path}")]
    AmbiguousMount {
        /// Path that was looked up.
        path: Utf8PathBuf,
        /// Matching entries.
        count: usize,
    },
    /// Raised when a mount table line cannot be parsed.
    #[error("cannot parse mount entry: {line}")]
    UnparseableMount {
        /// Offending line.
        line: String,
    },
    /// Raised when the mounted source is not a device node.
    #[error("device path is not valid: {path}")]
    InvalidDevice {
        /// Offending path.
        path: String,
    },
    /// Raised when multipath reports an unusable map.
    #[error("multipath error: {message}")]
    Multipath {
        /// Description of the problem.
        message: String,
    },
}

/// Block devices backing a mounted device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockDevices {
    /// Device-mapper parent (`/dev/dm-N`) when the device is multipathed.
    pub dm_parent: Option<Utf8PathBuf>,
    /// Underlying SCSI block devices.
    pub devices: Vec<Utf8PathBuf>,
}

/// Runs the host commands behind the mount operations.
#[derive(Clone, Debug)]
pub struct MountExecutor<R> {
    runner: SudoRunner<R>,
    sysfs: SysfsTree,
    dev_root: Utf8PathBuf,
    global_mounts_dir: Utf8PathBuf,
    cleanup_devices: bool,
}

impl<R: CommandRunner> MountExecutor<R> {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        runner: SudoRunner<R>,
        layout: DeviceLayout,
        global_mounts_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            runner,
            sysfs: SysfsTree::new(layout.sysfs_root),
            dev_root: layout.dev_root,
            global_mounts_dir,
            cleanup_devices: true,
        }
    }

    /// Enables or disables device cleanup after `unmountdevice`.
    #[must_use]
    pub const fn with_device_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_devices = enabled;
        self
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        self.runner
            .run_checked(program, args)
            .map(|output| output.stdout)
    }

    /// Creates a filesystem on `device` unless one exists, then mounts it at
    /// `mount_path`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Command`] when any step fails.
    pub fn mount_device(
        &self,
        mount_path: &Utf8Path,
        device: &Utf8Path,
        options: &FlexOptions,
    ) -> Result<(), MountError> {
        let fs_type = options.fs_type();
        if self.has_filesystem(device)? {
            info!(device = %device, "device already has a filesystem; not formatting");
        } else {
            let mkfs = format!("{MKFS_PREFIX}{fs_type}");
            let mut mkfs_args = vec![device.as_str()];
            if fs_type.starts_with("ext") || fs_type.starts_with("ntfs") {
                mkfs_args.push("-F");
            }
            self.run(&mkfs, &mkfs_args)?;
            info!(device = %device, fs_type, "created filesystem");
        }

        self.run(MKDIR, &["-p", mount_path.as_str()])?;
        let mut mount_args = Vec::with_capacity(3);
        if options.read_only() {
            mount_args.push("-r");
        }
        mount_args.extend([device.as_str(), mount_path.as_str()]);
        self.run(MOUNT, &mount_args)?;
        info!(device = %device, path = %mount_path, read_only = options.read_only(), "mounted device");
        Ok(())
    }

    fn has_filesystem(&self, device: &Utf8Path) -> Result<bool, MountError> {
        let stdout = self.run(
            LSBLK,
            &[device.as_str(), "--noheadings", "-o", "FSTYPE", "-f"],
        )?;
        let reported = stdout.trim().to_lowercase();
        let found = !reported.is_empty()
            && KNOWN_FILESYSTEMS
                .iter()
                .any(|fs| reported.contains(&fs.to_lowercase()));
        debug!(device = %device, reported = %reported, found, "filesystem detected");
        Ok(found)
    }

    /// Bind-mounts the volume's global mount path into `mount_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::MissingVolumeName`] when the options lack the
    /// volume name and [`MountError::Command`] when a command fails.
    pub fn mount(&self, mount_dir: &Utf8Path, options: &FlexOptions) -> Result<(), MountError> {
        let name = options.volume_name().ok_or(MountError::MissingVolumeName)?;
        let source = self.global_mounts_dir.join(name);
        self.run(MKDIR, &["-p", mount_dir.as_str()])?;
        self.run(MOUNT, &["--bind", source.as_str(), mount_dir.as_str()])?;
        info!(source = %source, target = %mount_dir, "bind mounted volume");
        Ok(())
    }

    /// Unmounts a pod's bind mount.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Command`] when `umount` fails.
    pub fn unmount(&self, mount_dir: &Utf8Path) -> Result<(), MountError> {
        self.run(UMOUNT, &[mount_dir.as_str()])?;
        info!(path = %mount_dir, "unmounted volume directory");
        Ok(())
    }

    /// Unmounts the global mount path and, when enabled, removes the
    /// multipath map and SCSI devices that backed it. Cleanup problems are
    /// logged and never fail the unmount.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Command`] when `umount` fails.
    pub fn unmount_device(&self, mount_path: &Utf8Path) -> Result<(), MountError> {
        let device = if self.cleanup_devices {
            self.device_of_mount(mount_path)
                .inspect_err(|err| {
                    warn!(path = %mount_path, error = %err, "could not identify mounted device");
                })
                .ok()
        } else {
            None
        };

        self.run(UMOUNT, &[mount_path.as_str()])?;
        info!(path = %mount_path, "unmounted device");

        if let Some(source) = device {
            if let Err(err) = self.cleanup(&source) {
                warn!(device = %source, error = %err, "device cleanup failed");
            }
        }
        Ok(())
    }

    /// Returns the source device mounted at `mount_path`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::MountPointNotFound`] when no entry matches,
    /// [`MountError::AmbiguousMount`] when several do, and
    /// [`MountError::UnparseableMount`] for malformed entries.
    pub fn device_of_mount(&self, mount_path: &Utf8Path) -> Result<String, MountError> {
        let table = self.run(MOUNT, &[])?;
        let entries: Vec<&str> = table
            .lines()
            .filter(|line| line.split_whitespace().nth(2) == Some(mount_path.as_str()))
            .collect();
        let line = match entries.as_slice() {
            [] => {
                return Err(MountError::MountPointNotFound {
                    path: mount_path.to_path_buf(),
                });
            }
            [line] => *line,
            _ => {
                return Err(MountError::AmbiguousMount {
                    path: mount_path.to_path_buf(),
                    count: entries.len(),
                });
            }
        };

        // <device> on <path> type <fs> (<options>)
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [device, "on", _, "type", _, _] => Ok((*device).to_owned()),
            _ => Err(MountError::UnparseableMount {
                line: line.to_owned(),
            }),
        }
    }

    /// Finds the device-mapper parent and SCSI devices behind `device`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidDevice`] for non-device paths and
    /// [`MountError::Multipath`] when the multipath map cannot be read.
    pub fn associated_block_devices(&self, device: &str) -> Result<BlockDevices, MountError> {
        if !device.contains("/dev") {
            return Err(MountError::InvalidDevice {
                path: device.to_owned(),
            });
        }
        if !device.starts_with(MULTIPATH_MAPPER_PREFIX) {
            return Ok(BlockDevices {
                dm_parent: None,
                devices: vec![Utf8PathBuf::from(device)],
            });
        }

        let listing = self.run(MULTIPATH, &["-l", device])?;
        let first = listing.lines().next().unwrap_or_default();
        if first.contains("not a valid argument") {
            return Err(MountError::Multipath {
                message: format!("{device} is not a multipath device: {first}"),
            });
        }
        // mpathi (36005076...) dm-3 AIX     ,VDASD
        let dm_name = first
            .split_whitespace()
            .nth(2)
            .filter(|field| field.starts_with("dm-"))
            .ok_or_else(|| MountError::Multipath {
                message: format!("unexpected multipath output: {first}"),
            })?;
        let dm_parent = self.dev_root.join(dm_name);
        if !dm_parent.exists() {
            return Err(MountError::Multipath {
                message: format!("device mapper parent {dm_parent} does not exist"),
            });
        }
        let devices = self
            .sysfs
            .slaves_of(dm_name)
            .into_iter()
            .map(|slave| self.dev_root.join(slave))
            .collect();
        Ok(BlockDevices {
            dm_parent: Some(dm_parent),
            devices,
        })
    }

    fn cleanup(&self, device: &str) -> Result<(), MountError> {
        let block = self.associated_block_devices(device)?;
        if block.dm_parent.is_some() {
            let map = Utf8Path::new(device).file_name().unwrap_or(device);
            self.run(MULTIPATH, &["-f", map])?;
            debug!(map, "flushed multipath map");
        }
        for path in &block.devices {
            let Some(name) = path.file_name() else {
                continue;
            };
            match self.sysfs.delete_scsi_device(name) {
                Ok(()) => info!(device = %path, "removed device from scsi subsystem"),
                Err(err) => warn!(device = %path, error = %err, "could not remove scsi device"),
            }
        }
        Ok(())
    }
}
