//! Waits for an attached volume to surface inside the guest.
//!
//! Bus rescans complete asynchronously in the kernel with no completion
//! signal, so discovery sleeps between a fixed number of attempts. Each
//! attempt rescans every SCSI host, nudges udev, then checks for the
//! expected by-id link without following it.

mod sysfs;

use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::command::{CommandError, CommandRunner, SudoRunner};

pub use sysfs::SysfsTree;

/// udev administration binary.
pub const UDEVADM: &str = "/sbin/udevadm";

/// Attempts made before discovery gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 24;

/// Delay preceding each attempt.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded retry policy for device discovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Number of attempts before reporting the device missing.
    pub max_attempts: u32,
    /// Delay before each attempt.
    pub interval: Duration,
}

impl PollPolicy {
    /// Creates a policy with the given attempt budget and spacing.
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

/// Host directories consulted during discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceLayout {
    /// Root of the sysfs tree.
    pub sysfs_root: Utf8PathBuf,
    /// Directory holding device nodes.
    pub dev_root: Utf8PathBuf,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            sysfs_root: Utf8PathBuf::from("/sys"),
            dev_root: Utf8PathBuf::from("/dev"),
        }
    }
}

/// Outcome of a successful discovery.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceDescriptor {
    /// Path computed before the device existed.
    pub expected_path: Utf8PathBuf,
    /// Real device node the expected path resolves to.
    pub resolved_real_path: Option<Utf8PathBuf>,
    /// Device-mapper parent that owns the real device, when multipathed.
    pub multipath_parent: Option<Utf8PathBuf>,
    /// Slave devices of the multipath parent.
    pub slave_devices: Vec<Utf8PathBuf>,
}

impl DeviceDescriptor {
    /// Returns the path I/O should target: the multipath parent when one
    /// exists, otherwise the resolved device, otherwise the expected path.
    #[must_use]
    pub fn device_path(&self) -> &Utf8Path {
        self.multipath_parent
            .as_deref()
            .or(self.resolved_real_path.as_deref())
            .unwrap_or(&self.expected_path)
    }
}

/// Errors raised while waiting for a device.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiscoveryError {
    /// Raised when the attempt budget runs out.
    #[error("device {path} did not appear after {attempts} attempts")]
    DeviceNotFound {
        /// Path that never appeared.
        path: Utf8PathBuf,
        /// Attempts made.
        attempts: u32,
    },
    /// Raised when the expected link exists but cannot be resolved.
    #[error("cannot resolve symlink {path}: {message}")]
    SymlinkUnresolvable {
        /// Link that failed to resolve.
        path: Utf8PathBuf,
        /// Underlying error.
        message: String,
    },
    /// Raised when the expected path is malformed.
    #[error("invalid device path {path}: {message}")]
    Io {
        /// Offending path.
        path: Utf8PathBuf,
        /// Description of the problem.
        message: String,
    },
}

/// Drives rescans and polls for attached devices.
#[derive(Clone, Debug)]
pub struct DeviceDiscoverer<R> {
    runner: SudoRunner<R>,
    policy: PollPolicy,
    sysfs: SysfsTree,
    dev_root: Utf8PathBuf,
}

impl<R: CommandRunner> DeviceDiscoverer<R> {
    /// Creates a discoverer.
    #[must_use]
    pub fn new(runner: SudoRunner<R>, policy: PollPolicy, layout: DeviceLayout) -> Self {
        Self {
            runner,
            policy,
            sysfs: SysfsTree::new(layout.sysfs_root),
            dev_root: layout.dev_root,
        }
    }

    /// Returns the sysfs tree used for rescans and multipath lookups.
    #[must_use]
    pub const fn sysfs(&self) -> &SysfsTree {
        &self.sysfs
    }

    /// Returns the active retry policy.
    #[must_use]
    pub const fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Waits for `expected` to appear, then resolves it to the device that
    /// should receive I/O. Safe to call again for an already present device.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::DeviceNotFound`] when the path never
    /// appears, [`DiscoveryError::SymlinkUnresolvable`] when it is a dangling
    /// link, and [`DiscoveryError::Io`] when the path has no file name.
    pub async fn wait_for_attach(
        &self,
        expected: &Utf8Path,
    ) -> Result<DeviceDescriptor, DiscoveryError> {
        let (parent, name) = split_path(expected)?;
        for attempt in 1..=self.policy.max_attempts {
            sleep(self.policy.interval).await;
            self.sysfs.rescan_scsi_hosts();
            if let Err(err) = self.trigger_udev(expected).await {
                warn!(path = %expected, error = %err, "udev trigger failed");
            }

            match lstat(parent, name) {
                Ok(is_symlink) => {
                    info!(path = %expected, attempt, "device appeared");
                    return self.describe(expected, is_symlink).await;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %expected, attempt, "device not present yet");
                }
                Err(err) => {
                    debug!(path = %expected, attempt, error = %err, "device lookup failed");
                }
            }
        }

        Err(DiscoveryError::DeviceNotFound {
            path: expected.to_path_buf(),
            attempts: self.policy.max_attempts,
        })
    }

    async fn trigger_udev(&self, expected: &Utf8Path) -> Result<(), CommandError> {
        self.runner.run_checked(UDEVADM, &["settle"])?;
        if tokio::fs::try_exists(expected).await.unwrap_or(false) {
            self.runner
                .run_checked(UDEVADM, &["trigger", expected.as_str()])?;
        } else {
            self.runner.run_checked(UDEVADM, &["trigger"])?;
        }
        Ok(())
    }

    async fn describe(
        &self,
        expected: &Utf8Path,
        is_symlink: bool,
    ) -> Result<DeviceDescriptor, DiscoveryError> {
        if !is_symlink {
            return Ok(DeviceDescriptor {
                expected_path: expected.to_path_buf(),
                resolved_real_path: Some(expected.to_path_buf()),
                ..DeviceDescriptor::default()
            });
        }

        let unresolvable = |message: String| DiscoveryError::SymlinkUnresolvable {
            path: expected.to_path_buf(),
            message,
        };
        let real = tokio::fs::canonicalize(expected)
            .await
            .map_err(|err| unresolvable(err.to_string()))?;
        let real_path = Utf8PathBuf::from_path_buf(real)
            .map_err(|path| unresolvable(format!("non-UTF-8 target {}", path.display())))?;
        let device_name = real_path
            .file_name()
            .ok_or_else(|| unresolvable(format!("target {real_path} has no device name")))?;

        let Some(dm_name) = self.sysfs.multipath_parent_of(device_name) else {
            debug!(path = %expected, device = %real_path, "no multipath parent");
            return Ok(DeviceDescriptor {
                expected_path: expected.to_path_buf(),
                resolved_real_path: Some(real_path),
                ..DeviceDescriptor::default()
            });
        };

        let slaves = self
            .sysfs
            .slaves_of(&dm_name)
            .into_iter()
            .map(|slave| self.dev_root.join(slave))
            .collect();
        let parent = self.dev_root.join(&dm_name);
        info!(path = %expected, device = %real_path, parent = %parent, "using multipath parent");
        Ok(DeviceDescriptor {
            expected_path: expected.to_path_buf(),
            resolved_real_path: Some(real_path),
            multipath_parent: Some(parent),
            slave_devices: slaves,
        })
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), DiscoveryError> {
    let name = path.file_name().ok_or_else(|| DiscoveryError::Io {
        path: path.to_path_buf(),
        message: String::from("path has no file name"),
    })?;
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("/"));
    Ok((parent, name))
}

/// Stats `parent/name` without following a final symlink, reporting whether
/// it is one.
fn lstat(parent: &Utf8Path, name: &str) -> io::Result<bool> {
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    let metadata = dir.symlink_metadata(name)?;
    Ok(metadata.file_type().is_symlink())
}
