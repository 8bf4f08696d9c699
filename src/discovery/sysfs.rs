//! Access to the kernel's block and SCSI topology under sysfs.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{debug, warn};

const SCSI_HOST_DIR: &str = "class/scsi_host";
const BLOCK_DIR: &str = "block";
const SCAN_ALL: &str = "- - -";
const DM_PREFIX: &str = "dm-";

/// Handle on a sysfs tree (normally `/sys`).
///
/// Clones share the count of rescan passes.
#[derive(Clone, Debug)]
pub struct SysfsTree {
    root: Utf8PathBuf,
    rescan_passes: Arc<AtomicUsize>,
}

impl SysfsTree {
    /// Creates a handle rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            rescan_passes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the sysfs root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn open(&self) -> io::Result<Dir> {
        Dir::open_ambient_dir(&self.root, ambient_authority())
    }

    /// Asks every SCSI host adapter to rescan all channels, targets and
    /// LUNs. Returns the number of adapters that accepted the request;
    /// individual failures are logged and skipped.
    pub fn rescan_scsi_hosts(&self) -> usize {
        self.rescan_passes.fetch_add(1, Ordering::SeqCst);
        let dir = match self.open() {
            Ok(dir) => dir,
            Err(err) => {
                warn!(root = %self.root, error = %err, "cannot open sysfs for rescan");
                return 0;
            }
        };
        let hosts = match list_names(&dir, SCSI_HOST_DIR) {
            Ok(hosts) => hosts,
            Err(err) => {
                warn!(root = %self.root, error = %err, "cannot list scsi hosts");
                return 0;
            }
        };

        let mut scanned = 0;
        for host in hosts {
            let scan = format!("{SCSI_HOST_DIR}/{host}/scan");
            match dir.write(&scan, SCAN_ALL) {
                Ok(()) => scanned += 1,
                Err(err) => warn!(path = %scan, error = %err, "could not rescan scsi host"),
            }
        }
        debug!(scanned, "scsi host scan done");
        scanned
    }

    /// Number of times [`Self::rescan_scsi_hosts`] has been called on this
    /// tree or its clones.
    #[must_use]
    pub fn rescan_passes(&self) -> usize {
        self.rescan_passes.load(Ordering::SeqCst)
    }

    /// Returns the device-mapper device (`dm-N`) whose slave list contains
    /// `device_name`, if any.
    #[must_use]
    pub fn multipath_parent_of(&self, device_name: &str) -> Option<String> {
        let dir = self.open().ok()?;
        let candidates = list_names(&dir, BLOCK_DIR).ok()?;
        candidates
            .into_iter()
            .filter(|name| name.starts_with(DM_PREFIX))
            .find(|name| {
                dir.symlink_metadata(format!("{BLOCK_DIR}/{name}/slaves/{device_name}"))
                    .is_ok()
            })
    }

    /// Lists the slave block devices of a device-mapper device, sorted by
    /// name. Missing or unreadable slave lists yield an empty vector.
    #[must_use]
    pub fn slaves_of(&self, dm_name: &str) -> Vec<String> {
        self.open()
            .and_then(|dir| list_names(&dir, &format!("{BLOCK_DIR}/{dm_name}/slaves")))
            .unwrap_or_default()
    }

    /// Removes a block device from the SCSI subsystem.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while writing the `delete` attribute.
    pub fn delete_scsi_device(&self, device_name: &str) -> io::Result<()> {
        let dir = self.open()?;
        dir.write(format!("{BLOCK_DIR}/{device_name}/device/delete"), "1")?;
        debug!(device = device_name, "deleted device from scsi subsystem");
        Ok(())
    }
}

fn list_names(dir: &Dir, path: &str) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir.read_dir(path)? {
        names.push(entry?.file_name()?);
    }
    names.sort();
    Ok(names)
}
