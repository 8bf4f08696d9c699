//! Computes where an attached volume will appear inside the guest.
//!
//! Each hypervisor and storage combination publishes SCSI disks under a
//! statically derivable `/dev/disk/by-id` name, so the path is known before
//! the device exists. Nothing here touches the filesystem.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::cloud::{BackendType, HypervisorType, VolumeRef};

/// Directory holding persistent by-id links.
pub const BY_ID_DIR: &str = "/dev/disk/by-id";

/// Link prefix for virtio-scsi disks presented by QEMU.
pub const KVM_PREFIX: &str = "scsi-0QEMU_QEMU_HARDDISK_";

/// Link prefix for LIO-exported GPFS LUNs.
pub const LIO_PREFIX: &str = "wwn-0x6001405";

/// Link prefix for XIV LUNs.
pub const XIV_PREFIX: &str = "scsi-2";

/// Link prefix for VIOS-mapped LUNs identified by WWN.
pub const VIOS_PREFIX: &str = "wwn-0x";

/// Characters of the volume identifier QEMU keeps in the disk serial.
pub const KVM_SERIAL_LEN: usize = 20;

/// Characters of the hyphen-free volume identifier LIO keeps in the WWN.
pub const LIO_SERIAL_LEN: usize = 25;

/// Errors raised when no device path can be derived.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// Raised for hypervisors outside the supported set.
    #[error("unsupported hypervisor type: {hypervisor_type}")]
    UnsupportedHypervisor {
        /// Hypervisor type reported by the cloud.
        hypervisor_type: String,
    },
    /// Raised when a WWN-keyed scheme applies but the volume has no WWN.
    #[error("volume {volume_id} has no world-wide name")]
    MissingWwn {
        /// Volume lacking a WWN.
        volume_id: String,
    },
    /// Raised when the volume identifier is shorter than the serial the
    /// scheme embeds.
    #[error("volume identifier {volume_id} is shorter than {required} characters")]
    IdentifierTooShort {
        /// Offending identifier.
        volume_id: String,
        /// Characters the scheme needs.
        required: usize,
    },
}

/// Naming scheme a guest uses for an attached disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NamingScheme {
    QemuSerial,
    LioSerial,
    XivWwn,
    ViosWwn,
}

impl NamingScheme {
    fn select(hypervisor: &HypervisorType, backend: BackendType) -> Result<Self, ResolveError> {
        let scheme = match (hypervisor, backend) {
            (HypervisorType::Kvm | HypervisorType::Libvirt | HypervisorType::PowerVmKvm, _) => {
                Self::QemuSerial
            }
            (HypervisorType::PowerVmVios | HypervisorType::PowerVmPhyp, BackendType::Gpfs) => {
                Self::LioSerial
            }
            (HypervisorType::PowerVmVios | HypervisorType::PowerVmPhyp, BackendType::Xiv) => {
                Self::XivWwn
            }
            (
                HypervisorType::PowerVmVios | HypervisorType::PowerVmPhyp,
                BackendType::Generic | BackendType::Unregistered,
            ) => Self::ViosWwn,
            (HypervisorType::Unsupported(name), _) => {
                return Err(ResolveError::UnsupportedHypervisor {
                    hypervisor_type: name.clone(),
                });
            }
        };
        Ok(scheme)
    }

    fn link_name(self, volume: &VolumeRef) -> Result<String, ResolveError> {
        match self {
            Self::QemuSerial => {
                let serial = leading(&volume.id, &volume.id, KVM_SERIAL_LEN)?;
                Ok(format!("{KVM_PREFIX}{serial}"))
            }
            Self::LioSerial => {
                let stripped = volume.id.replace('-', "");
                let serial = leading(&stripped, &volume.id, LIO_SERIAL_LEN)?;
                Ok(format!("{LIO_PREFIX}{serial}"))
            }
            Self::XivWwn => Ok(format!("{XIV_PREFIX}{}", lower_wwn(volume)?)),
            Self::ViosWwn => Ok(format!("{VIOS_PREFIX}{}", lower_wwn(volume)?)),
        }
    }
}

fn leading<'a>(text: &'a str, volume_id: &str, len: usize) -> Result<&'a str, ResolveError> {
    text.get(..len)
        .ok_or_else(|| ResolveError::IdentifierTooShort {
            volume_id: volume_id.to_owned(),
            required: len,
        })
}

fn lower_wwn(volume: &VolumeRef) -> Result<String, ResolveError> {
    volume
        .wwn
        .as_deref()
        .map(str::to_lowercase)
        .ok_or_else(|| ResolveError::MissingWwn {
            volume_id: volume.id.clone(),
        })
}

/// Returns the by-id path at which `volume` will appear in a guest running
/// on `hypervisor` with storage from `backend`.
///
/// # Errors
///
/// Returns [`ResolveError`] for unsupported hypervisors, volumes lacking a
/// WWN where one is needed, and identifiers too short to embed.
pub fn resolve(
    hypervisor: &HypervisorType,
    backend: BackendType,
    volume: &VolumeRef,
) -> Result<Utf8PathBuf, ResolveError> {
    resolve_in(Utf8Path::new(BY_ID_DIR), hypervisor, backend, volume)
}

/// Same as [`resolve`] but rooted at `by_id_dir`.
///
/// # Errors
///
/// See [`resolve`].
pub fn resolve_in(
    by_id_dir: &Utf8Path,
    hypervisor: &HypervisorType,
    backend: BackendType,
    volume: &VolumeRef,
) -> Result<Utf8PathBuf, ResolveError> {
    let scheme = NamingScheme::select(hypervisor, backend)?;
    Ok(by_id_dir.join(scheme.link_name(volume)?))
}
