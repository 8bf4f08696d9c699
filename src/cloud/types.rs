//! Value types exchanged with the cloud facade.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Volume metadata key holding the Kubernetes volume name written at attach.
pub const DISPLAY_NAME_METADATA_KEY: &str = "k8s_pvOrVolumeName";

/// Volume metadata key holding the storage world-wide name.
pub const WWN_METADATA_KEY: &str = "volume_wwn";

/// Block volume as seen by the driver.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRef {
    /// Cloud volume identifier (UUID).
    pub id: String,
    /// Kubernetes volume name recorded in metadata, when present.
    pub display_name: Option<String>,
    /// World-wide name of the backing LUN, when the storage reports one.
    pub wwn: Option<String>,
    /// Storage host that serves the volume.
    pub backend_host: String,
    /// Provider status string (for example `available`).
    pub status: String,
    /// Raw metadata map.
    pub metadata: BTreeMap<String, String>,
}

impl VolumeRef {
    /// Builds a volume from its identifier and metadata, deriving the display
    /// name and WWN from the well-known metadata keys.
    #[must_use]
    pub fn from_metadata(
        id: impl Into<String>,
        backend_host: impl Into<String>,
        status: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let display_name = non_blank(metadata.get(DISPLAY_NAME_METADATA_KEY));
        let wwn = non_blank(metadata.get(WWN_METADATA_KEY));
        Self {
            id: id.into(),
            display_name,
            wwn,
            backend_host: backend_host.into(),
            status: status.into(),
            metadata,
        }
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

/// Virtual machine known to the compute service.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ComputeInstance {
    /// Instance identifier.
    pub id: String,
    /// Hostname of the hypervisor running the instance.
    pub hypervisor_hostname: String,
    /// IPv4 addresses of the instance's network ports.
    pub addresses: Vec<Ipv4Addr>,
}

/// Virtualisation technology running a guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HypervisorType {
    /// Plain KVM.
    Kvm,
    /// Libvirt-managed KVM.
    Libvirt,
    /// KVM on a NovaLink-managed Power system.
    PowerVmKvm,
    /// PowerVM with Virtual I/O Server storage.
    PowerVmVios,
    /// PowerVM managed through the HMC (PHYP).
    PowerVmPhyp,
    /// Any hypervisor type outside the supported set.
    Unsupported(String),
}

impl HypervisorType {
    /// Maps the compute service's `hypervisor_type` string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "kvm" => Self::Kvm,
            "libvirt" => Self::Libvirt,
            "novalink-kvm" => Self::PowerVmKvm,
            "powervm" => Self::PowerVmVios,
            "phyp" => Self::PowerVmPhyp,
            _ => Self::Unsupported(value.trim().to_owned()),
        }
    }
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Kvm => "kvm",
            Self::Libvirt => "libvirt",
            Self::PowerVmKvm => "novalink-kvm",
            Self::PowerVmVios => "powervm",
            Self::PowerVmPhyp => "phyp",
            Self::Unsupported(other) => other.as_str(),
        };
        f.write_str(label)
    }
}

/// Hypervisor host record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HypervisorRecord {
    /// Hypervisor hostname as reported by the compute service.
    pub hostname: String,
    /// Virtualisation technology.
    pub hypervisor_type: HypervisorType,
}

/// Storage fabric behind a volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendType {
    /// IBM Spectrum Scale (GPFS) exported over LIO.
    Gpfs,
    /// IBM XIV.
    Xiv,
    /// SVC or any other registered controller.
    Generic,
    /// No registration was found for the storage host.
    Unregistered,
}

impl BackendType {
    /// Maps a registration's `host_type` string.
    #[must_use]
    pub fn from_host_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "gpfs" => Self::Gpfs,
            "xiv" => Self::Xiv,
            _ => Self::Generic,
        }
    }
}

/// Registration details of a storage host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageBackendRegistration {
    /// Storage host name the registration belongs to.
    pub backend_host: String,
    /// Storage fabric type.
    pub backend_type: BackendType,
}

impl StorageBackendRegistration {
    /// Returns the backend type for an optional registration, treating a
    /// missing registration as [`BackendType::Unregistered`].
    #[must_use]
    pub fn backend_type_of(registration: Option<&Self>) -> BackendType {
        registration.map_or(BackendType::Unregistered, |reg| reg.backend_type)
    }
}

/// Active attachment of a volume to an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Instance the volume is attached to.
    pub server_id: String,
    /// Attached volume identifier.
    pub volume_id: String,
    /// Device name reported by the hypervisor, if any.
    pub device: Option<String>,
}
