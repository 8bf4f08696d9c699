//! Wire representations of Keystone, Nova, and Cinder payloads.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::cloud::{
    BackendType, ComputeInstance, HypervisorRecord, HypervisorType, StorageBackendRegistration,
    VolumeAttachment, VolumeRef,
};

/// Pagination link attached to Nova and Cinder list responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct Link {
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub href: String,
}

/// Returns the `next` link of a page, if any.
pub(crate) fn next_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|link| link.rel == "next" && !link.href.is_empty())
        .map(|link| link.href.as_str())
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ServerAddress {
    #[serde(default)]
    pub addr: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Server {
    pub id: String,
    #[serde(default, rename = "OS-EXT-SRV-ATTR:hypervisor_hostname")]
    pub hypervisor_hostname: Option<String>,
    #[serde(default)]
    pub addresses: BTreeMap<String, Vec<ServerAddress>>,
}

impl From<Server> for ComputeInstance {
    fn from(server: Server) -> Self {
        let addresses = server
            .addresses
            .values()
            .flatten()
            .filter_map(|address| address.addr.parse::<Ipv4Addr>().ok())
            .collect();
        Self {
            id: server.id,
            hypervisor_hostname: server.hypervisor_hostname.unwrap_or_default(),
            addresses,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ServerPage {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub servers_links: Vec<Link>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Hypervisor {
    #[serde(default)]
    pub hypervisor_hostname: String,
    #[serde(default)]
    pub hypervisor_type: String,
}

impl From<Hypervisor> for HypervisorRecord {
    fn from(host: Hypervisor) -> Self {
        Self {
            hypervisor_type: HypervisorType::parse(&host.hypervisor_type),
            hostname: host.hypervisor_hostname,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct HypervisorPage {
    #[serde(default)]
    pub hypervisors: Vec<Hypervisor>,
    #[serde(default)]
    pub hypervisors_links: Vec<Link>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Volume {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub backend_host: Option<String>,
    #[serde(default, rename = "os-vol-host-attr:host")]
    pub host_attr: Option<String>,
}

impl From<Volume> for VolumeRef {
    fn from(volume: Volume) -> Self {
        let backend_host = volume
            .backend_host
            .filter(|host| !host.trim().is_empty())
            .or(volume.host_attr)
            .unwrap_or_default();
        Self::from_metadata(volume.id, backend_host, volume.status, volume.metadata)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct VolumeBody {
    pub volume: Volume,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct VolumePage {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub volumes_links: Vec<Link>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct MetadataBody<'a> {
    pub metadata: &'a BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct AttachRequest<'a> {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: AttachVolumeId<'a>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct AttachVolumeId<'a> {
    #[serde(rename = "volumeId")]
    pub volume_id: &'a str,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Attachment {
    #[serde(default, rename = "serverId")]
    pub server_id: String,
    #[serde(default, rename = "volumeId")]
    pub volume_id: String,
    #[serde(default)]
    pub device: Option<String>,
}

impl From<Attachment> for VolumeAttachment {
    fn from(attachment: Attachment) -> Self {
        Self {
            server_id: attachment.server_id,
            volume_id: attachment.volume_id,
            device: attachment.device,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AttachmentBody {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: Attachment,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Registration {
    #[serde(default)]
    pub host_type: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct HostEntry {
    #[serde(default)]
    pub registration: Option<Registration>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct HostBody {
    #[serde(default)]
    pub host: Vec<HostEntry>,
}

impl HostBody {
    /// First registration carried by the host entries.
    pub(crate) fn into_registration(self, backend_host: &str) -> Option<StorageBackendRegistration> {
        self.host
            .into_iter()
            .find_map(|entry| entry.registration)
            .map(|registration| StorageBackendRegistration {
                backend_host: backend_host.to_owned(),
                backend_type: BackendType::from_host_type(&registration.host_type),
            })
    }
}
