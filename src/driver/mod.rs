//! Attach, detach, and attachment queries against the cloud.
//!
//! Detach only receives the Kubernetes volume name, so attach records that
//! name in the volume's metadata and detach finds the volume through it.
//! Device discovery is a separate step; attach only predicts where the
//! device will appear.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{
    BackendType, CloudError, CloudFacade, ComputeInstance, DISPLAY_NAME_METADATA_KEY,
    HypervisorType, StorageBackendRegistration, VolumeRef,
};
use crate::device::{self, ResolveError};
use crate::identity::{IdentityCorrelator, IdentityError, NodeResolver};

/// Errors surfaced by the attach/detach orchestrator.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when a required input is missing or blank.
    #[error("missing required argument: {name}")]
    MissingArgument {
        /// Argument name as it appears in the request.
        name: String,
    },
    /// Raised when the cloud refuses or fails an attach.
    #[error("could not attach volume {volume_id} to instance {instance_id}: {message}")]
    AttachRejected {
        /// Volume being attached.
        volume_id: String,
        /// Target instance.
        instance_id: String,
        /// Cloud response or error text.
        message: String,
    },
    /// Raised when the cloud refuses or fails a detach.
    #[error("could not detach volume {volume_id} from instance {instance_id}: {message}")]
    DetachRejected {
        /// Volume being detached.
        volume_id: String,
        /// Instance the volume was attached to.
        instance_id: String,
        /// Cloud response or error text.
        message: String,
    },
    /// Raised when the instance's hypervisor host is not listed.
    #[error("hypervisor {hostname} not found")]
    HypervisorNotFound {
        /// Hypervisor hostname recorded on the instance.
        hostname: String,
    },
    /// Wrapper for node and volume correlation failures.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// Wrapper for device path resolution failures.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Wrapper for other cloud failures.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Inputs to [`VolumeDriver::attach`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachRequest {
    /// Cloud volume identifier.
    pub volume_id: String,
    /// Kubernetes volume name to record for later detach.
    pub display_name: Option<String>,
    /// Node name or address the volume is attached to.
    pub node: String,
}

/// Result of a successful attach.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachOutcome {
    /// Path at which the device is expected to appear.
    pub device_path: Utf8PathBuf,
    /// Instance the volume was attached to.
    pub instance_id: String,
    /// Hypervisor running the instance.
    pub hypervisor: HypervisorType,
    /// Storage fabric serving the volume.
    pub backend: BackendType,
}

/// Sequences cloud calls for attach, detach, and attachment queries.
#[derive(Debug)]
pub struct VolumeDriver<C, N> {
    cloud: C,
    resolver: N,
}

impl<C, N> VolumeDriver<C, N>
where
    C: CloudFacade + Sync,
    N: NodeResolver + Sync,
{
    /// Creates a driver over a cloud session and a node resolver.
    #[must_use]
    pub const fn new(cloud: C, resolver: N) -> Self {
        Self { cloud, resolver }
    }

    /// Returns the cloud session.
    #[must_use]
    pub const fn cloud(&self) -> &C {
        &self.cloud
    }

    const fn identity(&self) -> IdentityCorrelator<'_, C, N> {
        IdentityCorrelator::new(&self.cloud, &self.resolver)
    }

    /// Attaches a volume to the node's instance and predicts its device path.
    ///
    /// The Kubernetes volume name is merged into the volume's metadata
    /// before the attach and is not rolled back if the attach fails.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::AttachRejected`] when the cloud refuses the
    /// attach, [`DriverError::HypervisorNotFound`] when the instance's host
    /// is unknown, and the wrapped correlation, resolution, or cloud errors.
    pub async fn attach(&self, request: &AttachRequest) -> Result<AttachOutcome, DriverError> {
        let volume_id = required("volumeID", &request.volume_id)?;
        let instance = self.identity().resolve_instance_for(&request.node).await?;
        let volume = self.cloud.get_volume(volume_id).await?;

        if let Some(name) = request
            .display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
        {
            let metadata = BTreeMap::from([(
                String::from(DISPLAY_NAME_METADATA_KEY),
                name.trim().to_owned(),
            )]);
            self.cloud
                .update_volume_metadata(&volume.id, &metadata, false)
                .await?;
            debug!(volume = %volume.id, name, "recorded volume name in metadata");
        }

        let rejected = |message: String| DriverError::AttachRejected {
            volume_id: volume.id.clone(),
            instance_id: instance.id.clone(),
            message,
        };
        let accepted = self
            .cloud
            .attach_volume(&instance.id, &volume.id)
            .await
            .map_err(|err| rejected(err.to_string()))?;
        if !accepted {
            return Err(rejected(String::from("the cloud did not accept the request")));
        }
        info!(volume = %volume.id, instance = %instance.id, "volume attached");

        let (device_path, hypervisor, backend) = self.expected_device(&instance, &volume).await?;
        info!(volume = %volume.id, path = %device_path, "expected device path");
        Ok(AttachOutcome {
            device_path,
            instance_id: instance.id,
            hypervisor,
            backend,
        })
    }

    async fn expected_device(
        &self,
        instance: &ComputeInstance,
        volume: &VolumeRef,
    ) -> Result<(Utf8PathBuf, HypervisorType, BackendType), DriverError> {
        let hypervisor = self.hypervisor_of(instance).await?;
        let backend = match hypervisor {
            HypervisorType::PowerVmVios | HypervisorType::PowerVmPhyp => {
                self.backend_of(volume).await?
            }
            HypervisorType::Kvm
            | HypervisorType::Libvirt
            | HypervisorType::PowerVmKvm
            | HypervisorType::Unsupported(_) => BackendType::Unregistered,
        };
        let path = device::resolve(&hypervisor, backend, volume)?;
        Ok((path, hypervisor, backend))
    }

    async fn hypervisor_of(&self, instance: &ComputeInstance) -> Result<HypervisorType, DriverError> {
        let hostname = instance.hypervisor_hostname.as_str();
        self.cloud
            .list_hypervisors()
            .await?
            .into_iter()
            .find(|record| record.hostname == hostname)
            .map(|record| record.hypervisor_type)
            .ok_or_else(|| DriverError::HypervisorNotFound {
                hostname: hostname.to_owned(),
            })
    }

    async fn backend_of(&self, volume: &VolumeRef) -> Result<BackendType, DriverError> {
        if volume.backend_host.trim().is_empty() {
            warn!(volume = %volume.id, "volume has no backend host; assuming generic storage");
            return Ok(BackendType::Unregistered);
        }
        let registration = self
            .cloud
            .storage_backend_registration(&volume.backend_host)
            .await?;
        let backend = StorageBackendRegistration::backend_type_of(registration.as_ref());
        debug!(host = %volume.backend_host, ?backend, "storage backend");
        Ok(backend)
    }

    /// Detaches the volume carrying `volume_name` from the node's instance.
    ///
    /// The recorded volume name is left in place so the volume can be
    /// reattached elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Identity`] when the name matches zero or
    /// several volumes (no detach is attempted),
    /// [`DriverError::DetachRejected`] when the cloud refuses the detach,
    /// and the wrapped correlation errors.
    pub async fn detach(&self, volume_name: &str, node: &str) -> Result<VolumeRef, DriverError> {
        let name = required("volume name", volume_name)?;
        let identity = self.identity();
        let volume = identity.resolve_volume_by_display_name(name).await?;
        let instance = identity.resolve_instance_for(node).await?;

        let rejected = |message: String| DriverError::DetachRejected {
            volume_id: volume.id.clone(),
            instance_id: instance.id.clone(),
            message,
        };
        let accepted = self
            .cloud
            .detach_volume(&instance.id, &volume.id)
            .await
            .map_err(|err| rejected(err.to_string()))?;
        if !accepted {
            return Err(rejected(String::from("the cloud did not accept the request")));
        }
        info!(volume = %volume.id, instance = %instance.id, name, "volume detached");
        Ok(volume)
    }

    /// Reports whether the volume is attached to the node's instance. An
    /// attachment to a different instance counts as not attached.
    ///
    /// # Errors
    ///
    /// Returns the wrapped correlation or cloud errors.
    pub async fn is_attached(&self, volume_id: &str, node: &str) -> Result<bool, DriverError> {
        let id = required("volumeID", volume_id)?;
        let instance = self.identity().resolve_instance_for(node).await?;
        let attachment = self.cloud.volume_attachment(&instance.id, id).await?;
        let attached = attachment.is_some_and(|record| {
            record.server_id == instance.id && record.volume_id == id
        });
        debug!(volume = id, instance = %instance.id, attached, "attachment state");
        Ok(attached)
    }
}

fn required<'a>(name: &str, value: &'a str) -> Result<&'a str, DriverError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DriverError::MissingArgument {
            name: name.to_owned(),
        });
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests;
