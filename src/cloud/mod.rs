//! Cloud facade consumed by the attach/detach core.
//!
//! The driver never talks to a REST API directly; it goes through
//! [`CloudFacade`], which the OpenStack client implements and tests replace
//! with an in-memory fake.

mod error;
mod types;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

pub use error::CloudError;
pub use types::{
    BackendType, ComputeInstance, DISPLAY_NAME_METADATA_KEY, HypervisorRecord, HypervisorType,
    StorageBackendRegistration, VolumeAttachment, VolumeRef, WWN_METADATA_KEY,
};

/// Future returned by cloud facade operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Operations the driver needs from the compute and block-storage services.
pub trait CloudFacade {
    /// Fetches a single volume by identifier.
    fn get_volume<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, VolumeRef>;

    /// Lists volumes whose metadata maps `key` to `value`.
    fn find_volumes_by_metadata<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> CloudFuture<'a, Vec<VolumeRef>>;

    /// Merges `metadata` into the volume's metadata, or removes the listed
    /// keys when `delete` is set.
    fn update_volume_metadata<'a>(
        &'a self,
        volume_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
        delete: bool,
    ) -> CloudFuture<'a, ()>;

    /// Attaches a volume to an instance, returning whether the cloud
    /// accepted the request.
    fn attach_volume<'a>(&'a self, instance_id: &'a str, volume_id: &'a str)
    -> CloudFuture<'a, bool>;

    /// Detaches a volume from an instance, returning whether the cloud
    /// accepted the request.
    fn detach_volume<'a>(&'a self, instance_id: &'a str, volume_id: &'a str)
    -> CloudFuture<'a, bool>;

    /// Looks up the attachment record of `volume_id` on `instance_id`.
    fn volume_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<VolumeAttachment>>;

    /// Lists every compute instance visible to the project.
    fn list_instances(&self) -> CloudFuture<'_, Vec<ComputeInstance>>;

    /// Lists every hypervisor host.
    fn list_hypervisors(&self) -> CloudFuture<'_, Vec<HypervisorRecord>>;

    /// Looks up the storage registration of a backend host; `None` when the
    /// host has no registration.
    fn storage_backend_registration<'a>(
        &'a self,
        backend_host: &'a str,
    ) -> CloudFuture<'a, Option<StorageBackendRegistration>>;
}
