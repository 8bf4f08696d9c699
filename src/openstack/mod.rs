//! OpenStack implementation of the cloud facade.
//!
//! Authenticates once per invocation against Keystone v3 and then talks to
//! Nova (servers, hypervisors, volume attachments) and Cinder (volumes,
//! metadata, and the PowerVC `os-hosts` registration extension) over REST.

mod auth;
mod tls;
mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cloud::{
    CloudError, CloudFacade, CloudFuture, ComputeInstance, HypervisorRecord,
    StorageBackendRegistration, VolumeAttachment, VolumeRef,
};
use crate::config::OpenStackConfig;

pub(crate) use auth::Session;
pub use tls::{http_client, read_bundle, repair_pem};
use types::{
    AttachRequest, AttachVolumeId, AttachmentBody, HostBody, HypervisorPage, MetadataBody,
    ServerPage, VolumeBody, VolumePage, next_link,
};

/// Volume status that is waited out before a volume is returned.
pub const CREATING_STATUS: &str = "creating";

/// Polls made while a volume is still being created.
pub const DEFAULT_CREATING_POLLS: u32 = 100;

/// Delay between polls of a volume that is still being created.
pub const DEFAULT_CREATING_INTERVAL: Duration = Duration::from_secs(3);

/// Cloud facade backed by the OpenStack REST APIs.
#[derive(Clone, Debug)]
pub struct OpenStackCloud {
    http: Client,
    session: Session,
    creating_polls: u32,
    creating_interval: Duration,
}

impl OpenStackCloud {
    /// Validates the configuration, builds the HTTP client, and
    /// authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Config`] for incomplete configuration,
    /// [`CloudError::Authentication`] when Keystone rejects the credentials,
    /// and [`CloudError::MissingEndpoint`] when the catalogue lacks compute
    /// or block storage.
    pub async fn connect(config: &OpenStackConfig) -> Result<Self, CloudError> {
        config
            .validate()
            .map_err(|err| CloudError::Config(err.to_string()))?;
        let http = http_client(config)?;
        let session = auth::authenticate(&http, config).await?;
        info!("authenticated with OpenStack");
        Ok(Self::from_session(http, session))
    }

    pub(crate) const fn from_session(http: Client, session: Session) -> Self {
        Self {
            http,
            session,
            creating_polls: DEFAULT_CREATING_POLLS,
            creating_interval: DEFAULT_CREATING_INTERVAL,
        }
    }

    /// Overrides how long [`CloudFacade::get_volume`] waits for a volume in
    /// the `creating` state.
    #[must_use]
    pub const fn with_creating_wait(mut self, polls: u32, interval: Duration) -> Self {
        self.creating_polls = polls;
        self.creating_interval = interval;
        self
    }

    fn url(base: &str, segments: &[&str]) -> Result<Url, CloudError> {
        let mut url = Url::parse(base)
            .map_err(|err| CloudError::Config(format!("invalid endpoint {base}: {err}")))?;
        url.path_segments_mut()
            .map_err(|()| CloudError::Config(format!("endpoint {base} cannot carry a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn compute_url(&self, segments: &[&str]) -> Result<Url, CloudError> {
        Self::url(&self.session.compute_url, segments)
    }

    fn volume_url(&self, segments: &[&str]) -> Result<Url, CloudError> {
        Self::url(&self.session.volume_url, segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(auth::AUTH_TOKEN_HEADER, &self.session.token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Sends a request, returning `None` for 404 and an error for any other
    /// non-success status.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Option<Response>, CloudError> {
        let target = url.to_string();
        debug!(method = %method, url = %target, "openstack request");
        let builder = self.request(method.clone(), url);
        let response = match body {
            Some(json) => builder.json(&json),
            None => builder,
        }
        .send()
        .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Http {
                method: method.to_string(),
                url: target,
                status: status.as_u16(),
                message: message.trim().to_owned(),
            });
        }
        Ok(Some(response))
    }

    async fn decode<T: DeserializeOwned>(response: Response, resource: &str) -> Result<T, CloudError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|err| CloudError::Parse {
            resource: resource.to_owned(),
            message: err.to_string(),
        })
    }

    async fn get_optional<T: DeserializeOwned>(
        &self,
        url: Url,
        resource: &str,
    ) -> Result<Option<T>, CloudError> {
        match self.send(Method::GET, url, None).await? {
            Some(response) => Self::decode(response, resource).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, resource: &str) -> Result<T, CloudError> {
        let target = url.to_string();
        self.get_optional(url, resource)
            .await?
            .ok_or_else(|| CloudError::NotFound {
                resource: resource.to_owned(),
                id: target,
            })
    }

    fn to_body<B: Serialize>(body: &B, resource: &str) -> Result<serde_json::Value, CloudError> {
        serde_json::to_value(body).map_err(|err| CloudError::Parse {
            resource: resource.to_owned(),
            message: err.to_string(),
        })
    }

    fn next_page(current: &Url, links: &[types::Link]) -> Result<Option<Url>, CloudError> {
        next_link(links)
            .map(|href| {
                Url::parse(href).map_err(|err| CloudError::Parse {
                    resource: String::from("pagination link"),
                    message: err.to_string(),
                })
            })
            .transpose()
            .map(|next| next.filter(|url| url != current))
    }

    async fn fetch_volume(&self, volume_id: &str) -> Result<VolumeRef, CloudError> {
        let body: Option<VolumeBody> = self
            .get_optional(self.volume_url(&["volumes", volume_id])?, "volume")
            .await?;
        body.map(|found| VolumeRef::from(found.volume))
            .ok_or_else(|| CloudError::NotFound {
                resource: String::from("volume"),
                id: volume_id.to_owned(),
            })
    }

    async fn wait_until_created(&self, volume_id: &str) -> Result<VolumeRef, CloudError> {
        let mut attempt = 1;
        loop {
            let volume = self.fetch_volume(volume_id).await?;
            if volume.status != CREATING_STATUS || attempt >= self.creating_polls {
                return Ok(volume);
            }
            debug!(volume_id, attempt, "volume still creating");
            attempt += 1;
            sleep(self.creating_interval).await;
        }
    }

    async fn volumes_with_metadata(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<VolumeRef>, CloudError> {
        let filter = serde_json::to_string(&BTreeMap::from([(key, value)])).map_err(|err| {
            CloudError::Parse {
                resource: String::from("metadata filter"),
                message: err.to_string(),
            }
        })?;
        let mut url = self.volume_url(&["volumes", "detail"])?;
        url.query_pairs_mut().append_pair("metadata", &filter);

        let mut volumes = Vec::new();
        let mut next = Some(url);
        while let Some(page_url) = next {
            let page: VolumePage = self.get_json(page_url.clone(), "volume list").await?;
            next = Self::next_page(&page_url, &page.volumes_links)?;
            volumes.extend(page.volumes.into_iter().map(VolumeRef::from));
        }
        // Older Cinder releases ignore unknown filters, so recheck the match.
        volumes.retain(|volume| volume.metadata.get(key).map(String::as_str) == Some(value));
        Ok(volumes)
    }

    async fn write_metadata(
        &self,
        volume_id: &str,
        metadata: &BTreeMap<String, String>,
        delete: bool,
    ) -> Result<(), CloudError> {
        if delete {
            for key in metadata.keys() {
                let url = self.volume_url(&["volumes", volume_id, "metadata", key])?;
                if self.send(Method::DELETE, url, None).await?.is_none() {
                    debug!(volume_id, key = %key, "metadata key already absent");
                }
            }
            return Ok(());
        }
        let url = self.volume_url(&["volumes", volume_id, "metadata"])?;
        let body = Self::to_body(&MetadataBody { metadata }, "volume metadata")?;
        self.send(Method::POST, url, Some(body))
            .await?
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound {
                resource: String::from("volume"),
                id: volume_id.to_owned(),
            })
    }

    async fn servers(&self) -> Result<Vec<ComputeInstance>, CloudError> {
        let mut instances = Vec::new();
        let mut next = Some(self.compute_url(&["servers", "detail"])?);
        while let Some(page_url) = next {
            let page: ServerPage = self.get_json(page_url.clone(), "server list").await?;
            next = Self::next_page(&page_url, &page.servers_links)?;
            instances.extend(page.servers.into_iter().map(ComputeInstance::from));
        }
        Ok(instances)
    }

    async fn hypervisors(&self) -> Result<Vec<HypervisorRecord>, CloudError> {
        let mut hosts = Vec::new();
        let mut next = Some(self.compute_url(&["os-hypervisors", "detail"])?);
        while let Some(page_url) = next {
            let page: HypervisorPage = self.get_json(page_url.clone(), "hypervisor list").await?;
            next = Self::next_page(&page_url, &page.hypervisors_links)?;
            hosts.extend(page.hypervisors.into_iter().map(HypervisorRecord::from));
        }
        Ok(hosts)
    }

    async fn attach(&self, instance_id: &str, volume_id: &str) -> Result<bool, CloudError> {
        let url = self.compute_url(&["servers", instance_id, "os-volume_attachments"])?;
        let body = Self::to_body(
            &AttachRequest {
                volume_attachment: AttachVolumeId { volume_id },
            },
            "volume attachment",
        )?;
        let accepted = self.send(Method::POST, url, Some(body)).await?.is_some();
        info!(instance_id, volume_id, accepted, "attach requested");
        Ok(accepted)
    }

    async fn detach(&self, instance_id: &str, volume_id: &str) -> Result<bool, CloudError> {
        let url =
            self.compute_url(&["servers", instance_id, "os-volume_attachments", volume_id])?;
        let accepted = self.send(Method::DELETE, url, None).await?.is_some();
        info!(instance_id, volume_id, accepted, "detach requested");
        Ok(accepted)
    }

    async fn attachment(
        &self,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<Option<VolumeAttachment>, CloudError> {
        let url =
            self.compute_url(&["servers", instance_id, "os-volume_attachments", volume_id])?;
        let body: Option<AttachmentBody> = self.get_optional(url, "volume attachment").await?;
        Ok(body.map(|found| VolumeAttachment::from(found.volume_attachment)))
    }

    async fn registration(
        &self,
        backend_host: &str,
    ) -> Result<Option<StorageBackendRegistration>, CloudError> {
        let url = self.volume_url(&["os-hosts", backend_host])?;
        let body: Option<HostBody> = self.get_optional(url, "storage host").await?;
        Ok(body.and_then(|host| host.into_registration(backend_host)))
    }
}

impl CloudFacade for OpenStackCloud {
    fn get_volume<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, VolumeRef> {
        Box::pin(self.wait_until_created(volume_id))
    }

    fn find_volumes_by_metadata<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> CloudFuture<'a, Vec<VolumeRef>> {
        Box::pin(self.volumes_with_metadata(key, value))
    }

    fn update_volume_metadata<'a>(
        &'a self,
        volume_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
        delete: bool,
    ) -> CloudFuture<'a, ()> {
        Box::pin(self.write_metadata(volume_id, metadata, delete))
    }

    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, bool> {
        Box::pin(self.attach(instance_id, volume_id))
    }

    fn detach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, bool> {
        Box::pin(self.detach(instance_id, volume_id))
    }

    fn volume_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<VolumeAttachment>> {
        Box::pin(self.attachment(instance_id, volume_id))
    }

    fn list_instances(&self) -> CloudFuture<'_, Vec<ComputeInstance>> {
        Box::pin(self.servers())
    }

    fn list_hypervisors(&self) -> CloudFuture<'_, Vec<HypervisorRecord>> {
        Box::pin(self.hypervisors())
    }

    fn storage_backend_registration<'a>(
        &'a self,
        backend_host: &'a str,
    ) -> CloudFuture<'a, Option<StorageBackendRegistration>> {
        Box::pin(self.registration(backend_host))
    }
}
