//! FlexVolume wire types: the JSON options blob kubelet passes in and the
//! single JSON object the driver prints back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message used by every successful operation.
pub const SUCCESS_MESSAGE: &str = "Operation Success";

/// Filesystem created when the options do not name one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

const READ_ONLY: &str = "ro";

/// Outcome reported in the `status` field.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Status {
    /// Operation completed.
    #[serde(rename = "Success")]
    Success,
    /// Operation failed; `message` explains why.
    #[serde(rename = "Failed")]
    Failed,
    /// Operation is not implemented by this driver.
    #[serde(rename = "Not supported")]
    NotSupported,
}

/// Response printed to stdout for every invocation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DriverResponse {
    /// Operation outcome.
    pub status: Status,
    /// Human readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Device path for `attach` and `waitforattach`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Unique volume name for `getvolumename`.
    #[serde(
        default,
        rename = "volumeName",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_name: Option<String>,
    /// Attachment state for `isattached`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached: Option<bool>,
    /// Driver capabilities for `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeMap<String, bool>>,
}

impl DriverResponse {
    const fn with_status(status: Status, message: Option<String>) -> Self {
        Self {
            status,
            message,
            device: None,
            volume_name: None,
            attached: None,
            capabilities: None,
        }
    }

    /// Successful response carrying [`SUCCESS_MESSAGE`].
    #[must_use]
    pub fn success() -> Self {
        Self::with_status(Status::Success, Some(String::from(SUCCESS_MESSAGE)))
    }

    /// Successful response with a custom message.
    #[must_use]
    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self::with_status(Status::Success, Some(message.into()))
    }

    /// Failed response.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::with_status(Status::Failed, Some(message.into()))
    }

    /// Response for operations the driver does not implement.
    #[must_use]
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::with_status(Status::NotSupported, Some(message.into()))
    }

    /// Sets the device path.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Sets the volume name.
    #[must_use]
    pub fn with_volume_name(mut self, name: impl Into<String>) -> Self {
        self.volume_name = Some(name.into());
        self
    }

    /// Sets the attachment state.
    #[must_use]
    pub const fn with_attached(mut self, attached: bool) -> Self {
        self.attached = Some(attached);
        self
    }

    /// Sets a capability flag.
    #[must_use]
    pub fn with_capability(mut self, name: &str, enabled: bool) -> Self {
        self.capabilities
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_owned(), enabled);
        self
    }

    /// Renders the response as a single line of JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| String::from(r#"{"status":"Failed"}"#))
    }
}

/// Errors raised while decoding the options blob.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    /// Raised when the options are not a JSON object of strings.
    #[error("invalid JSON options: {message}")]
    InvalidOptions {
        /// Decoder error message.
        message: String,
    },
}

/// Options kubelet passes as the JSON argument.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FlexOptions {
    /// Cloud volume identifier.
    #[serde(rename = "volumeID")]
    pub volume_id: Option<String>,
    /// World-wide name supplied by the provisioner.
    pub wwn: Option<String>,
    /// Driver-specific read/write override (`ro` or `rw`).
    #[serde(rename = "actualReadWrite")]
    pub actual_read_write: Option<String>,
    /// Filesystem type to create and mount.
    #[serde(rename = "kubernetes.io/fsType")]
    pub fs_type: Option<String>,
    /// Access mode requested by kubelet (`ro` or `rw`).
    #[serde(rename = "kubernetes.io/readwrite")]
    pub read_write: Option<String>,
    /// Persistent volume or inline volume name.
    #[serde(rename = "kubernetes.io/pvOrVolumeName")]
    pub pv_or_volume_name: Option<String>,
    /// Group ownership requested for the mount.
    #[serde(rename = "kubernetes.io/fsGroup")]
    pub fs_group: Option<String>,
    /// Kubelet's mounts directory for the volume.
    #[serde(rename = "kubernetes.io/mountsDir")]
    pub mounts_dir: Option<String>,
    /// Remaining keys, such as secret references.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FlexOptions {
    /// Decodes the options blob.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidOptions`] when `raw` is not a JSON
    /// object with string values for the known keys.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|err| ProtocolError::InvalidOptions {
            message: err.to_string(),
        })
    }

    /// Decodes an optional options blob, treating absence as empty options.
    ///
    /// # Errors
    ///
    /// See [`Self::parse`].
    pub fn parse_optional(raw: Option<&str>) -> Result<Self, ProtocolError> {
        raw.filter(|text| !text.trim().is_empty())
            .map_or_else(|| Ok(Self::default()), Self::parse)
    }

    /// Returns the volume identifier, or an empty string when absent.
    #[must_use]
    pub fn volume_id(&self) -> &str {
        self.volume_id.as_deref().unwrap_or_default()
    }

    /// Returns the requested filesystem type, defaulting to ext4.
    #[must_use]
    pub fn fs_type(&self) -> &str {
        self.fs_type
            .as_deref()
            .map(str::trim)
            .filter(|fs| !fs.is_empty())
            .unwrap_or(DEFAULT_FS_TYPE)
    }

    /// Returns `true` when either access flag asks for a read-only mount.
    #[must_use]
    pub fn read_only(&self) -> bool {
        [&self.read_write, &self.actual_read_write]
            .into_iter()
            .any(|flag| flag.as_deref().map(str::trim) == Some(READ_ONLY))
    }

    /// Returns the non-blank Kubernetes volume name.
    #[must_use]
    pub fn volume_name(&self) -> Option<&str> {
        self.pv_or_volume_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
