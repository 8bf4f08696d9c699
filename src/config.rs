//! Configuration loading via `ortho-config`.
//!
//! Two structures are loaded from the same layered sources: [`OpenStackConfig`]
//! carries the cloud credentials under the conventional `OS_*` environment
//! names, and [`DriverConfig`] carries node-local settings under `FLEXVOL_*`.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::command::SudoRunner;
use crate::discovery::{DeviceLayout, PollPolicy};

/// Name of the layered configuration file.
pub const CONFIG_FILE_NAME: &str = "flexvol.toml";

/// Prefix used when the binary name does not carry one.
pub const DEFAULT_DRIVER_PREFIX: &str = "power-openstack-k8s";

/// Suffix shared by every installed driver binary.
pub const DRIVER_SUFFIX: &str = "-volume-flex";

/// Kubelet's plugin directory on stock Kubernetes nodes.
pub const DEFAULT_KUBELET_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins";

/// Kubelet's plugin directory on OpenShift nodes.
pub const DEFAULT_OPENSHIFT_PLUGIN_DIR: &str = "/var/lib/origin/openshift.local.volumes/plugins";

const FLEXVOLUME_VENDOR_DIR: &str = "kubernetes.io/flexvolume/ibm";

/// OpenStack credentials and endpoint selection.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OS",
    discovery(
        app_name = "flexvol",
        env_var = "FLEXVOL_CONFIG_PATH",
        config_file_name = "flexvol.toml",
        dotfile_name = ".flexvol.toml",
        project_file_name = "flexvol.toml"
    )
)]
pub struct OpenStackConfig {
    /// Keystone v3 endpoint, for example `https://cloud:5000/v3`.
    pub auth_url: Option<String>,
    /// User to authenticate as.
    pub username: Option<String>,
    /// Password for [`Self::username`].
    pub password: Option<String>,
    /// Domain owning the user.
    #[ortho_config(default = "Default".to_owned())]
    pub user_domain_name: String,
    /// Domain owning the project.
    #[ortho_config(default = "Default".to_owned())]
    pub project_domain_name: String,
    /// Project name to scope the token to.
    pub tenant_name: Option<String>,
    /// Project identifier; preferred over the name when both are set.
    pub tenant_id: Option<String>,
    /// Region used to filter the service catalogue.
    pub region_name: Option<String>,
    /// Catalogue interface (`public`, `internal` or `admin`).
    #[ortho_config(default = "public".to_owned())]
    pub endpoint_interface: String,
    /// PEM bundle used to verify the endpoints (`OS_CACERT`).
    ///
    /// When unset or blank, server certificates are NOT verified: the HTTP
    /// client accepts any certificate and logs a warning naming the auth URL.
    /// Set this for any deployment reachable over an untrusted network.
    pub cacert: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn require_field<'a>(
    value: Option<&'a str>,
    metadata: &FieldMetadata,
) -> Result<&'a str, ConfigError> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| metadata.missing())
}

impl OpenStackConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flexvol")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on the credentials. Error messages name
    /// the environment variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            self.auth_url.as_deref(),
            &FieldMetadata::new("Keystone endpoint", "OS_AUTH_URL", "auth_url"),
        )?;
        require_field(
            self.username.as_deref(),
            &FieldMetadata::new("OpenStack user", "OS_USERNAME", "username"),
        )?;
        require_field(
            self.password.as_deref(),
            &FieldMetadata::new("OpenStack password", "OS_PASSWORD", "password"),
        )?;
        if self.project_id().is_none() {
            require_field(
                self.tenant_name.as_deref(),
                &FieldMetadata::new(
                    "OpenStack project",
                    "OS_TENANT_NAME or OS_TENANT_ID",
                    "tenant_name",
                ),
            )?;
        }
        Ok(())
    }

    /// Returns the non-blank project identifier.
    #[must_use]
    pub fn project_id(&self) -> Option<&str> {
        self.tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Returns the non-blank CA bundle path.
    #[must_use]
    pub fn cacert_path(&self) -> Option<&Utf8Path> {
        self.cacert
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(Utf8Path::new)
    }
}

/// Node-local driver settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLEXVOL",
    discovery(
        app_name = "flexvol",
        env_var = "FLEXVOL_CONFIG_PATH",
        config_file_name = "flexvol.toml",
        dotfile_name = ".flexvol.toml",
        project_file_name = "flexvol.toml"
    )
)]
pub struct DriverConfig {
    /// Driver prefix used when the binary name does not end in
    /// `-volume-flex`.
    #[ortho_config(default = DEFAULT_DRIVER_PREFIX.to_owned())]
    pub driver_prefix: String,
    /// Kubelet plugin directory.
    #[ortho_config(default = DEFAULT_KUBELET_PLUGIN_DIR.to_owned())]
    pub kubelet_plugin_dir: String,
    /// OpenShift plugin directory, preferred when it exists.
    #[ortho_config(default = DEFAULT_OPENSHIFT_PLUGIN_DIR.to_owned())]
    pub openshift_plugin_dir: String,
    /// Number of discovery attempts before giving up on a device.
    #[ortho_config(default = 24)]
    pub discovery_max_attempts: u32,
    /// Seconds to wait before each discovery attempt.
    #[ortho_config(default = 5)]
    pub discovery_interval_secs: u64,
    /// Root of the sysfs mount.
    #[ortho_config(default = "/sys".to_owned())]
    pub sysfs_root: String,
    /// Root of the device tree.
    #[ortho_config(default = "/dev".to_owned())]
    pub dev_root: String,
    /// Privilege wrapper for system commands; empty runs them directly.
    #[ortho_config(default = "/usr/bin/sudo".to_owned())]
    pub sudo_bin: String,
    /// Log file; defaults to `/var/log/<binary>.log`.
    pub log_file: Option<String>,
    /// Default log filter when `FLEXVOL_LOG` is unset.
    #[ortho_config(default = "warn".to_owned())]
    pub log_level: String,
    /// Whether `unmountdevice` flushes multipath maps and removes the SCSI
    /// devices behind them.
    #[ortho_config(default = true)]
    pub cleanup_devices_on_unmount: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_prefix: DEFAULT_DRIVER_PREFIX.to_owned(),
            kubelet_plugin_dir: DEFAULT_KUBELET_PLUGIN_DIR.to_owned(),
            openshift_plugin_dir: DEFAULT_OPENSHIFT_PLUGIN_DIR.to_owned(),
            discovery_max_attempts: crate::discovery::DEFAULT_MAX_ATTEMPTS,
            discovery_interval_secs: crate::discovery::DEFAULT_INTERVAL.as_secs(),
            sysfs_root: String::from("/sys"),
            dev_root: String::from("/dev"),
            sudo_bin: String::from("/usr/bin/sudo"),
            log_file: None,
            log_level: String::from("warn"),
            cleanup_devices_on_unmount: true,
        }
    }
}

impl DriverConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flexvol")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Poll policy for device discovery.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.discovery_max_attempts,
            Duration::from_secs(self.discovery_interval_secs),
        )
    }

    /// Locations of sysfs and the device tree.
    #[must_use]
    pub fn layout(&self) -> DeviceLayout {
        DeviceLayout {
            sysfs_root: Utf8PathBuf::from(&self.sysfs_root),
            dev_root: Utf8PathBuf::from(&self.dev_root),
        }
    }

    /// Wraps `runner` so system commands go through the configured
    /// privilege helper.
    #[must_use]
    pub fn host_runner<R>(&self, runner: R) -> SudoRunner<R> {
        SudoRunner::new(runner, &self.sudo_bin)
    }

    /// Kubelet plugin directory, preferring OpenShift's when it exists.
    #[must_use]
    pub fn plugin_dir(&self) -> Utf8PathBuf {
        let openshift = Utf8Path::new(&self.openshift_plugin_dir);
        if openshift.is_dir() {
            openshift.to_path_buf()
        } else {
            Utf8PathBuf::from(&self.kubelet_plugin_dir)
        }
    }

    /// Driver prefix for a binary name: the part before `-volume-flex`, or the
    /// configured prefix when the name does not follow that pattern.
    #[must_use]
    pub fn driver_prefix_for<'a>(&'a self, binary_name: &'a str) -> &'a str {
        binary_name
            .strip_suffix(DRIVER_SUFFIX)
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(&self.driver_prefix)
    }

    /// Directory holding the per-volume global mount points.
    #[must_use]
    pub fn global_mounts_dir(&self, prefix: &str) -> Utf8PathBuf {
        self.plugin_dir()
            .join(FLEXVOLUME_VENDOR_DIR)
            .join(format!("{prefix}{DRIVER_SUFFIX}"))
            .join("mounts")
    }

    /// Log file for a binary name.
    #[must_use]
    pub fn log_file_for(&self, binary_name: &str) -> Utf8PathBuf {
        self.log_file
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map_or_else(
                || Utf8PathBuf::from(format!("/var/log/{binary_name}.log")),
                Utf8PathBuf::from,
            )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
