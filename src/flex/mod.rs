//! FlexVolume entry point: turns a kubelet invocation into core calls and
//! always yields a [`DriverResponse`].

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use clap::error::ErrorKind;
use thiserror::Error;
use tracing::{error, info};

use crate::cli::Cli;
use crate::cloud::{CloudError, CloudFacade, CloudFuture};
use crate::command::CommandRunner;
use crate::config::{DriverConfig, OpenStackConfig};
use crate::discovery::{DeviceDiscoverer, DiscoveryError};
use crate::driver::{AttachRequest, DriverError, VolumeDriver};
use crate::identity::NodeResolver;
use crate::mount::{MountError, MountExecutor};
use crate::openstack::OpenStackCloud;
use crate::protocol::{DriverResponse, FlexOptions, ProtocolError};

/// A parsed driver operation with decoded options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Report capabilities.
    Init,
    /// Return the unique volume name.
    GetVolumeName {
        /// Decoded options.
        options: FlexOptions,
    },
    /// Query whether the volume is attached to the node.
    IsAttached {
        /// Decoded options.
        options: FlexOptions,
        /// Node name or address.
        node: String,
    },
    /// Attach the volume to the node.
    Attach {
        /// Decoded options.
        options: FlexOptions,
        /// Node name or address.
        node: String,
    },
    /// Wait for the attached device to appear.
    WaitForAttach {
        /// Device path predicted by `attach`.
        device: String,
    },
    /// Format and mount the device at the global mount path.
    MountDevice {
        /// Global mount path.
        mount_path: String,
        /// Device path.
        device: String,
        /// Decoded options.
        options: FlexOptions,
    },
    /// Bind mount into the pod directory.
    Mount {
        /// Pod mount directory.
        mount_dir: String,
        /// Decoded options.
        options: FlexOptions,
    },
    /// Detach the named volume from the node.
    Detach {
        /// Kubernetes volume name.
        volume_name: String,
        /// Node name or address.
        node: String,
    },
    /// Wait for the device to go away.
    WaitForDetach {
        /// Device path.
        device: String,
    },
    /// Unmount the global mount path and release the device.
    UnmountDevice {
        /// Global mount path.
        mount_path: String,
    },
    /// Unmount the pod bind mount.
    Unmount {
        /// Pod mount directory.
        mount_dir: String,
    },
}

impl Operation {
    /// Operation name as kubelet spells it.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::GetVolumeName { .. } => "getvolumename",
            Self::IsAttached { .. } => "isattached",
            Self::Attach { .. } => "attach",
            Self::WaitForAttach { .. } => "waitforattach",
            Self::MountDevice { .. } => "mountdevice",
            Self::Mount { .. } => "mount",
            Self::Detach { .. } => "detach",
            Self::WaitForDetach { .. } => "waitfordetach",
            Self::UnmountDevice { .. } => "unmountdevice",
            Self::Unmount { .. } => "unmount",
        }
    }

    /// Returns `true` for operations that need a cloud session.
    #[must_use]
    pub const fn needs_cloud(&self) -> bool {
        matches!(
            self,
            Self::IsAttached { .. } | Self::Attach { .. } | Self::Detach { .. }
        )
    }
}

impl TryFrom<Cli> for Operation {
    type Error = ProtocolError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        Ok(match cli {
            Cli::Init => Self::Init,
            Cli::GetVolumeName { json } => Self::GetVolumeName {
                options: FlexOptions::parse_optional(json.as_deref())?,
            },
            Cli::IsAttached { json, node } => Self::IsAttached {
                options: FlexOptions::parse(&json)?,
                node,
            },
            Cli::Attach { json, node } => Self::Attach {
                options: FlexOptions::parse(&json)?,
                node,
            },
            Cli::WaitForAttach { device, .. } => Self::WaitForAttach { device },
            Cli::MountDevice {
                mount_path,
                device,
                json,
            } => Self::MountDevice {
                mount_path,
                device,
                options: FlexOptions::parse_optional(json.as_deref())?,
            },
            Cli::Mount { mount_dir, json } => Self::Mount {
                mount_dir,
                options: FlexOptions::parse_optional(json.as_deref())?,
            },
            Cli::Detach { volume_name, node } => Self::Detach { volume_name, node },
            Cli::WaitForDetach { device } => Self::WaitForDetach { device },
            Cli::UnmountDevice { mount_path } => Self::UnmountDevice { mount_path },
            Cli::Unmount { mount_dir } => Self::Unmount { mount_dir },
        })
    }
}

/// What the binary should do with its arguments.
#[derive(Debug)]
pub enum Invocation {
    /// Run the operation.
    Run(Operation),
    /// Print this response without running anything.
    Respond(DriverResponse),
    /// Print clap's help or version text.
    Help(clap::Error),
}

fn first_line(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error: ")
        .to_owned()
}

/// Parses the process arguments. Unknown operations yield a
/// `Not supported` response; malformed arguments yield `Failed`.
pub fn parse_invocation<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => match Operation::try_from(cli) {
            Ok(operation) => Invocation::Run(operation),
            Err(err) => Invocation::Respond(DriverResponse::failure(err.to_string())),
        },
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp
            | ErrorKind::DisplayVersion
            | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => Invocation::Help(err),
            ErrorKind::InvalidSubcommand => {
                Invocation::Respond(DriverResponse::not_supported(first_line(&err)))
            }
            _ => Invocation::Respond(DriverResponse::failure(first_line(&err))),
        },
    }
}

/// Returns the file name the driver was invoked as.
#[must_use]
pub fn binary_name(argv0: Option<&OsString>) -> String {
    argv0
        .and_then(|arg| arg.to_str())
        .and_then(|path| Utf8Path::new(path).file_name())
        .unwrap_or("flexvol")
        .to_owned()
}

/// Opens a cloud session on demand.
pub trait Connector {
    /// Session type handed to the orchestrator.
    type Cloud: CloudFacade + Sync;

    /// Authenticates and returns a session.
    fn connect(&self) -> CloudFuture<'_, Self::Cloud>;
}

/// [`Connector`] for OpenStack. Configuration is loaded on first use so that
/// node-local operations never need credentials.
#[derive(Clone, Debug, Default)]
pub struct OpenStackConnector {
    config: Option<OpenStackConfig>,
}

impl OpenStackConnector {
    /// Connector that loads `OS_*` configuration when a session is needed.
    #[must_use]
    pub const fn from_environment() -> Self {
        Self { config: None }
    }

    /// Connector using an explicit configuration.
    #[must_use]
    pub const fn with_config(config: OpenStackConfig) -> Self {
        Self {
            config: Some(config),
        }
    }
}

impl Connector for OpenStackConnector {
    type Cloud = OpenStackCloud;

    fn connect(&self) -> CloudFuture<'_, Self::Cloud> {
        Box::pin(async move {
            let config = match &self.config {
                Some(config) => config.clone(),
                None => OpenStackConfig::load_without_cli_args()
                    .map_err(|err| CloudError::Config(err.to_string()))?,
            };
            OpenStackCloud::connect(&config).await
        })
    }
}

/// Failures surfaced as `Failed` responses.
#[derive(Debug, Error)]
pub enum FlexError {
    /// Options could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The cloud session could not be opened.
    #[error("cannot open cloud session: {0}")]
    Connect(CloudError),
    /// Attach, detach, or query failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// The device never appeared.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// A mount step failed.
    #[error(transparent)]
    Mount(#[from] MountError),
    /// A required option was blank.
    #[error("{name} is required")]
    MissingArgument {
        /// Option name.
        name: &'static str,
    },
}

/// Dispatches operations to the orchestrator, the poller, and the mount
/// executor.
#[derive(Clone, Debug)]
pub struct FlexDriver<K, R, N> {
    connector: K,
    runner: R,
    resolver: N,
    config: DriverConfig,
    driver_prefix: String,
}

impl<K, R, N> FlexDriver<K, R, N>
where
    K: Connector + Sync,
    R: CommandRunner + Clone,
    N: NodeResolver + Clone + Sync,
{
    /// Creates a driver for the binary invoked as `binary_name`.
    #[must_use]
    pub fn new(connector: K, runner: R, resolver: N, config: DriverConfig, binary_name: &str) -> Self {
        let driver_prefix = config.driver_prefix_for(binary_name).to_owned();
        Self {
            connector,
            runner,
            resolver,
            config,
            driver_prefix,
        }
    }

    /// Driver prefix derived from the binary name or configuration.
    #[must_use]
    pub fn driver_prefix(&self) -> &str {
        &self.driver_prefix
    }

    /// Directory holding the per-volume global mount points.
    #[must_use]
    pub fn global_mounts_dir(&self) -> Utf8PathBuf {
        self.config.global_mounts_dir(&self.driver_prefix)
    }

    /// Runs `operation`, converting every failure into a `Failed` response.
    pub async fn dispatch(&self, operation: Operation) -> DriverResponse {
        let name = operation.name();
        info!(operation = name, "dispatching");
        match self.execute(operation).await {
            Ok(response) => response,
            Err(err) => {
                error!(operation = name, error = %err, "operation failed");
                DriverResponse::failure(err.to_string())
            }
        }
    }

    async fn volume_driver(&self) -> Result<VolumeDriver<K::Cloud, N>, FlexError> {
        let cloud = self.connector.connect().await.map_err(FlexError::Connect)?;
        Ok(VolumeDriver::new(cloud, self.resolver.clone()))
    }

    fn discoverer(&self) -> DeviceDiscoverer<R> {
        DeviceDiscoverer::new(
            self.config.host_runner(self.runner.clone()),
            self.config.poll_policy(),
            self.config.layout(),
        )
    }

    fn executor(&self) -> MountExecutor<R> {
        MountExecutor::new(
            self.config.host_runner(self.runner.clone()),
            self.config.layout(),
            self.global_mounts_dir(),
        )
        .with_device_cleanup(self.config.cleanup_devices_on_unmount)
    }

    async fn execute(&self, operation: Operation) -> Result<DriverResponse, FlexError> {
        match operation {
            Operation::Init => Ok(DriverResponse::success().with_capability("attach", true)),
            Operation::GetVolumeName { options } => {
                let volume_id = options.volume_id().trim();
                if volume_id.is_empty() {
                    return Err(FlexError::MissingArgument { name: "volumeID" });
                }
                Ok(DriverResponse::success().with_volume_name(volume_id))
            }
            Operation::IsAttached { options, node } => {
                let attached = self
                    .volume_driver()
                    .await?
                    .is_attached(options.volume_id(), &node)
                    .await?;
                Ok(DriverResponse::success().with_attached(attached))
            }
            Operation::Attach { options, node } => {
                let request = AttachRequest {
                    volume_id: options.volume_id().to_owned(),
                    display_name: options.volume_name().map(str::to_owned),
                    node,
                };
                let outcome = self.volume_driver().await?.attach(&request).await?;
                Ok(DriverResponse::success().with_device(outcome.device_path.into_string()))
            }
            Operation::WaitForAttach { device } => {
                let descriptor = self
                    .discoverer()
                    .wait_for_attach(Utf8Path::new(&device))
                    .await?;
                Ok(DriverResponse::success().with_device(descriptor.device_path().as_str()))
            }
            Operation::MountDevice {
                mount_path,
                device,
                options,
            } => {
                self.executor().mount_device(
                    Utf8Path::new(&mount_path),
                    Utf8Path::new(&device),
                    &options,
                )?;
                Ok(DriverResponse::success())
            }
            Operation::Mount { mount_dir, options } => {
                self.executor().mount(Utf8Path::new(&mount_dir), &options)?;
                Ok(DriverResponse::success())
            }
            Operation::Detach { volume_name, node } => {
                self.volume_driver()
                    .await?
                    .detach(&volume_name, &node)
                    .await?;
                Ok(DriverResponse::success())
            }
            Operation::WaitForDetach { .. } => Ok(DriverResponse::success()),
            Operation::UnmountDevice { mount_path } => {
                self.executor().unmount_device(Utf8Path::new(&mount_path))?;
                Ok(DriverResponse::success())
            }
            Operation::Unmount { mount_dir } => {
                self.executor().unmount(Utf8Path::new(&mount_dir))?;
                Ok(DriverResponse::success_with_message(format!(
                    "Unmounted volume directory {mount_dir}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests;
