//! Core library for the `flexvol` FlexVolume driver.
//!
//! The kubelet runs the driver binary once per volume operation. The crate
//! correlates a Kubernetes node with its OpenStack virtual machine, attaches
//! or detaches Cinder volumes through the compute API, discovers the guest
//! block device that appears afterwards, and formats and mounts it. Every
//! invocation ends with a single JSON response on stdout.

pub mod cli;
pub mod cloud;
pub mod command;
pub mod config;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod flex;
pub mod identity;
pub mod logging;
pub mod mount;
pub mod openstack;
pub mod protocol;
pub mod test_support;

pub use cloud::{CloudError, CloudFacade, CloudFuture};
pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner, SudoRunner};
pub use config::{ConfigError, DriverConfig, OpenStackConfig};
pub use discovery::{DeviceDiscoverer, PollPolicy};
pub use driver::{AttachRequest, DriverError, VolumeDriver};
pub use flex::{
    Connector, FlexDriver, FlexError, Invocation, OpenStackConnector, Operation, binary_name,
    parse_invocation,
};
pub use identity::{DnsResolver, NodeResolver};
pub use mount::{MountError, MountExecutor};
pub use openstack::OpenStackCloud;
pub use protocol::{DriverResponse, FlexOptions, Status};
