//! Maps Kubernetes node names to compute instances and volume names back to
//! cloud volume identifiers.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;

use thiserror::Error;
use tracing::debug;

use crate::cloud::{CloudError, CloudFacade, ComputeInstance, DISPLAY_NAME_METADATA_KEY, VolumeRef};

/// Node as named by the orchestrator together with the IPv4 address it
/// resolved to for this invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRef {
    /// Hostname or address passed on the command line.
    pub logical_name: String,
    /// IPv4 address used to match the node to an instance port.
    pub resolved_address: Ipv4Addr,
}

/// Errors raised while correlating nodes and volumes with cloud records.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// Raised when a hostname has no IPv4 address.
    #[error("node {node} does not resolve to an IPv4 address")]
    UnresolvableAddress {
        /// Node name that was looked up.
        node: String,
    },
    /// Raised when no instance owns the node's address.
    #[error("no compute instance owns address {address}")]
    NodeNotFound {
        /// Address that was matched against instance ports.
        address: Ipv4Addr,
    },
    /// Raised when several instance ports share the node's address.
    #[error("{count} instance ports match address {address}")]
    AmbiguousNode {
        /// Address that matched more than once.
        address: Ipv4Addr,
        /// Number of matching ports.
        count: usize,
    },
    /// Raised when no volume carries the requested name.
    #[error("no volume carries the name {name}")]
    VolumeNotFound {
        /// Volume name that was looked up.
        name: String,
    },
    /// Raised when several volumes carry the requested name.
    #[error("{count} volumes carry the name {name}; refusing to pick one")]
    AmbiguousVolume {
        /// Volume name that matched more than once.
        name: String,
        /// Number of matching volumes.
        count: usize,
    },
    /// Wrapper for cloud facade failures.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Future returned by [`NodeResolver::lookup`].
pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;

/// Forward name lookup used to turn node hostnames into addresses.
pub trait NodeResolver {
    /// Returns every address `host` resolves to.
    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a>;
}

/// Resolver backed by the system resolver through tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsResolver;

impl NodeResolver for DnsResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Correlates orchestrator-level names with cloud records.
#[derive(Debug)]
pub struct IdentityCorrelator<'a, C, N> {
    cloud: &'a C,
    resolver: &'a N,
}

impl<'a, C, N> IdentityCorrelator<'a, C, N>
where
    C: CloudFacade + Sync,
    N: NodeResolver + Sync,
{
    /// Creates a correlator over the given cloud and resolver.
    #[must_use]
    pub const fn new(cloud: &'a C, resolver: &'a N) -> Self {
        Self { cloud, resolver }
    }

    /// Resolves a node name to an IPv4 address. Literal IPv4 addresses pass
    /// through unchanged; anything else goes through a forward lookup and
    /// takes the first IPv4 result.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnresolvableAddress`] when the lookup fails
    /// or yields no IPv4 address.
    pub async fn resolve_node(&self, node: &str) -> Result<NodeRef, IdentityError> {
        let name = node.trim();
        if let Ok(address) = name.parse::<Ipv4Addr>() {
            return Ok(NodeRef {
                logical_name: name.to_owned(),
                resolved_address: address,
            });
        }

        let unresolvable = || IdentityError::UnresolvableAddress {
            node: name.to_owned(),
        };
        let candidates = self.resolver.lookup(name).await.map_err(|err| {
            debug!(node = name, error = %err, "node lookup failed");
            unresolvable()
        })?;
        let address = candidates
            .into_iter()
            .find_map(|candidate| match candidate {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(unresolvable)?;
        debug!(node = name, %address, "resolved node address");
        Ok(NodeRef {
            logical_name: name.to_owned(),
            resolved_address: address,
        })
    }

    /// Finds the single compute instance whose network port owns the node's
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NodeNotFound`] when no port matches,
    /// [`IdentityError::AmbiguousNode`] when several do, and
    /// [`IdentityError::Cloud`] when the instance listing fails.
    pub async fn resolve_instance(&self, node: &NodeRef) -> Result<ComputeInstance, IdentityError> {
        let address = node.resolved_address;
        let instances = self.cloud.list_instances().await?;
        let mut matches = instances.into_iter().flat_map(|instance| {
            let ports = instance
                .addresses
                .iter()
                .filter(|candidate| **candidate == address)
                .count();
            std::iter::repeat_n(instance, ports)
        });

        let Some(found) = matches.next() else {
            return Err(IdentityError::NodeNotFound { address });
        };
        let extra = matches.count();
        if extra > 0 {
            return Err(IdentityError::AmbiguousNode {
                address,
                count: extra + 1,
            });
        }
        debug!(node = %node.logical_name, instance = %found.id, "matched node to instance");
        Ok(found)
    }

    /// Resolves a node name all the way to its compute instance.
    ///
    /// # Errors
    ///
    /// Propagates the failures of [`Self::resolve_node`] and
    /// [`Self::resolve_instance`].
    pub async fn resolve_instance_for(&self, node: &str) -> Result<ComputeInstance, IdentityError> {
        let node_ref = self.resolve_node(node).await?;
        self.resolve_instance(&node_ref).await
    }

    /// Finds the single volume whose metadata carries `name` as its
    /// Kubernetes volume name.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::VolumeNotFound`] when no volume matches,
    /// [`IdentityError::AmbiguousVolume`] when several do, and
    /// [`IdentityError::Cloud`] when the lookup fails.
    pub async fn resolve_volume_by_display_name(
        &self,
        name: &str,
    ) -> Result<VolumeRef, IdentityError> {
        let mut volumes = self
            .cloud
            .find_volumes_by_metadata(DISPLAY_NAME_METADATA_KEY, name)
            .await?;
        match volumes.len() {
            0 => Err(IdentityError::VolumeNotFound {
                name: name.to_owned(),
            }),
            1 => volumes.pop().ok_or_else(|| IdentityError::VolumeNotFound {
                name: name.to_owned(),
            }),
            count => Err(IdentityError::AmbiguousVolume {
                name: name.to_owned(),
                count,
            }),
        }
    }
}
