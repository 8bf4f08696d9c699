//! Shared fixtures for volume BDD scenarios.

use flexvol::DriverConfig;
use flexvol::DriverResponse;
use flexvol::test_support::{FakeCloud, ScriptedRunner};
use rstest::fixture;

/// Name the driver binary is installed under on the node.
pub const BINARY: &str = "ibm-volume-flex";

#[derive(Clone, Debug)]
pub struct VolumeContext {
    pub cloud: FakeCloud,
    pub runner: ScriptedRunner,
    pub config: DriverConfig,
    pub response: Option<DriverResponse>,
}

#[fixture]
pub fn volume_context() -> VolumeContext {
    VolumeContext {
        cloud: FakeCloud::new(),
        runner: ScriptedRunner::new(),
        config: DriverConfig {
            openshift_plugin_dir: String::from("/nonexistent/openshift/plugins"),
            discovery_max_attempts: 1,
            discovery_interval_secs: 0,
            sudo_bin: String::new(),
            ..DriverConfig::default()
        },
        response: None,
    }
}
