//! Unit tests for credential validation and driver settings.

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use flexvol::config::{ConfigError, DEFAULT_DRIVER_PREFIX};
use flexvol::{DriverConfig, OpenStackConfig};
use rstest::*;
use tempfile::TempDir;

#[fixture]
fn valid_config() -> OpenStackConfig {
    OpenStackConfig {
        auth_url: Some(String::from("https://keystone.example:5000/v3")),
        username: Some(String::from("admin")),
        password: Some(String::from("secret")),
        user_domain_name: String::from("Default"),
        project_domain_name: String::from("Default"),
        tenant_name: Some(String::from("ibm-default")),
        tenant_id: None,
        region_name: None,
        endpoint_interface: String::from("public"),
        cacert: None,
    }
}

fn temp_root(tmp: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()))
}

#[rstest]
fn complete_credentials_validate(valid_config: OpenStackConfig) {
    valid_config
        .validate()
        .unwrap_or_else(|err| panic!("valid credentials: {err}"));
}

#[rstest]
fn missing_auth_url_names_env_var_and_key(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        auth_url: None,
        ..valid_config
    };

    let error = cfg.validate().expect_err("auth_url is required");
    let ConfigError::MissingField(ref message) = error else {
        panic!("expected MissingField error");
    };
    assert!(message.contains("OS_AUTH_URL"), "env var: {message}");
    assert!(message.contains("flexvol.toml"), "config file: {message}");
    assert!(message.contains("auth_url"), "TOML key: {message}");
}

/// Each required credential produces an error naming where to set it.
#[rstest]
#[case::username(|cfg: &mut OpenStackConfig| cfg.username = None, "OS_USERNAME", "username")]
#[case::blank_username(
    |cfg: &mut OpenStackConfig| cfg.username = Some(String::from("  ")),
    "OS_USERNAME",
    "username"
)]
#[case::password(|cfg: &mut OpenStackConfig| cfg.password = None, "OS_PASSWORD", "password")]
#[case::project(
    |cfg: &mut OpenStackConfig| cfg.tenant_name = None,
    "OS_TENANT_NAME",
    "tenant_name"
)]
fn missing_credentials_are_actionable(
    valid_config: OpenStackConfig,
    #[case] mutate: fn(&mut OpenStackConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut cfg = valid_config;
    mutate(&mut cfg);

    let message = cfg
        .validate()
        .expect_err("validation should fail")
        .to_string();
    assert!(message.contains(env_var), "env var {env_var}: {message}");
    assert!(message.contains("flexvol.toml"), "config file: {message}");
    assert!(message.contains(toml_key), "TOML key {toml_key}: {message}");
}

#[rstest]
fn project_id_replaces_project_name(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        tenant_name: None,
        tenant_id: Some(String::from(" b3f1 ")),
        ..valid_config
    };

    cfg.validate()
        .unwrap_or_else(|err| panic!("project id suffices: {err}"));
    assert_eq!(cfg.project_id(), Some("b3f1"));
}

#[rstest]
fn blank_cacert_means_no_bundle(valid_config: OpenStackConfig) {
    let cfg = OpenStackConfig {
        cacert: Some(String::from("   ")),
        ..valid_config
    };
    assert_eq!(cfg.cacert_path(), None);
}

#[rstest]
#[case("ibm-volume-flex", "ibm")]
#[case("flexvol", DEFAULT_DRIVER_PREFIX)]
#[case("-volume-flex", DEFAULT_DRIVER_PREFIX)]
fn driver_prefix_follows_binary_name(#[case] binary: &str, #[case] expected: &str) {
    let cfg = DriverConfig::default();
    assert_eq!(cfg.driver_prefix_for(binary), expected);
}

#[test]
fn global_mounts_prefer_existing_openshift_dir() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = temp_root(&tmp);
    Dir::open_ambient_dir(&root, ambient_authority())
        .unwrap_or_else(|err| panic!("open temp dir: {err}"))
        .create_dir_all("openshift/plugins")
        .unwrap_or_else(|err| panic!("create plugin dir: {err}"));

    let cfg = DriverConfig {
        openshift_plugin_dir: root.join("openshift/plugins").into_string(),
        ..DriverConfig::default()
    };

    assert_eq!(
        cfg.global_mounts_dir("ibm"),
        root.join("openshift/plugins/kubernetes.io/flexvolume/ibm/ibm-volume-flex/mounts")
    );
}

#[test]
fn global_mounts_fall_back_to_kubelet_dir() {
    let cfg = DriverConfig {
        openshift_plugin_dir: String::from("/nonexistent/openshift/plugins"),
        ..DriverConfig::default()
    };

    assert_eq!(
        cfg.global_mounts_dir("power-openstack-k8s"),
        "/var/lib/kubelet/plugins/kubernetes.io/flexvolume/ibm/power-openstack-k8s-volume-flex/mounts"
    );
}

#[rstest]
#[case(None, "/var/log/ibm-volume-flex.log")]
#[case(Some(""), "/var/log/ibm-volume-flex.log")]
#[case(Some("/tmp/driver.log"), "/tmp/driver.log")]
fn log_file_defaults_to_binary_name(#[case] configured: Option<&str>, #[case] expected: &str) {
    let cfg = DriverConfig {
        log_file: configured.map(str::to_owned),
        ..DriverConfig::default()
    };
    assert_eq!(cfg.log_file_for("ibm-volume-flex"), expected);
}

#[tokio::test]
async fn driver_settings_load_from_environment() {
    let _guard = flexvol::test_support::EnvGuard::set_vars(&[
        ("FLEXVOL_DISCOVERY_MAX_ATTEMPTS", "3"),
        ("FLEXVOL_SUDO_BIN", "/bin/doas"),
    ])
    .await;

    let cfg = DriverConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("driver config loads: {err}"));

    assert_eq!(cfg.discovery_max_attempts, 3);
    assert_eq!(cfg.sudo_bin, "/bin/doas");
    assert_eq!(cfg.dev_root, "/dev");
}

#[tokio::test]
async fn credentials_load_from_environment() {
    let _guard = flexvol::test_support::EnvGuard::set_vars(&[
        ("OS_AUTH_URL", "https://keystone.example:5000/v3"),
        ("OS_USERNAME", "admin"),
        ("OS_PASSWORD", "secret"),
        ("OS_TENANT_NAME", "ibm-default"),
    ])
    .await;

    let cfg = OpenStackConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("credentials load: {err}"));

    assert_eq!(cfg.auth_url.as_deref(), Some("https://keystone.example:5000/v3"));
    assert_eq!(cfg.user_domain_name, "Default");
    assert_eq!(cfg.endpoint_interface, "public");
    cfg.validate()
        .unwrap_or_else(|err| panic!("loaded credentials validate: {err}"));
}
