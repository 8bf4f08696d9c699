//! Unit tests for operation parsing and dispatch.

use super::*;
use crate::protocol::Status;
use crate::test_support::{CloudCall, FakeCloud, FakeConnector, ScriptedRunner, StaticResolver};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const BINARY: &str = "ibm-volume-flex";
const GLOBAL_MOUNTS: &str =
    "/var/lib/kubelet/plugins/kubernetes.io/flexvolume/ibm/ibm-volume-flex/mounts";

fn config() -> DriverConfig {
    DriverConfig {
        openshift_plugin_dir: String::from("/nonexistent/openshift/plugins"),
        discovery_max_attempts: 2,
        discovery_interval_secs: 0,
        sudo_bin: String::new(),
        ..DriverConfig::default()
    }
}

struct Harness {
    cloud: FakeCloud,
    connector: FakeConnector,
    runner: ScriptedRunner,
    driver: FlexDriver<FakeConnector, ScriptedRunner, StaticResolver>,
}

fn harness_with(connector: FakeConnector, cloud: FakeCloud, config: DriverConfig) -> Harness {
    let runner = ScriptedRunner::new();
    let driver = FlexDriver::new(
        connector.clone(),
        runner.clone(),
        StaticResolver::new(),
        config,
        BINARY,
    );
    Harness {
        cloud,
        connector,
        runner,
        driver,
    }
}

#[fixture]
fn harness() -> Harness {
    let cloud = FakeCloud::reference_topology();
    harness_with(FakeConnector::new(cloud.clone()), cloud, config())
}

fn run(args: &[&str]) -> Operation {
    let argv = std::iter::once(BINARY).chain(args.iter().copied());
    match parse_invocation(argv) {
        Invocation::Run(operation) => operation,
        other => panic!("expected an operation, got {other:?}"),
    }
}

fn respond(args: &[&str]) -> DriverResponse {
    let argv = std::iter::once(BINARY).chain(args.iter().copied());
    match parse_invocation(argv) {
        Invocation::Respond(response) => response,
        other => panic!("expected a response, got {other:?}"),
    }
}

#[test]
fn attach_arguments_decode_options() {
    let operation = run(&["attach", r#"{"volumeID":"vol_1"}"#, "node-1"]);
    let Operation::Attach { options, node } = operation else {
        panic!("expected attach");
    };
    assert_eq!(options.volume_id(), "vol_1");
    assert_eq!(node, "node-1");
}

#[test]
fn unknown_operation_is_not_supported() {
    let response = respond(&["expandvolume", "{}"]);
    assert_eq!(response.status, Status::NotSupported);
}

#[rstest]
#[case(&["attach", "{}"])]
#[case(&["detach", "vol", "node", "extra"])]
fn wrong_arity_fails(#[case] args: &[&str]) {
    let response = respond(args);
    assert_eq!(response.status, Status::Failed);
    assert!(response.message.is_some_and(|message| !message.is_empty()));
}

#[test]
fn malformed_options_fail() {
    let response = respond(&["attach", "{not json", "node-1"]);
    assert_eq!(response.status, Status::Failed);
    assert!(
        response
            .message
            .is_some_and(|message| message.contains("invalid JSON options"))
    );
}

#[test]
fn help_is_passed_through() {
    let argv = [BINARY, "--help"];
    assert!(matches!(parse_invocation(argv), Invocation::Help(_)));
}

#[rstest]
#[case(Some("/usr/libexec/kubernetes/ibm-volume-flex"), "ibm-volume-flex")]
#[case(Some("flexvol"), "flexvol")]
#[case(None, "flexvol")]
fn binary_name_is_the_file_name(#[case] argv0: Option<&str>, #[case] expected: &str) {
    let arg = argv0.map(OsString::from);
    assert_eq!(binary_name(arg.as_ref()), expected);
}

#[test]
fn prefix_comes_from_binary_name() {
    let driver = harness().driver;
    assert_eq!(driver.driver_prefix(), "ibm");
    assert_eq!(driver.global_mounts_dir(), GLOBAL_MOUNTS);
}

#[test]
fn prefix_falls_back_to_configuration() {
    let cloud = FakeCloud::new();
    let driver = FlexDriver::new(
        FakeConnector::new(cloud),
        ScriptedRunner::new(),
        StaticResolver::new(),
        config(),
        "flexvol",
    );
    assert_eq!(driver.driver_prefix(), "power-openstack-k8s");
}

#[rstest]
#[tokio::test]
async fn init_reports_attach_capability_without_cloud(harness: Harness) {
    let response = harness.driver.dispatch(Operation::Init).await;
    assert_eq!(
        response.to_json(),
        r#"{"status":"Success","message":"Operation Success","capabilities":{"attach":true}}"#
    );
    assert_eq!(harness.connector.connects(), 0);
}

#[rstest]
#[tokio::test]
async fn getvolumename_echoes_volume_id(harness: Harness) {
    let response = harness
        .driver
        .dispatch(run(&["getvolumename", r#"{"volumeID":"vol_1"}"#]))
        .await;
    assert_eq!(response.volume_name.as_deref(), Some("vol_1"));
    assert_eq!(harness.connector.connects(), 0);
}

#[rstest]
#[tokio::test]
async fn getvolumename_without_id_fails(harness: Harness) {
    let response = harness.driver.dispatch(run(&["getvolumename", "{}"])).await;
    assert_eq!(response.status, Status::Failed);
    assert_eq!(response.message.as_deref(), Some("volumeID is required"));
}

#[rstest]
#[tokio::test]
async fn attach_returns_predicted_device(harness: Harness) {
    let response = harness
        .driver
        .dispatch(run(&[
            "attach",
            r#"{"volumeID":"vol_1","kubernetes.io/pvOrVolumeName":"nginx-vol"}"#,
            "1.2.3.4",
        ]))
        .await;

    assert_eq!(response.status, Status::Success);
    assert_eq!(response.device.as_deref(), Some("/dev/disk/by-id/wwn-0xwwn_1"));
    assert_eq!(harness.connector.connects(), 1);
    assert_eq!(
        harness.cloud.volume("vol_1").and_then(|volume| volume.display_name),
        Some(String::from("nginx-vol"))
    );
}

#[tokio::test]
async fn failed_session_becomes_failed_response() {
    let harness = harness_with(
        FakeConnector::failing(CloudError::Authentication {
            message: String::from("401 bad password"),
        }),
        FakeCloud::new(),
        config(),
    );

    let response = harness
        .driver
        .dispatch(run(&["isattached", r#"{"volumeID":"vol_1"}"#, "1.2.3.4"]))
        .await;

    assert_eq!(response.status, Status::Failed);
    assert!(
        response
            .message
            .is_some_and(|message| message.contains("cannot open cloud session"))
    );
}

fn harness_over(cloud: FakeCloud) -> Harness {
    harness_with(FakeConnector::new(cloud.clone()), cloud, config())
}

#[tokio::test]
async fn isattached_reports_state() {
    let harness = harness_over(FakeCloud::reference_topology().with_attachment("vm_1", "vol_1"));

    let response = harness
        .driver
        .dispatch(run(&["isattached", r#"{"volumeID":"vol_1"}"#, "1.2.3.4"]))
        .await;

    assert_eq!(response.status, Status::Success);
    assert_eq!(response.attached, Some(true));
}

#[tokio::test]
async fn ambiguous_detach_fails_without_detaching() {
    let harness = harness_over(
        FakeCloud::reference_topology()
            .with_named_volume("vol_8", "nginx-vol")
            .with_named_volume("vol_9", "nginx-vol"),
    );

    let response = harness
        .driver
        .dispatch(run(&["detach", "nginx-vol", "1.2.3.4"]))
        .await;

    assert_eq!(response.status, Status::Failed);
    assert!(!harness.cloud.attach_or_detach_called());
}

#[tokio::test]
async fn detach_by_name_succeeds() {
    let harness =
        harness_over(FakeCloud::reference_topology().with_named_volume("vol_9", "nginx-vol"));

    let response = harness
        .driver
        .dispatch(run(&["detach", "nginx-vol", "1.2.3.4"]))
        .await;

    assert_eq!(response, DriverResponse::success());
    assert!(harness.cloud.calls().contains(&CloudCall::DetachVolume(
        String::from("vm_1"),
        String::from("vol_9")
    )));
}

#[tokio::test]
async fn waitforattach_reports_present_device() {
    let tmp = TempDir::new().expect("tempdir");
    let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir: {}", path.display()));
    std::fs::create_dir_all(root.join("sys/class/scsi_host")).expect("sysfs");
    std::fs::create_dir_all(root.join("dev/disk/by-id")).expect("dev");
    let device = root.join("dev/disk/by-id/wwn-0xwwn_1");
    std::fs::write(&device, "").expect("device node");
    let cloud = FakeCloud::new();
    let harness = harness_with(
        FakeConnector::new(cloud.clone()),
        cloud,
        DriverConfig {
            sysfs_root: root.join("sys").into_string(),
            dev_root: root.join("dev").into_string(),
            ..config()
        },
    );
    harness.runner.push_success();
    harness.runner.push_success();

    let response = harness
        .driver
        .dispatch(Operation::WaitForAttach {
            device: device.to_string(),
        })
        .await;

    assert_eq!(response.status, Status::Success);
    assert_eq!(response.device.as_deref(), Some(device.as_str()));
    assert_eq!(harness.connector.connects(), 0);
}

#[rstest]
#[tokio::test]
async fn mount_binds_from_global_mounts_dir(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_success();

    let response = harness
        .driver
        .dispatch(run(&[
            "mount",
            "/pods/abc/volumes/nginx",
            r#"{"kubernetes.io/pvOrVolumeName":"nginx-vol"}"#,
        ]))
        .await;

    assert_eq!(response.status, Status::Success);
    assert_eq!(
        harness.runner.command_strings().last().cloned(),
        Some(format!(
            "/bin/mount --bind {GLOBAL_MOUNTS}/nginx-vol /pods/abc/volumes/nginx"
        ))
    );
}

#[rstest]
#[tokio::test]
async fn unmount_names_directory(harness: Harness) {
    harness.runner.push_success();

    let response = harness
        .driver
        .dispatch(run(&["unmount", "/pods/abc/volumes/nginx"]))
        .await;

    assert_eq!(
        response.message.as_deref(),
        Some("Unmounted volume directory /pods/abc/volumes/nginx")
    );
}

#[rstest]
#[tokio::test]
async fn waitfordetach_is_a_no_op(harness: Harness) {
    let response = harness
        .driver
        .dispatch(run(&["waitfordetach", "/dev/dm-3"]))
        .await;
    assert_eq!(response, DriverResponse::success());
    assert!(harness.runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_mount_command_becomes_failed_response(harness: Harness) {
    harness.runner.push_stdout("");
    harness.runner.push_failure(1);

    let response = harness
        .driver
        .dispatch(run(&["mountdevice", "/mnt/global/vol", "/dev/dm-3", "{}"]))
        .await;

    assert_eq!(response.status, Status::Failed);
    assert!(
        response
            .message
            .is_some_and(|message| message.contains("mkfs.ext4"))
    );
}
