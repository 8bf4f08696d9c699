//! Unit tests for the attach/detach orchestrator.

use super::*;
use crate::test_support::{CloudCall, FakeCloud, StaticResolver, volume_with_wwn};
use rstest::{fixture, rstest};
use std::net::Ipv4Addr;

fn attach_request(volume_id: &str, name: Option<&str>) -> AttachRequest {
    AttachRequest {
        volume_id: volume_id.to_owned(),
        display_name: name.map(str::to_owned),
        node: String::from("1.2.3.4"),
    }
}

#[fixture]
fn cloud() -> FakeCloud {
    FakeCloud::reference_topology()
}

fn driver(cloud: &FakeCloud) -> VolumeDriver<FakeCloud, StaticResolver> {
    VolumeDriver::new(cloud.clone(), StaticResolver::new())
}

#[rstest]
#[tokio::test]
async fn attach_on_vios_generic_predicts_wwn_path(cloud: FakeCloud) {
    let outcome = driver(&cloud)
        .attach(&attach_request("vol_1", Some("nginx-vol")))
        .await
        .expect("attach succeeds");

    assert_eq!(outcome.device_path, "/dev/disk/by-id/wwn-0xwwn_1");
    assert_eq!(outcome.instance_id, "vm_1");
    assert_eq!(outcome.hypervisor, HypervisorType::PowerVmVios);
    assert_eq!(outcome.backend, BackendType::Generic);
}

#[rstest]
#[tokio::test]
async fn attach_records_name_before_attaching(cloud: FakeCloud) {
    driver(&cloud)
        .attach(&attach_request("vol_1", Some("nginx-vol")))
        .await
        .expect("attach succeeds");

    let calls = cloud.calls();
    let update = calls
        .iter()
        .position(|call| matches!(call, CloudCall::UpdateVolumeMetadata(..)))
        .expect("metadata updated");
    let attach = calls
        .iter()
        .position(|call| matches!(call, CloudCall::AttachVolume(..)))
        .expect("attach issued");
    assert!(update < attach);

    let volume = cloud.volume("vol_1").expect("volume exists");
    assert_eq!(volume.display_name.as_deref(), Some("nginx-vol"));
    assert_eq!(volume.wwn.as_deref(), Some("wwn_1"), "merge keeps existing keys");
}

#[rstest]
#[tokio::test]
async fn attach_without_name_skips_metadata(cloud: FakeCloud) {
    driver(&cloud)
        .attach(&attach_request("vol_1", None))
        .await
        .expect("attach succeeds");

    assert!(
        !cloud
            .calls()
            .iter()
            .any(|call| matches!(call, CloudCall::UpdateVolumeMetadata(..)))
    );
}

#[rstest]
#[tokio::test]
async fn refused_attach_keeps_metadata_and_fails(cloud: FakeCloud) {
    cloud.refuse_attach();

    let err = driver(&cloud)
        .attach(&attach_request("vol_1", Some("nginx-vol")))
        .await
        .expect_err("attach refused");

    assert!(matches!(err, DriverError::AttachRejected { ref volume_id, .. } if volume_id == "vol_1"));
    assert_eq!(
        cloud.volume("vol_1").and_then(|volume| volume.display_name),
        Some(String::from("nginx-vol"))
    );
}

#[rstest]
#[tokio::test]
async fn failed_attach_is_rejected_with_cloud_message(cloud: FakeCloud) {
    cloud.fail_attach(CloudError::Provider {
        message: String::from("quota exceeded"),
    });

    let err = driver(&cloud)
        .attach(&attach_request("vol_1", None))
        .await
        .expect_err("attach fails");

    assert!(matches!(err, DriverError::AttachRejected { ref message, .. } if message.contains("quota exceeded")));
}

#[rstest]
#[case(HypervisorType::Kvm)]
#[case(HypervisorType::Libvirt)]
#[case(HypervisorType::PowerVmKvm)]
#[tokio::test]
async fn kvm_family_skips_registration_lookup(#[case] hypervisor: HypervisorType) {
    let cloud = FakeCloud::new()
        .with_instance("vm_1", "kvm_host", &[Ipv4Addr::new(1, 2, 3, 4)])
        .with_hypervisor("kvm_host", hypervisor)
        .with_volume(volume_with_wwn(
            "9ddd4949-5117-4ad8-82b2-8ab37b690078",
            "wwn_1",
            "svc",
        ));

    let outcome = driver(&cloud)
        .attach(&attach_request("9ddd4949-5117-4ad8-82b2-8ab37b690078", None))
        .await
        .expect("attach succeeds");

    assert_eq!(
        outcome.device_path,
        "/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_9ddd4949-5117-4ad8-8"
    );
    assert!(
        !cloud
            .calls()
            .iter()
            .any(|call| matches!(call, CloudCall::StorageBackendRegistration(_)))
    );
}

#[rstest]
#[case(Some(BackendType::Gpfs), "/dev/disk/by-id/wwn-0x60014059ddd494951174ad882b28ab37")]
#[case(Some(BackendType::Xiv), "/dev/disk/by-id/scsi-2abc")]
#[case(None, "/dev/disk/by-id/wwn-0xabc")]
#[tokio::test]
async fn powervm_path_follows_backend_registration(
    #[case] backend: Option<BackendType>,
    #[case] expected: &str,
) {
    let base = FakeCloud::new()
        .with_instance("vm_1", "host_1", &[Ipv4Addr::new(1, 2, 3, 4)])
        .with_hypervisor("host_1", HypervisorType::PowerVmPhyp)
        .with_volume(volume_with_wwn(
            "9ddd4949-5117-4ad8-82b2-8ab37b690080",
            "ABC",
            "storage_1",
        ));
    let cloud = match backend {
        Some(kind) => base.with_registration("storage_1", kind),
        None => base,
    };

    let outcome = driver(&cloud)
        .attach(&attach_request("9ddd4949-5117-4ad8-82b2-8ab37b690080", None))
        .await
        .expect("attach succeeds");

    assert_eq!(outcome.device_path, expected);
}

#[rstest]
#[tokio::test]
async fn unknown_hypervisor_host_fails_attach() {
    let cloud = FakeCloud::new()
        .with_instance("vm_1", "ghost", &[Ipv4Addr::new(1, 2, 3, 4)])
        .with_volume(volume_with_wwn("vol_1", "wwn_1", "svc"));

    let err = driver(&cloud)
        .attach(&attach_request("vol_1", None))
        .await
        .expect_err("hypervisor missing");

    assert_eq!(
        err,
        DriverError::HypervisorNotFound {
            hostname: String::from("ghost")
        }
    );
}

#[rstest]
#[tokio::test]
async fn blank_volume_id_is_missing_argument(cloud: FakeCloud) {
    let err = driver(&cloud)
        .attach(&attach_request("  ", None))
        .await
        .expect_err("volume id required");

    assert_eq!(
        err,
        DriverError::MissingArgument {
            name: String::from("volumeID")
        }
    );
    assert!(cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn detach_by_name_detaches_matching_volume(cloud: FakeCloud) {
    let named = cloud.with_named_volume("vol_9", "nginx-vol");

    let volume = driver(&named)
        .detach("nginx-vol", "1.2.3.4")
        .await
        .expect("detach succeeds");

    assert_eq!(volume.id, "vol_9");
    assert!(named.calls().contains(&CloudCall::DetachVolume(
        String::from("vm_1"),
        String::from("vol_9")
    )));
    assert_eq!(
        named.volume("vol_9").and_then(|vol| vol.display_name),
        Some(String::from("nginx-vol")),
        "metadata is left in place"
    );
}

#[rstest]
#[tokio::test]
async fn ambiguous_name_never_detaches(cloud: FakeCloud) {
    let named = cloud
        .with_named_volume("vol_8", "nginx-vol")
        .with_named_volume("vol_9", "nginx-vol");

    let err = driver(&named)
        .detach("nginx-vol", "1.2.3.4")
        .await
        .expect_err("ambiguous");

    assert_eq!(
        err,
        DriverError::Identity(IdentityError::AmbiguousVolume {
            name: String::from("nginx-vol"),
            count: 2
        })
    );
    assert!(!named.attach_or_detach_called());
}

#[rstest]
#[tokio::test]
async fn refused_detach_is_rejected(cloud: FakeCloud) {
    let named = cloud.with_named_volume("vol_9", "nginx-vol");
    named.refuse_detach();

    let err = driver(&named)
        .detach("nginx-vol", "1.2.3.4")
        .await
        .expect_err("refused");

    assert!(matches!(err, DriverError::DetachRejected { ref instance_id, .. } if instance_id == "vm_1"));
}

#[rstest]
#[tokio::test]
async fn is_attached_reports_own_attachment(cloud: FakeCloud) {
    let attached = cloud.with_attachment("vm_1", "vol_1");
    let result = driver(&attached)
        .is_attached("vol_1", "1.2.3.4")
        .await
        .expect("query succeeds");
    assert!(result);
}

#[rstest]
#[tokio::test]
async fn attachment_to_other_instance_is_not_attached(cloud: FakeCloud) {
    let elsewhere = cloud
        .with_instance("vm_2", "host_1", &[Ipv4Addr::new(1, 2, 3, 5)])
        .with_attachment("vm_2", "vol_1");
    let result = driver(&elsewhere)
        .is_attached("vol_1", "1.2.3.4")
        .await
        .expect("query succeeds");
    assert!(!result);
}

#[rstest]
#[tokio::test]
async fn listing_failure_surfaces_as_identity_error(cloud: FakeCloud) {
    cloud.fail_listings(CloudError::Provider {
        message: String::from("compute unavailable"),
    });

    let err = driver(&cloud)
        .is_attached("vol_1", "1.2.3.4")
        .await
        .expect_err("listing fails");

    assert!(matches!(err, DriverError::Identity(IdentityError::Cloud(_))));
}
