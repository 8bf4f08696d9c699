//! BDD scenarios for attach and detach.

use rstest_bdd_macros::scenario;

use super::test_helpers::{VolumeContext, volume_context};

#[scenario(
    path = "tests/features/volume.feature",
    name = "Attach a volume to a PowerVM guest"
)]
fn scenario_attach(volume_context: VolumeContext) {
    drop(volume_context);
}

#[scenario(
    path = "tests/features/volume.feature",
    name = "Reject an attach to an unknown node"
)]
fn scenario_attach_unknown_node(volume_context: VolumeContext) {
    drop(volume_context);
}

#[scenario(
    path = "tests/features/volume.feature",
    name = "Detach a uniquely named volume"
)]
fn scenario_detach(volume_context: VolumeContext) {
    drop(volume_context);
}

#[scenario(
    path = "tests/features/volume.feature",
    name = "Refuse to detach an ambiguous volume name"
)]
fn scenario_detach_ambiguous(volume_context: VolumeContext) {
    drop(volume_context);
}
