//! BDD step definitions for attach and detach.

use flexvol::test_support::{CloudCall, FakeConnector, StaticResolver};
use flexvol::{DriverResponse, FlexDriver, Invocation, parse_invocation};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{BINARY, VolumeContext};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn dispatch(volume_context: VolumeContext, args: &[&str]) -> Result<VolumeContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let argv = std::iter::once(BINARY).chain(args.iter().copied());
    let operation = match parse_invocation(argv) {
        Invocation::Run(operation) => operation,
        other => {
            return Err(StepError::Assertion(format!(
                "expected a runnable operation, got {other:?}"
            )));
        }
    };

    let driver = FlexDriver::new(
        FakeConnector::new(volume_context.cloud.clone()),
        volume_context.runner.clone(),
        StaticResolver::new(),
        volume_context.config.clone(),
        BINARY,
    );
    let response = runtime.block_on(driver.dispatch(operation));

    Ok(VolumeContext {
        response: Some(response),
        ..volume_context
    })
}

fn response(volume_context: &VolumeContext) -> Result<&DriverResponse, StepError> {
    volume_context
        .response
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("no operation was dispatched")))
}

#[given("the reference PowerVM topology")]
fn reference_topology(mut volume_context: VolumeContext) -> VolumeContext {
    volume_context.cloud = flexvol::test_support::FakeCloud::reference_topology();
    volume_context
}

#[given("volume \"{id}\" is named \"{name}\"")]
fn named_volume(mut volume_context: VolumeContext, id: String, name: String) -> VolumeContext {
    volume_context.cloud = volume_context.cloud.with_named_volume(&id, &name);
    volume_context
}

#[when("the kubelet attaches volume \"{id}\" named \"{name}\" to node \"{node}\"")]
fn attach(
    volume_context: VolumeContext,
    id: String,
    name: String,
    node: String,
) -> Result<VolumeContext, StepError> {
    let options = serde_json::json!({
        "volumeID": id,
        "kubernetes.io/pvOrVolumeName": name,
    })
    .to_string();
    dispatch(volume_context, &["attach", &options, &node])
}

#[when("the kubelet detaches \"{name}\" from node \"{node}\"")]
fn detach(
    volume_context: VolumeContext,
    name: String,
    node: String,
) -> Result<VolumeContext, StepError> {
    dispatch(volume_context, &["detach", &name, &node])
}

#[then("the response status is \"{status}\"")]
fn response_status(volume_context: &VolumeContext, status: String) -> Result<(), StepError> {
    let actual = response(volume_context)?;
    let rendered = serde_json::to_value(&actual.status)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if rendered == serde_json::Value::String(status.clone()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected status {status}, got {}",
            actual.to_json()
        )))
    }
}

#[then("the response device is \"{device}\"")]
fn response_device(volume_context: &VolumeContext, device: String) -> Result<(), StepError> {
    let actual = response(volume_context)?;
    if actual.device.as_deref() == Some(device.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected device {device}, got {}",
            actual.to_json()
        )))
    }
}

#[then("volume \"{id}\" carries the Kubernetes name \"{name}\"")]
fn volume_named(volume_context: &VolumeContext, id: String, name: String) -> Result<(), StepError> {
    let display_name = volume_context
        .cloud
        .volume(&id)
        .and_then(|volume| volume.display_name);
    if display_name.as_deref() == Some(name.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected volume {id} to be named {name}, got {display_name:?}"
        )))
    }
}

#[then("volume \"{id}\" was detached from instance \"{instance}\"")]
fn volume_detached(
    volume_context: &VolumeContext,
    id: String,
    instance: String,
) -> Result<(), StepError> {
    let expected = CloudCall::DetachVolume(instance, id);
    let calls = volume_context.cloud.calls();
    if calls.contains(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?} among {calls:?}"
        )))
    }
}

#[then("no attach or detach request reached the cloud")]
fn no_attach_or_detach(volume_context: &VolumeContext) -> Result<(), StepError> {
    if volume_context.cloud.attach_or_detach_called() {
        Err(StepError::Assertion(format!(
            "unexpected attach or detach among {:?}",
            volume_context.cloud.calls()
        )))
    } else {
        Ok(())
    }
}
