//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::cloud::{
    BackendType, CloudError, CloudFacade, CloudFuture, ComputeInstance, DISPLAY_NAME_METADATA_KEY,
    HypervisorRecord, HypervisorType, StorageBackendRegistration, VolumeAttachment, VolumeRef,
    WWN_METADATA_KEY,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::flex::Connector;
use crate::identity::{LookupFuture, NodeResolver};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns the invocations rendered with [`CommandInvocation::command_string`].
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with captured stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Call recorded by [`FakeCloud`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloudCall {
    /// `get_volume(volume_id)`.
    GetVolume(String),
    /// `find_volumes_by_metadata(key, value)`.
    FindVolumesByMetadata(String, String),
    /// `update_volume_metadata(volume_id, metadata, delete)`.
    UpdateVolumeMetadata(String, BTreeMap<String, String>, bool),
    /// `attach_volume(instance_id, volume_id)`.
    AttachVolume(String, String),
    /// `detach_volume(instance_id, volume_id)`.
    DetachVolume(String, String),
    /// `volume_attachment(instance_id, volume_id)`.
    VolumeAttachment(String, String),
    /// `list_instances()`.
    ListInstances,
    /// `list_hypervisors()`.
    ListHypervisors,
    /// `storage_backend_registration(backend_host)`.
    StorageBackendRegistration(String),
}

/// Scripted result for attach and detach calls.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
enum Verdict {
    #[default]
    Accept,
    Refuse,
    Fail(CloudError),
}

#[derive(Debug, Default)]
struct FakeCloudState {
    volumes: Vec<VolumeRef>,
    instances: Vec<ComputeInstance>,
    hypervisors: Vec<HypervisorRecord>,
    registrations: BTreeMap<String, StorageBackendRegistration>,
    attachments: Vec<VolumeAttachment>,
    attach: Verdict,
    detach: Verdict,
    list_error: Option<CloudError>,
    calls: Vec<CloudCall>,
}

/// In-memory [`CloudFacade`] seeded through builder methods.
///
/// Clones share state so tests can keep a handle for assertions after
/// moving the fake into a driver.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<StdMutex<FakeCloudState>>,
}

impl FakeCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the reference topology: instance `vm_1` at `1.2.3.4` on the
    /// PowerVM host `host_1`, and volume `vol_1` with WWN `wwn_1` served by
    /// the registered SVC backend `svc`.
    #[must_use]
    pub fn reference_topology() -> Self {
        Self::new()
            .with_instance("vm_1", "host_1", &[Ipv4Addr::new(1, 2, 3, 4)])
            .with_hypervisor("host_1", HypervisorType::PowerVmVios)
            .with_volume(volume_with_wwn("vol_1", "wwn_1", "svc"))
            .with_registration("svc", BackendType::Generic)
    }

    fn with_state(self, apply: impl FnOnce(&mut FakeCloudState)) -> Self {
        apply(&mut self.lock());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeCloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a volume.
    #[must_use]
    pub fn with_volume(self, volume: VolumeRef) -> Self {
        self.with_state(|state| state.volumes.push(volume))
    }

    /// Adds a volume whose metadata carries `name` as its Kubernetes name.
    #[must_use]
    pub fn with_named_volume(self, id: &str, name: &str) -> Self {
        let metadata = BTreeMap::from([(String::from(DISPLAY_NAME_METADATA_KEY), name.to_owned())]);
        self.with_volume(VolumeRef::from_metadata(id, "svc", "available", metadata))
    }

    /// Adds an instance.
    #[must_use]
    pub fn with_instance(self, id: &str, hypervisor_hostname: &str, addresses: &[Ipv4Addr]) -> Self {
        let instance = ComputeInstance {
            id: id.to_owned(),
            hypervisor_hostname: hypervisor_hostname.to_owned(),
            addresses: addresses.to_vec(),
        };
        self.with_state(|state| state.instances.push(instance))
    }

    /// Adds a hypervisor record.
    #[must_use]
    pub fn with_hypervisor(self, hostname: &str, hypervisor_type: HypervisorType) -> Self {
        let record = HypervisorRecord {
            hostname: hostname.to_owned(),
            hypervisor_type,
        };
        self.with_state(|state| state.hypervisors.push(record))
    }

    /// Registers a storage backend host.
    #[must_use]
    pub fn with_registration(self, backend_host: &str, backend_type: BackendType) -> Self {
        let registration = StorageBackendRegistration {
            backend_host: backend_host.to_owned(),
            backend_type,
        };
        self.with_state(|state| {
            state
                .registrations
                .insert(backend_host.to_owned(), registration);
        })
    }

    /// Records an existing attachment.
    #[must_use]
    pub fn with_attachment(self, instance_id: &str, volume_id: &str) -> Self {
        let attachment = VolumeAttachment {
            server_id: instance_id.to_owned(),
            volume_id: volume_id.to_owned(),
            device: None,
        };
        self.with_state(|state| state.attachments.push(attachment))
    }

    /// Makes attach return `false`.
    pub fn refuse_attach(&self) {
        self.lock().attach = Verdict::Refuse;
    }

    /// Makes attach fail with `error`.
    pub fn fail_attach(&self, error: CloudError) {
        self.lock().attach = Verdict::Fail(error);
    }

    /// Makes detach return `false`.
    pub fn refuse_detach(&self) {
        self.lock().detach = Verdict::Refuse;
    }

    /// Makes detach fail with `error`.
    pub fn fail_detach(&self, error: CloudError) {
        self.lock().detach = Verdict::Fail(error);
    }

    /// Makes instance and hypervisor listings fail with `error`.
    pub fn fail_listings(&self, error: CloudError) {
        self.lock().list_error = Some(error);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    /// Returns `true` when any attach or detach call was made.
    #[must_use]
    pub fn attach_or_detach_called(&self) -> bool {
        self.lock()
            .calls
            .iter()
            .any(|call| matches!(call, CloudCall::AttachVolume(..) | CloudCall::DetachVolume(..)))
    }

    /// Returns the current state of a volume.
    #[must_use]
    pub fn volume(&self, id: &str) -> Option<VolumeRef> {
        self.lock().volumes.iter().find(|volume| volume.id == id).cloned()
    }

    /// Returns the current attachment records.
    #[must_use]
    pub fn attachments(&self) -> Vec<VolumeAttachment> {
        self.lock().attachments.clone()
    }

    fn record(&self, call: CloudCall) -> std::sync::MutexGuard<'_, FakeCloudState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

/// Builds a volume whose metadata carries a WWN.
#[must_use]
pub fn volume_with_wwn(id: &str, wwn: &str, backend_host: &str) -> VolumeRef {
    let metadata = BTreeMap::from([(String::from(WWN_METADATA_KEY), wwn.to_owned())]);
    VolumeRef::from_metadata(id, backend_host, "available", metadata)
}

impl CloudFacade for FakeCloud {
    fn get_volume<'a>(&'a self, volume_id: &'a str) -> CloudFuture<'a, VolumeRef> {
        let state = self.record(CloudCall::GetVolume(volume_id.to_owned()));
        let found = state
            .volumes
            .iter()
            .find(|volume| volume.id == volume_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound {
                resource: String::from("volume"),
                id: volume_id.to_owned(),
            });
        drop(state);
        Box::pin(async move { found })
    }

    fn find_volumes_by_metadata<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> CloudFuture<'a, Vec<VolumeRef>> {
        let state = self.record(CloudCall::FindVolumesByMetadata(
            key.to_owned(),
            value.to_owned(),
        ));
        let matches = state
            .volumes
            .iter()
            .filter(|volume| volume.metadata.get(key).is_some_and(|found| found == value))
            .cloned()
            .collect();
        drop(state);
        Box::pin(async move { Ok(matches) })
    }

    fn update_volume_metadata<'a>(
        &'a self,
        volume_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
        delete: bool,
    ) -> CloudFuture<'a, ()> {
        let mut state = self.record(CloudCall::UpdateVolumeMetadata(
            volume_id.to_owned(),
            metadata.clone(),
            delete,
        ));
        let result = match state.volumes.iter_mut().find(|volume| volume.id == volume_id) {
            Some(volume) => {
                let mut merged = volume.metadata.clone();
                for (key, value) in metadata {
                    if delete {
                        merged.remove(key);
                    } else {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                *volume = VolumeRef::from_metadata(
                    volume.id.clone(),
                    volume.backend_host.clone(),
                    volume.status.clone(),
                    merged,
                );
                Ok(())
            }
            None => Err(CloudError::NotFound {
                resource: String::from("volume"),
                id: volume_id.to_owned(),
            }),
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, bool> {
        let mut state = self.record(CloudCall::AttachVolume(
            instance_id.to_owned(),
            volume_id.to_owned(),
        ));
        let result = match state.attach.clone() {
            Verdict::Accept => {
                state.attachments.push(VolumeAttachment {
                    server_id: instance_id.to_owned(),
                    volume_id: volume_id.to_owned(),
                    device: None,
                });
                Ok(true)
            }
            Verdict::Refuse => Ok(false),
            Verdict::Fail(err) => Err(err),
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn detach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, bool> {
        let mut state = self.record(CloudCall::DetachVolume(
            instance_id.to_owned(),
            volume_id.to_owned(),
        ));
        let result = match state.detach.clone() {
            Verdict::Accept => {
                state.attachments.retain(|attachment| {
                    attachment.server_id != instance_id || attachment.volume_id != volume_id
                });
                Ok(true)
            }
            Verdict::Refuse => Ok(false),
            Verdict::Fail(err) => Err(err),
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn volume_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
    ) -> CloudFuture<'a, Option<VolumeAttachment>> {
        let state = self.record(CloudCall::VolumeAttachment(
            instance_id.to_owned(),
            volume_id.to_owned(),
        ));
        let found = state
            .attachments
            .iter()
            .find(|attachment| attachment.volume_id == volume_id)
            .cloned();
        drop(state);
        Box::pin(async move { Ok(found) })
    }

    fn list_instances(&self) -> CloudFuture<'_, Vec<ComputeInstance>> {
        let state = self.record(CloudCall::ListInstances);
        let result = state
            .list_error
            .clone()
            .map_or_else(|| Ok(state.instances.clone()), Err);
        drop(state);
        Box::pin(async move { result })
    }

    fn list_hypervisors(&self) -> CloudFuture<'_, Vec<HypervisorRecord>> {
        let state = self.record(CloudCall::ListHypervisors);
        let result = state
            .list_error
            .clone()
            .map_or_else(|| Ok(state.hypervisors.clone()), Err);
        drop(state);
        Box::pin(async move { result })
    }

    fn storage_backend_registration<'a>(
        &'a self,
        backend_host: &'a str,
    ) -> CloudFuture<'a, Option<StorageBackendRegistration>> {
        let state = self.record(CloudCall::StorageBackendRegistration(
            backend_host.to_owned(),
        ));
        let found = state.registrations.get(backend_host).cloned();
        drop(state);
        Box::pin(async move { Ok(found) })
    }
}

/// [`NodeResolver`] answering from a fixed host table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: BTreeMap<String, Vec<IpAddr>>,
    lookups: Arc<StdMutex<Vec<String>>>,
}

impl StaticResolver {
    /// Creates a resolver that knows no hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host entry.
    #[must_use]
    pub fn with_host(mut self, host: &str, addresses: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_owned(), addresses.to_vec());
        self
    }

    /// Returns every host name looked up so far.
    #[must_use]
    pub fn lookups(&self) -> Vec<String> {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NodeResolver for StaticResolver {
    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(host.to_owned());
        let result = self.hosts.get(host).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}"))
        });
        Box::pin(async move { result })
    }
}

/// [`Connector`] handing out a shared [`FakeCloud`] or a scripted failure.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    cloud: FakeCloud,
    failure: Option<CloudError>,
    connects: Arc<AtomicUsize>,
}

impl FakeConnector {
    /// Connector whose sessions all share `cloud`'s state.
    #[must_use]
    pub fn new(cloud: FakeCloud) -> Self {
        Self {
            cloud,
            failure: None,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connector whose every connection attempt fails with `error`.
    #[must_use]
    pub fn failing(error: CloudError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Number of sessions requested so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    type Cloud = FakeCloud;

    fn connect(&self) -> CloudFuture<'_, Self::Cloud> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let result = self
            .failure
            .clone()
            .map_or_else(|| Ok(self.cloud.clone()), Err);
        Box::pin(async move { result })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
