//! In-memory stand-ins for the control plane, instance metadata and
//! environment used by unit tests.

use crate::{
  credentials::{Credentials, ACCESS_KEY_ID_ENV, ACCESS_KEY_SECRET_ENV},
  ecs::{ApiError, ClientFactory, Disk, DiskApi, DiskStatus},
  metadata::{MetadataService, RAM_ROLE},
  options::{VolumeRequest, DISK_ID_KEY, NODE_ID_KEY, REGION_ID_KEY, ZONE_ID_KEY},
};
use async_trait::async_trait;
use std::{
  collections::HashMap,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
  },
  time::Duration,
};

pub(crate) fn env_map(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
  let vars: HashMap<String, String> = pairs
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
  move |key| vars.get(key).cloned()
}

pub(crate) fn static_env() -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
  env_map(&[(ACCESS_KEY_ID_ENV, "ak"), (ACCESS_KEY_SECRET_ENV, "sk")])
}

/// A fully specified request that needs no metadata lookups.
pub(crate) fn request(disk_id: &str, node_id: &str) -> VolumeRequest {
  futures::executor::block_on(VolumeRequest::parse(
    &request_options(disk_id, node_id),
    &StaticMetadata::new(),
    "",
  ))
  .expect("valid request")
}

pub(crate) fn request_options(disk_id: &str, node_id: &str) -> HashMap<String, String> {
  vec![
    (DISK_ID_KEY, disk_id),
    (NODE_ID_KEY, node_id),
    (ZONE_ID_KEY, "cn-hangzhou-b"),
    (REGION_ID_KEY, "cn-hangzhou"),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_owned(), v.to_owned()))
  .collect()
}

#[derive(Default)]
pub(crate) struct StaticMetadata {
  values: HashMap<String, String>,
  lookups: AtomicUsize,
}

impl StaticMetadata {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn with(mut self, resource: &str, value: &str) -> Self {
    self.values.insert(resource.to_owned(), value.to_owned());
    self
  }

  pub(crate) fn with_role(role: &str, id: &str, secret: &str, token: &str) -> Self {
    let body = serde_json::json!({
      "AccessKeyId": id,
      "AccessKeySecret": secret,
      "SecurityToken": token,
      "Expiration": "2026-10-17T12:00:00Z",
      "Code": "Success",
    });

    StaticMetadata::new()
      .with(RAM_ROLE, role)
      .with(&format!("{}{}", RAM_ROLE, role), &body.to_string())
  }

  pub(crate) fn lookups(&self) -> usize {
    self.lookups.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl MetadataService for StaticMetadata {
  async fn get(&self, resource: &str) -> Option<String> {
    self.lookups.fetch_add(1, Ordering::SeqCst);
    self.values.get(resource).cloned()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
  Attach,
  Detach,
  Describe,
}

#[derive(Default)]
struct FakeState {
  disks: HashMap<String, Disk>,
  failures: HashMap<Call, (ApiError, usize)>,
  calls: HashMap<Call, usize>,
  settle_after: usize,
  pending: usize,
}

/// Control plane that keeps disks in memory. Attach and detach take effect
/// after `settle_after` describes.
#[derive(Default)]
pub(crate) struct FakeDiskApi {
  state: Mutex<FakeState>,
  delay: Duration,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl FakeDiskApi {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, FakeState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn with_disk(self, disk_id: &str, instance_id: &str, status: DiskStatus, device: &str) -> Self {
    self.state().disks.insert(
      disk_id.to_owned(),
      Disk {
        disk_id: disk_id.to_owned(),
        status,
        instance_id: instance_id.to_owned(),
        device: device.to_owned(),
        category: "cloud_efficiency".to_owned(),
        zone_id: "cn-hangzhou-b".to_owned(),
      },
    );
    self
  }

  pub(crate) fn with_available_disk(self, disk_id: &str, device: &str) -> Self {
    self.with_disk(disk_id, "", DiskStatus::Available, device)
  }

  pub(crate) fn with_attached_disk(self, disk_id: &str, instance_id: &str, device: &str) -> Self {
    self.with_disk(disk_id, instance_id, DiskStatus::InUse, device)
  }

  /// Fails the next `times` calls of the kind with the given code.
  pub(crate) fn fail(self, call: Call, code: &str, times: usize) -> Self {
    self.fail_with(call, ApiError::service(code, "injected failure"), times)
  }

  /// Fails the next `times` calls of the kind as if the endpoint was down.
  pub(crate) fn fail_transport(self, call: Call, times: usize) -> Self {
    self.fail_with(call, ApiError::Transport("connection reset by peer".to_owned()), times)
  }

  fn fail_with(self, call: Call, err: ApiError, times: usize) -> Self {
    self.state().failures.insert(call, (err, times));
    self
  }

  pub(crate) fn settle_after(self, describes: usize) -> Self {
    self.state().settle_after = describes;
    self
  }

  /// Every call takes this long to complete.
  pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub(crate) fn calls(&self, call: Call) -> usize {
    self.state().calls.get(&call).copied().unwrap_or(0)
  }

  pub(crate) fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  async fn enter(&self, call: Call) -> Result<(), ApiError> {
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let mut state = self.state();
    *state.calls.entry(call).or_default() += 1;
    match state.failures.get_mut(&call) {
      Some((err, remaining)) if *remaining > 0 => {
        *remaining -= 1;
        Err(err.clone())
      }
      _ => Ok(()),
    }
  }
}

fn not_found(disk_id: &str) -> ApiError {
  ApiError::service("InvalidDiskId.NotFound", format!("disk {} not found", disk_id))
}

#[async_trait]
impl DiskApi for FakeDiskApi {
  async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), ApiError> {
    self.enter(Call::Attach).await?;

    let mut state = self.state();
    let settle_after = state.settle_after;
    let disk = state.disks.get_mut(disk_id).ok_or_else(|| not_found(disk_id))?;
    disk.instance_id = instance_id.to_owned();
    disk.status = if settle_after > 0 {
      DiskStatus::Attaching
    } else {
      DiskStatus::InUse
    };
    state.pending = settle_after;
    Ok(())
  }

  async fn detach_disk(&self, disk_id: &str, _instance_id: &str) -> Result<(), ApiError> {
    self.enter(Call::Detach).await?;

    let mut state = self.state();
    let settle_after = state.settle_after;
    let disk = state.disks.get_mut(disk_id).ok_or_else(|| not_found(disk_id))?;
    if settle_after > 0 {
      disk.status = DiskStatus::Detaching;
    } else {
      disk.status = DiskStatus::Available;
      disk.instance_id.clear();
    }
    state.pending = settle_after;
    Ok(())
  }

  async fn describe_disk(&self, _region_id: &str, disk_id: &str) -> Result<Option<Disk>, ApiError> {
    self.enter(Call::Describe).await?;

    let mut state = self.state();
    if state.pending > 0 {
      state.pending -= 1;
      return Ok(state.disks.get(disk_id).cloned());
    }

    Ok(state.disks.get_mut(disk_id).map(|disk| {
      match disk.status {
        DiskStatus::Attaching => disk.status = DiskStatus::InUse,
        DiskStatus::Detaching => {
          disk.status = DiskStatus::Available;
          disk.instance_id.clear();
        }
        _ => (),
      }
      disk.clone()
    }))
  }
}

/// Hands out the shared fake control plane for any non-empty credentials.
pub(crate) struct FakeFactory {
  api: Arc<FakeDiskApi>,
  built: AtomicUsize,
  fail: AtomicBool,
}

impl FakeFactory {
  pub(crate) fn new(api: Arc<FakeDiskApi>) -> Self {
    FakeFactory {
      api,
      built: AtomicUsize::new(0),
      fail: AtomicBool::new(false),
    }
  }

  pub(crate) fn built(&self) -> usize {
    self.built.load(Ordering::SeqCst)
  }

  pub(crate) fn fail_new_clients(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }
}

impl ClientFactory for FakeFactory {
  fn new_client(&self, credentials: &Credentials) -> Option<Arc<dyn DiskApi>> {
    if credentials.is_empty() || self.fail.load(Ordering::SeqCst) {
      return None;
    }

    self.built.fetch_add(1, Ordering::SeqCst);
    Some(self.api.clone())
  }
}
