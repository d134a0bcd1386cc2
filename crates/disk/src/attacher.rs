//! Attach/detach state machine.
//!
//! Each operation runs `Requesting -> (Retrying -> Requesting)* -> Success |
//! Failed`. Conflict-class control-plane errors are retried with capped
//! exponential backoff. Authentication and transport failures get exactly one
//! retry with refreshed credentials, and everything else fails immediately.

use crate::{
  config::RetryPolicy,
  ecs::{ApiError, CloudConnector, Disk, DiskApi, DiskClient, DiskStatus},
  error::{DiskError, OpContext, OperationOutcome},
  options::VolumeRequest,
};
use csi_mount_utils::{create_dest, is_dir_empty, is_file_existing, Mounter};
use std::{
  fmt, fs,
  future::Future,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

pub const UNMOUNT_FORCE_AFTER: Duration = Duration::from_secs(30);

/// Codes reported while a disk or instance is still busy with another change.
pub const CONFLICT_CODES: &[&str] = &[
  "InvalidOperation.Conflict",
  "IncorrectDiskStatus",
  "IncorrectInstanceStatus",
  "DiskCreatingSnapshot",
  "Throttling",
  "ServiceUnavailable",
  "InternalError",
];

pub const CAPABILITY_CODES: &[&str] = &[
  "InvalidDataDiskCategory.NotSupported",
  "InvalidDiskCategory.NotSupported",
  "InvalidZoneId.NotSupported",
];

pub const AUTHENTICATION_CODES: &[&str] = &[
  "InvalidAccessKeyId.NotFound",
  "InvalidAccessKeyId.Inactive",
  "SignatureDoesNotMatch",
  "InvalidSecurityToken.Expired",
  "InvalidSecurityToken.Malformed",
  "InvalidSecurityToken.MismatchWithAccessKey",
  "Forbidden.RAM",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  Attach,
  Detach,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operation::Attach => f.write_str("attach"),
      Operation::Detach => f.write_str("detach"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  Conflict,
  Capability,
  Authentication,
  Transport,
  Unknown,
}

impl ErrorClass {
  #[inline]
  pub fn is_retryable(self) -> bool {
    self == ErrorClass::Conflict
  }
}

/// Classifies a control-plane error.
pub fn classify(err: &ApiError) -> ErrorClass {
  let code = match err.code() {
    None => return ErrorClass::Transport,
    Some(code) => code,
  };

  if CONFLICT_CODES.contains(&code) {
    ErrorClass::Conflict
  } else if CAPABILITY_CODES.contains(&code) {
    ErrorClass::Capability
  } else if AUTHENTICATION_CODES.contains(&code) {
    ErrorClass::Authentication
  } else {
    ErrorClass::Unknown
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Requesting { attempt: u32 },
  Retrying { attempt: u32, backoff: Duration },
}

/// Drives attach and detach of a single disk against the control plane and
/// the host.
#[derive(Clone)]
pub struct Attacher {
  connector: CloudConnector,
  mounter: Arc<dyn Mounter>,
  policy: RetryPolicy,
}

impl fmt::Debug for Attacher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Attacher")
      .field("policy", &self.policy)
      .finish()
  }
}

impl Attacher {
  pub fn new(connector: CloudConnector, mounter: Arc<dyn Mounter>, policy: RetryPolicy) -> Self {
    Attacher {
      connector,
      mounter,
      policy,
    }
  }

  /// Runs the operation to completion. Callers must hold the resource lock
  /// for the request's (node, disk) pair.
  pub async fn execute(&self, op: Operation, request: &VolumeRequest, target: &Path) -> OperationOutcome {
    let result = match op {
      Operation::Attach => self.attach(request, target).await,
      Operation::Detach => self.detach(request, target).await,
    };

    match &result {
      Ok(()) => info!(%op, disk_id = %request.disk_id(), node_id = %request.node_id(), "operation succeeded"),
      Err(e) if e.is_retryable() => warn!(error = %e, "operation failed, may be retried"),
      Err(e) => error!(error = %e, "operation failed"),
    }

    result.into()
  }

  #[instrument(skip(self, request), fields(disk_id = %request.disk_id(), node_id = %request.node_id()))]
  pub async fn attach(&self, request: &VolumeRequest, target: &Path) -> Result<(), DiskError> {
    let ctx = OpContext::new(Operation::Attach, request);
    let mut client = self.connect(&ctx).await?;

    let disk = self.describe(&ctx, &mut client, request).await?;
    if disk.is_attached_to(request.node_id()) {
      info!("disk already attached to node, skipping attach call");
    } else {
      let (disk_id, node_id) = (request.disk_id(), request.node_id());
      self
        .request(&ctx, &mut client, |api| async move {
          api.attach_disk(disk_id, node_id).await
        })
        .await?;
      info!("attach accepted by control plane");
    }

    let node_id = request.node_id();
    let disk = self
      .wait_for(&ctx, &mut client, request, "attached", |d| {
        d.status == DiskStatus::InUse && d.instance_id == node_id
      })
      .await?;

    self.mount_device(&ctx, request, &disk, target).await
  }

  #[instrument(skip(self, request), fields(disk_id = %request.disk_id(), node_id = %request.node_id()))]
  pub async fn detach(&self, request: &VolumeRequest, target: &Path) -> Result<(), DiskError> {
    let ctx = OpContext::new(Operation::Detach, request);

    let mut client = self.connect(&ctx).await?;
    let disk = match self.describe(&ctx, &mut client, request).await {
      Ok(disk) => disk,
      Err(DiskError::DiskNotFound { .. }) => {
        info!("disk no longer exists, nothing to detach");
        return self.unmount_target(&ctx, target).await;
      }
      Err(e) => return Err(e),
    };

    if disk.instance_id != request.node_id() || disk.status == DiskStatus::Available {
      info!(status = ?disk.status, "disk not attached to node, nothing to detach");
      return self.unmount_target(&ctx, target).await;
    }

    // The mount table stays untouched while any other path uses the device.
    let own = [Some(target.to_owned()), fs::canonicalize(target).ok()];
    let mut busy = Vec::new();
    for device in device_candidates(&disk.device) {
      let refs = self
        .mounter
        .get_device_refs(device)
        .await
        .map_err(DiskError::host_io(&ctx, "list device mounts"))?;
      busy.extend(
        refs
          .into_iter()
          .filter(|path| !own.iter().flatten().any(|t| t == path)),
      );
    }
    if !busy.is_empty() {
      return Err(DiskError::DeviceBusy { ctx, mounts: busy });
    }

    self.unmount_target(&ctx, target).await?;

    let (disk_id, node_id) = (request.disk_id(), request.node_id());
    self
      .request(&ctx, &mut client, |api| async move {
        api.detach_disk(disk_id, node_id).await
      })
      .await?;
    info!("detach accepted by control plane");

    self
      .wait_for(&ctx, &mut client, request, "detached", |d| {
        d.instance_id != node_id || d.status == DiskStatus::Available
      })
      .await?;

    Ok(())
  }

  async fn unmount_target(&self, ctx: &OpContext, target: &Path) -> Result<(), DiskError> {
    let mounts = self
      .mounter
      .device_mount_count(target.to_owned())
      .await
      .map_err(DiskError::host_io(ctx, "count mounts"))?;
    if mounts == 0 {
      return Ok(());
    }

    debug!(target = %target.display(), mounts, "unmounting");
    self
      .mounter
      .unmount(target.to_owned(), Some(UNMOUNT_FORCE_AFTER))
      .await
      .map_err(DiskError::host_io(ctx, "unmount"))
  }

  async fn connect(&self, ctx: &OpContext) -> Result<DiskClient, DiskError> {
    self
      .connector
      .connect()
      .await
      .ok_or_else(|| DiskError::MissingCredentials { ctx: ctx.clone() })
  }

  async fn describe(
    &self,
    ctx: &OpContext,
    client: &mut DiskClient,
    request: &VolumeRequest,
  ) -> Result<Disk, DiskError> {
    let (region_id, disk_id) = (request.region_id(), request.disk_id());
    self
      .request(ctx, client, |api| async move {
        api.describe_disk(region_id, disk_id).await
      })
      .await?
      .ok_or_else(|| DiskError::DiskNotFound {
        ctx: ctx.clone(),
        region_id: region_id.to_owned(),
      })
  }

  /// Issues a control-plane call, retrying according to the error class.
  async fn request<T, F, Fut>(
    &self,
    ctx: &OpContext,
    client: &mut DiskClient,
    mut call: F,
  ) -> Result<T, DiskError>
  where
    F: FnMut(Arc<dyn DiskApi>) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    let mut state = State::Requesting { attempt: 1 };
    let mut refreshed = false;

    loop {
      state = match state {
        State::Requesting { attempt } => {
          let err = match call(client.api()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
          };

          match classify(&err) {
            ErrorClass::Conflict if attempt < self.policy.max_attempts => {
              refreshed = false;
              State::Retrying {
                attempt,
                backoff: self.policy.backoff(attempt),
              }
            }
            ErrorClass::Conflict => {
              return Err(DiskError::Retryable {
                ctx: ctx.clone(),
                attempts: attempt,
                source: err,
              })
            }
            ErrorClass::Authentication | ErrorClass::Transport if !refreshed => {
              warn!(%ctx, error = %err, "control plane call failed, refreshing credentials");
              refreshed = true;
              *client = self.connector.refresh_if_token_based(client.clone()).await;
              State::Requesting { attempt }
            }
            ErrorClass::Authentication => {
              return Err(DiskError::Authentication {
                ctx: ctx.clone(),
                source: err,
              })
            }
            ErrorClass::Transport => {
              return Err(DiskError::Transport {
                ctx: ctx.clone(),
                source: err,
              })
            }
            class => {
              return Err(DiskError::ControlPlane {
                ctx: ctx.clone(),
                class,
                source: err,
              })
            }
          }
        }

        State::Retrying { attempt, backoff } => {
          warn!(%ctx, attempt, ?backoff, "control plane busy, retrying");
          sleep(backoff).await;
          *client = self.connector.refresh_if_token_based(client.clone()).await;
          State::Requesting {
            attempt: attempt + 1,
          }
        }
      };
    }
  }

  /// Polls the disk until `settled` holds, up to the retry budget.
  async fn wait_for(
    &self,
    ctx: &OpContext,
    client: &mut DiskClient,
    request: &VolumeRequest,
    expected: &'static str,
    settled: impl Fn(&Disk) -> bool,
  ) -> Result<Disk, DiskError> {
    for attempt in 1..=self.policy.max_attempts {
      let disk = self.describe(ctx, client, request).await?;
      if settled(&disk) {
        debug!(attempt, status = ?disk.status, "disk settled");
        return Ok(disk);
      }

      debug!(attempt, status = ?disk.status, "waiting for disk to become {}", expected);
      if attempt < self.policy.max_attempts {
        sleep(self.policy.backoff(attempt)).await;
      }
    }

    Err(DiskError::NotSettled {
      ctx: ctx.clone(),
      expected,
      attempts: self.policy.max_attempts,
    })
  }

  async fn mount_device(
    &self,
    ctx: &OpContext,
    request: &VolumeRequest,
    disk: &Disk,
    target: &Path,
  ) -> Result<(), DiskError> {
    if disk.device.is_empty() {
      return Err(DiskError::NoDevice { ctx: ctx.clone() });
    }
    let device = resolve_device(&disk.device);

    create_dest(target).map_err(DiskError::host_io(ctx, "create mount target"))?;

    let mounted = self
      .mounter
      .get_device_name_from_mount(target.to_owned())
      .await
      .map_err(DiskError::host_io(ctx, "inspect mount target"))?;
    match mounted {
      Some((existing, _)) if device_candidates(&disk.device).contains(&existing) => {
        info!(device = %existing.display(), "already mounted");
        return Ok(());
      }
      Some((existing, _)) => {
        return Err(DiskError::TargetBusy {
          ctx: ctx.clone(),
          target: target.to_owned(),
          device: existing,
        })
      }
      None => (),
    }

    match is_dir_empty(target) {
      Ok(true) => (),
      Ok(false) => {
        return Err(DiskError::TargetNotEmpty {
          ctx: ctx.clone(),
          target: target.to_owned(),
        })
      }
      Err(e) => return Err(DiskError::host_io(ctx, "inspect mount target")(e.into())),
    }

    let mut options = Vec::new();
    if request.read_only() {
      options.push("ro".to_owned());
    }

    self
      .mounter
      .format_and_mount(
        device.clone(),
        target.to_owned(),
        request.fs_type().to_string(),
        options,
      )
      .await
      .map_err(DiskError::host_io(ctx, "format and mount"))?;
    info!(device = %device.display(), target = %target.display(), "mounted");

    Ok(())
  }
}

/// The same disk may show up as `/dev/xvdX` or, on virtio hosts, `/dev/vdX`.
fn device_candidates(reported: &str) -> Vec<PathBuf> {
  let mut candidates = vec![PathBuf::from(reported)];
  if let Some(rest) = reported.strip_prefix("/dev/xvd") {
    candidates.push(PathBuf::from(format!("/dev/vd{}", rest)));
  }
  candidates
}

/// Picks the first device candidate present on the host, or the reported
/// name when none is.
fn resolve_device(reported: &str) -> PathBuf {
  let candidates = device_candidates(reported);
  candidates
    .iter()
    .find(|c| is_file_existing(c))
    .cloned()
    .unwrap_or_else(|| PathBuf::from(reported))
}
