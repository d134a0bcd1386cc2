use crate::{
  attacher::{ErrorClass, Operation},
  config::ConfigError,
  ecs::ApiError,
  options::{ValidationError, VolumeRequest},
};
use csi_mount_utils::MountError;
use std::{fmt, path::PathBuf};
use thiserror::Error;
use tonic::{Code, Status};

/// Failures while wiring up the node service.
#[derive(Debug, Error)]
pub enum InitError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("failed to build HTTP client")]
  Http(#[from] reqwest::Error),
  #[error("failed to start mounter")]
  Mount(#[from] MountError),
}

/// The operation and resource an error happened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
  pub op: Operation,
  pub disk_id: String,
  pub node_id: String,
}

impl OpContext {
  pub fn new(op: Operation, request: &VolumeRequest) -> Self {
    OpContext {
      op,
      disk_id: request.disk_id().to_owned(),
      node_id: request.node_id().to_owned(),
    }
  }
}

impl fmt::Display for OpContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} of disk {} on node {}",
      self.op, self.disk_id, self.node_id
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Validation,
  Conflict,
  Timeout,
  Capability,
  Authentication,
  Transport,
  Credentials,
  NotFound,
  HostIo,
  DeviceBusy,
  Unknown,
}

#[derive(Debug, Error)]
pub enum DiskError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("{ctx} still failing after {attempts} attempts: {source}")]
  Retryable {
    ctx: OpContext,
    attempts: u32,
    #[source]
    source: ApiError,
  },

  #[error("{ctx} rejected: {source}")]
  ControlPlane {
    ctx: OpContext,
    class: ErrorClass,
    #[source]
    source: ApiError,
  },

  #[error("{ctx} failed authentication after credential refresh: {source}")]
  Authentication {
    ctx: OpContext,
    #[source]
    source: ApiError,
  },

  #[error("{ctx}: control plane still unreachable after client refresh: {source}")]
  Transport {
    ctx: OpContext,
    #[source]
    source: ApiError,
  },

  #[error("{ctx}: no usable credentials")]
  MissingCredentials { ctx: OpContext },

  #[error("{ctx}: disk not found in region {region_id}")]
  DiskNotFound { ctx: OpContext, region_id: String },

  #[error("{ctx}: disk did not become {expected} after {attempts} checks")]
  NotSettled {
    ctx: OpContext,
    expected: &'static str,
    attempts: u32,
  },

  #[error("{ctx}: control plane reports no device for the disk")]
  NoDevice { ctx: OpContext },

  #[error("{ctx}: {action} failed: {source}")]
  HostIo {
    ctx: OpContext,
    action: &'static str,
    #[source]
    source: MountError,
  },

  #[error("{ctx}: {} already holds {}", .target.display(), .device.display())]
  TargetBusy {
    ctx: OpContext,
    target: PathBuf,
    device: PathBuf,
  },

  #[error("{ctx}: mount target {} is not empty", .target.display())]
  TargetNotEmpty { ctx: OpContext, target: PathBuf },

  #[error("{ctx}: device still mounted at {mounts:?}")]
  DeviceBusy { ctx: OpContext, mounts: Vec<PathBuf> },
}

impl DiskError {
  pub(crate) fn host_io(ctx: &OpContext, action: &'static str) -> impl FnOnce(MountError) -> Self {
    let ctx = ctx.clone();
    move |source| DiskError::HostIo {
      ctx,
      action,
      source,
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      DiskError::Validation(_) => ErrorKind::Validation,
      DiskError::Retryable { .. } => ErrorKind::Conflict,
      DiskError::NotSettled { .. } => ErrorKind::Timeout,
      DiskError::ControlPlane {
        class: ErrorClass::Capability,
        ..
      } => ErrorKind::Capability,
      DiskError::ControlPlane { .. } => ErrorKind::Unknown,
      DiskError::Authentication { .. } => ErrorKind::Authentication,
      DiskError::Transport { .. } => ErrorKind::Transport,
      DiskError::MissingCredentials { .. } => ErrorKind::Credentials,
      DiskError::DiskNotFound { .. } => ErrorKind::NotFound,
      DiskError::NoDevice { .. } | DiskError::HostIo { .. } => ErrorKind::HostIo,
      DiskError::TargetBusy { .. }
      | DiskError::TargetNotEmpty { .. }
      | DiskError::DeviceBusy { .. } => ErrorKind::DeviceBusy,
    }
  }

  /// Whether the orchestrator may retry the whole operation later.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      DiskError::Retryable { .. } | DiskError::NotSettled { .. } | DiskError::Transport { .. }
    )
  }
}

/// Terminal result of an attach or detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
  Success,
  RetryableError { kind: ErrorKind, detail: String },
  FatalError { kind: ErrorKind, detail: String },
}

impl OperationOutcome {
  #[inline]
  pub fn is_success(&self) -> bool {
    matches!(self, OperationOutcome::Success)
  }

  pub fn kind(&self) -> Option<ErrorKind> {
    match self {
      OperationOutcome::Success => None,
      OperationOutcome::RetryableError { kind, .. } | OperationOutcome::FatalError { kind, .. } => {
        Some(*kind)
      }
    }
  }

  /// Maps the outcome onto a gRPC status for the node service.
  pub fn into_status(self) -> Result<(), Status> {
    match self {
      OperationOutcome::Success => Ok(()),
      OperationOutcome::RetryableError { kind, detail } => {
        let code = match kind {
          ErrorKind::Timeout | ErrorKind::Transport => Code::Unavailable,
          _ => Code::Aborted,
        };
        Err(Status::new(code, detail))
      }
      OperationOutcome::FatalError { kind, detail } => Err(Status::new(fatal_code(kind), detail)),
    }
  }
}

fn fatal_code(kind: ErrorKind) -> Code {
  match kind {
    ErrorKind::Validation => Code::InvalidArgument,
    ErrorKind::Capability | ErrorKind::Credentials | ErrorKind::DeviceBusy => {
      Code::FailedPrecondition
    }
    ErrorKind::Authentication => Code::Unauthenticated,
    ErrorKind::NotFound => Code::NotFound,
    ErrorKind::Conflict => Code::Aborted,
    ErrorKind::Timeout | ErrorKind::Transport => Code::Unavailable,
    ErrorKind::HostIo | ErrorKind::Unknown => Code::Internal,
  }
}

impl From<Result<(), DiskError>> for OperationOutcome {
  fn from(result: Result<(), DiskError>) -> Self {
    match result {
      Ok(()) => OperationOutcome::Success,
      Err(e) if e.is_retryable() => OperationOutcome::RetryableError {
        kind: e.kind(),
        detail: e.to_string(),
      },
      Err(e) => OperationOutcome::FatalError {
        kind: e.kind(),
        detail: e.to_string(),
      },
    }
  }
}

impl From<DiskError> for Status {
  fn from(err: DiskError) -> Self {
    match OperationOutcome::from(Err(err)).into_status() {
      Err(status) => status,
      Ok(()) => Status::unknown("operation reported success"),
    }
  }
}

impl From<ValidationError> for Status {
  fn from(err: ValidationError) -> Self {
    Status::invalid_argument(err.to_string())
  }
}
