//! Node-side attach/detach of cloud block storage disks.
//!
//! [`DiskNode`] is the entry point: it validates volume options, serializes
//! operations per (node, disk) and drives the [`attacher::Attacher`] state
//! machine against the ECS control plane and the host mounter.

pub mod attacher;
pub mod config;
pub mod credentials;
pub mod ecs;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod node;
pub mod options;

#[cfg(test)]
mod fake;

pub use config::{DiskConfig, RetryPolicy};
pub use credentials::{CredentialResolver, Credentials};
pub use error::{DiskError, ErrorKind, InitError, OperationOutcome};
pub use lock::{LockManager, ResourceLockKey};
pub use node::DiskNode;
pub use options::{DiskCategory, FsType, ValidationError, VolumeRequest};
