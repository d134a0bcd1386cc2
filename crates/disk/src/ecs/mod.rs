//! Control-plane access for block storage disks.

mod client;
mod signer;

pub use client::{EcsClient, EcsClientFactory};

use crate::credentials::{CredentialResolver, Credentials};
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  #[error("{code}: {message} (request {request_id})")]
  Service {
    code: String,
    message: String,
    request_id: String,
  },
  #[error("control plane unreachable: {0}")]
  Transport(String),
}

impl ApiError {
  pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
    ApiError::Service {
      code: code.into(),
      message: message.into(),
      request_id: String::new(),
    }
  }

  /// Service error code, `None` for transport failures.
  pub fn code(&self) -> Option<&str> {
    match self {
      ApiError::Service { code, .. } => Some(code),
      ApiError::Transport(_) => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
  InUse,
  Available,
  Attaching,
  Detaching,
  Creating,
  ReIniting,
  Unknown,
}

impl DiskStatus {
  pub fn from_api(status: &str) -> Self {
    match status {
      "In_use" => DiskStatus::InUse,
      "Available" => DiskStatus::Available,
      "Attaching" => DiskStatus::Attaching,
      "Detaching" => DiskStatus::Detaching,
      "Creating" => DiskStatus::Creating,
      "ReIniting" => DiskStatus::ReIniting,
      _ => DiskStatus::Unknown,
    }
  }
}

/// A disk as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
  pub disk_id: String,
  pub status: DiskStatus,
  /// Instance the disk is attached to, empty when detached.
  pub instance_id: String,
  /// Device name reported for the attachment, e.g. `/dev/xvdb`.
  pub device: String,
  pub category: String,
  pub zone_id: String,
}

impl Disk {
  /// Attached to, or in the middle of attaching to, the node.
  pub fn is_attached_to(&self, node_id: &str) -> bool {
    self.instance_id == node_id && matches!(self.status, DiskStatus::InUse | DiskStatus::Attaching)
  }
}

#[async_trait]
pub trait DiskApi: Send + Sync {
  async fn attach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), ApiError>;

  async fn detach_disk(&self, disk_id: &str, instance_id: &str) -> Result<(), ApiError>;

  /// Looks up a single disk. `Ok(None)` when the disk does not exist.
  async fn describe_disk(&self, region_id: &str, disk_id: &str) -> Result<Option<Disk>, ApiError>;
}

/// Builds authenticated control-plane clients.
pub trait ClientFactory: Send + Sync {
  /// `None` when no client can be built from the credentials.
  fn new_client(&self, credentials: &Credentials) -> Option<Arc<dyn DiskApi>>;
}

/// A control-plane client together with the credentials it was built from.
///
/// Clients are never mutated in place; a refresh produces a new value.
#[derive(Clone)]
pub struct DiskClient {
  api: Arc<dyn DiskApi>,
  credentials: Credentials,
}

impl fmt::Debug for DiskClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DiskClient")
      .field("credentials", &self.credentials)
      .finish()
  }
}

impl DiskClient {
  #[inline]
  pub fn api(&self) -> Arc<dyn DiskApi> {
    self.api.clone()
  }

  #[inline]
  pub fn credentials(&self) -> &Credentials {
    &self.credentials
  }

  #[inline]
  pub fn is_token_based(&self) -> bool {
    self.credentials.is_token_based()
  }
}

/// Pairs credential resolution with client construction.
#[derive(Clone)]
pub struct CloudConnector {
  resolver: CredentialResolver,
  factory: Arc<dyn ClientFactory>,
}

impl fmt::Debug for CloudConnector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloudConnector").finish()
  }
}

impl CloudConnector {
  pub fn new(resolver: CredentialResolver, factory: Arc<dyn ClientFactory>) -> Self {
    CloudConnector { resolver, factory }
  }

  /// Builds a client from freshly resolved credentials. `None` when no
  /// credentials are available or the factory rejects them.
  #[instrument(level = "debug", skip(self))]
  pub async fn connect(&self) -> Option<DiskClient> {
    let credentials = self.resolver.resolve().await;
    self.build(credentials)
  }

  /// Rebuilds a token-based client with re-resolved credentials. Static
  /// clients, and clients whose rebuild fails, are returned unchanged.
  #[instrument(level = "debug", skip(self, client))]
  pub async fn refresh_if_token_based(&self, client: DiskClient) -> DiskClient {
    if !client.is_token_based() {
      return client;
    }

    let credentials = self.resolver.resolve().await;
    match self.build(credentials) {
      Some(refreshed) => {
        debug!(
          access_key_id = %refreshed.credentials.access_key_id(),
          "refreshed control plane client"
        );
        refreshed
      }
      None => {
        warn!("client refresh failed, keeping previous credentials");
        client
      }
    }
  }

  fn build(&self, credentials: Credentials) -> Option<DiskClient> {
    if credentials.is_empty() {
      return None;
    }

    let api = self.factory.new_client(&credentials)?;
    Some(DiskClient { api, credentials })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fake::{env_map, FakeDiskApi, FakeFactory, StaticMetadata};

  #[test]
  fn status_from_api() {
    assert_eq!(DiskStatus::from_api("In_use"), DiskStatus::InUse);
    assert_eq!(DiskStatus::from_api("Available"), DiskStatus::Available);
    assert_eq!(DiskStatus::from_api("Expired"), DiskStatus::Unknown);
  }

  fn connector(metadata: StaticMetadata, env: &[(&str, &str)]) -> (CloudConnector, Arc<FakeFactory>) {
    let factory = Arc::new(FakeFactory::new(Arc::new(FakeDiskApi::new())));
    let resolver = CredentialResolver::new(Arc::new(metadata)).with_env(env_map(env));
    (CloudConnector::new(resolver, factory.clone()), factory)
  }

  #[tokio::test]
  async fn connect_fails_without_credentials() {
    let (connector, factory) = connector(StaticMetadata::new(), &[]);

    assert!(connector.connect().await.is_none());
    assert_eq!(factory.built(), 0);
  }

  #[tokio::test]
  async fn static_clients_are_not_refreshed() {
    let (connector, factory) = connector(
      StaticMetadata::new(),
      &[("ACCESS_KEY_ID", "ak"), ("ACCESS_KEY_SECRET", "sk")],
    );

    let client = connector.connect().await.expect("client");
    let client = connector.refresh_if_token_based(client).await;
    assert!(!client.is_token_based());
    assert_eq!(factory.built(), 1);
  }

  #[tokio::test]
  async fn token_clients_are_rebuilt() {
    let metadata = StaticMetadata::with_role("csi-role", "STS.id", "secret", "token");
    let (connector, factory) = connector(metadata, &[]);

    let client = connector.connect().await.expect("client");
    assert!(client.is_token_based());

    let refreshed = connector.refresh_if_token_based(client).await;
    assert_eq!(refreshed.credentials().session_token(), Some("token"));
    assert_eq!(factory.built(), 2);
  }

  #[tokio::test]
  async fn failed_refresh_keeps_previous_client() {
    let metadata = StaticMetadata::with_role("csi-role", "STS.id", "secret", "token");
    let (connector, factory) = connector(metadata, &[]);

    let client = connector.connect().await.expect("client");
    factory.fail_new_clients(true);

    let kept = connector.refresh_if_token_based(client.clone()).await;
    assert_eq!(kept.credentials(), client.credentials());
    assert_eq!(factory.built(), 1);
  }
}
