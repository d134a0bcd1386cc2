use crate::{
  attacher::{Attacher, Operation, UNMOUNT_FORCE_AFTER},
  config::DiskConfig,
  credentials::CredentialResolver,
  ecs::{ClientFactory, CloudConnector, EcsClientFactory},
  error::InitError,
  lock::{LockManager, ResourceLockKey},
  metadata::{HttpMetadata, MetadataService},
  options::{VolumeRequest, DISK_ID_KEY},
};
use csi_mount_utils::{create_dest, DefaultMounter, Mounter, DEFAULT_MOUNT_COMMAND};
use std::{collections::HashMap, fmt, path::Path, sync::Arc};
use tonic::Status;
use tracing::{info, instrument};

/// Node-side volume operations for block storage disks.
///
/// Stage and unstage attach/detach the disk and manage its global mount,
/// serialized per (node, disk). Publish and unpublish only bind mount the
/// staged filesystem into pods and take no disk lock.
pub struct DiskNode {
  metadata: Arc<dyn MetadataService>,
  default_region: String,
  locks: LockManager,
  attacher: Attacher,
  mounter: Arc<dyn Mounter>,
}

impl fmt::Debug for DiskNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DiskNode")
      .field("default_region", &self.default_region)
      .field("locks", &self.locks)
      .field("attacher", &self.attacher)
      .finish()
  }
}

impl DiskNode {
  pub fn new(
    config: &DiskConfig,
    metadata: Arc<dyn MetadataService>,
    factory: Arc<dyn ClientFactory>,
    mounter: Arc<dyn Mounter>,
  ) -> Self {
    let resolver = CredentialResolver::new(metadata.clone()).with_static_keys(
      &config.global.access_key_id,
      &config.global.access_key_secret,
    );

    Self::with_connector(
      config,
      metadata,
      CloudConnector::new(resolver, factory),
      mounter,
    )
  }

  pub fn with_connector(
    config: &DiskConfig,
    metadata: Arc<dyn MetadataService>,
    connector: CloudConnector,
    mounter: Arc<dyn Mounter>,
  ) -> Self {
    DiskNode {
      metadata,
      default_region: config.region().to_owned(),
      locks: LockManager::new(),
      attacher: Attacher::new(connector, mounter.clone(), config.retry),
      mounter,
    }
  }

  /// Wires up the HTTP metadata service, the ECS client factory and the
  /// host mounter.
  pub async fn from_config(config: DiskConfig) -> Result<Self, InitError> {
    let metadata = HttpMetadata::new(config.metadata_endpoint.clone(), config.request_timeout())?;
    let factory = EcsClientFactory::new(config.ecs_endpoint.clone(), config.request_timeout())?;
    let mounter = DefaultMounter::new(DEFAULT_MOUNT_COMMAND).await?;

    Ok(Self::new(
      &config,
      Arc::new(metadata),
      Arc::new(factory),
      Arc::new(mounter),
    ))
  }

  /// Like [`DiskNode::from_config`], with the config file named by
  /// `DISK_PLUGIN_CONFIG`.
  pub async fn from_env() -> Result<Self, InitError> {
    Self::from_config(DiskConfig::from_env()?).await
  }

  async fn parse(&self, volume_id: &str, options: &HashMap<String, String>) -> Result<VolumeRequest, Status> {
    let mut raw = options.clone();
    raw.insert(DISK_ID_KEY.to_owned(), volume_id.to_owned());

    Ok(VolumeRequest::parse(&raw, &*self.metadata, &self.default_region).await?)
  }

  async fn run(&self, op: Operation, request: VolumeRequest, target: &Path) -> Result<(), Status> {
    let _guard = self.locks.acquire(ResourceLockKey::from(&request)).await;
    self.attacher.execute(op, &request, target).await.into_status()
  }

  /// Attaches the disk to this node and mounts it at the staging path,
  /// formatting it first when it carries no filesystem.
  #[instrument(skip(self, options))]
  pub async fn stage_volume(
    &self,
    volume_id: &str,
    staging_target_path: &Path,
    options: &HashMap<String, String>,
  ) -> Result<(), Status> {
    let request = self.parse(volume_id, options).await?;
    self.run(Operation::Attach, request, staging_target_path).await
  }

  /// Unmounts the staging path and detaches the disk from this node.
  #[instrument(skip(self, options))]
  pub async fn unstage_volume(
    &self,
    volume_id: &str,
    staging_target_path: &Path,
    options: &HashMap<String, String>,
  ) -> Result<(), Status> {
    let request = self.parse(volume_id, options).await?;
    self.run(Operation::Detach, request, staging_target_path).await
  }

  #[instrument(skip(self))]
  pub async fn publish_volume(
    &self,
    staging_target_path: &Path,
    target_path: &Path,
    read_only: bool,
  ) -> Result<(), Status> {
    create_dest(target_path).map_err(|e| Status::internal(e.to_string()))?;

    let mounted = self
      .mounter
      .get_device_name_from_mount(target_path.to_owned())
      .await
      .map_err(|e| Status::internal(e.to_string()))?;
    if mounted.is_some() {
      info!("already published");
      return Ok(());
    }

    let mut options = vec!["bind".to_owned()];
    if read_only {
      options.push("ro".to_owned());
    }
    self
      .mounter
      .mount(
        Some(staging_target_path.to_owned()),
        target_path.to_owned(),
        String::new(),
        options,
      )
      .await
      .map_err(|e| Status::internal(e.to_string()))?;

    info!("published");
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn unpublish_volume(&self, target_path: &Path) -> Result<(), Status> {
    let mounted = self
      .mounter
      .get_device_name_from_mount(target_path.to_owned())
      .await
      .map_err(|e| Status::internal(e.to_string()))?;
    if mounted.is_none() {
      info!("not published");
      return Ok(());
    }

    self
      .mounter
      .unmount(target_path.to_owned(), Some(UNMOUNT_FORCE_AFTER))
      .await
      .map_err(|e| Status::internal(e.to_string()))?;

    info!("unpublished");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    fake::{request_options, static_env, Call, FakeDiskApi, FakeFactory, StaticMetadata},
    options::CATEGORY_KEY,
  };
  use csi_mount_utils::{FakeAction, FakeMounter};
  use std::time::Duration;
  use tempfile::tempdir;
  use tokio::time::{sleep, timeout};
  use tonic::Code;

  const DEVICE: &str = "/dev/xvdz";

  fn node(api: Arc<FakeDiskApi>, mounter: Arc<FakeMounter>) -> Arc<DiskNode> {
    let metadata = Arc::new(StaticMetadata::new());
    let resolver = CredentialResolver::new(metadata.clone()).with_env(static_env());
    let connector = CloudConnector::new(resolver, Arc::new(FakeFactory::new(api)));

    Arc::new(DiskNode::with_connector(
      &DiskConfig::default(),
      metadata,
      connector,
      mounter,
    ))
  }

  #[tokio::test(start_paused = true)]
  async fn stage_and_unstage() {
    let dir = tempdir().expect("tempdir");
    let staging = dir.path().join("globalmount");
    let api = Arc::new(FakeDiskApi::new().with_available_disk("d-1", DEVICE));
    let mounter = Arc::new(FakeMounter::new(None));
    let node = node(api.clone(), mounter.clone());
    let options = request_options("d-1", "i-1");

    node
      .stage_volume("d-1", &staging, &options)
      .await
      .expect("stage");
    node
      .unstage_volume("d-1", &staging, &options)
      .await
      .expect("unstage");

    assert_eq!(api.calls(Call::Attach), 1);
    assert_eq!(api.calls(Call::Detach), 1);
    assert_eq!(
      mounter.get_log().last(),
      Some(&FakeAction::Unmount { target: staging })
    );
    assert!(node.locks.is_empty());
  }

  #[tokio::test]
  async fn invalid_category_fails_before_control_plane() {
    let dir = tempdir().expect("tempdir");
    let api = Arc::new(FakeDiskApi::new().with_available_disk("d-1", DEVICE));
    let node = node(api.clone(), Arc::new(FakeMounter::new(None)));
    let mut options = request_options("d-1", "i-1");
    options.insert(CATEGORY_KEY.to_owned(), "cloud_unknown".to_owned());

    let status = node
      .stage_volume("d-1", &dir.path().join("m"), &options)
      .await
      .expect_err("invalid");

    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(api.calls(Call::Describe), 0);
    assert_eq!(api.calls(Call::Attach), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_stages_of_one_disk_are_serialized() {
    let dir = tempdir().expect("tempdir");
    let staging = dir.path().join("globalmount");
    let api = Arc::new(
      FakeDiskApi::new()
        .with_available_disk("d-1", DEVICE)
        .with_delay(Duration::from_millis(5)),
    );
    let node = node(api.clone(), Arc::new(FakeMounter::new(None)));

    let tasks = (0..8)
      .map(|_| {
        let node = node.clone();
        let staging = staging.clone();
        tokio::spawn(async move {
          node
            .stage_volume("d-1", &staging, &request_options("d-1", "i-1"))
            .await
        })
      })
      .collect::<Vec<_>>();

    for task in tasks {
      task.await.expect("join").expect("stage");
    }

    assert_eq!(api.max_in_flight(), 1);
    assert_eq!(api.calls(Call::Attach), 1);
    assert!(node.locks.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_stage_releases_lock() {
    let dir = tempdir().expect("tempdir");
    let api = Arc::new(
      FakeDiskApi::new()
        .with_available_disk("d-1", DEVICE)
        .with_delay(Duration::from_secs(3600)),
    );
    let node = node(api, Arc::new(FakeMounter::new(None)));

    let stage = {
      let node = node.clone();
      let staging = dir.path().join("m");
      tokio::spawn(async move {
        node
          .stage_volume("d-1", &staging, &request_options("d-1", "i-1"))
          .await
      })
    };
    sleep(Duration::from_millis(10)).await;
    assert_eq!(node.locks.len(), 1);

    stage.abort();
    assert!(stage.await.is_err());
    assert!(node.locks.is_empty());

    let guard = timeout(
      Duration::from_secs(1),
      node.locks.acquire(ResourceLockKey::new("i-1", "d-1")),
    )
    .await;
    assert!(guard.is_ok());
  }

  #[tokio::test]
  async fn publish_and_unpublish_bind_mount() {
    let dir = tempdir().expect("tempdir");
    let staging = dir.path().join("globalmount");
    let target = dir.path().join("pod");
    let mounter = Arc::new(FakeMounter::new(vec![csi_mount_utils::MountPoint::new(
      DEVICE, &staging, "ext4",
    )]));
    let node = node(Arc::new(FakeDiskApi::new()), mounter.clone());

    node
      .publish_volume(&staging, &target, true)
      .await
      .expect("publish");
    node
      .publish_volume(&staging, &target, true)
      .await
      .expect("publish again");
    node.unpublish_volume(&target).await.expect("unpublish");
    node
      .unpublish_volume(&target)
      .await
      .expect("unpublish again");

    assert_eq!(
      mounter.get_log(),
      vec![
        FakeAction::Mount {
          target: target.clone(),
          source: DEVICE.into(),
          fs_type: String::new(),
        },
        FakeAction::Unmount { target },
      ]
    );
  }
}
