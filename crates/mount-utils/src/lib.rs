cfg_if::cfg_if! {
  if #[cfg(unix)] {
    mod unix;
    use unix::*;
  } else {
    compile_error!("Only cfg(unix) is supported at this time")
  }
}

mod fake;
mod host;
mod runner;

pub use fake::FakeAction;
pub use host::{create_dest, is_dir_empty, is_file_existing};

use futures::future::BoxFuture;
use runner::{run, run_inst, MounterImpl, MounterWrapper};
use static_assertions::assert_impl_all;
use std::{
  fmt, io,
  path::{Path, PathBuf},
  result,
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tracing::Instrument;

pub type Result<T> = result::Result<T, MountError>;
pub type FutureResult<T> = BoxFuture<'static, Result<T>>;

pub const DEFAULT_MOUNT_COMMAND: &str = "mount";

/// Interface defines the set of methods to allow for mount operations on a system.
///
/// Every method is dispatched to a single background thread, so at most one
/// host mount operation runs at a time and callers never block the executor.
pub trait Mounter: Send + Sync {
  /// Mounts source to target as fstype with given options.
  fn mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: String,
    options: Vec<String>,
  ) -> FutureResult<()>;

  /// Unmount unmounts given target. If `force_after` is set and the unmount
  /// has not finished within that time, it is retried with `-f`.
  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> FutureResult<()>;

  /// List returns a list of all mounted filesystems.
  fn list(&self) -> FutureResult<Vec<MountPoint>>;

  /// Returns the filesystem found on the device, or `None` when the device
  /// is unformatted.
  fn get_disk_format(&self, device: PathBuf) -> FutureResult<Option<String>>;

  /// Formats the device with fstype if it carries no filesystem yet, then
  /// mounts it at target. Read only mounts of unformatted devices fail.
  fn format_and_mount(
    &self,
    source: PathBuf,
    target: PathBuf,
    fstype: String,
    options: Vec<String>,
  ) -> FutureResult<()>;

  /// Returns every mount path the given device is mounted at.
  fn get_device_refs(&self, device: PathBuf) -> FutureResult<Vec<PathBuf>>;

  /// Finds the device mounted at mount_path together with the number of
  /// mounts that device has.
  fn get_device_name_from_mount(
    &self,
    mount_path: PathBuf,
  ) -> FutureResult<Option<(PathBuf, usize)>>;

  /// Number of mounts of the device mounted at target, 0 when nothing is
  /// mounted there.
  fn device_mount_count(&self, target: PathBuf) -> FutureResult<usize>;
}

/// MountPoint represents a single line in /proc/mounts or /etc/fstab.
#[derive(Clone, PartialEq)]
pub struct MountPoint {
  device: PathBuf,
  path: PathBuf,
  ty: String,
  opts: Vec<String>,
  freq: isize,
  pass: isize,
}

impl fmt::Debug for MountPoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MountPoint")
      .field("device", &self.device)
      .field("path", &self.path)
      .field("type", &self.ty)
      .field("opts", &format!("length={}", self.opts.len()))
      .field("freq", &self.freq)
      .field("pass", &self.pass)
      .finish()
  }
}

impl MountPoint {
  pub fn new(device: impl Into<PathBuf>, path: impl Into<PathBuf>, ty: impl Into<String>) -> Self {
    MountPoint {
      device: device.into(),
      path: path.into(),
      ty: ty.into(),
      opts: Vec::new(),
      freq: 0,
      pass: 0,
    }
  }

  #[inline]
  pub fn device(&self) -> &Path {
    &self.device
  }

  #[inline]
  pub fn path(&self) -> &Path {
    &self.path
  }

  #[inline]
  pub fn mount_type(&self) -> &str {
    &self.ty
  }

  #[inline]
  pub fn opts(&self) -> &[String] {
    &self.opts
  }

  #[inline]
  pub fn freq(&self) -> isize {
    self.freq
  }

  #[inline]
  pub fn pass(&self) -> isize {
    self.pass
  }
}

#[derive(Debug, Error)]
pub enum MountError {
  #[error("File system mismatch on {}: found {existing}, requested {requested}", .device.display())]
  FilesystemMismatch {
    device: PathBuf,
    existing: String,
    requested: String,
  },
  #[error("Unformatted read only: {}", .0.display())]
  UnformattedReadOnly(PathBuf),
  #[error("Format failed: {}", .0.display())]
  FormatFailed(PathBuf, #[source] io::Error),
  #[error("Get disk format failed: {}", .0.display())]
  GetDiskFormatFailed(PathBuf, #[source] io::Error),
  #[error("{} already exists and is not a directory", .0.display())]
  NotADirectory(PathBuf),
  #[error("Unknown mount error: {0}")]
  UnknownMountError(
    #[from]
    #[source]
    io::Error,
  ),
}

impl MountError {
  pub(crate) fn new(msg: impl Into<String>) -> Self {
    MountError::UnknownMountError(io::Error::new(io::ErrorKind::Other, msg.into()))
  }
}

impl<T> Mounter for T
where
  T: MounterWrapper + Send + Sync,
{
  fn mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: String,
    options: Vec<String>,
  ) -> FutureResult<()> {
    let options = options.into_iter().collect();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.mount(source, target, fstype, options)
    }))
  }

  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> FutureResult<()> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.unmount(target, force_after)
    }))
  }

  fn list(&self) -> FutureResult<Vec<MountPoint>> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.list()
    }))
  }

  fn get_disk_format(&self, device: PathBuf) -> FutureResult<Option<String>> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.get_disk_format(&device)
    }))
  }

  fn format_and_mount(
    &self,
    source: PathBuf,
    target: PathBuf,
    fstype: String,
    options: Vec<String>,
  ) -> FutureResult<()> {
    let options = options.into_iter().collect();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.format_and_mount(source, target, fstype, options)
    }))
  }

  fn get_device_refs(&self, device: PathBuf) -> FutureResult<Vec<PathBuf>> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.get_device_refs(&device)
    }))
  }

  fn get_device_name_from_mount(
    &self,
    mount_path: PathBuf,
  ) -> FutureResult<Option<(PathBuf, usize)>> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.get_device_name_from_mount(mount_path)
    }))
  }

  fn device_mount_count(&self, target: PathBuf) -> FutureResult<usize> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.device_mount_count(target)
    }))
  }
}

assert_impl_all!(OsMounter: MounterImpl);
assert_impl_all!(fake::FakeMounter: MounterImpl);
assert_impl_all!(DefaultMounter: Mounter);
assert_impl_all!(FakeMounter: Mounter);

pub struct DefaultMounter(Arc<OsMounter>);

impl DefaultMounter {
  /// Create a new mounter that runs the given mount binary.
  pub fn new(mount_path: impl Into<PathBuf>) -> FutureResult<Self> {
    let mount_path = mount_path.into();

    Box::pin(
      async move {
        run(move || OsMounter::new(mount_path))
          .await
          .map(|inner| <Self as MounterWrapper>::new(Arc::new(inner)))
      }
      .in_current_span(),
    )
  }
}

impl MounterWrapper for DefaultMounter {
  type Mounter = OsMounter;

  fn new(inner: Arc<Self::Mounter>) -> Self {
    DefaultMounter(inner)
  }

  #[inline]
  fn mounter(&self) -> &Arc<Self::Mounter> {
    &self.0
  }
}

pub struct FakeMounter(Arc<fake::FakeMounter>);

impl FakeMounter {
  pub fn new(mps: impl IntoIterator<Item = MountPoint>) -> Self {
    FakeMounter(Arc::new(fake::FakeMounter::new(mps)))
  }

  /// Pretend the device already carries the given filesystem.
  pub fn set_disk_format(&self, device: impl Into<PathBuf>, fstype: impl Into<String>) {
    self.0.set_disk_format(device.into(), fstype.into())
  }

  pub fn reset_log(&self) {
    self.0.reset_log()
  }

  pub fn get_log(&self) -> Vec<FakeAction> {
    self.0.get_log()
  }
}

impl MounterWrapper for FakeMounter {
  type Mounter = fake::FakeMounter;

  fn new(inner: Arc<Self::Mounter>) -> Self {
    FakeMounter(inner)
  }

  #[inline]
  fn mounter(&self) -> &Arc<Self::Mounter> {
    &self.0
  }
}
