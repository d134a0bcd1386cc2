use crate::{
  runner::{MounterImpl, Options},
  MountError, MountPoint, Result,
};
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};
use tracing::info;

#[derive(Clone, Debug, PartialEq)]
pub enum FakeAction {
  Mount {
    target: PathBuf,
    source: PathBuf,
    fs_type: String,
  },

  Unmount {
    target: PathBuf,
  },

  Format {
    device: PathBuf,
    fs_type: String,
  },
}

struct FakeMounterInner {
  mount_points: Vec<MountPoint>,
  formats: HashMap<PathBuf, String>,
  log: Vec<FakeAction>,
}

pub struct FakeMounter(Mutex<FakeMounterInner>);

impl FakeMounter {
  pub fn new(mps: impl IntoIterator<Item = MountPoint>) -> Self {
    let mount_points = mps.into_iter().collect();
    let inner = FakeMounterInner {
      mount_points,
      formats: HashMap::new(),
      log: Vec::new(),
    };

    Self(Mutex::new(inner))
  }

  fn inner(&self) -> MutexGuard<'_, FakeMounterInner> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn set_disk_format(&self, device: PathBuf, fstype: String) {
    self.inner().formats.insert(device, fstype);
  }

  pub fn reset_log(&self) {
    self.inner().log.clear();
  }

  pub fn get_log(&self) -> Vec<FakeAction> {
    self.inner().log.clone()
  }
}

impl MounterImpl for FakeMounter {
  fn new(_: PathBuf) -> Result<Self> {
    Ok(FakeMounter::new(None))
  }

  fn mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: String,
    options: Options,
  ) -> Result<()> {
    let mut source =
      source.ok_or_else(|| MountError::new("missing required source in fake mounter"))?;
    let mut inner = self.inner();

    if options.iter().any(|opt| opt == "bind") {
      // This is a bind-mount. In order to mimic linux behaviour, we must
      // use the original device of the bind-mount as the real source.
      // E.g. when mounted /dev/sda like this:
      //      $ mount /dev/sda /mnt/test
      //      $ mount -o bind /mnt/test /mnt/bound
      // then /proc/mount contains:
      // /dev/sda /mnt/test
      // /dev/sda /mnt/bound
      // (and not /mnt/test /mnt/bound)
      if let Some(mnt) = inner.mount_points.iter().find(|mnt| mnt.path == source) {
        source = mnt.device.clone();
      }
    }

    inner.mount_points.push(MountPoint {
      device: source.clone(),
      path: target.clone(),
      ty: fstype.clone(),
      opts: options.into_vec(),
      freq: 0,
      pass: 0,
    });
    info!(
      "Fake mounter: mounted {} to {}",
      source.display(),
      target.display()
    );
    inner.log.push(FakeAction::Mount {
      target,
      source,
      fs_type: fstype,
    });

    Ok(())
  }

  fn unmount(&self, target: PathBuf, _: Option<Duration>) -> Result<()> {
    let mut inner = self.inner();

    if let Some(i) = inner.mount_points.iter().position(|mp| mp.path == target) {
      let mp = inner.mount_points.remove(i);
      info!(
        "Fake mounter: unmounted {} from {}",
        mp.device.display(),
        target.display()
      );
    }

    inner.log.push(FakeAction::Unmount { target });
    Ok(())
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    Ok(self.inner().mount_points.clone())
  }

  fn get_disk_format(&self, device: &Path) -> Result<Option<String>> {
    Ok(self.inner().formats.get(device).cloned())
  }

  fn format(&self, device: &Path, fstype: &str) -> Result<()> {
    let mut inner = self.inner();
    inner.formats.insert(device.to_owned(), fstype.to_owned());
    inner.log.push(FakeAction::Format {
      device: device.to_owned(),
      fs_type: fstype.to_owned(),
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::{FakeAction, FakeMounter};
  use crate::{runner::MounterImpl, MountError, MountPoint};
  use std::path::{Path, PathBuf};

  fn mp_simple(device: &'static str, path: &'static str) -> MountPoint {
    MountPoint::new(device, path, "")
  }

  #[test]
  fn get_device_name_from_mount() {
    let fm = FakeMounter::new(vec![
      mp_simple("/dev/vdb", "/var/lib/kubelet/plugins/disk/d-1/globalmount"),
      mp_simple("/dev/vdb", "/var/lib/kubelet/pods/pod-1/volumes/d-1"),
      mp_simple("/dev/vdc", "/var/lib/kubelet/plugins/disk/d-2/globalmount"),
    ]);

    let (device, refs) = fm
      .get_device_name_from_mount("/var/lib/kubelet/pods/pod-1/volumes/d-1".into())
      .expect("list succeeded")
      .expect("device found");
    assert_eq!(device, PathBuf::from("/dev/vdb"));
    assert_eq!(refs, 2);

    assert_eq!(
      fm.device_mount_count("/var/lib/kubelet/plugins/disk/d-2/globalmount".into())
        .expect("count"),
      1
    );
    assert_eq!(
      fm.device_mount_count("/var/fake/directory/that/doesnt/exist".into())
        .expect("count"),
      0
    );
  }

  #[test]
  fn get_device_refs() {
    let fm = FakeMounter::new(vec![
      mp_simple("/dev/vdb", "/mnt/a"),
      mp_simple("/dev/vdb", "/mnt/b"),
      mp_simple("/dev/vdc", "/mnt/c"),
    ]);

    let refs = fm.get_device_refs(Path::new("/dev/vdb")).expect("refs");
    assert_eq!(refs, vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]);
    assert!(fm
      .get_device_refs(Path::new("/dev/vdd"))
      .expect("refs")
      .is_empty());
  }

  #[test]
  fn format_and_mount_formats_blank_disk_once() {
    let fm = FakeMounter::new(None);

    fm.format_and_mount(
      "/dev/vdb".into(),
      "/mnt/a".into(),
      "ext4".into(),
      Default::default(),
    )
    .expect("first mount");
    fm.unmount("/mnt/a".into(), None).expect("unmount");
    fm.format_and_mount(
      "/dev/vdb".into(),
      "/mnt/a".into(),
      "ext4".into(),
      Default::default(),
    )
    .expect("second mount");

    let formats = fm
      .get_log()
      .into_iter()
      .filter(|a| matches!(a, FakeAction::Format { .. }))
      .count();
    assert_eq!(formats, 1);
  }

  #[test]
  fn format_and_mount_rejects_mismatch_and_unformatted_read_only() {
    let fm = FakeMounter::new(None);
    fm.set_disk_format("/dev/vdb".into(), "xfs".into());

    let err = fm
      .format_and_mount(
        "/dev/vdb".into(),
        "/mnt/a".into(),
        "ext4".into(),
        Default::default(),
      )
      .expect_err("mismatch");
    assert!(matches!(err, MountError::FilesystemMismatch { .. }));

    let err = fm
      .format_and_mount(
        "/dev/vdc".into(),
        "/mnt/b".into(),
        "ext4".into(),
        vec!["ro".to_owned()].into(),
      )
      .expect_err("read only");
    assert!(matches!(err, MountError::UnformattedReadOnly(_)));
    assert!(fm.list().expect("list").is_empty());
  }

  #[test]
  fn bind_mount_resolves_original_device() {
    let fm = FakeMounter::new(vec![mp_simple("/dev/vdb", "/mnt/staging")]);

    fm.mount(
      Some("/mnt/staging".into()),
      "/mnt/pod".into(),
      "".into(),
      vec!["bind".to_owned()].into(),
    )
    .expect("bind");

    assert_eq!(
      fm.get_device_refs(Path::new("/dev/vdb")).expect("refs").len(),
      2
    );
  }
}
