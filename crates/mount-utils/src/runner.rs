use crate::{MountError, MountPoint, Result};
use futures::channel::oneshot::{channel as oneshot, Receiver, Sender};
use once_cell::sync::OnceCell;
use smallvec::SmallVec;
use std::{
  fs,
  future::Future,
  panic::{catch_unwind, RefUnwindSafe, UnwindSafe},
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};
use tracing::{error, info, Span};

pub(crate) type Options = SmallVec<[String; 4]>;

struct MounterMessage {
  span: Span,
  run: Box<dyn FnOnce(Span) + Send + UnwindSafe + RefUnwindSafe>,
}

impl MounterMessage {
  fn new(span: Span, f: impl FnOnce(Span) + Send + UnwindSafe + RefUnwindSafe + 'static) -> Self {
    Self {
      span,
      run: Box::new(f),
    }
  }
}

// Span isn't unwindsafe due to dyn content - but it should be unwind safe in practice (missing some bounds)
impl UnwindSafe for MounterMessage {}

type MounterDispatcher = crossbeam::channel::Sender<MounterMessage>;

// Note: All these methods are to be run in a separate thread, ensuring
// that only one runs at once, and that it does not block async processing.
pub trait MounterImpl: Sized + Send + Sync + UnwindSafe + RefUnwindSafe + 'static {
  /// Create a new mounter that invokes the mount binary at mount_path.
  fn new(mount_path: PathBuf) -> Result<Self>;

  /// Mounts source to target as fstype with given options.
  fn mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: String,
    options: Options,
  ) -> Result<()>;

  /// Unmount unmounts given target. If a force_after is provided, will retry
  /// after that amount of time with force option.
  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> Result<()>;

  /// List returns a list of all mounted filesystems. This is guaranteed to be
  /// consistent.
  fn list(&self) -> Result<Vec<MountPoint>>;

  /// Probes the filesystem on the device. `None` means unformatted.
  fn get_disk_format(&self, device: &Path) -> Result<Option<String>>;

  /// Creates a fstype filesystem on the device.
  fn format(&self, device: &Path, fstype: &str) -> Result<()>;

  fn format_and_mount(
    &self,
    source: PathBuf,
    target: PathBuf,
    fstype: String,
    options: Options,
  ) -> Result<()> {
    let read_only = options.iter().any(|o| o == "ro");

    match self.get_disk_format(&source)? {
      None if read_only => return Err(MountError::UnformattedReadOnly(source)),
      None => {
        info!(
          "Disk {} appears to be unformatted, formatting as {}",
          source.display(),
          fstype
        );
        self.format(&source, &fstype)?;
      }
      Some(existing) if existing != fstype => {
        return Err(MountError::FilesystemMismatch {
          device: source,
          existing,
          requested: fstype,
        })
      }
      Some(_) => (),
    }

    self.mount(Some(source), target, fstype, options)
  }

  /// Finds every mount path the device is mounted at.
  fn get_device_refs(&self, device: &Path) -> Result<Vec<PathBuf>> {
    Ok(
      self
        .list()?
        .into_iter()
        .filter(|m| m.device() == device)
        .map(|m| m.path)
        .collect(),
    )
  }

  fn get_device_name_from_mount(&self, mount_path: PathBuf) -> Result<Option<(PathBuf, usize)>> {
    let mps = self.list()?;

    // If mountPath is symlink, need get its target path.
    let mount_path = fs::canonicalize(&mount_path).unwrap_or(mount_path);

    // Find the device name.
    // FIXME if multiple devices mounted on the same mount path, only the first one is returned.
    Ok(
      mps
        .iter()
        .find(|m| m.path() == mount_path)
        .map(|m| m.device().to_owned())
        .map(|device| {
          let ref_count = mps.iter().filter(|m| m.device() == device).count();
          (device, ref_count)
        }),
    )
  }

  fn device_mount_count(&self, target: PathBuf) -> Result<usize> {
    Ok(
      self
        .get_device_name_from_mount(target)?
        .map(|(_, refs)| refs)
        .unwrap_or(0),
    )
  }
}

static DISPATCHER: OnceCell<MounterDispatcher> = OnceCell::new();

fn dispatcher() -> Result<&'static MounterDispatcher> {
  DISPATCHER
    .get_or_try_init(|| {
      let (sender, receiver) = crossbeam::channel::unbounded::<MounterMessage>();

      std::thread::Builder::new()
        .name("mount-utils:dispatch".into())
        .spawn(move || {
          while let Ok(msg) = receiver.recv() {
            if let Err(e) = catch_unwind(move || {
              let MounterMessage { span, run } = msg;
              run(span)
            }) {
              error!("Failed to run mount function in dispatcher: {:?}", e);
            }
          }
        })
        .map(|_| sender)
    })
    .map_err(|e| MountError::new(format!("failed to spawn dispatcher: {:?}", e)))
}

pub(crate) fn run<R: 'static, F: 'static>(f: F) -> impl Future<Output = Result<R>>
where
  F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
  R: UnwindSafe + RefUnwindSafe + Send,
{
  struct OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
    run: F,
    sender: Sender<Result<R>>,
  }

  impl<R, F> UnwindSafe for OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
  }

  impl<R, F> RefUnwindSafe for OuterMsg<R, F>
  where
    F: FnOnce() -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
    R: UnwindSafe + RefUnwindSafe,
  {
  }

  let span = Span::current();
  let (sender, receiver) = oneshot();

  match dispatcher() {
    Ok(dispatch) => {
      let msg = OuterMsg { run: f, sender };

      // A send only fails once the dispatcher thread is gone, in which case
      // the dropped sender surfaces as a cancelled request in `read`.
      let _ = dispatch.send(MounterMessage::new(span, move |span| {
        let OuterMsg { run, sender } = msg;
        let result = {
          let _enter = span.enter();
          run()
        };

        let _ = sender.send(result);
      }));
    }
    Err(e) => {
      let _ = sender.send(Err(e));
    }
  };

  read(receiver)
}

pub(crate) fn run_inst<T: MounterImpl, R: 'static, F: 'static>(
  mounter: Arc<T>,
  f: F,
) -> impl Future<Output = Result<R>>
where
  F: FnOnce(&T) -> Result<R> + Send + UnwindSafe + RefUnwindSafe,
  R: UnwindSafe + RefUnwindSafe + Send,
{
  run(move || f(&*mounter))
}

async fn read<R>(receiver: Receiver<Result<R>>) -> Result<R> {
  match receiver.await {
    Ok(r) => r,
    Err(_cancelled) => Err(MountError::new("request was cancelled (thread paniced?)")),
  }
}

// MakeBindOpts detects whether a bind mount is being requested and makes the remount options to
// use in case of bind mount, due to the fact that bind mount doesn't respect mount options.
// The list equals:
//   options - 'bind' + 'remount' (no duplicate)
pub(crate) fn make_bind_opts(opts: &[String]) -> (bool, Vec<String>, Vec<String>) {
  let mut bind_remount_opts = vec!["bind".to_owned(), "remount".to_owned()];
  let mut bind = false;
  let mut bind_opts = vec!["bind".to_owned()];

  for opt in opts {
    match opt.as_str() {
      "bind" => {
        bind = true;
      }
      "_netdev" => {
        // _netdev is a userspace mount option and does not automatically get added when
        // bind mount is created and hence we must carry it over.
        bind_opts.push("_netdev".to_owned());
        bind_remount_opts.push("_netdev".to_owned());
      }
      _ => bind_remount_opts.push(opt.clone()),
    }
  }

  (bind, bind_opts, bind_remount_opts)
}

pub trait MounterWrapper {
  type Mounter: MounterImpl;

  fn new(inner: Arc<Self::Mounter>) -> Self;

  fn mounter(&self) -> &Arc<Self::Mounter>;
}
