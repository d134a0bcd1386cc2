use crate::{
  runner::{make_bind_opts, MounterImpl, Options},
  MountError, MountPoint, Result,
};
use crossbeam::{scope, select};
use duct::cmd;
use smallvec::SmallVec;
use std::{
  ffi::OsString,
  fs, io,
  num::NonZeroUsize,
  path::{Path, PathBuf},
  time::Duration,
};
use tracing::{debug, error, info};

const PROC_MOUNTS_PATH: &str = "/proc/mounts";
const MAX_LIST_TRIES: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(3) };
const EXPECTED_FIELDS_PER_MOUNTS_LINE: usize = 6;

// blkid exits with 2 when the device carries no recognizable signature.
const BLKID_NOTHING_FOUND: i32 = 2;

pub struct OsMounter {
  mounter_path: PathBuf,
}

impl MounterImpl for OsMounter {
  fn new(mounter_path: PathBuf) -> Result<Self> {
    Ok(OsMounter { mounter_path })
  }

  fn mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: String,
    options: Options,
  ) -> Result<()> {
    let (bind, bind_opts, bind_remount_opts) = make_bind_opts(&options);
    if bind {
      self.do_mount(source.clone(), target.clone(), &fstype, &bind_opts)?;
      self.do_mount(source, target, &fstype, &bind_remount_opts)
    } else {
      self.do_mount(source, target, &fstype, &options)
    }
  }

  fn unmount(&self, target: PathBuf, force_after: Option<Duration>) -> Result<()> {
    info!("Unmounting {}", target.display());
    let cmd = cmd!("umount", &target).stderr_to_stdout();

    let run_forced = match force_after {
      None => {
        cmd.run()?;
        false
      }
      Some(duration) => {
        let handle = cmd.start()?;
        let handle = &handle;
        scope::<'_, _, Result<bool>>(|s| {
          let (sender, receiver) = crossbeam::channel::bounded(1);

          s.spawn(move |_| {
            let result = handle.wait().map(|_| ());
            let _ = sender.send(result);
          });

          let succeeded = select! {
            recv(receiver) -> result => match result {
              Ok(Ok(())) => true,
              Ok(Err(e)) => return Err(e.into()),
              Err(_) => false,
            },
            default(duration) => false,
          };

          drop(receiver);
          if !succeeded {
            let _ = handle.kill();
          }

          Ok(!succeeded)
        })
        .map_err(|e| MountError::new(format!("Failed to spawn threads: {:?}", e)))??
      }
    };

    if run_forced {
      info!("Unmount of {} timed out, forcing", target.display());
      cmd!("umount", "-f", &target).stderr_to_stdout().run()?;
    }

    Ok(())
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    list_proc_mounts(PROC_MOUNTS_PATH.as_ref())
  }

  fn get_disk_format(&self, device: &Path) -> Result<Option<String>> {
    let output = cmd!(
      "blkid", "-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device
    )
    .stdout_capture()
    .stderr_capture()
    .unchecked()
    .run()
    .map_err(|e| MountError::GetDiskFormatFailed(device.to_owned(), e))?;

    if output.status.code() == Some(BLKID_NOTHING_FOUND) {
      return Ok(None);
    }

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(MountError::GetDiskFormatFailed(
        device.to_owned(),
        io::Error::new(
          io::ErrorKind::Other,
          format!("blkid failed with {:?}: {}", output.status, stderr.trim()),
        ),
      ));
    }

    let format = parse_blkid_export(&String::from_utf8_lossy(&output.stdout));
    debug!("Disk {} has format {:?}", device.display(), format);
    Ok(format)
  }

  fn format(&self, device: &Path, fstype: &str) -> Result<()> {
    let mkfs = format!("mkfs.{}", fstype);
    let args: Vec<OsString> = match fstype {
      "ext3" | "ext4" => vec!["-F".into(), "-m0".into(), device.into()],
      _ => vec![device.into()],
    };

    info!("Formatting {} with {}", device.display(), mkfs);
    cmd(mkfs, args)
      .stderr_to_stdout()
      .stdout_capture()
      .run()
      .map(|_| ())
      .map_err(|e| {
        error!("Format of {} failed: {:?}", device.display(), e);
        MountError::FormatFailed(device.to_owned(), e)
      })
  }
}

impl OsMounter {
  /// do_mount runs the mount command.
  fn do_mount(
    &self,
    source: Option<PathBuf>,
    target: PathBuf,
    fstype: &str,
    options: &[String],
  ) -> Result<()> {
    let (mount_args, log_str) = make_mount_args(source, target, fstype, options);

    info!(
      "Mounting cmd {} with arguments ({})",
      self.mounter_path.display(),
      log_str
    );
    match cmd(self.mounter_path.as_path(), mount_args).stderr_to_stdout().run() {
      Ok(_) => Ok(()),
      Err(e) => {
        error!("Mount failed: {:?}", e);
        Err(e.into())
      }
    }
  }
}

// make_mount_args makes the arguments to the mount(8) command.
fn make_mount_args(
  source: Option<PathBuf>,
  target: PathBuf,
  fstype: &str,
  options: &[String],
) -> (Vec<OsString>, String) {
  // Build mount command as follows:
  //   mount [-t $fstype] [-o $options] [$source] $target
  let mut mount_args: Vec<OsString> = Vec::new();
  let mut log_parts: Vec<String> = Vec::new();

  if !fstype.is_empty() {
    mount_args.push("-t".into());
    mount_args.push(fstype.into());
    log_parts.push(format!("-t {}", fstype));
  }

  if !options.is_empty() {
    let joined = options.join(",");
    mount_args.push("-o".into());
    mount_args.push(joined.clone().into());
    log_parts.push(format!("-o {}", joined));
  }

  if let Some(source) = source {
    log_parts.push(source.display().to_string());
    mount_args.push(source.into());
  }

  log_parts.push(target.display().to_string());
  mount_args.push(target.into());

  (mount_args, log_parts.join(" "))
}

fn parse_blkid_export(output: &str) -> Option<String> {
  let mut fs_type = None;
  let mut pt_type = None;

  for line in output.lines() {
    let mut parts = line.trim().splitn(2, '=');
    match (parts.next(), parts.next()) {
      (Some("TYPE"), Some(v)) if !v.is_empty() => fs_type = Some(v.to_owned()),
      (Some("PTTYPE"), Some(v)) if !v.is_empty() => pt_type = Some(v.to_owned()),
      _ => (),
    }
  }

  // A partition table without a filesystem must never be formatted over.
  match (fs_type, pt_type) {
    (Some(fs), _) => Some(fs),
    (None, Some(_)) => Some("unknown data, probably partitions".to_owned()),
    (None, None) => None,
  }
}

fn list_proc_mounts(mount_file_path: &Path) -> Result<Vec<MountPoint>> {
  let content = consistent_read(mount_file_path, MAX_LIST_TRIES)?;

  parse_proc_mounts(&content)
}

/// ConsistentRead repeatedly reads a file until it gets the same content twice. This is useful when reading files
/// in /proc that are larger than page size and kernel may modify them between individual read() syscalls.
fn consistent_read(path: &Path, attempts: NonZeroUsize) -> io::Result<Vec<u8>> {
  let mut old_content = fs::read(path)?;

  for _ in 0..attempts.get() {
    let new_content = fs::read(path)?;
    if new_content == old_content {
      return Ok(new_content);
    }

    // Files are different, continue reading
    old_content = new_content;
  }

  Err(io::Error::new(
    io::ErrorKind::Other,
    format!(
      "could not get consistent content of '{}' after {} attempts",
      path.display(),
      attempts.get()
    ),
  ))
}

fn parse_proc_mounts(content: &[u8]) -> Result<Vec<MountPoint>> {
  let mut out = Vec::new();
  let s = std::str::from_utf8(content)
    .map_err(|_| MountError::new("proc mounts contain invalid UTF8"))?;
  for line in s.lines() {
    if line.trim().is_empty() {
      continue;
    }

    let fields = line
      .split_whitespace()
      .collect::<SmallVec<[&str; EXPECTED_FIELDS_PER_MOUNTS_LINE]>>();
    if fields.len() != EXPECTED_FIELDS_PER_MOUNTS_LINE {
      return Err(MountError::new(format!(
        "wrong number of fields (expected {}, got {})",
        EXPECTED_FIELDS_PER_MOUNTS_LINE,
        fields.len()
      )));
    }

    let freq = fields[4]
      .parse()
      .map_err(|e| MountError::new(format!("invalid freq: {:?}", e)))?;
    let pass = fields[5]
      .parse()
      .map_err(|e| MountError::new(format!("invalid pass: {:?}", e)))?;

    out.push(MountPoint {
      device: PathBuf::from(fields[0]),
      path: PathBuf::from(unescape_octal(fields[1])),
      ty: fields[2].to_owned(),
      opts: fields[3].split(',').map(ToOwned::to_owned).collect(),
      freq,
      pass,
    })
  }

  Ok(out)
}

// The kernel escapes space, tab, newline and backslash in mount paths as \ooo.
fn unescape_octal(field: &str) -> String {
  let bytes = field.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'\\' {
      if let Some(v) = field
        .get(i + 1..i + 4)
        .and_then(|digits| u8::from_str_radix(digits, 8).ok())
      {
        out.push(v);
        i += 4;
        continue;
      }
    }
    out.push(bytes[i]);
    i += 1;
  }

  String::from_utf8_lossy(&out).into_owned()
}
