//! Scoped temporary mounts.
//!
//! [`with_temp_mount`] materializes a [`MountSpec`] onto a fresh temporary
//! directory, runs a closure against it, and tears the mount down on every
//! exit path, including a panic inside the closure.

use std::path::{Path, PathBuf};

use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::event::events;
use a3s_diff_core::{DiffEvent, EventEmitter, MountSpec};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEMP_PREFIX: &str = "a3s-diff-mount-";

/// Mount primitive used by [`with_temp_mount`].
pub trait Mounter: Send + Sync {
    /// Apply every mount in `spec`, in order, beneath `root`.
    fn mount(&self, spec: &MountSpec, root: &Path) -> Result<()>;

    /// Undo [`Mounter::mount`] for the same `spec` and `root`.
    fn unmount(&self, spec: &MountSpec, root: &Path) -> Result<()>;
}

/// Run `f` against a temporary directory with `spec` mounted on it.
///
/// The directory is created under `temp_base` (or the system temp dir) with
/// a random name. It is removed after a successful unmount; if the unmount
/// fails it is left in place so mounted data is never deleted.
///
/// An error from `f` takes precedence over a teardown error, which is then
/// logged and emitted on `events`.
pub fn with_temp_mount<T, F>(
    mounter: &dyn Mounter,
    spec: &MountSpec,
    temp_base: Option<&Path>,
    cancel: &CancellationToken,
    events: Option<&EventEmitter>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&Path) -> Result<T>,
{
    if cancel.is_cancelled() {
        return Err(DiffError::Cancelled);
    }

    let dir = create_temp_dir(temp_base)?;
    let root = dir.path().to_path_buf();

    if let Err(e) = mounter.mount(spec, &root) {
        drop(dir);
        return Err(match e {
            DiffError::MountError(_) => e,
            other => DiffError::MountError(format!(
                "failed to mount onto {}: {}",
                root.display(),
                other
            )),
        });
    }
    tracing::debug!(root = %root.display(), mounts = spec.len(), "Mounted temporary root");

    let mut guard = MountGuard {
        mounter,
        spec,
        dir: Some(dir),
        events,
    };
    let result = f(&root);
    let teardown = guard.teardown();

    match (result, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_err)) => {
            report_teardown_failure(events, &root, &teardown_err, Some(&e));
            Err(e)
        }
    }
}

fn create_temp_dir(temp_base: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_PREFIX);

    let created = match temp_base {
        Some(base) => {
            std::fs::create_dir_all(base).map_err(|e| {
                DiffError::MountError(format!(
                    "failed to create temp base {}: {}",
                    base.display(),
                    e
                ))
            })?;
            builder.tempdir_in(base)
        }
        None => builder.tempdir(),
    };
    created.map_err(|e| DiffError::MountError(format!("failed to create temp mount dir: {}", e)))
}

fn report_teardown_failure(
    events: Option<&EventEmitter>,
    root: &Path,
    err: &DiffError,
    cause: Option<&DiffError>,
) {
    match cause {
        Some(cause) => tracing::warn!(
            root = %root.display(),
            error = %err,
            cause = %cause,
            "Failed to tear down temporary mount after error"
        ),
        None => tracing::warn!(
            root = %root.display(),
            error = %err,
            "Failed to tear down temporary mount"
        ),
    }

    if let Some(events) = events {
        let mut event = DiffEvent::new(events::MOUNT_TEARDOWN_FAILED)
            .with_field("root", root.display().to_string())
            .with_field("error", err.to_string());
        if let Some(cause) = cause {
            event = event.with_field("cause", cause.to_string());
        }
        events.emit(event);
    }
}

/// Tears the mount down if dropped before [`MountGuard::teardown`] ran.
struct MountGuard<'a> {
    mounter: &'a dyn Mounter,
    spec: &'a MountSpec,
    dir: Option<TempDir>,
    events: Option<&'a EventEmitter>,
}

impl MountGuard<'_> {
    fn teardown(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        if let Err(e) = self.mounter.unmount(self.spec, dir.path()) {
            let kept = keep_dir(dir);
            return Err(DiffError::MountError(format!(
                "failed to unmount {} (directory left in place): {}",
                kept.display(),
                e
            )));
        }

        let path = dir.path().to_path_buf();
        dir.close().map_err(|e| {
            DiffError::MountError(format!("failed to remove {}: {}", path.display(), e))
        })
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        let Some(root) = self.dir.as_ref().map(|d| d.path().to_path_buf()) else {
            return;
        };
        if let Err(e) = self.teardown() {
            report_teardown_failure(self.events, &root, &e, None);
        }
    }
}

#[allow(deprecated)]
fn keep_dir(dir: TempDir) -> PathBuf {
    dir.into_path()
}

/// Mounts through the host kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

#[cfg(target_os = "linux")]
impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec, root: &Path) -> Result<()> {
        for (i, m) in spec.mounts().iter().enumerate() {
            let mounted = prepare_mount_point(m, root).and_then(|t| linux::mount_one(m, &t));
            if let Err(e) = mounted {
                let applied = MountSpec::new(spec.mounts()[..i].to_vec());
                if let Err(undo) = self.unmount(&applied, root) {
                    tracing::warn!(
                        root = %root.display(),
                        error = %undo,
                        "Failed to undo partial mount"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn unmount(&self, spec: &MountSpec, root: &Path) -> Result<()> {
        for m in spec.mounts().iter().rev() {
            linux::unmount_all(&m.mount_point(root)?)?;
        }
        Ok(())
    }
}

/// Resolve the mount point of `m` beneath `root`, creating it when it is a
/// subdirectory.
#[cfg(target_os = "linux")]
fn prepare_mount_point(m: &a3s_diff_core::Mount, root: &Path) -> Result<PathBuf> {
    let target = m.mount_point(root)?;
    if target != root {
        std::fs::create_dir_all(&target).map_err(|e| {
            DiffError::MountError(format!(
                "failed to create mount point {}: {}",
                target.display(),
                e
            ))
        })?;
    }
    Ok(target)
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SystemMounter {
    fn mount(&self, _spec: &MountSpec, _root: &Path) -> Result<()> {
        Err(DiffError::MountError(
            "mounting is only supported on Linux".to_string(),
        ))
    }

    fn unmount(&self, _spec: &MountSpec, _root: &Path) -> Result<()> {
        Err(DiffError::MountError(
            "mounting is only supported on Linux".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;

    use a3s_diff_core::error::{DiffError, Result};
    use a3s_diff_core::Mount;

    /// Kernel flags plus the leftover filesystem-specific data string.
    #[derive(Debug, PartialEq, Eq)]
    pub(super) struct ParsedOptions {
        pub flags: libc::c_ulong,
        pub data: String,
    }

    pub(super) fn parse_options(options: &[String]) -> ParsedOptions {
        let mut flags: libc::c_ulong = 0;
        let mut data = Vec::new();

        for option in options {
            match option.as_str() {
                "ro" => flags |= libc::MS_RDONLY,
                "rw" => flags &= !libc::MS_RDONLY,
                "bind" => flags |= libc::MS_BIND,
                "rbind" => flags |= libc::MS_BIND | libc::MS_REC,
                "nosuid" => flags |= libc::MS_NOSUID,
                "nodev" => flags |= libc::MS_NODEV,
                "noexec" => flags |= libc::MS_NOEXEC,
                "noatime" => flags |= libc::MS_NOATIME,
                "relatime" => flags |= libc::MS_RELATIME,
                "sync" => flags |= libc::MS_SYNCHRONOUS,
                "remount" => flags |= libc::MS_REMOUNT,
                other => data.push(other),
            }
        }

        ParsedOptions {
            flags,
            data: data.join(","),
        }
    }

    fn cstring(value: &[u8], what: &str) -> Result<CString> {
        CString::new(value)
            .map_err(|_| DiffError::MountError(format!("{} contains a NUL byte", what)))
    }

    pub(super) fn mount_one(m: &Mount, target: &Path) -> Result<()> {
        let parsed = parse_options(&m.options);
        let source = cstring(m.source.as_bytes(), "mount source")?;
        let target_c = cstring(target.as_os_str().as_bytes(), "mount target")?;
        let fstype = cstring(m.mount_type.as_bytes(), "mount type")?;
        let data = if parsed.data.is_empty() {
            None
        } else {
            Some(cstring(parsed.data.as_bytes(), "mount data")?)
        };
        let data_ptr = data
            .as_ref()
            .map_or(ptr::null(), |d| d.as_ptr() as *const libc::c_void);

        let ret = unsafe {
            libc::mount(
                source.as_ptr(),
                target_c.as_ptr(),
                fstype.as_ptr(),
                parsed.flags,
                data_ptr,
            )
        };
        if ret != 0 {
            return Err(DiffError::MountError(format!(
                "mount {} ({}) on {}: {}",
                m.source,
                m.mount_type,
                target.display(),
                io::Error::last_os_error()
            )));
        }

        // The kernel ignores MS_RDONLY on the initial bind.
        let is_bind = parsed.flags & libc::MS_BIND != 0;
        let is_ro = parsed.flags & libc::MS_RDONLY != 0;
        if is_bind && is_ro {
            let flags = parsed.flags | libc::MS_REMOUNT;
            let ret = unsafe {
                libc::mount(
                    ptr::null(),
                    target_c.as_ptr(),
                    ptr::null(),
                    flags,
                    ptr::null(),
                )
            };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
                return Err(DiffError::MountError(format!(
                    "remount {} read-only: {}",
                    target.display(),
                    err
                )));
            }
        }

        Ok(())
    }

    /// Unmount `target` until it is no longer a mount point.
    pub(super) fn unmount_all(target: &Path) -> Result<()> {
        let target_c = cstring(target.as_os_str().as_bytes(), "mount target")?;
        loop {
            if unsafe { libc::umount2(target_c.as_ptr(), 0) } == 0 {
                continue;
            }
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOENT) => Ok(()),
                _ => Err(DiffError::MountError(format!(
                    "unmount {}: {}",
                    target.display(),
                    err
                ))),
            };
        }
    }
}
