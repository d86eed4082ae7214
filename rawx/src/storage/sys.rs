//! Thin wrappers over the syscalls tokio does not cover: extended
//! attributes, preallocation, no-replace rename and filesystem usage.
//!
//! Everything here blocks; async callers go through `spawn_blocking`.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn name_to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "attribute contains a NUL byte"))
}

/// Whether `err` means the filesystem lacks the requested feature.
pub fn is_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTSUP) | Some(libc::ENOSYS) | Some(libc::EINVAL)
    )
}

/// Whether `err` is "no space left on device".
pub fn is_no_space(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOSPC) | Some(libc::EDQUOT))
}

#[cfg(target_os = "linux")]
pub fn get_xattr(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let cpath = path_to_cstring(path)?;
    let cname = name_to_cstring(name)?;
    let size =
        unsafe { libc::lgetxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(None);
        }
        return Err(err);
    }
    let mut buf = vec![0u8; size as usize];
    let res = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(None);
        }
        return Err(err);
    }
    buf.truncate(res as usize);
    Ok(Some(buf))
}

#[cfg(target_os = "linux")]
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    setxattr_flags(path, name, value, 0)
}

/// Like [`set_xattr`] but fails with `AlreadyExists` if the attribute is set.
#[cfg(target_os = "linux")]
pub fn create_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    setxattr_flags(path, name, value, libc::XATTR_CREATE)
}

#[cfg(target_os = "linux")]
fn setxattr_flags(path: &Path, name: &str, value: &[u8], flags: libc::c_int) -> io::Result<()> {
    let cpath = path_to_cstring(path)?;
    let cname = name_to_cstring(name)?;
    let res = unsafe {
        libc::lsetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn remove_xattr(path: &Path, name: &str) -> io::Result<()> {
    let cpath = path_to_cstring(path)?;
    let cname = name_to_cstring(name)?;
    let res = unsafe { libc::lremovexattr(cpath.as_ptr(), cname.as_ptr()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn get_xattr(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
pub fn set_xattr(_path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
pub fn create_xattr(_path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
pub fn remove_xattr(_path: &Path, _name: &str) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Reserves `len` bytes for `file` without changing its size. Filesystems
/// without preallocation support are silently accepted; running out of
/// space is not.
#[cfg(target_os = "linux")]
pub fn preallocate(file: &File, len: u64) -> io::Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};
    use std::os::fd::AsRawFd;

    if len == 0 {
        return Ok(());
    }
    let len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "preallocation too large"))?;
    if let Err(errno) = fallocate(file.as_raw_fd(), FallocateFlags::FALLOC_FL_KEEP_SIZE, 0, len) {
        let err = io::Error::from(errno);
        if is_no_space(&err) || !is_unsupported(&err) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn preallocate(_file: &File, _len: u64) -> io::Result<()> {
    Ok(())
}

/// Renames `from` to `to`, failing with `AlreadyExists` instead of replacing
/// an existing `to`. Uses `renameat2(RENAME_NOREPLACE)` and falls back to
/// `link` + `unlink` on filesystems that do not support it.
pub fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::fcntl::{RenameFlags, renameat2};

        match renameat2(None, from, None, to, RenameFlags::RENAME_NOREPLACE) {
            Ok(()) => return Ok(()),
            Err(errno) => {
                let err = io::Error::from(errno);
                if !is_unsupported(&err) {
                    return Err(err);
                }
            }
        }
    }

    std::fs::hard_link(from, to)?;
    if let Err(err) = std::fs::remove_file(from) {
        tracing::warn!("published {} but left {}: {err}", to.display(), from.display());
    }
    Ok(())
}

/// Flushes a directory entry table to stable storage.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Total and available bytes of the filesystem holding `path`.
pub fn fs_usage(path: &Path) -> io::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    let frag = stat.fragment_size() as u64;
    Ok((
        stat.blocks() as u64 * frag,
        stat.blocks_available() as u64 * frag,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_noreplace_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let err = rename_noreplace(&a, &b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&b).unwrap(), b"second");
        assert!(a.exists());
    }

    #[test]
    fn test_rename_noreplace_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"payload").unwrap();

        rename_noreplace(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(std::fs::read(&b).unwrap(), b"payload");
    }

    #[test]
    fn test_preallocate_keeps_the_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reserved");
        let file = File::create(&path).unwrap();
        preallocate(&file, 1 << 16).unwrap();
        preallocate(&file, 0).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_fs_usage_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (total, avail) = fs_usage(dir.path()).unwrap();
        assert!(total >= avail);
        assert!(total > 0);
    }
}
