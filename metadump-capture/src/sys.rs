//! Thin wrappers for the raw metadata queries. Each returns the plain
//! success value or the OS error code; recording policy stays with the
//! caller.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

nix::ioctl_read!(fs_ioc_getversion, b'v', 1, libc::c_long);

/// `statx(2)` for the entry `name` below `dirfd`. Symlinks are not
/// followed, automounts not triggered; the basic stats plus the birth
/// time are requested.
pub fn statx(dirfd: RawFd, name: &CStr) -> Result<libc::statx, Errno> {
    let mut stx = MaybeUninit::<libc::statx>::zeroed();
    let ret = unsafe {
        libc::statx(
            dirfd,
            name.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW | libc::AT_NO_AUTOMOUNT,
            libc::STATX_BASIC_STATS | libc::STATX_BTIME,
            stx.as_mut_ptr(),
        )
    };
    Errno::result(ret)?;
    Ok(unsafe { stx.assume_init() })
}

/// `llistxattr(2)`; an empty buffer probes the list size.
pub fn llistxattr(path: &CStr, buf: &mut [u8]) -> Result<usize, Errno> {
    let bytes = unsafe {
        libc::llistxattr(
            path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if bytes < 0 {
        return Err(Errno::last());
    }
    Ok(bytes as usize)
}

/// `lgetxattr(2)`; an empty buffer probes the value size.
pub fn lgetxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> Result<usize, Errno> {
    let bytes = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if bytes < 0 {
        return Err(Errno::last());
    }
    Ok(bytes as usize)
}
