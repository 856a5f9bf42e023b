//! The capture session: depth first walk over a directory tree,
//! recording one metadata record per entry and the matching structural
//! stream.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use nix::dir::{Dir, Type};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use proxmox_sys::fs;

use metadump_format::file_formats::{write_version, DATA_OFFSET};
use metadump_format::record::{
    self, ContentDigest, FlagsProbe, FsxattrImage, InodeFlags, Record, StatBlock, StatImage,
    TimestampImage, TwoCall,
};
use metadump_format::tree::TreeWriter;

use crate::digest::ContentDigester;
use crate::scratch::ScratchBuffer;
use crate::sys;

/// Capture failure bound to the filesystem path being processed.
#[derive(Debug)]
pub struct CaptureError {
    path: PathBuf,
    error: Error,
}

impl CaptureError {
    pub fn new(path: PathBuf, error: Error) -> Self {
        Self { path, error }
    }
}

impl std::error::Error for CaptureError {}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "error at {:?}: {}", self.path, self.error)
    }
}

fn errno_is_unsupported(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOTTY | Errno::ENOSYS | Errno::EBADF | Errno::EOPNOTSUPP | Errno::EINVAL
    )
}

fn type_tag(file_type: Type) -> u8 {
    match file_type {
        Type::Fifo => libc::DT_FIFO,
        Type::CharacterDevice => libc::DT_CHR,
        Type::Directory => libc::DT_DIR,
        Type::BlockDevice => libc::DT_BLK,
        Type::File => libc::DT_REG,
        Type::Symlink => libc::DT_LNK,
        Type::Socket => libc::DT_SOCK,
    }
}

fn timestamp_image(ts: &libc::statx_timestamp) -> TimestampImage {
    TimestampImage {
        secs: ts.tv_sec,
        nanos: ts.tv_nsec,
    }
}

fn stat_image(stx: &libc::statx) -> StatImage {
    StatImage {
        mask: stx.stx_mask,
        blksize: stx.stx_blksize,
        attributes: stx.stx_attributes,
        nlink: stx.stx_nlink,
        uid: stx.stx_uid,
        gid: stx.stx_gid,
        mode: stx.stx_mode,
        ino: stx.stx_ino,
        size: stx.stx_size,
        blocks: stx.stx_blocks,
        attributes_mask: stx.stx_attributes_mask,
        atime: timestamp_image(&stx.stx_atime),
        btime: timestamp_image(&stx.stx_btime),
        ctime: timestamp_image(&stx.stx_ctime),
        mtime: timestamp_image(&stx.stx_mtime),
        rdev_major: stx.stx_rdev_major,
        rdev_minor: stx.stx_rdev_minor,
        dev_major: stx.stx_dev_major,
        dev_minor: stx.stx_dev_minor,
    }
}

/// Counting writer for the data stream. `pos` already carries the
/// offset bias, so the stored offset of the next record is simply the
/// current value.
struct DataWriter<W: Write> {
    writer: W,
    pos: u64,
}

impl<W: Write> DataWriter<W> {
    fn new(writer: W) -> Result<Self, Error> {
        let mut this = Self {
            writer,
            pos: u64::from(DATA_OFFSET),
        };
        write_version(&mut this)?;
        Ok(this)
    }

    fn position(&self) -> Result<u32, Error> {
        u32::try_from(self.pos).map_err(|_| format_err!("data file too large for 32 bit offsets"))
    }
}

impl<W: Write> Write for DataWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.writer.write(buf)?;
        self.pos += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// State of one capture run.
struct Capturer<T: Write, D: Write> {
    tree: TreeWriter<T>,
    data: DataWriter<D>,
    digester: Option<Box<dyn ContentDigester>>,
    scratch: ScratchBuffer,
    path: PathBuf,
    root_device: Option<(u32, u32)>,
}

/// Capture the metadata of the tree rooted at `source` into the two
/// streams. The root entry is recorded first; for a directory root its
/// children follow between the outer scope markers of the structural
/// stream. Both streams are flushed before returning.
pub fn create_snapshot<T: Write, D: Write>(
    source: &Path,
    tree: T,
    data: D,
    digester: Option<Box<dyn ContentDigester>>,
) -> Result<(), Error> {
    let mut capturer = Capturer {
        tree: TreeWriter::new(tree)?,
        data: DataWriter::new(data)?,
        digester,
        scratch: ScratchBuffer::new(),
        path: source.to_path_buf(),
        root_device: None,
    };

    let root = CString::new(source.as_os_str().as_bytes())?;
    capturer
        .capture_entry(libc::AT_FDCWD, &root)
        .map_err(|err| capturer.wrap_err(err))?;

    capturer.tree.flush()?;
    capturer.data.flush()?;
    Ok(())
}

impl<T: Write, D: Write> Capturer<T, D> {
    fn wrap_err(&self, err: Error) -> Error {
        if err.downcast_ref::<CaptureError>().is_some() {
            err
        } else {
            CaptureError::new(self.path.clone(), err).into()
        }
    }

    /// Record one entry, recursing into directories on the guard
    /// device. `name` is relative to `parent_fd`; `self.path` names the
    /// same entry for diagnostics and the path based attribute calls.
    fn capture_entry(&mut self, parent_fd: RawFd, name: &CStr) -> Result<(), Error> {
        let stx = match sys::statx(parent_fd, name) {
            Ok(stx) => stx,
            Err(errno) => bail!("stat failed - {}", errno),
        };
        if self.root_device.is_none() {
            self.root_device = Some((stx.stx_dev_major, stx.stx_dev_minor));
        }

        let mode = u32::from(stx.stx_mode);
        let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;
        let is_regular = mode & libc::S_IFMT == libc::S_IFREG;

        let (mut fd, flags, open_errno) = match self.open_entry(parent_fd, name, is_dir) {
            Ok(fd) => {
                let probe = self.probe_flags(fd.as_raw_fd());
                (Some(fd), InodeFlags::Probed(probe), 0)
            }
            Err(errno) => (None, InodeFlags::Unavailable(errno as i32), errno as i32),
        };

        let path = CString::new(self.path.as_os_str().as_bytes())?;
        let xattr_names = self.two_call(|buf| sys::llistxattr(&path, buf));
        let mut xattr_values = Vec::new();
        if let TwoCall::Data { data, .. } = &xattr_names {
            for name in record::split_xattr_names(data) {
                let name = CString::new(name)?;
                xattr_values.push(self.two_call(|buf| sys::lgetxattr(&path, &name, buf)));
            }
        }

        let digest = if is_regular {
            Some(self.compute_digest(fd.take(), open_errno))
        } else {
            None
        };

        let record = Record {
            stat: StatBlock {
                ret: 0,
                errno: 0,
                stat: stat_image(&stx),
            },
            flags,
            xattr_names,
            xattr_values,
            digest,
        };
        record::write_record(&mut self.data, &record)?;

        if is_dir {
            if self.root_device != Some((stx.stx_dev_major, stx.stx_dev_minor)) {
                log::info!("skipping mount point: {:?}", self.path);
                return Ok(());
            }
            self.capture_directory(fd)?;
        }

        Ok(())
    }

    /// Best-effort open backing the ioctl queries and the content
    /// digest. O_NONBLOCK keeps fifos from hanging the walk; with
    /// O_NOFOLLOW a symlink fails the open and is recorded that way.
    fn open_entry(&self, parent_fd: RawFd, name: &CStr, is_dir: bool) -> Result<OwnedFd, Errno> {
        let mut oflags = OFlag::O_RDONLY
            | OFlag::O_CLOEXEC
            | OFlag::O_NOCTTY
            | OFlag::O_NOFOLLOW
            | OFlag::O_NONBLOCK;
        if is_dir {
            oflags |= OFlag::O_DIRECTORY;
        }
        proxmox_sys::fd::openat(&parent_fd, name, oflags, Mode::empty())
    }

    fn probe_flags(&self, fd: RawFd) -> FlagsProbe {
        let mut probe = FlagsProbe::default();

        let mut attr: libc::c_long = 0;
        match unsafe { fs::read_attr_fd(fd, &mut attr) } {
            Ok(_) => probe.flags = attr as i64,
            Err(errno) => {
                probe.flags_ret = -1;
                probe.flags_errno = errno as i32;
                if !errno_is_unsupported(errno) {
                    log::warn!("failed to read file attributes at {:?}: {}", self.path, errno);
                }
            }
        }

        let mut version: libc::c_long = 0;
        match unsafe { sys::fs_ioc_getversion(fd, &mut version) } {
            Ok(_) => probe.version = version as i64,
            Err(errno) => {
                probe.version_ret = -1;
                probe.version_errno = errno as i32;
                if !errno_is_unsupported(errno) {
                    log::warn!("failed to read version counter at {:?}: {}", self.path, errno);
                }
            }
        }

        let mut fsxattr = fs::FSXAttr::default();
        match unsafe { fs::fs_ioc_fsgetxattr(fd, &mut fsxattr) } {
            Ok(_) => {
                probe.fsx = FsxattrImage {
                    xflags: fsxattr.fsx_xflags,
                    extsize: fsxattr.fsx_extsize,
                    nextents: fsxattr.fsx_nextents,
                    projid: fsxattr.fsx_projid,
                    cowextsize: fsxattr.fsx_cowextsize,
                    pad: [0u8; 8],
                };
            }
            Err(errno) => {
                probe.fsx_ret = -1;
                probe.fsx_errno = errno as i32;
                if !errno_is_unsupported(errno) {
                    log::warn!("failed to read extended flags at {:?}: {}", self.path, errno);
                }
            }
        }

        probe
    }

    /// One size-then-fill query pair through the scratch buffer, the
    /// raw outcome recorded as a [`TwoCall`].
    fn two_call<F>(&mut self, mut call: F) -> TwoCall
    where
        F: FnMut(&mut [u8]) -> Result<usize, Errno>,
    {
        let probe = match call(&mut []) {
            Ok(0) => return TwoCall::Empty,
            Ok(size) => size,
            Err(errno) => return TwoCall::ProbeFailed { errno: errno as i32 },
        };
        let buf = self.scratch.bytes_mut(probe);
        match call(&mut buf[..]) {
            Ok(len) => {
                let data = buf[..len].to_vec();
                TwoCall::Data {
                    probe: probe as i32,
                    data,
                }
            }
            Err(errno) => TwoCall::FillFailed {
                probe: probe as i32,
                errno: errno as i32,
            },
        }
    }

    fn compute_digest(&mut self, fd: Option<OwnedFd>, open_errno: i32) -> ContentDigest {
        let digester = match self.digester.as_deref_mut() {
            Some(digester) => digester,
            None => return ContentDigest::Disabled,
        };
        let fd = match fd {
            Some(fd) => fd,
            None => return ContentDigest::Failed(open_errno),
        };

        let mut file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
        match digester.digest(&mut file) {
            Ok(bytes) => ContentDigest::Bytes(bytes),
            Err(err) => {
                log::warn!("content digest failed at {:?}: {}", self.path, err);
                ContentDigest::Failed(libc::EIO)
            }
        }
    }

    /// Emit the child scope of the directory just recorded: one
    /// (offset, descriptor) pair per child, each followed by the
    /// child's own record via recursion.
    fn capture_directory(&mut self, fd: Option<OwnedFd>) -> Result<(), Error> {
        let mut dir = match fd {
            Some(fd) => Dir::from_fd(fd.into_raw_fd())?,
            None => Dir::open(
                &self.path,
                OFlag::O_RDONLY
                    | OFlag::O_DIRECTORY
                    | OFlag::O_CLOEXEC
                    | OFlag::O_NOCTTY
                    | OFlag::O_NOFOLLOW,
                Mode::empty(),
            )?,
        };

        self.tree.start_directory()?;

        let dir_fd = dir.as_raw_fd();
        for entry in dir.iter() {
            let entry = entry?;

            let file_name = entry.file_name();
            let file_name_bytes = file_name.to_bytes();
            if file_name_bytes == b"." || file_name_bytes == b".." {
                continue;
            }

            let file_type = entry.file_type().map(type_tag).unwrap_or(libc::DT_UNKNOWN);
            let offset = self.data.position()?;
            self.tree
                .add_entry(offset, entry.ino(), file_type, file_name_bytes)?;

            self.path.push(OsStr::from_bytes(file_name_bytes));
            let result = self
                .capture_entry(dir_fd, file_name)
                .map_err(|err| self.wrap_err(err));
            self.path.pop();
            result?;
        }

        self.tree.end_directory()?;
        Ok(())
    }
}

#[test]
fn test_data_writer_position_bias() {
    let mut data = Vec::new();
    let mut writer = DataWriter::new(&mut data).unwrap();
    // version header plus the reserved marker offsets
    assert_eq!(writer.position().unwrap(), 14);
    writer.write_all(b"abcd").unwrap();
    assert_eq!(writer.position().unwrap(), 18);
    drop(writer);
    // physical length stays DATA_OFFSET behind the stored position
    assert_eq!(data.len(), 16);
}

#[test]
fn test_wrap_err_keeps_the_failing_path() {
    let capturer = Capturer::<Vec<u8>, Vec<u8>> {
        tree: TreeWriter::new(Vec::new()).unwrap(),
        data: DataWriter::new(Vec::new()).unwrap(),
        digester: None,
        scratch: ScratchBuffer::new(),
        path: PathBuf::from("/outer"),
        root_device: None,
    };

    let inner = CaptureError::new(PathBuf::from("/outer/inner"), format_err!("stat failed - 13"));
    let wrapped = capturer.wrap_err(inner.into());
    assert_eq!(
        wrapped.to_string(),
        "error at \"/outer/inner\": stat failed - 13"
    );

    let plain = capturer.wrap_err(format_err!("enumeration failed"));
    assert_eq!(plain.to_string(), "error at \"/outer\": enumeration failed");
}
