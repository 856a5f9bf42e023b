pub mod fd {
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use nix::NixPath;

    pub fn openat<D: AsRawFd, P: ?Sized + NixPath>(
        dirfd: &D,
        path: &P,
        oflag: OFlag,
        mode: Mode,
    ) -> Result<OwnedFd, Errno> {
        let fd = nix::fcntl::openat(dirfd.as_raw_fd(), path, oflag, mode)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

pub mod fs {
    // /usr/include/linux/fs.h: #define FS_IOC_GETFLAGS _IOR('f', 1, long)
    nix::ioctl_read!(read_attr_fd, b'f', 1, libc::c_long);

    // #define FS_IOC_FSGETXATTR _IOR('X', 31, struct fsxattr)
    nix::ioctl_read!(fs_ioc_fsgetxattr, b'X', 31, FSXAttr);

    #[repr(C)]
    #[derive(Debug)]
    pub struct FSXAttr {
        pub fsx_xflags: u32,
        pub fsx_extsize: u32,
        pub fsx_nextents: u32,
        pub fsx_projid: u32,
        pub fsx_cowextsize: u32,
        pub fsx_pad: [u8; 8],
    }

    impl Default for FSXAttr {
        fn default() -> Self {
            FSXAttr {
                fsx_xflags: 0u32,
                fsx_extsize: 0u32,
                fsx_nextents: 0u32,
                fsx_projid: 0u32,
                fsx_cowextsize: 0u32,
                fsx_pad: [0u8; 8],
            }
        }
    }
}
