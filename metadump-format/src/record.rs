//! Record stream codec: self-describing per-entry metadata records.
//!
//! A record is the concatenation of a fixed stat block, an inode flags
//! block gated on the best-effort open, an extended attribute block
//! replaying the size-then-fill query results, and, for regular files,
//! a content digest unit. Record boundaries exist only by decoding; the
//! tree stream carries the offsets that let a reader seek directly to a
//! record instead.

use std::fmt;
use std::io::{Read, Write};

use anyhow::{bail, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

/// Upper bound on any variable length field read back from a data file.
pub const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;

/// One statx timestamp as stored on disk.
#[derive(Endian, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C, packed)]
pub struct TimestampImage {
    pub secs: i64,
    pub nanos: u32,
}

proxmox_lang::static_assert_size!(TimestampImage, 12);

/// The recorded statx result. `mask` flags which fields the kernel
/// filled in, `attributes_mask` which attribute bits are meaningful.
#[derive(Endian, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C, packed)]
pub struct StatImage {
    pub mask: u32,
    pub blksize: u32,
    pub attributes: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub attributes_mask: u64,
    pub atime: TimestampImage,
    pub btime: TimestampImage,
    pub ctime: TimestampImage,
    pub mtime: TimestampImage,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
}

proxmox_lang::static_assert_size!(StatImage, 126);

impl StatImage {
    pub fn is_regular_file(&self) -> bool {
        let mode = self.mode;
        (mode as u32 & libc::S_IFMT) == libc::S_IFREG
    }
}

/// Stat facet: the statx return code, its error code (0 on success) and
/// the recorded image. Fixed size, leads every record.
#[derive(Endian, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C, packed)]
pub struct StatBlock {
    pub ret: i32,
    pub errno: i32,
    pub stat: StatImage,
}

proxmox_lang::static_assert_size!(StatBlock, 134);

/// FS_IOC_FSGETXATTR result image.
#[derive(Endian, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C, packed)]
pub struct FsxattrImage {
    pub xflags: u32,
    pub extsize: u32,
    pub nextents: u32,
    pub projid: u32,
    pub cowextsize: u32,
    pub pad: [u8; 8],
}

proxmox_lang::static_assert_size!(FsxattrImage, 28);

/// The three ioctl queries behind a successful open, each with its own
/// return and error code. A failed query leaves its value zeroed.
#[derive(Endian, Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C, packed)]
pub struct FlagsProbe {
    pub flags_ret: i32,
    pub flags_errno: i32,
    pub flags: i64,
    pub version_ret: i32,
    pub version_errno: i32,
    pub version: i64,
    pub fsx_ret: i32,
    pub fsx_errno: i32,
    pub fsx: FsxattrImage,
}

proxmox_lang::static_assert_size!(FlagsProbe, 68);

/// Inode flags facet. The ioctl queries need an open file descriptor,
/// so a failed open ends the facet with just the open error code. That
/// case stays distinguishable from an open that succeeded while all
/// three queries failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InodeFlags {
    /// the best-effort open failed with this error code
    Unavailable(i32),
    Probed(FlagsProbe),
}

/// Recorded outcome of one size-then-fill attribute query pair. The
/// same encoding is used for the name list and for each value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TwoCall {
    /// the size query failed with this error code
    ProbeFailed { errno: i32 },
    /// the size query returned zero
    Empty,
    /// the size query succeeded but the fill call failed
    FillFailed { probe: i32, errno: i32 },
    /// probed size and the bytes the fill call returned
    Data { probe: i32, data: Vec<u8> },
}

/// Content digest unit, present for regular files only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContentDigest {
    Bytes(Vec<u8>),
    /// the digest provider was disabled for this run
    Disabled,
    /// the provider or the open it needs failed with this error code
    Failed(i32),
}

/// One decoded data file record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub stat: StatBlock,
    pub flags: InodeFlags,
    /// the NUL separated attribute name list query
    pub xattr_names: TwoCall,
    /// one value query per non-empty listed name, in list order
    pub xattr_values: Vec<TwoCall>,
    /// present exactly when the stat mode denotes a regular file
    pub digest: Option<ContentDigest>,
}

/// Split a raw attribute list into its non-empty NUL separated names.
pub fn split_xattr_names(list: &[u8]) -> impl Iterator<Item = &[u8]> {
    list.split(|byte| *byte == 0).filter(|name| !name.is_empty())
}

fn write_two_call<W: Write>(writer: &mut W, unit: &TwoCall) -> Result<(), Error> {
    match unit {
        TwoCall::ProbeFailed { errno } => {
            unsafe { writer.write_le_value(-1i32)? };
            unsafe { writer.write_le_value(*errno)? };
        }
        TwoCall::Empty => unsafe { writer.write_le_value(0i32)? },
        TwoCall::FillFailed { probe, errno } => {
            if *probe <= 0 {
                bail!("probed size must be positive");
            }
            unsafe { writer.write_le_value(*probe)? };
            unsafe { writer.write_le_value(-1i32)? };
            unsafe { writer.write_le_value(*errno)? };
        }
        TwoCall::Data { probe, data } => {
            if *probe <= 0 {
                bail!("probed size must be positive");
            }
            let len = i32::try_from(data.len())?;
            unsafe { writer.write_le_value(*probe)? };
            unsafe { writer.write_le_value(len)? };
            writer.write_all(data)?;
        }
    }
    Ok(())
}

fn read_two_call<R: Read>(reader: &mut R) -> Result<TwoCall, Error> {
    let probe: i32 = unsafe { reader.read_le_value()? };
    if probe < 0 {
        let errno: i32 = unsafe { reader.read_le_value()? };
        return Ok(TwoCall::ProbeFailed { errno });
    }
    if probe == 0 {
        return Ok(TwoCall::Empty);
    }

    let len: i32 = unsafe { reader.read_le_value()? };
    if len < 0 {
        let errno: i32 = unsafe { reader.read_le_value()? };
        return Ok(TwoCall::FillFailed { probe, errno });
    }
    let len = len as usize;
    if len > MAX_FIELD_SIZE {
        bail!("variable field too long ({} bytes)", len);
    }
    let data = reader.read_exact_allocated(len)?;
    Ok(TwoCall::Data { probe, data })
}

/// Append one record to a data stream.
pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<(), Error> {
    unsafe { writer.write_le_value(record.stat)? };

    match record.flags {
        InodeFlags::Unavailable(errno) => {
            if errno == 0 {
                bail!("open error code must be nonzero");
            }
            unsafe { writer.write_le_value(errno)? };
        }
        InodeFlags::Probed(probe) => {
            unsafe { writer.write_le_value(0i32)? };
            unsafe { writer.write_le_value(probe)? };
        }
    }

    write_two_call(writer, &record.xattr_names)?;
    let listed = match &record.xattr_names {
        TwoCall::Data { data, .. } => split_xattr_names(data).count(),
        _ => 0,
    };
    if record.xattr_values.len() != listed {
        bail!(
            "attribute value count {} does not match the {} listed names",
            record.xattr_values.len(),
            listed
        );
    }
    for value in &record.xattr_values {
        write_two_call(writer, value)?;
    }

    let image = record.stat.stat;
    match (&record.digest, image.is_regular_file()) {
        (Some(_), false) => bail!("content digest on a non-regular entry"),
        (None, true) => bail!("regular file record is missing its digest unit"),
        _ => {}
    }
    if let Some(digest) = &record.digest {
        match digest {
            ContentDigest::Bytes(data) => {
                if data.is_empty() {
                    bail!("empty content digest");
                }
                let len = i32::try_from(data.len())?;
                unsafe { writer.write_le_value(len)? };
                writer.write_all(data)?;
            }
            ContentDigest::Disabled => unsafe { writer.write_le_value(0i32)? },
            ContentDigest::Failed(errno) => {
                unsafe { writer.write_le_value(-1i32)? };
                unsafe { writer.write_le_value(*errno)? };
            }
        }
    }

    Ok(())
}

/// Decode one record starting at the current stream position.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Record, Error> {
    let stat: StatBlock = unsafe { reader.read_le_value()? };

    let status: i32 = unsafe { reader.read_le_value()? };
    let flags = if status != 0 {
        InodeFlags::Unavailable(status)
    } else {
        InodeFlags::Probed(unsafe { reader.read_le_value()? })
    };

    let xattr_names = read_two_call(reader)?;
    let mut xattr_values = Vec::new();
    if let TwoCall::Data { data, .. } = &xattr_names {
        for _ in split_xattr_names(data) {
            xattr_values.push(read_two_call(reader)?);
        }
    }

    let image = stat.stat;
    let digest = if image.is_regular_file() {
        let len: i32 = unsafe { reader.read_le_value()? };
        Some(if len > 0 {
            let len = len as usize;
            if len > MAX_FIELD_SIZE {
                bail!("content digest too long ({} bytes)", len);
            }
            ContentDigest::Bytes(reader.read_exact_allocated(len)?)
        } else if len == 0 {
            ContentDigest::Disabled
        } else {
            ContentDigest::Failed(unsafe { reader.read_le_value()? })
        })
    } else {
        None
    };

    Ok(Record {
        stat,
        flags,
        xattr_names,
        xattr_values,
        digest,
    })
}

fn masked(mask: u32, bits: u32) -> &'static str {
    if mask & bits != 0 {
        ""
    } else {
        " (not in mask)"
    }
}

fn format_timestamp(ts: TimestampImage) -> String {
    let TimestampImage { secs, nanos } = ts;
    match proxmox_time::strftime_local("%c", secs) {
        Ok(text) => format!("{}.{:09} ({})", secs, nanos, text),
        Err(_) => format!("{}.{:09}", secs, nanos),
    }
}

fn format_bytes(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) if !text.chars().any(char::is_control) => format!("{:?}", text),
        _ => format!("hex {}", hex::encode(data)),
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let StatBlock { ret, errno, stat } = self.stat;
        writeln!(f, "stat: ret {}, errno {}", ret, errno)?;

        let StatImage {
            mask,
            blksize,
            attributes,
            nlink,
            uid,
            gid,
            mode,
            ino,
            size,
            blocks,
            attributes_mask,
            atime,
            btime,
            ctime,
            mtime,
            rdev_major,
            rdev_minor,
            dev_major,
            dev_minor,
        } = stat;
        writeln!(
            f,
            "  mode: 0o{:o}{}",
            mode,
            masked(mask, libc::STATX_TYPE | libc::STATX_MODE)
        )?;
        writeln!(f, "  nlink: {}{}", nlink, masked(mask, libc::STATX_NLINK))?;
        writeln!(f, "  uid: {}{}", uid, masked(mask, libc::STATX_UID))?;
        writeln!(f, "  gid: {}{}", gid, masked(mask, libc::STATX_GID))?;
        writeln!(f, "  ino: {}{}", ino, masked(mask, libc::STATX_INO))?;
        writeln!(f, "  size: {}{}", size, masked(mask, libc::STATX_SIZE))?;
        writeln!(f, "  blocks: {}{}", blocks, masked(mask, libc::STATX_BLOCKS))?;
        writeln!(f, "  blksize: {}", blksize)?;
        writeln!(
            f,
            "  atime: {}{}",
            format_timestamp(atime),
            masked(mask, libc::STATX_ATIME)
        )?;
        writeln!(
            f,
            "  btime: {}{}",
            format_timestamp(btime),
            masked(mask, libc::STATX_BTIME)
        )?;
        writeln!(
            f,
            "  ctime: {}{}",
            format_timestamp(ctime),
            masked(mask, libc::STATX_CTIME)
        )?;
        writeln!(
            f,
            "  mtime: {}{}",
            format_timestamp(mtime),
            masked(mask, libc::STATX_MTIME)
        )?;
        writeln!(
            f,
            "  attributes: 0x{:x} (meaningful bits 0x{:x})",
            attributes, attributes_mask
        )?;
        writeln!(f, "  rdev: {}:{}", rdev_major, rdev_minor)?;
        writeln!(f, "  dev: {}:{}", dev_major, dev_minor)?;

        match self.flags {
            InodeFlags::Unavailable(errno) => {
                writeln!(f, "inode flags: open failed, errno {}", errno)?;
            }
            InodeFlags::Probed(probe) => {
                let FlagsProbe {
                    flags_ret,
                    flags_errno,
                    flags,
                    version_ret,
                    version_errno,
                    version,
                    fsx_ret,
                    fsx_errno,
                    fsx,
                } = probe;
                if flags_ret == 0 {
                    writeln!(f, "flags: 0x{:x} (ret 0)", flags)?;
                } else {
                    writeln!(f, "flags: failed (ret {}, errno {})", flags_ret, flags_errno)?;
                }
                if version_ret == 0 {
                    writeln!(f, "generation: {} (ret 0)", version)?;
                } else {
                    writeln!(
                        f,
                        "generation: failed (ret {}, errno {})",
                        version_ret, version_errno
                    )?;
                }
                if fsx_ret == 0 {
                    let FsxattrImage {
                        xflags,
                        extsize,
                        nextents,
                        projid,
                        cowextsize,
                        pad: _,
                    } = fsx;
                    writeln!(
                        f,
                        "fsxattr: xflags 0x{:x}, extsize {}, nextents {}, projid {}, cowextsize {} (ret 0)",
                        xflags, extsize, nextents, projid, cowextsize
                    )?;
                } else {
                    writeln!(f, "fsxattr: failed (ret {}, errno {})", fsx_ret, fsx_errno)?;
                }
            }
        }

        match &self.xattr_names {
            TwoCall::ProbeFailed { errno } | TwoCall::FillFailed { errno, .. } => {
                writeln!(f, "xattrs: list failed, errno {}", errno)?;
            }
            TwoCall::Empty => writeln!(f, "xattrs: none")?,
            TwoCall::Data { data, .. } => {
                for (name, value) in split_xattr_names(data).zip(&self.xattr_values) {
                    let name = String::from_utf8_lossy(name);
                    match value {
                        TwoCall::ProbeFailed { errno } | TwoCall::FillFailed { errno, .. } => {
                            writeln!(f, "xattr {}: failed, errno {}", name, errno)?;
                        }
                        TwoCall::Empty => writeln!(f, "xattr {}: (empty)", name)?,
                        TwoCall::Data { data, .. } => {
                            writeln!(f, "xattr {}: {}", name, format_bytes(data))?;
                        }
                    }
                }
            }
        }

        if let Some(digest) = &self.digest {
            match digest {
                ContentDigest::Bytes(data) => writeln!(f, "content digest: {}", hex::encode(data))?,
                ContentDigest::Disabled => writeln!(f, "content digest: not captured")?,
                ContentDigest::Failed(errno) => {
                    writeln!(f, "content digest: failed, errno {}", errno)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
fn sample_stat() -> StatBlock {
    StatBlock {
        ret: 0,
        errno: 0,
        stat: StatImage {
            mask: libc::STATX_BASIC_STATS | libc::STATX_BTIME,
            blksize: 4096,
            attributes: 0,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            mode: (libc::S_IFREG | 0o644) as u16,
            ino: 42,
            size: 8192,
            blocks: 16,
            attributes_mask: 0x70,
            atime: TimestampImage { secs: 1_700_000_000, nanos: 1 },
            btime: TimestampImage { secs: 1_700_000_001, nanos: 2 },
            ctime: TimestampImage { secs: 1_700_000_002, nanos: 3 },
            mtime: TimestampImage { secs: 1_700_000_003, nanos: 4 },
            rdev_major: 0,
            rdev_minor: 0,
            dev_major: 254,
            dev_minor: 3,
        },
    }
}

#[test]
fn test_minimal_record_size() {
    let mut stat = sample_stat();
    stat.stat.mode = (libc::S_IFDIR | 0o755) as u16;
    let record = Record {
        stat,
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::Empty,
        xattr_values: Vec::new(),
        digest: None,
    };

    let mut data = Vec::new();
    write_record(&mut data, &record).unwrap();
    // 134 byte stat block + 4 byte open status + 4 byte empty list probe
    assert_eq!(data.len(), 142);
    assert_eq!(read_record(&mut &data[..]).unwrap(), record);
}

#[test]
fn test_record_roundtrip() {
    let names = b"user.alpha\0user.beta\0".to_vec();
    let record = Record {
        stat: sample_stat(),
        flags: InodeFlags::Probed(FlagsProbe {
            flags_ret: 0,
            flags_errno: 0,
            flags: 0x0008_0000,
            version_ret: -1,
            version_errno: 25,
            version: 0,
            fsx_ret: 0,
            fsx_errno: 0,
            fsx: FsxattrImage {
                xflags: 2,
                extsize: 0,
                nextents: 1,
                projid: 7,
                cowextsize: 0,
                pad: [0u8; 8],
            },
        }),
        xattr_names: TwoCall::Data {
            probe: names.len() as i32,
            data: names,
        },
        xattr_values: vec![
            TwoCall::Data {
                probe: 3,
                data: b"one".to_vec(),
            },
            TwoCall::ProbeFailed { errno: 13 },
        ],
        digest: Some(ContentDigest::Bytes(vec![0xab; 32])),
    };

    let mut data = Vec::new();
    write_record(&mut data, &record).unwrap();
    // 134 + 4 + 68 flags probe + (4 + 4 + 21) name list
    //     + (4 + 4 + 3) + (4 + 4) values + (4 + 32) digest
    assert_eq!(data.len(), 290);

    let mut reader = &data[..];
    let decoded = read_record(&mut reader).unwrap();
    assert!(reader.is_empty());
    assert_eq!(decoded, record);
}

#[test]
fn test_records_stay_in_sync() {
    // in-band facet failures must not desynchronize the next record
    let first = Record {
        stat: sample_stat(),
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::FillFailed { probe: 64, errno: 34 },
        xattr_values: Vec::new(),
        digest: Some(ContentDigest::Failed(13)),
    };
    let mut second_stat = sample_stat();
    second_stat.stat.mode = (libc::S_IFLNK | 0o777) as u16;
    second_stat.stat.ino = 43;
    let second = Record {
        stat: second_stat,
        flags: InodeFlags::Unavailable(40),
        xattr_names: TwoCall::ProbeFailed { errno: 95 },
        xattr_values: Vec::new(),
        digest: None,
    };

    let mut data = Vec::new();
    write_record(&mut data, &first).unwrap();
    write_record(&mut data, &second).unwrap();

    let mut reader = &data[..];
    assert_eq!(read_record(&mut reader).unwrap(), first);
    assert_eq!(read_record(&mut reader).unwrap(), second);
    assert!(reader.is_empty());
}

#[test]
fn test_open_failure_stays_distinct() {
    // open failed is not the same as open fine with every query failed
    let open_failed = Record {
        stat: sample_stat(),
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::Empty,
        xattr_values: Vec::new(),
        digest: Some(ContentDigest::Disabled),
    };
    let queries_failed = Record {
        flags: InodeFlags::Probed(FlagsProbe {
            flags_ret: -1,
            flags_errno: 25,
            flags: 0,
            version_ret: -1,
            version_errno: 25,
            version: 0,
            fsx_ret: -1,
            fsx_errno: 95,
            fsx: FsxattrImage::default(),
        }),
        ..open_failed.clone()
    };

    let mut first = Vec::new();
    write_record(&mut first, &open_failed).unwrap();
    let mut second = Vec::new();
    write_record(&mut second, &queries_failed).unwrap();
    assert_eq!(second.len(), first.len() + 68);

    assert_eq!(read_record(&mut &first[..]).unwrap().flags, InodeFlags::Unavailable(13));
    match read_record(&mut &second[..]).unwrap().flags {
        InodeFlags::Probed(probe) => {
            let errno = probe.flags_errno;
            assert_eq!(errno, 25);
        }
        other => panic!("unexpected flags facet: {:?}", other),
    }
}

#[test]
fn test_digest_unit_gating() {
    let mut regular = Record {
        stat: sample_stat(),
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::Empty,
        xattr_values: Vec::new(),
        digest: None,
    };
    assert!(write_record(&mut Vec::new(), &regular).is_err());
    regular.digest = Some(ContentDigest::Disabled);
    assert!(write_record(&mut Vec::new(), &regular).is_ok());

    let mut directory = regular.clone();
    directory.stat.stat.mode = (libc::S_IFDIR | 0o755) as u16;
    assert!(write_record(&mut Vec::new(), &directory).is_err());
    directory.digest = None;
    assert!(write_record(&mut Vec::new(), &directory).is_ok());
}

#[test]
fn test_value_count_must_match_names() {
    let names = b"user.a\0user.b\0".to_vec();
    let record = Record {
        stat: sample_stat(),
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::Data {
            probe: names.len() as i32,
            data: names,
        },
        xattr_values: vec![TwoCall::Empty],
        digest: Some(ContentDigest::Disabled),
    };
    assert!(write_record(&mut Vec::new(), &record).is_err());
}

#[test]
fn test_record_display() {
    let names = b"user.note\0".to_vec();
    let record = Record {
        stat: sample_stat(),
        flags: InodeFlags::Unavailable(13),
        xattr_names: TwoCall::Data {
            probe: names.len() as i32,
            data: names,
        },
        xattr_values: vec![TwoCall::Data {
            probe: 5,
            data: b"hello".to_vec(),
        }],
        digest: Some(ContentDigest::Bytes(vec![0x01, 0x02])),
    };

    let text = record.to_string();
    assert!(text.contains("mode: 0o100644"));
    assert!(text.contains("inode flags: open failed, errno 13"));
    assert!(text.contains("xattr user.note: \"hello\""));
    assert!(text.contains("content digest: 0102"));
}
