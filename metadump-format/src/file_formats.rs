use std::fmt;
use std::io::{Read, Write};

use anyhow::{format_err, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

/// Tree stream marker: enter the child scope of the preceding directory entry.
pub const MARKER_PUSH: u32 = 0;

/// Tree stream marker: leave the current child scope.
pub const MARKER_POP: u32 = 1;

/// Smallest valid data offset. Reserved strictly above both marker values,
/// so offsets and markers share the integer domain without a tag byte.
/// Stored offsets are the data file position plus this constant.
pub const DATA_OFFSET: u32 = 2;

/// Format version written at the head of both files of a capture run.
pub const METADUMP_FORMAT_VERSION: FormatVersion = FormatVersion {
    major: 0,
    minor: 2,
    patch: 0,
};

/// Semantic version triple heading every snapshot file.
#[derive(Endian, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C, packed)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

proxmox_lang::static_assert_size!(FormatVersion, 12);

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let FormatVersion { major, minor, patch } = *self;
        write!(f, "{}.{}.{}", major, minor, patch)
    }
}

/// Which part of the version triple failed the compatibility check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VersionMismatch {
    Major,
    Minor,
    Patch,
}

impl fmt::Display for VersionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VersionMismatch::Major => write!(f, "major"),
            VersionMismatch::Minor => write!(f, "minor"),
            VersionMismatch::Patch => write!(f, "patch"),
        }
    }
}

/// Compare the version found in a file against the version the running
/// parser implements.
///
/// A major mismatch is always incompatible. Before 1.0 the minor must
/// match exactly. From 1.0 on the parser reads any older minor of the
/// same major, and within one minor any older patch level.
pub fn compare_versions(data: FormatVersion, parser: FormatVersion) -> Result<(), VersionMismatch> {
    let FormatVersion { major, minor, patch } = data;
    let FormatVersion { major: parser_major, minor: parser_minor, patch: parser_patch } = parser;

    if major != parser_major {
        return Err(VersionMismatch::Major);
    }
    if major == 0 {
        if minor != parser_minor {
            return Err(VersionMismatch::Minor);
        }
    } else if minor > parser_minor {
        return Err(VersionMismatch::Minor);
    }
    if minor == parser_minor && patch > parser_patch {
        return Err(VersionMismatch::Patch);
    }
    Ok(())
}

/// Check a version read from a file against [`METADUMP_FORMAT_VERSION`].
pub fn check_version(data: FormatVersion) -> Result<(), Error> {
    compare_versions(data, METADUMP_FORMAT_VERSION).map_err(|mismatch| {
        format_err!(
            "incompatible format version {} ({} version mismatch, parser implements {})",
            data,
            mismatch,
            METADUMP_FORMAT_VERSION,
        )
    })
}

/// Write the current format version at the head of an output stream.
pub fn write_version<W: Write>(writer: &mut W) -> Result<(), Error> {
    unsafe { writer.write_le_value(METADUMP_FORMAT_VERSION)? };
    Ok(())
}

/// Read the version triple heading a snapshot file.
///
/// A stream too short to hold one is reported as truncation, distinct
/// from any compatibility error.
pub fn read_version<R: Read>(reader: &mut R) -> Result<FormatVersion, Error> {
    let version: FormatVersion = unsafe {
        reader
            .read_le_value()
            .map_err(|err| format_err!("unable to read format version - {}", err))?
    };
    Ok(version)
}

#[test]
fn test_version_compatibility() {
    fn ver(major: u32, minor: u32, patch: u32) -> FormatVersion {
        FormatVersion { major, minor, patch }
    }

    assert_eq!(compare_versions(ver(0, 2, 0), ver(0, 2, 0)), Ok(()));
    assert_eq!(compare_versions(ver(0, 2, 0), ver(0, 3, 0)), Err(VersionMismatch::Minor));
    assert_eq!(compare_versions(ver(0, 3, 0), ver(0, 2, 0)), Err(VersionMismatch::Minor));
    assert_eq!(compare_versions(ver(1, 1, 0), ver(1, 2, 0)), Ok(()));
    assert_eq!(compare_versions(ver(1, 2, 0), ver(1, 1, 0)), Err(VersionMismatch::Minor));
    assert_eq!(compare_versions(ver(1, 1, 2), ver(1, 1, 1)), Err(VersionMismatch::Patch));
    assert_eq!(compare_versions(ver(1, 1, 1), ver(1, 1, 2)), Ok(()));
    assert_eq!(compare_versions(ver(2, 0, 0), ver(1, 9, 9)), Err(VersionMismatch::Major));
    assert_eq!(compare_versions(ver(0, 2, 1), ver(0, 2, 0)), Err(VersionMismatch::Patch));
}

#[test]
fn test_version_header() {
    let mut data = Vec::new();
    write_version(&mut data).unwrap();
    assert_eq!(data.len(), 12);

    let version = read_version(&mut &data[..]).unwrap();
    assert_eq!(version, METADUMP_FORMAT_VERSION);
    assert!(check_version(version).is_ok());

    // truncated header is an error, not a mismatch
    assert!(read_version(&mut &data[..7]).is_err());

    let newer = FormatVersion { major: 0, minor: 3, patch: 0 };
    assert!(check_version(newer).is_err());
}
