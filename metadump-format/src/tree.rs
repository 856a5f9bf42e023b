//! Tree stream codec: directory nesting as a flat marker/offset stream.
//!
//! The writer emits push/pop markers and (offset, descriptor) pairs in
//! call order; the reader yields them back as lazy [`TreeEvent`]s and
//! powers both the structure dump and the streaming path lookup.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, Error};
use endian_trait::Endian;

use proxmox_io::{ReadExt, WriteExt};

use crate::file_formats::{check_version, read_version, write_version, DATA_OFFSET, MARKER_POP, MARKER_PUSH};

/// Capacity of the descriptor name field, mirroring the OS dirent.
pub const ENTRY_NAME_SIZE: usize = 256;

/// Fixed head of a directory entry descriptor in the tree stream. The
/// name follows as a NUL padded [`ENTRY_NAME_SIZE`] byte field.
#[derive(Endian, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct DescriptorHead {
    pub ino: u64,
    pub name_len: u16,
    pub file_type: u8,
}

proxmox_lang::static_assert_size!(DescriptorHead, 11);

/// One (offset, descriptor) pair decoded from the tree stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeEntry {
    /// Start of this entry's record in the data file, [`DATA_OFFSET`] based.
    pub offset: u32,
    pub ino: u64,
    /// Raw dirent type tag (`DT_*`).
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl TreeEntry {
    /// Entry name for display; invalid UTF-8 is replaced lossily.
    pub fn display_name(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Human readable name of the dirent type tag.
    pub fn type_name(&self) -> &'static str {
        match self.file_type {
            libc::DT_REG => "file",
            libc::DT_DIR => "directory",
            libc::DT_LNK => "symlink",
            libc::DT_BLK => "block device",
            libc::DT_CHR => "character device",
            libc::DT_FIFO => "fifo",
            libc::DT_SOCK => "socket",
            _ => "unknown",
        }
    }
}

/// Structural event decoded from the tree stream.
#[derive(Clone, Debug)]
pub enum TreeEvent {
    Push,
    Pop,
    Entry(TreeEntry),
}

/// Writes a tree stream, heading it with the current format version.
pub struct TreeWriter<W: Write> {
    writer: W,
}

impl<W: Write> TreeWriter<W> {
    pub fn new(mut writer: W) -> Result<Self, Error> {
        write_version(&mut writer)?;
        Ok(Self { writer })
    }

    /// Enter the child scope of the directory whose pair was emitted last.
    pub fn start_directory(&mut self) -> Result<(), Error> {
        unsafe { self.writer.write_le_value(MARKER_PUSH)? };
        Ok(())
    }

    /// Leave the current child scope.
    pub fn end_directory(&mut self) -> Result<(), Error> {
        unsafe { self.writer.write_le_value(MARKER_POP)? };
        Ok(())
    }

    /// Emit one (offset, descriptor) pair for a child entry.
    pub fn add_entry(&mut self, offset: u32, ino: u64, file_type: u8, name: &[u8]) -> Result<(), Error> {
        if offset < DATA_OFFSET {
            bail!("data offset {} collides with the tree marker values", offset);
        }
        if name.len() >= ENTRY_NAME_SIZE {
            bail!("directory entry name too long ({} bytes)", name.len());
        }

        unsafe { self.writer.write_le_value(offset)? };
        unsafe {
            self.writer.write_le_value(DescriptorHead {
                ino,
                name_len: name.len() as u16,
                file_type,
            })?
        };
        let mut padded = [0u8; ENTRY_NAME_SIZE];
        padded[..name.len()].copy_from_slice(name);
        self.writer.write_all(&padded)?;
        Ok(())
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads a tree stream, checking the version header up front, then
/// yielding [`TreeEvent`]s until the end of the stream.
pub struct TreeReader<R: Read> {
    reader: R,
}

impl<R: Read> TreeReader<R> {
    /// Open a tree stream and verify its format version.
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let version = read_version(&mut reader)?;
        check_version(version)?;
        Ok(Self { reader })
    }

    /// The next structural event, or `None` at the end of the stream.
    /// End of file inside an event is a truncation error.
    pub fn next_event(&mut self) -> Result<Option<TreeEvent>, Error> {
        let mut word = [0u8; 4];
        match self.reader.read_exact_or_eof(&mut word) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(err) => bail!("read failed - {}", err),
        }

        let value = u32::from_le_bytes(word);
        if value == MARKER_PUSH {
            return Ok(Some(TreeEvent::Push));
        }
        if value == MARKER_POP {
            return Ok(Some(TreeEvent::Pop));
        }

        let head: DescriptorHead = unsafe { self.reader.read_le_value()? };
        let name_len = usize::from(head.name_len);
        if name_len >= ENTRY_NAME_SIZE {
            bail!("directory entry name too long ({} bytes)", name_len);
        }
        let mut name = self.reader.read_exact_allocated(ENTRY_NAME_SIZE)?;
        name.truncate(name_len);

        Ok(Some(TreeEvent::Entry(TreeEntry {
            offset: value,
            ino: head.ino,
            file_type: head.file_type,
            name,
        })))
    }

    /// Print the captured structure, one name per line, indented one
    /// column per nesting level.
    pub fn dump(&mut self) -> Result<(), Error> {
        let mut level: usize = 0;
        loop {
            let event = match self.next_event()? {
                Some(event) => event,
                None => return Ok(()),
            };
            match event {
                TreeEvent::Push => level += 1,
                TreeEvent::Pop => {
                    if level == 0 {
                        bail!("unbalanced scope markers in tree stream");
                    }
                    level -= 1;
                }
                TreeEvent::Entry(entry) => {
                    log::info!("{:indent$}{}", "", entry.display_name(), indent = level);
                }
            }
        }
    }

    /// Stream forward to the entry matching `path` and return its
    /// descriptor pair.
    ///
    /// `path` is split on `/`; the first component is matched among the
    /// capture root's direct children. No index is consulted and nothing
    /// is buffered, one forward pass over the stream decides. Entries
    /// deeper than the component currently searched for are skipped
    /// without inspection; leaving the scope that had to contain it
    /// means the path does not exist.
    pub fn lookup(&mut self, path: &Path) -> Result<TreeEntry, Error> {
        let mut components = Vec::new();
        for part in path.as_os_str().as_bytes().split(|byte| *byte == b'/') {
            if !part.is_empty() {
                components.push(part);
            }
        }
        if components.is_empty() {
            bail!("invalid search path {:?}", path);
        }

        // components[target] is expected at nesting level target + 1,
        // the capture root itself being level 0
        let mut level: usize = 0;
        let mut target: usize = 0;
        loop {
            let event = match self.next_event()? {
                Some(event) => event,
                None => bail!("no such entry in tree: {:?}", path),
            };
            match event {
                TreeEvent::Push => level += 1,
                TreeEvent::Pop => {
                    if level == 0 {
                        bail!("unbalanced scope markers in tree stream");
                    }
                    level -= 1;
                    if level <= target {
                        bail!("no such entry in tree: {:?}", path);
                    }
                }
                TreeEvent::Entry(entry) => {
                    if level > target + 1 {
                        continue;
                    }
                    if level <= target {
                        bail!("no such entry in tree: {:?}", path);
                    }
                    if entry.name == components[target] {
                        if target + 1 == components.len() {
                            return Ok(entry);
                        }
                        target += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
fn test_stream() -> Vec<u8> {
    // root { etc { passwd, cron.d { } }, data { log.txt }, note.txt }
    let mut stream = Vec::new();
    let mut writer = TreeWriter::new(&mut stream).unwrap();
    writer.start_directory().unwrap();
    writer.add_entry(14, 101, libc::DT_DIR, b"etc").unwrap();
    writer.start_directory().unwrap();
    writer.add_entry(500, 102, libc::DT_REG, b"passwd").unwrap();
    writer.add_entry(750, 103, libc::DT_DIR, b"cron.d").unwrap();
    writer.start_directory().unwrap();
    writer.end_directory().unwrap();
    writer.end_directory().unwrap();
    writer.add_entry(900, 104, libc::DT_DIR, b"data").unwrap();
    writer.start_directory().unwrap();
    writer.add_entry(1100, 105, libc::DT_REG, b"log.txt").unwrap();
    writer.end_directory().unwrap();
    writer.add_entry(1400, 106, libc::DT_REG, b"note.txt").unwrap();
    writer.end_directory().unwrap();
    stream
}

#[test]
fn test_tree_stream_roundtrip() {
    let stream = test_stream();
    // version + 8 markers + 6 entries, every entry costs 4 + 11 + 256 bytes
    assert_eq!(stream.len(), 12 + 8 * 4 + 6 * (4 + 11 + 256));

    let mut reader = TreeReader::new(&stream[..]).unwrap();
    let mut names = Vec::new();
    let mut level = 0usize;
    while let Some(event) = reader.next_event().unwrap() {
        match event {
            TreeEvent::Push => level += 1,
            TreeEvent::Pop => level -= 1,
            TreeEvent::Entry(entry) => names.push((level, entry.display_name().into_owned(), entry.offset)),
        }
    }
    assert_eq!(level, 0);
    assert_eq!(
        names,
        vec![
            (1, "etc".to_string(), 14),
            (2, "passwd".to_string(), 500),
            (2, "cron.d".to_string(), 750),
            (1, "data".to_string(), 900),
            (2, "log.txt".to_string(), 1100),
            (1, "note.txt".to_string(), 1400),
        ]
    );
}

#[test]
fn test_tree_stream_across_buffer_boundaries() {
    // identical bytes through differently chunked writers, decoded
    // through a reader too small to hold one event
    fn emit<W: Write>(writer: &mut TreeWriter<W>) -> Result<(), Error> {
        let mut offset = 14u32;
        writer.start_directory()?;
        for dir in 0u64..40 {
            let name = format!("dir-{:02}", dir);
            writer.add_entry(offset, 1000 + dir, libc::DT_DIR, name.as_bytes())?;
            offset += 171;
            writer.start_directory()?;
            for file in 0u64..10 {
                let name = format!("file-{:03}", file);
                writer.add_entry(offset, 2000 + file, libc::DT_REG, name.as_bytes())?;
                offset += 153;
            }
            writer.end_directory()?;
        }
        writer.end_directory()?;
        Ok(())
    }

    let mut plain = Vec::new();
    let mut writer = TreeWriter::new(&mut plain).unwrap();
    emit(&mut writer).unwrap();

    let mut chunked = Vec::new();
    let mut writer = TreeWriter::new(std::io::BufWriter::with_capacity(31, &mut chunked)).unwrap();
    emit(&mut writer).unwrap();
    writer.flush().unwrap();
    drop(writer);
    assert_eq!(plain, chunked);

    let mut reader = TreeReader::new(std::io::BufReader::with_capacity(7, &plain[..])).unwrap();
    let mut level = 0usize;
    let mut count = 0usize;
    let mut last_offset = 0u32;
    while let Some(event) = reader.next_event().unwrap() {
        match event {
            TreeEvent::Push => level += 1,
            TreeEvent::Pop => level -= 1,
            TreeEvent::Entry(entry) => {
                assert!(entry.offset > last_offset);
                last_offset = entry.offset;
                count += 1;
            }
        }
    }
    assert_eq!(level, 0);
    assert_eq!(count, 40 * 11);
}

#[test]
fn test_tree_writer_rejects_invalid_entries() {
    let mut stream = Vec::new();
    let mut writer = TreeWriter::new(&mut stream).unwrap();
    assert!(writer.add_entry(0, 1, libc::DT_REG, b"a").is_err());
    assert!(writer.add_entry(1, 1, libc::DT_REG, b"a").is_err());
    assert!(writer.add_entry(2, 1, libc::DT_REG, b"a").is_ok());
    assert!(writer.add_entry(14, 1, libc::DT_REG, &[b'x'; 256]).is_err());
    assert!(writer.add_entry(14, 1, libc::DT_REG, &[b'x'; 255]).is_ok());
}

#[test]
fn test_tree_truncation_detected() {
    let stream = test_stream();
    // cut in the middle of the first descriptor
    let mut reader = TreeReader::new(&stream[..30]).unwrap();
    assert!(matches!(reader.next_event(), Ok(Some(TreeEvent::Push))));
    assert!(reader.next_event().is_err());
}

#[test]
fn test_lookup() {
    fn lookup(path: &str) -> Result<TreeEntry, Error> {
        let stream = test_stream();
        TreeReader::new(&stream[..]).unwrap().lookup(Path::new(path))
    }

    assert_eq!(lookup("etc").unwrap().offset, 14);
    assert_eq!(lookup("etc/passwd").unwrap().offset, 500);
    assert_eq!(lookup("etc/cron.d").unwrap().offset, 750);
    assert_eq!(lookup("data").unwrap().offset, 900);
    assert_eq!(lookup("data/log.txt").unwrap().offset, 1100);
    assert_eq!(lookup("note.txt").unwrap().offset, 1400);
    // trailing and doubled separators are tolerated
    assert_eq!(lookup("etc/cron.d/").unwrap().offset, 750);
    assert_eq!(lookup("data//log.txt").unwrap().offset, 1100);

    // a name that only exists deeper in the tree must not match at the
    // top level, and vice versa
    assert!(lookup("passwd").is_err());
    assert!(lookup("etc/note.txt").is_err());

    assert!(lookup("missing").is_err());
    assert!(lookup("etc/missing").is_err());
    assert!(lookup("etc/cron.d/missing").is_err());
    assert!(lookup("note.txt/below-a-file").is_err());
    assert!(lookup("").is_err());
    assert!(lookup("/").is_err());
}
