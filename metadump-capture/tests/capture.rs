use std::ffi::{CStr, CString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::Error;
use nix::errno::Errno;

use metadump_capture::{create_snapshot, Sha256Digester};
use metadump_format::file_formats::{check_version, read_version};
use metadump_format::record::{self, split_xattr_names, ContentDigest, InodeFlags, TwoCall};
use metadump_format::tree::{TreeEvent, TreeReader};

fn build_tree(root: &Path) -> Result<(), Error> {
    fs::create_dir(root.join("etc"))?;
    fs::write(root.join("etc/passwd"), b"root:x:0:0\n")?;
    fs::create_dir(root.join("etc/cron.d"))?;
    fs::create_dir(root.join("data"))?;
    fs::write(root.join("data/log.txt"), b"hello metadump\n")?;
    symlink("etc/passwd", root.join("link"))?;
    fs::write(root.join("note.txt"), b"top level\n")?;
    Ok(())
}

fn capture_to_memory(
    root: &Path,
    digest: bool,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut tree = Vec::new();
    let mut data = Vec::new();
    let digester = if digest {
        Some(Box::new(Sha256Digester) as Box<dyn metadump_capture::ContentDigester>)
    } else {
        None
    };
    create_snapshot(root, &mut tree, &mut data, digester)?;
    Ok((tree, data))
}

fn decode_at(data: &[u8], offset: u32) -> Result<record::Record, Error> {
    record::read_record(&mut &data[offset as usize - 2..])
}

/// Decoded tree with sibling order normalized away, for comparisons that
/// must not depend on how the OS enumerates a directory.
#[derive(Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Node {
    name: Vec<u8>,
    ino: u64,
    file_type: u8,
    children: Vec<Node>,
}

fn normalized_tree(stream: &[u8]) -> Result<Node, Error> {
    let mut reader = TreeReader::new(stream)?;
    // synthetic node standing in for the unnamed capture root
    let root = Node {
        name: Vec::new(),
        ino: 0,
        file_type: libc::DT_DIR,
        children: Vec::new(),
    };
    let mut stack = vec![vec![root]];
    while let Some(event) = reader.next_event()? {
        match event {
            TreeEvent::Push => stack.push(Vec::new()),
            TreeEvent::Pop => {
                let mut children = stack.pop().expect("tree stream underflow");
                children.sort();
                stack
                    .last_mut()
                    .and_then(|scope| scope.last_mut())
                    .expect("scope without an owning entry")
                    .children = children;
            }
            TreeEvent::Entry(entry) => stack.last_mut().expect("tree stream underflow").push(Node {
                name: entry.name,
                ino: entry.ino,
                file_type: entry.file_type,
                children: Vec::new(),
            }),
        }
    }
    assert_eq!(stack.len(), 1);
    let mut outer = stack.pop().unwrap();
    assert_eq!(outer.len(), 1);
    Ok(outer.pop().unwrap())
}

#[test]
fn test_capture_and_walk() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    build_tree(dir.path())?;

    let (tree, data) = capture_to_memory(dir.path(), true)?;

    // both streams lead with a compatible version header
    check_version(read_version(&mut &tree[..])?)?;
    check_version(read_version(&mut &data[..])?)?;

    let mut reader = TreeReader::new(&tree[..])?;
    let mut level = 0usize;
    let mut max_level = 0usize;
    let mut last_offset = 0u32;
    let mut entries = Vec::new();
    while let Some(event) = reader.next_event()? {
        match event {
            TreeEvent::Push => {
                level += 1;
                max_level = max_level.max(level);
            }
            TreeEvent::Pop => level -= 1,
            TreeEvent::Entry(entry) => {
                // offsets stay clear of the marker values and only grow
                assert!(entry.offset >= 2);
                assert!(entry.offset > last_offset);
                last_offset = entry.offset;
                entries.push((level, entry.display_name().into_owned(), entry.offset));
            }
        }
    }
    assert_eq!(level, 0);
    assert_eq!(max_level, 3);

    let mut top: Vec<&str> = entries
        .iter()
        .filter(|(level, _, _)| *level == 1)
        .map(|(_, name, _)| name.as_str())
        .collect();
    top.sort_unstable();
    assert_eq!(top, vec!["data", "etc", "link", "note.txt"]);

    let mut nested: Vec<&str> = entries
        .iter()
        .filter(|(level, _, _)| *level == 2)
        .map(|(_, name, _)| name.as_str())
        .collect();
    nested.sort_unstable();
    assert_eq!(nested, vec!["cron.d", "log.txt", "passwd"]);

    // the first record belongs to the capture root
    let root_record = decode_at(&data, 14)?;
    let root_image = root_record.stat.stat;
    assert!(!root_image.is_regular_file());

    // every present path resolves and its record decodes
    for path in [
        "etc",
        "etc/passwd",
        "etc/cron.d",
        "data",
        "data/log.txt",
        "link",
        "note.txt",
    ] {
        let entry = TreeReader::new(&tree[..])?.lookup(Path::new(path))?;
        let record = decode_at(&data, entry.offset)?;
        let ret = record.stat.ret;
        assert_eq!(ret, 0, "stat block of {:?}", path);
    }

    let entry = TreeReader::new(&tree[..])?.lookup(Path::new("etc/passwd"))?;
    let record = decode_at(&data, entry.offset)?;
    let image = record.stat.stat;
    assert!(image.is_regular_file());
    let size = image.size;
    assert_eq!(size, 11);
    match record.digest {
        Some(ContentDigest::Bytes(bytes)) => {
            assert_eq!(bytes, openssl::sha::sha256(b"root:x:0:0\n").to_vec());
        }
        other => panic!("unexpected digest unit: {:?}", other),
    }

    // symlinks fail the O_NOFOLLOW open; that ends up in the record
    let entry = TreeReader::new(&tree[..])?.lookup(Path::new("link"))?;
    assert_eq!(entry.file_type, libc::DT_LNK);
    let record = decode_at(&data, entry.offset)?;
    match record.flags {
        InodeFlags::Unavailable(errno) => assert_eq!(errno, libc::ELOOP),
        other => panic!("unexpected flags facet: {:?}", other),
    }
    assert!(record.digest.is_none());

    // absent paths fail to resolve
    for path in ["etc/shadow", "passwd", "note.txt/below", "missing"] {
        assert!(
            TreeReader::new(&tree[..])?.lookup(Path::new(path)).is_err(),
            "lookup of {:?} should fail",
            path
        );
    }

    Ok(())
}

#[test]
fn test_capture_without_digester() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("file"), b"x")?;

    let (tree, data) = capture_to_memory(dir.path(), false)?;
    let entry = TreeReader::new(&tree[..])?.lookup(Path::new("file"))?;
    let record = decode_at(&data, entry.offset)?;
    assert_eq!(record.digest, Some(ContentDigest::Disabled));
    Ok(())
}

#[test]
fn test_capture_structure_is_idempotent() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    build_tree(dir.path())?;

    let (tree_first, data_first) = capture_to_memory(dir.path(), true)?;
    let (tree_second, data_second) = capture_to_memory(dir.path(), true)?;

    // timestamps move between runs and sibling enumeration order may
    // shift; the nested structure and the record sizes may not
    let first = normalized_tree(&tree_first)?;
    let names: Vec<&[u8]> = first.children.iter().map(|child| &child.name[..]).collect();
    assert_eq!(names, [b"data" as &[u8], b"etc", b"link", b"note.txt"]);
    assert_eq!(first, normalized_tree(&tree_second)?);
    assert_eq!(data_first.len(), data_second.len());
    Ok(())
}

#[test]
fn test_fifo_does_not_block_the_walk() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    nix::unistd::mkfifo(
        &dir.path().join("pipe"),
        nix::sys::stat::Mode::from_bits_truncate(0o644),
    )?;

    let (tree, data) = capture_to_memory(dir.path(), true)?;
    let entry = TreeReader::new(&tree[..])?.lookup(Path::new("pipe"))?;
    assert_eq!(entry.file_type, libc::DT_FIFO);

    let record = decode_at(&data, entry.offset)?;
    // the fifo opens without blocking, the ioctl queries just fail
    match record.flags {
        InodeFlags::Probed(_) => {}
        other => panic!("unexpected flags facet: {:?}", other),
    }
    Ok(())
}

fn set_xattr(path: &Path, name: &CStr, value: &[u8]) -> Result<(), Errno> {
    let path = CString::new(path.as_os_str().as_bytes()).unwrap();
    let ret = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    Errno::result(ret).map(drop)
}

#[test]
fn test_capture_records_xattrs() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("tagged");
    fs::write(&file, b"payload")?;

    let name = CStr::from_bytes_with_nul(b"user.metadump\0").unwrap();
    if set_xattr(&file, name, b"42").is_err() {
        // user xattrs are not supported on every test filesystem
        return Ok(());
    }

    let (tree, data) = capture_to_memory(dir.path(), true)?;
    let entry = TreeReader::new(&tree[..])?.lookup(Path::new("tagged"))?;
    let record = decode_at(&data, entry.offset)?;

    match &record.xattr_names {
        TwoCall::Data { data, .. } => {
            let names: Vec<&[u8]> = split_xattr_names(data).collect();
            let target: &[u8] = b"user.metadump";
            let index = names
                .iter()
                .position(|name| *name == target)
                .expect("attribute missing from the recorded list");
            match &record.xattr_values[index] {
                TwoCall::Data { data, .. } => assert_eq!(&data[..], b"42"),
                other => panic!("unexpected value unit: {:?}", other),
            }
        }
        other => panic!("unexpected name list unit: {:?}", other),
    }
    Ok(())
}

/// Needs a mount point inside the test tree, for example:
///   mkdir -p /tmp/walk/mnt && mount -t tmpfs none /tmp/walk/mnt
/// then `METADUMP_TEST_MOUNT_TREE=/tmp/walk cargo test -- --ignored`.
#[test]
#[ignore]
fn test_mount_boundary_is_not_descended() -> Result<(), Error> {
    let root = match std::env::var("METADUMP_TEST_MOUNT_TREE") {
        Ok(root) => root,
        Err(_) => return Ok(()),
    };

    let (tree, data) = capture_to_memory(Path::new(&root), false)?;

    let mut events = Vec::new();
    let mut reader = TreeReader::new(&tree[..])?;
    while let Some(event) = reader.next_event()? {
        events.push(event);
    }

    let root_record = decode_at(&data, 14)?;
    let root_image = root_record.stat.stat;
    let root_dev = (root_image.dev_major, root_image.dev_minor);

    let mut saw_boundary = false;
    for (index, event) in events.iter().enumerate() {
        let entry = match event {
            TreeEvent::Entry(entry) => entry,
            _ => continue,
        };
        if entry.file_type != libc::DT_DIR {
            continue;
        }
        let record = decode_at(&data, entry.offset)?;
        let image = record.stat.stat;
        let dev = (image.dev_major, image.dev_minor);
        let descended = matches!(events.get(index + 1), Some(TreeEvent::Push));
        if dev == root_dev {
            assert!(descended, "directory on the root device was not descended");
        } else {
            saw_boundary = true;
            assert!(!descended, "mount boundary was descended into");
        }
    }
    assert!(saw_boundary, "test tree contains no mount boundary");
    Ok(())
}
