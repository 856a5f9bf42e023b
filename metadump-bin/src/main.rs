use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{format_err, Error};
use serde_json::{json, Value};

use proxmox_router::cli::*;
use proxmox_schema::api;

use metadump_capture::{create_snapshot, ContentDigester, Sha256Digester};
use metadump_format::file_formats::{check_version, read_version, DATA_OFFSET};
use metadump_format::record::{
    read_record, split_xattr_names, ContentDigest, FlagsProbe, FsxattrImage, InodeFlags, Record,
    StatBlock, StatImage, TimestampImage, TwoCall,
};
use metadump_format::tree::{TreeEntry, TreeReader};

fn create_output_file(path: &str) -> Result<File, Error> {
    OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o640)
        .open(path)
        .map_err(|err| format_err!("unable to create {:?} - {}", path, err))
}

#[api(
    input: {
        properties: {
            treefile: {
                description: "Output file for the directory tree structure.",
            },
            datafile: {
                description: "Output file for the metadata records.",
            },
            source: {
                description: "Root of the directory tree to capture.",
            },
            "no-digest": {
                description: "Skip content digests of regular files.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Capture the metadata of a directory tree into a snapshot.
fn create(treefile: String, datafile: String, source: String, no_digest: bool) -> Result<(), Error> {
    let tree = BufWriter::with_capacity(1024 * 1024, create_output_file(&treefile)?);
    let data = BufWriter::with_capacity(1024 * 1024, create_output_file(&datafile)?);

    let digester: Option<Box<dyn ContentDigester>> = if no_digest {
        None
    } else {
        Some(Box::new(Sha256Digester))
    };

    create_snapshot(Path::new(&source), tree, data, digester)
}

#[api(
    input: {
        properties: {
            treefile: {
                description: "The tree file of the snapshot.",
            },
        },
    },
)]
/// List the directory structure of a snapshot.
fn list(treefile: String) -> Result<(), Error> {
    let file = File::open(&treefile)
        .map_err(|err| format_err!("unable to open tree file {:?} - {}", treefile, err))?;

    TreeReader::new(BufReader::new(file))?.dump()
}

#[api(
    input: {
        properties: {
            treefile: {
                description: "The tree file of the snapshot.",
            },
            datafile: {
                description: "The data file of the snapshot.",
            },
            path: {
                description: "Path to resolve, relative to the capture root.",
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// Resolve a path inside a snapshot and decode its metadata record.
fn lookup(
    treefile: String,
    datafile: String,
    path: String,
    param: Value,
) -> Result<(), Error> {
    let output_format = get_output_format(&param);

    let tree = File::open(&treefile)
        .map_err(|err| format_err!("unable to open tree file {:?} - {}", treefile, err))?;
    let entry = TreeReader::new(BufReader::new(tree))?.lookup(Path::new(&path))?;

    let mut data = File::open(&datafile)
        .map_err(|err| format_err!("unable to open data file {:?} - {}", datafile, err))?;
    check_version(read_version(&mut data)?)?;
    data.seek(SeekFrom::Start(u64::from(entry.offset - DATA_OFFSET)))?;
    let record = read_record(&mut BufReader::new(data))?;

    if output_format == "text" {
        println!(
            "{} ({}, inode {}, data offset {})",
            entry.display_name(),
            entry.type_name(),
            entry.ino,
            entry.offset,
        );
        print!("{}", record);
    } else {
        format_and_print_result(&record_to_json(&entry, &record), &output_format);
    }

    Ok(())
}

fn timestamp_to_json(timestamp: TimestampImage) -> Value {
    let TimestampImage { secs, nanos } = timestamp;
    json!({ "secs": secs, "nanos": nanos })
}

fn two_call_to_json(name: &str, value: &TwoCall) -> Value {
    match value {
        TwoCall::ProbeFailed { errno } | TwoCall::FillFailed { errno, .. } => {
            json!({ "name": name, "errno": errno })
        }
        TwoCall::Empty => json!({ "name": name, "value": "" }),
        TwoCall::Data { data, .. } => match std::str::from_utf8(data) {
            Ok(text) => json!({ "name": name, "value": text }),
            Err(_) => json!({ "name": name, "value-hex": hex::encode(data) }),
        },
    }
}

fn record_to_json(entry: &TreeEntry, record: &Record) -> Value {
    let StatBlock { ret, errno, stat } = record.stat;
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

    let stat_json = json!({
        "ret": ret,
        "errno": errno,
        "mask": mask,
        "mode": mode,
        "nlink": nlink,
        "uid": uid,
        "gid": gid,
        "ino": ino,
        "size": size,
        "blocks": blocks,
        "blksize": blksize,
        "attributes": attributes,
        "attributes-mask": attributes_mask,
        "atime": timestamp_to_json(atime),
        "btime": timestamp_to_json(btime),
        "ctime": timestamp_to_json(ctime),
        "mtime": timestamp_to_json(mtime),
        "rdev": { "major": rdev_major, "minor": rdev_minor },
        "dev": { "major": dev_major, "minor": dev_minor },
    });

    let flags_json = match record.flags {
        InodeFlags::Unavailable(errno) => json!({ "open-errno": errno }),
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
            let FsxattrImage {
                xflags,
                extsize,
                nextents,
                projid,
                cowextsize,
                pad: _,
            } = fsx;
            json!({
                "flags": { "ret": flags_ret, "errno": flags_errno, "value": flags },
                "generation": { "ret": version_ret, "errno": version_errno, "value": version },
                "fsxattr": {
                    "ret": fsx_ret,
                    "errno": fsx_errno,
                    "xflags": xflags,
                    "extsize": extsize,
                    "nextents": nextents,
                    "projid": projid,
                    "cowextsize": cowextsize,
                },
            })
        }
    };

    let xattrs_json = match &record.xattr_names {
        TwoCall::ProbeFailed { errno } | TwoCall::FillFailed { errno, .. } => {
            json!({ "errno": errno })
        }
        TwoCall::Empty => json!([]),
        TwoCall::Data { data, .. } => {
            let items: Vec<Value> = split_xattr_names(data)
                .zip(&record.xattr_values)
                .map(|(name, value)| two_call_to_json(&String::from_utf8_lossy(name), value))
                .collect();
            json!(items)
        }
    };

    let mut val = json!({
        "name": entry.display_name(),
        "type": entry.type_name(),
        "inode": entry.ino,
        "offset": entry.offset,
        "stat": stat_json,
        "inode-flags": flags_json,
        "xattrs": xattrs_json,
    });

    if let Some(digest) = &record.digest {
        val["digest"] = match digest {
            ContentDigest::Bytes(bytes) => json!(hex::encode(bytes)),
            ContentDigest::Disabled => Value::Null,
            ContentDigest::Failed(errno) => json!({ "errno": errno }),
        };
    }

    val
}

fn main() {
    init_cli_logger("METADUMP_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "create",
            CliCommand::new(&API_METHOD_CREATE)
                .arg_param(&["treefile", "datafile", "source"])
                .completion_cb("treefile", complete_file_name)
                .completion_cb("datafile", complete_file_name)
                .completion_cb("source", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST)
                .arg_param(&["treefile"])
                .completion_cb("treefile", complete_file_name),
        )
        .insert(
            "lookup",
            CliCommand::new(&API_METHOD_LOOKUP)
                .arg_param(&["treefile", "datafile", "path"])
                .completion_cb("treefile", complete_file_name)
                .completion_cb("datafile", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(cmd_def, rpcenv, None);
}
