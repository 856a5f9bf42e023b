//! Content digest provider for regular files.

use std::fs::File;
use std::io::Read;

use anyhow::Error;

/// Computes the opaque content digest recorded for regular files. The
/// session invokes this once per file; the result is stored as a
/// length prefixed byte string.
pub trait ContentDigester {
    /// Digest the content of `file` from its current position.
    fn digest(&mut self, file: &mut File) -> Result<Vec<u8>, Error>;
}

/// SHA-256 digest provider.
pub struct Sha256Digester;

impl ContentDigester for Sha256Digester {
    fn digest(&mut self, file: &mut File) -> Result<Vec<u8>, Error> {
        let mut hasher = openssl::sha::Sha256::new();
        let mut buffer = proxmox_io::vec::undefined(256 * 1024);

        loop {
            let count = match file.read(&mut buffer) {
                Ok(count) => count,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }

        Ok(hasher.finish().to_vec())
    }
}

#[test]
fn test_sha256_digester() {
    use std::io::{Seek, SeekFrom, Write};

    let payload = b"metadump digest test payload";
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(payload).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let digest = Sha256Digester.digest(&mut file).unwrap();
    assert_eq!(digest, openssl::sha::sha256(payload).to_vec());
}
