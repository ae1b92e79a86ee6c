use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

pub const DIGEST_LEN: usize = 16;

const READ_CHUNK: usize = 64 * 1024;

/// Non-cryptographic content digest of a test file, used for change
/// detection only.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct FileDigest([u8; DIGEST_LEN]);

impl FileDigest {
    #[must_use]
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Rebuilds a digest from a stored blob. Returns `None` when the blob
    /// has the wrong width.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; DIGEST_LEN]>::try_from(bytes).ok().map(Self)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl Display for FileDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Computes the XXH3-128 digest of a byte stream.
///
/// # Errors
/// Returns any I/O error raised while reading `reader`.
pub fn hash_reader(mut reader: impl Read) -> io::Result<FileDigest> {
    let mut hasher = Xxh3::new();
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(FileDigest(hasher.digest128().to_be_bytes()))
}

/// Computes the digest of the file at `path`.
///
/// # Errors
/// Returns an error when the file cannot be opened or read.
pub fn hash_file(path: &Path) -> io::Result<FileDigest> {
    let file = File::open(path)?;
    hash_reader(BufReader::new(file))
}
