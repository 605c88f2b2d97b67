//! Whole-file digests and the rolling block checksum.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::digest::DynDigest;
use sha2::Sha256;
use tokio::io::AsyncReadExt;

use super::CodecError;

const READ_BUFFER: usize = 64 * 1024;

/// Hash algorithms a metadata file may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
        }
    }

    pub fn hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            HashAlgorithm::Md5 => Box::new(Md5::default()),
            HashAlgorithm::Sha1 => Box::new(Sha1::default()),
            HashAlgorithm::Sha256 => Box::new(Sha256::default()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}

impl FromStr for HashAlgorithm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            _ => Err(CodecError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash a file by path.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<Vec<u8>, CodecError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into_vec())
}

/// rsync-style weak checksum over a fixed-size window.
///
/// Both halves are kept modulo 2^16 so the window can slide one byte at a
/// time with [`RollingChecksum::roll`].
#[derive(Debug, Clone, Copy)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn new(block: &[u8]) -> Self {
        let len = block.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &x) in block.iter().enumerate() {
            a = a.wrapping_add(x as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(x as u32));
        }
        Self {
            a: a & 0xffff,
            b: b & 0xffff,
            len,
        }
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    /// Slide the window forward: `out` leaves at the front, `next` enters at
    /// the back.
    pub fn roll(&mut self, out: u8, next: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(next as u32) & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(out as u32))
            .wrapping_add(self.a)
            & 0xffff;
    }
}
