//! The metadata sidecar: whole-file hash plus per-block signatures.
//!
//! Wire layout, all integers big-endian, `str16`/`bytes16` carrying a u16
//! length prefix:
//!
//! ```text
//! fileHashAlg  str16
//! fileHash     bytes16
//! blockSize    u32
//! fileSize     u64
//! blockHashAlg str16
//! blockCount   u32
//! blockCount * { checksum u32, hash bytes16 }
//! ```

use std::ops::Range;
use std::path::Path;

use bytes::{Buf, BufMut};
use sha2::digest::DynDigest;

use super::hash::{HashAlgorithm, RollingChecksum};
use super::CodecError;

/// Block size used when capturing metadata from a full download.
pub const CAPTURE_BLOCK_SIZE: u32 = 65536;

/// Largest block size accepted from a metadata file.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Smallest encoded block entry: a checksum and an empty hash.
const MIN_BLOCK_ENTRY: usize = 4 + 2;

/// Signature of one block of the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    pub checksum: u32,
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_hash_alg: HashAlgorithm,
    pub file_hash: Vec<u8>,
    pub block_size: u32,
    pub file_size: u64,
    pub block_hash_alg: HashAlgorithm,
    pub blocks: Vec<BlockSignature>,
}

impl Metadata {
    /// Build metadata for an in-memory file.
    pub fn generate(
        data: &[u8],
        block_size: u32,
        file_hash_alg: HashAlgorithm,
        block_hash_alg: HashAlgorithm,
    ) -> Self {
        let mut capture = MetadataCapture::new(block_size, file_hash_alg, block_hash_alg);
        capture.update(data);
        capture.finish()
    }

    pub fn file_hash_hex(&self) -> String {
        hex::encode(&self.file_hash)
    }

    /// Byte offsets covered by blocks `first..last` of the target file.
    pub fn span(&self, blocks: Range<usize>) -> Range<u64> {
        let bs = self.block_size as u64;
        let start = (blocks.start as u64 * bs).min(self.file_size);
        let end = (blocks.end as u64 * bs).min(self.file_size);
        start..end
    }

    pub fn block_len(&self, index: usize) -> usize {
        let span = self.span(index..index + 1);
        (span.end - span.start) as usize
    }

    pub async fn load(path: &Path) -> Result<Self, CodecError> {
        let buf = tokio::fs::read(path).await?;
        Self::decode(&buf)
    }

    pub async fn store(&self, path: &Path) -> Result<(), CodecError> {
        tokio::fs::write(path, self.encode()).await?;
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.blocks.len() * 24);
        put_str(&mut out, self.file_hash_alg.name());
        put_bytes(&mut out, &self.file_hash);
        out.put_u32(self.block_size);
        out.put_u64(self.file_size);
        put_str(&mut out, self.block_hash_alg.name());
        out.put_u32(self.blocks.len() as u32);
        for block in &self.blocks {
            out.put_u32(block.checksum);
            put_bytes(&mut out, &block.hash);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        let file_hash_alg = get_str(&mut buf)?.parse()?;
        let file_hash = get_bytes(&mut buf)?;
        let block_size = get_u32(&mut buf)?;
        let file_size = get_u64(&mut buf)?;
        let block_hash_alg = get_str(&mut buf)?.parse()?;
        let count = get_u32(&mut buf)? as usize;

        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(CodecError::Malformed(format!("block size {block_size}")));
        }
        let expected = file_size.div_ceil(block_size as u64);
        if count as u64 != expected {
            return Err(CodecError::Malformed(format!(
                "{count} blocks declared for {file_size} bytes at block size {block_size}"
            )));
        }

        // The header alone cannot be trusted to size the allocation.
        if buf.len() / MIN_BLOCK_ENTRY < count {
            return Err(CodecError::Malformed(format!(
                "{count} blocks declared in {} bytes",
                buf.len()
            )));
        }
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let checksum = get_u32(&mut buf)?;
            let hash = get_bytes(&mut buf)?;
            blocks.push(BlockSignature { checksum, hash });
        }
        if buf.has_remaining() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            file_hash_alg,
            file_hash,
            block_size,
            file_size,
            block_hash_alg,
            blocks,
        })
    }
}

/// Computes metadata incrementally while a file streams past.
pub struct MetadataCapture {
    block_size: u32,
    file_hash_alg: HashAlgorithm,
    block_hash_alg: HashAlgorithm,
    file_hasher: Box<dyn DynDigest + Send>,
    pending: Vec<u8>,
    blocks: Vec<BlockSignature>,
    size: u64,
}

impl MetadataCapture {
    pub fn new(block_size: u32, file_hash_alg: HashAlgorithm, block_hash_alg: HashAlgorithm) -> Self {
        Self {
            block_size,
            file_hash_alg,
            block_hash_alg,
            file_hasher: file_hash_alg.hasher(),
            pending: Vec::with_capacity(block_size as usize),
            blocks: Vec::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.file_hasher.update(data);
        self.size += data.len() as u64;
        let block_size = self.block_size as usize;
        while !data.is_empty() {
            let take = (block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == block_size {
                self.push_pending();
            }
        }
    }

    pub fn finish(mut self) -> Metadata {
        if !self.pending.is_empty() {
            self.push_pending();
        }
        Metadata {
            file_hash_alg: self.file_hash_alg,
            file_hash: self.file_hasher.finalize().into_vec(),
            block_size: self.block_size,
            file_size: self.size,
            block_hash_alg: self.block_hash_alg,
            blocks: self.blocks,
        }
    }

    fn push_pending(&mut self) {
        self.blocks.push(BlockSignature {
            checksum: RollingChecksum::new(&self.pending).value(),
            hash: self.block_hash_alg.digest(&self.pending),
        });
        self.pending.clear();
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.put_u16(b.len() as u16);
    out.put_slice(b);
}

fn ensure(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        return Err(CodecError::Malformed("truncated".into()));
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|_| CodecError::Malformed("non-utf8 algorithm name".into()))
}
