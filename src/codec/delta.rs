//! Block-level reconstruction of a target file from a local file plus
//! ranged fetches of the blocks that could not be found locally.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::Path;

use async_trait::async_trait;
use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};

use super::hash::RollingChecksum;
use super::metadata::Metadata;
use super::CodecError;

/// Bytes read from the local file per refill of the scan window.
const SCAN_CHUNK: usize = 256 * 1024;

/// Supplies byte ranges of the target file described by the metadata.
#[async_trait]
pub trait RangeRequestFactory: Send + Sync {
    /// Stream bytes `range.start..range.end` of the target file into `out`.
    ///
    /// Writes at most the range length and returns how many bytes the
    /// response carried for the range, so a short or long body can be
    /// told apart from a correct one.
    async fn fetch_range(
        &self,
        range: Range<u64>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CodecError>;
}

/// What a reconstruction reused and what it had to download.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub blocks_matched: usize,
    pub blocks_fetched: usize,
    pub bytes_fetched: u64,
    pub requests: usize,
}

/// Rebuild the file described by `metadata` into `output`.
///
/// Blocks present anywhere in `existing` are copied locally; each run of
/// consecutive missing blocks costs one ranged request.  A missing
/// `existing` file is treated as empty.  Memory use is bounded by the block
/// size and the scan window, not by either file's size.
pub async fn sync<F>(
    metadata: &Metadata,
    existing: &Path,
    output: &Path,
    requests: &F,
) -> Result<SyncStats, CodecError>
where
    F: RangeRequestFactory + ?Sized,
{
    let mut local = match File::open(existing).await {
        Ok(file) => Some(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let found = match local.as_mut() {
        Some(file) => match_blocks(metadata, file).await?,
        None => vec![None; metadata.blocks.len()],
    };

    let mut stats = SyncStats::default();
    let mut out = BufWriter::new(File::create(output).await?);
    let mut block = Vec::new();
    let count = metadata.blocks.len();
    let mut index = 0;
    while index < count {
        if let (Some(offset), Some(file)) = (found[index], local.as_mut()) {
            block.resize(metadata.block_len(index), 0);
            read_at(file, offset, &mut block).await?;
            out.write_all(&block).await?;
            stats.blocks_matched += 1;
            index += 1;
            continue;
        }

        let first = index;
        while index < count && found[index].is_none() {
            index += 1;
        }
        let range = metadata.span(first..index);
        let expected = range.end - range.start;
        let actual = requests.fetch_range(range.clone(), &mut out).await?;
        if actual != expected {
            return Err(CodecError::RangeLength {
                start: range.start,
                end: range.end,
                actual,
            });
        }
        stats.blocks_fetched += index - first;
        stats.bytes_fetched += expected;
        stats.requests += 1;
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;

    debug!(
        "delta sync reused {} blocks, fetched {} blocks ({} bytes) in {} requests",
        stats.blocks_matched, stats.blocks_fetched, stats.bytes_fetched, stats.requests
    );
    Ok(stats)
}

async fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}

/// A sliding view over a sequential reader that keeps only the bytes from
/// the current scan position onward.
struct Window<R> {
    reader: R,
    buf: Vec<u8>,
    /// File offset of `buf[0]`.
    base: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> Window<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            base: 0,
            eof: false,
        }
    }

    /// Make `pos..pos + len` available, dropping everything before `pos`
    /// once enough has accumulated.  Returns false if the file ends first.
    async fn fill(&mut self, pos: u64, len: usize) -> io::Result<bool> {
        let consumed = (pos - self.base) as usize;
        if consumed >= SCAN_CHUNK {
            self.buf.drain(..consumed);
            self.base = pos;
        }
        let need = (pos - self.base) as usize + len;
        while self.buf.len() < need && !self.eof {
            let start = self.buf.len();
            self.buf.resize(start + SCAN_CHUNK, 0);
            let n = self.reader.read(&mut self.buf[start..]).await?;
            self.buf.truncate(start + n);
            self.eof = n == 0;
        }
        Ok(self.buf.len() >= need)
    }

    fn slice(&self, pos: u64, len: usize) -> &[u8] {
        let at = (pos - self.base) as usize;
        &self.buf[at..at + len]
    }

    fn byte(&self, pos: u64) -> u8 {
        self.buf[(pos - self.base) as usize]
    }
}

/// Locate target blocks in the local file, returning the local offset of
/// each block that was found.
async fn match_blocks(metadata: &Metadata, file: &mut File) -> Result<Vec<Option<u64>>, CodecError> {
    let count = metadata.blocks.len();
    let mut found = vec![None; count];
    let block_size = metadata.block_size as usize;
    let local_len = file.metadata().await?.len();

    let mut lookup: HashMap<u32, Vec<usize>> = HashMap::new();
    for (index, block) in metadata.blocks.iter().enumerate() {
        if metadata.block_len(index) == block_size {
            lookup.entry(block.checksum).or_default().push(index);
        }
    }
    let mut remaining: usize = lookup.values().map(Vec::len).sum();

    file.seek(SeekFrom::Start(0)).await?;
    {
        let mut window = Window::new(&mut *file);
        if remaining > 0 && window.fill(0, block_size).await? {
            let mut pos = 0u64;
            let mut rolling = RollingChecksum::new(window.slice(0, block_size));
            loop {
                let mut matched = false;
                if let Some(candidates) = lookup.get(&rolling.value()) {
                    let mut strong: Option<Vec<u8>> = None;
                    for &index in candidates {
                        if found[index].is_some() {
                            continue;
                        }
                        let hash = strong.get_or_insert_with(|| {
                            metadata.block_hash_alg.digest(window.slice(pos, block_size))
                        });
                        if *hash == metadata.blocks[index].hash {
                            found[index] = Some(pos);
                            remaining -= 1;
                            matched = true;
                        }
                    }
                }
                if remaining == 0 {
                    break;
                }

                let outgoing = window.byte(pos);
                let next = if matched { pos + block_size as u64 } else { pos + 1 };
                if !window.fill(next, block_size).await? {
                    break;
                }
                if matched {
                    rolling = RollingChecksum::new(window.slice(next, block_size));
                } else {
                    rolling.roll(outgoing, window.byte(next + block_size as u64 - 1));
                }
                pos = next;
            }
        }
    }

    // A short trailing block can only sit at its own offset or at the very
    // end of the local file.
    if let Some(last) = count.checked_sub(1) {
        let len = metadata.block_len(last);
        if len < block_size && local_len >= len as u64 {
            let own = metadata.span(last..count).start;
            let mut tail = vec![0; len];
            for offset in [own, local_len - len as u64] {
                if offset + len as u64 > local_len {
                    continue;
                }
                read_at(file, offset, &mut tail).await?;
                if metadata.block_hash_alg.digest(&tail) == metadata.blocks[last].hash {
                    found[last] = Some(offset);
                    break;
                }
            }
        }
    }

    Ok(found)
}
