//! Byte sources that chunks are read from

use super::Chunk;
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Random-access byte source backing a chunked file.
///
/// `read_chunk` is called from blocking worker threads, so implementations
/// may perform synchronous I/O.
pub trait ChunkSource: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    /// Whether the source holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly the bytes covered by `chunk`
    fn read_chunk(&self, chunk: &Chunk) -> io::Result<Bytes>;
}

/// A file on local disk
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open a file and record its current length
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(FileSource {
            path,
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, chunk: &Chunk) -> io::Result<Bytes> {
        if chunk.end() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "chunk {} ends at {} past file length {}",
                    chunk.index,
                    chunk.end(),
                    self.len
                ),
            ));
        }

        // Each read gets its own handle so workers never share a cursor
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        let mut buf = vec![0u8; chunk.size as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl ChunkSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn read_chunk(&self, chunk: &Chunk) -> io::Result<Bytes> {
        let end = chunk.end() as usize;
        if end > Bytes::len(self) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk {} out of range", chunk.index),
            ));
        }
        Ok(self.slice(chunk.offset as usize..end))
    }
}
