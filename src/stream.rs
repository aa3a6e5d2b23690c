use std::io;
use std::path::Path;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::error::TransferError;

/// Sequential chunked reader feeding the sender role.
pub struct FileStreamReader<R> {
    inner: R,
    chunk_size: usize,
    exhausted: bool,
    bytes_read: u64,
    hasher: Sha256,
}

impl FileStreamReader<File> {
    /// Open `path` for reading; a missing file is `FileNotFound`.
    pub async fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(path.to_path_buf()),
            _ => TransferError::Io(e),
        })?;

        if !file.metadata().await?.is_file() {
            return Err(TransferError::FileNotFound(path.to_path_buf()));
        }

        Ok(Self::new(file, chunk_size))
    }
}

impl<R: AsyncRead + Unpin> FileStreamReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size,
            exhausted: false,
            bytes_read: 0,
            hasher: Sha256::new(),
        }
    }

    /// Read the next chunk of up to `chunk_size` bytes. Only the last chunk
    /// may be short; `None` marks the end of the stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        self.hasher.update(&buf);
        self.bytes_read += filled as u64;
        Ok(Some(Bytes::from(buf)))
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex SHA-256 of everything read so far.
    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

/// Sequential writer fed by the receiver role with in-order payloads only.
pub struct FileStreamWriter<W> {
    inner: W,
    bytes_written: u64,
    hasher: Sha256,
    closed: bool,
}

impl FileStreamWriter<File> {
    /// Create (or truncate) `path`, creating missing parent directories.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self, TransferError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(Self::new(file))
    }
}

impl<W: AsyncWrite + Unpin> FileStreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
            hasher: Sha256::new(),
            closed: false,
        }
    }

    pub async fn append(&mut self, payload: &[u8]) -> Result<(), TransferError> {
        if self.closed {
            return Err(TransferError::ProtocolError(
                "write after end of stream".to_string(),
            ));
        }
        self.inner.write_all(payload).await?;
        self.hasher.update(payload);
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Flush and mark the stream finished. Idempotent.
    pub async fn close(&mut self) -> Result<(), TransferError> {
        if !self.closed {
            self.inner.flush().await?;
            self.closed = true;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    async fn chunks_of(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
        let mut reader = FileStreamReader::new(Cursor::new(data.to_vec()), chunk_size);
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            out.push(chunk);
        }
        // stays exhausted
        assert!(reader.next_chunk().await.unwrap().is_none());
        out
    }

    #[tokio::test]
    async fn test_chunking_boundaries() {
        assert!(chunks_of(b"", 4).await.is_empty());
        assert_eq!(chunks_of(b"abc", 4).await, vec![Bytes::from_static(b"abc")]);
        assert_eq!(chunks_of(b"abcd", 4).await, vec![Bytes::from_static(b"abcd")]);
        assert_eq!(
            chunks_of(b"abcde", 4).await,
            vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"e")]
        );
        assert_eq!(chunks_of(&[7u8; 5000], 1000).await.len(), 5);
    }

    #[tokio::test]
    async fn test_reader_digest_matches_content() {
        let mut reader = FileStreamReader::new(Cursor::new(b"hello".to_vec()), 2);
        while reader.next_chunk().await.unwrap().is_some() {}
        assert_eq!(reader.bytes_read(), 5);
        assert_eq!(
            reader.digest(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("nope.bin");
        match FileStreamReader::open(&missing, 10).await {
            Err(TransferError::FileNotFound(path)) => assert_eq!(path, missing),
            Err(e) => panic!("Expected FileNotFound, got {e}"),
            Ok(_) => panic!("Expected FileNotFound"),
        }
    }

    #[tokio::test]
    async fn test_open_directory_is_not_a_file() {
        let temp_dir = tempdir().unwrap();
        assert!(matches!(
            FileStreamReader::open(temp_dir.path(), 10).await,
            Err(TransferError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_appends_and_closes() {
        let mut writer = FileStreamWriter::new(Vec::new());
        writer.append(b"abc").await.unwrap();
        writer.append(b"def").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert!(writer.is_closed());
        assert_eq!(writer.bytes_written(), 6);
        assert!(writer.append(b"late").await.is_err());
        assert_eq!(writer.into_inner(), b"abcdef".to_vec());
    }

    #[tokio::test]
    async fn test_create_makes_parent_directories() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("deeper").join("out.bin");

        let mut writer = FileStreamWriter::create(&path).await.unwrap();
        writer.append(b"payload").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_reader_and_writer_digests_agree() {
        let data: Vec<u8> = (0..3001u32).map(|i| (i % 251) as u8).collect();
        let mut reader = FileStreamReader::new(Cursor::new(data.clone()), 1000);
        let mut writer = FileStreamWriter::new(Vec::new());
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            writer.append(&chunk).await.unwrap();
        }
        assert_eq!(reader.digest(), writer.digest());
        assert_eq!(writer.into_inner(), data);
    }
}
