//! Files offered by the sender, either on disk or already in memory.

use crate::FileDescriptor;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::hash::{DigestProvider, compute_file_digest};
use super::utils::{guess_media_type, now_millis, unix_millis};

#[derive(Debug, Clone)]
enum Origin {
    Path(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    name: String,
    size: u64,
    media_type: String,
    modified_at: u64,
    origin: Origin,
}

impl SourceFile {
    /// Read name, size and modification time from the filesystem.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid file name"))?
            .to_string();
        let modified_at = metadata.modified().map(unix_millis).unwrap_or(0);

        Ok(Self {
            media_type: guess_media_type(&name).to_string(),
            name,
            size: metadata.len(),
            modified_at,
            origin: Origin::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let name = name.into();
        let bytes = bytes.into();
        Self {
            media_type: guess_media_type(&name).to_string(),
            name,
            size: bytes.len() as u64,
            modified_at: now_millis(),
            origin: Origin::Memory(bytes),
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn descriptor(&self, id: u32) -> FileDescriptor {
        FileDescriptor {
            id,
            name: self.name.clone(),
            size: self.size,
            media_type: self.media_type.clone(),
            modified_at: self.modified_at,
        }
    }

    pub(crate) async fn digest(&self, provider: &dyn DigestProvider) -> io::Result<String> {
        match &self.origin {
            Origin::Path(path) => compute_file_digest(path, provider).await,
            Origin::Memory(bytes) => Ok(provider.digest(bytes)),
        }
    }

    pub(crate) async fn open(&self) -> io::Result<SourceReader> {
        match &self.origin {
            Origin::Path(path) => Ok(SourceReader::File(File::open(path).await?)),
            Origin::Memory(bytes) => Ok(SourceReader::Memory {
                bytes: bytes.clone(),
                pos: 0,
            }),
        }
    }
}

/// Sequential reader over a source file.
pub(crate) enum SourceReader {
    File(File),
    Memory { bytes: Bytes, pos: usize },
}

impl SourceReader {
    /// Fill `buf` completely unless the source ends first. Returns bytes read.
    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceReader::File(file) => {
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(filled)
            }
            SourceReader::Memory { bytes, pos } => {
                let n = buf.len().min(bytes.len() - *pos);
                buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}
