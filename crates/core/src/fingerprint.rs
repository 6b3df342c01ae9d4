//! Content fingerprinting and duplicate detection

use crate::error::{Error, Result};
use crate::session::UploadSession;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Content type used when nothing better is known
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the content fingerprint (hex SHA-256) of a byte slice
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Where a file's bytes come from when it is transferred
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    /// Read from disk at transfer time
    Disk(PathBuf),
}

impl FileSource {
    pub async fn load(&self) -> Result<Bytes> {
        match self {
            FileSource::Memory(data) => Ok(data.clone()),
            FileSource::Disk(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

/// A file as submitted by the caller, before analysis
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub hash: String,
    pub source: FileSource,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            hash: fingerprint(&data),
            source: FileSource::Memory(data),
        }
    }

    /// Fingerprint a file on disk without keeping its bytes, guessing its
    /// content type from the extension
    pub async fn from_path(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        let mut size = 0u64;

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            size += read as u64;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        let content_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        Ok(Self {
            name,
            content_type,
            size,
            hash: hex::encode(hasher.finalize()),
            source: FileSource::Disk(path.to_path_buf()),
        })
    }
}

/// Analyzed file: identity, digest and the flags the pipeline acts on.
///
/// The body source travels with the descriptor until the file is handed to
/// a transfer or settled without one; after that only metadata remains.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    index: usize,
    name: String,
    size: u64,
    content_type: String,
    hash: String,
    duplicate_of: Option<usize>,
    needs_compression: bool,
    source: Option<FileSource>,
}

impl FileDescriptor {
    pub fn new(index: usize, file: UploadFile, compression_threshold: u64) -> Self {
        let content_type = if file.content_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            file.content_type
        };

        Self {
            index,
            name: file.name,
            size: file.size,
            content_type,
            hash: file.hash,
            duplicate_of: None,
            needs_compression: file.size > compression_threshold,
            source: Some(file.source),
        }
    }

    /// Position of the file in the caller's submission
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    /// Submission index of the earlier file with the same content, if that
    /// file is part of this submission
    pub fn duplicate_of(&self) -> Option<usize> {
        self.duplicate_of
    }

    pub fn needs_compression(&self) -> bool {
        self.needs_compression
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    pub fn has_body(&self) -> bool {
        self.source.is_some()
    }

    /// Load the bytes to transfer. Fails once the body has been released or
    /// when the file on disk no longer has the fingerprinted size.
    pub async fn body(&self) -> Result<Bytes> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::InvalidInput(format!("Body of {} was already released", self.name)))?;

        let data = source.load().await?;
        if data.len() as u64 != self.size {
            return Err(Error::InvalidInput(format!(
                "{} changed since it was fingerprinted ({} bytes, now {})",
                self.name,
                self.size,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Move the body source into a copy of this descriptor, keeping only
    /// metadata here
    pub fn detach(&mut self) -> FileDescriptor {
        let mut detached = self.clone_metadata();
        detached.source = self.source.take();
        detached
    }

    /// Drop the body source
    pub fn release(&mut self) {
        self.source = None;
    }

    fn clone_metadata(&self) -> FileDescriptor {
        FileDescriptor {
            index: self.index,
            name: self.name.clone(),
            size: self.size,
            content_type: self.content_type.clone(),
            hash: self.hash.clone(),
            duplicate_of: self.duplicate_of,
            needs_compression: self.needs_compression,
            source: None,
        }
    }
}

/// Outcome of fingerprinting a submission
#[derive(Debug, Default)]
pub struct Analysis {
    /// Files that need a transfer, in submission order
    pub unique: Vec<FileDescriptor>,
    /// Files whose content is already uploaded or appears earlier in the submission
    pub duplicates: Vec<FileDescriptor>,
}

impl Analysis {
    pub fn unique_bytes(&self) -> u64 {
        self.unique.iter().map(FileDescriptor::size).sum()
    }
}

/// Fingerprint every file and split the submission into unique and duplicate files.
///
/// A file is a duplicate when its digest is already in the session's
/// completed set, or when an earlier file of the same submission has the
/// same digest. Names play no part in the decision. Duplicates never
/// transfer, so their bodies are released here.
pub fn analyze(files: Vec<UploadFile>, session: &UploadSession, compression_threshold: u64) -> Analysis {
    let mut analysis = Analysis::default();
    let mut first_seen: HashMap<String, usize> = HashMap::new();

    for (index, file) in files.into_iter().enumerate() {
        let mut descriptor = FileDescriptor::new(index, file, compression_threshold);

        if session.is_completed(descriptor.hash()) {
            descriptor.release();
            debug!(file = %descriptor.name(), hash = %descriptor.hash(), "content already uploaded this session");
            analysis.duplicates.push(descriptor);
            continue;
        }

        match first_seen.get(descriptor.hash()) {
            Some(&original) => {
                debug!(file = %descriptor.name(), original, "duplicate content in submission");
                descriptor.duplicate_of = Some(original);
                descriptor.release();
                analysis.duplicates.push(descriptor);
            }
            None => {
                first_seen.insert(descriptor.hash().to_string(), index);
                analysis.unique.push(descriptor);
            }
        }
    }

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u64 = 25 * 1024 * 1024;

    #[test]
    fn test_fingerprint_known_vector() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint(b"").len(), 64);
    }

    #[test]
    fn test_identical_bytes_different_names_collapse() {
        let session = UploadSession::new();
        let files = vec![
            UploadFile::new("a.jpg", "image/jpeg", b"same".to_vec()),
            UploadFile::new("b.jpg", "image/jpeg", b"same".to_vec()),
        ];

        let analysis = analyze(files, &session, THRESHOLD);
        assert_eq!(analysis.unique.len(), 1);
        assert_eq!(analysis.duplicates.len(), 1);
        assert_eq!(analysis.unique[0].name(), "a.jpg");
        assert_eq!(analysis.duplicates[0].duplicate_of(), Some(0));
        assert!(analysis.duplicates[0].is_duplicate());
        assert!(analysis.unique[0].has_body());
        assert!(!analysis.duplicates[0].has_body());
    }

    #[test]
    fn test_same_name_different_bytes_kept_apart() {
        let session = UploadSession::new();
        let files = vec![
            UploadFile::new("photo.jpg", "image/jpeg", b"one".to_vec()),
            UploadFile::new("photo.jpg", "image/jpeg", b"two".to_vec()),
        ];

        let analysis = analyze(files, &session, THRESHOLD);
        assert_eq!(analysis.unique.len(), 2);
        assert!(analysis.duplicates.is_empty());
    }

    #[test]
    fn test_session_completed_hash_is_duplicate() {
        let session = UploadSession::new();
        session.mark_completed(&fingerprint(b"done"));

        let files = vec![UploadFile::new("again.txt", "text/plain", b"done".to_vec())];
        let analysis = analyze(files, &session, THRESHOLD);

        assert!(analysis.unique.is_empty());
        assert_eq!(analysis.duplicates.len(), 1);
        assert_eq!(analysis.duplicates[0].duplicate_of(), None);
    }

    #[test]
    fn test_descriptor_flags() {
        let big = UploadFile::new("big.png", "image/png", vec![0u8; 11]);
        let descriptor = FileDescriptor::new(3, big, 10);
        assert!(descriptor.needs_compression());
        assert!(descriptor.is_image());
        assert_eq!(descriptor.size(), 11);
        assert_eq!(descriptor.index(), 3);

        let blank_type = UploadFile::new("x", "", vec![1u8]);
        let descriptor = FileDescriptor::new(0, blank_type, 10);
        assert_eq!(descriptor.content_type(), DEFAULT_CONTENT_TYPE);
        assert!(!descriptor.needs_compression());
    }

    #[test]
    fn test_unique_bytes() {
        let session = UploadSession::new();
        let files = vec![
            UploadFile::new("a", "text/plain", vec![1u8; 10]),
            UploadFile::new("b", "text/plain", vec![2u8; 5]),
            UploadFile::new("c", "text/plain", vec![1u8; 10]),
        ];
        assert_eq!(analyze(files, &session, THRESHOLD).unique_bytes(), 15);
    }

    #[tokio::test]
    async fn test_from_path_guesses_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.size, 5);
        assert_eq!(file.hash, fingerprint(b"hello"));
        assert!(matches!(file.source, FileSource::Disk(_)));

        let odd = dir.path().join("blob.zzzunknown");
        tokio::fs::write(&odd, b"?").await.unwrap();
        let file = UploadFile::from_path(&odd).await.unwrap();
        assert_eq!(file.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_disk_body_read_at_transfer_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let content = vec![7u8; HASH_BUFFER_SIZE * 2 + 3];
        tokio::fs::write(&path, &content).await.unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.hash, fingerprint(&content));

        let descriptor = FileDescriptor::new(0, file, u64::MAX);
        assert_eq!(descriptor.body().await.unwrap().as_ref(), content.as_slice());

        tokio::fs::write(&path, b"truncated").await.unwrap();
        assert!(matches!(descriptor.body().await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_detach_moves_body() {
        let mut descriptor = FileDescriptor::new(4, UploadFile::new("a.txt", "text/plain", b"abc".to_vec()), u64::MAX);

        let detached = descriptor.detach();
        assert!(!descriptor.has_body());
        assert_eq!(descriptor.name(), "a.txt");
        assert_eq!(descriptor.hash(), fingerprint(b"abc"));
        assert!(matches!(descriptor.body().await, Err(Error::InvalidInput(_))));

        assert_eq!(detached.index(), 4);
        assert_eq!(detached.body().await.unwrap().as_ref(), b"abc");
    }
}
