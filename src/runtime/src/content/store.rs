//! Disk-based content store keyed by digest.
//!
//! Blobs live under `<root>/blobs/<algorithm>/<hex>`. Writes stream into
//! `<root>/ingest/` while being hashed and are renamed into place once the
//! digest is known, so a blob path never holds partial content.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::{Descriptor, Digest, Digester};

use super::{Provider, ReaderAt};

/// On-disk content store.
pub struct LocalStore {
    /// Root directory for blob storage
    root: PathBuf,
}

impl LocalStore {
    /// Open a store rooted at `root`, creating its directories if needed.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs"), root.join("ingest")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                DiffError::Other(format!(
                    "Failed to create content store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path at which the blob for `digest` is stored.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Stream `reader` into the store and return its descriptor.
    pub fn ingest(&self, media_type: &str, reader: impl Read) -> Result<Descriptor> {
        let (digest, size, tmp) = self.write_ingest(reader)?;
        self.commit(tmp, &digest)?;

        tracing::debug!(
            digest = %digest,
            size,
            media_type = %media_type,
            "Ingested blob"
        );
        Ok(Descriptor::new(media_type, digest, size))
    }

    /// Like [`LocalStore::ingest`], but refuse content that does not match
    /// `expected`.
    pub fn ingest_verified(
        &self,
        expected: &Descriptor,
        reader: impl Read,
    ) -> Result<Descriptor> {
        let digester = expected.digest().algorithm().digester();
        let (digest, size, tmp) = self.write_ingest_with(reader, digester)?;

        if &digest != expected.digest() {
            return Err(DiffError::DigestMismatch {
                expected: expected.digest().to_string(),
                actual: digest.to_string(),
            });
        }
        if size != expected.size() {
            return Err(DiffError::DigestMismatch {
                expected: format!("{} bytes", expected.size()),
                actual: format!("{} bytes", size),
            });
        }

        self.commit(tmp, &digest)?;
        Ok(Descriptor::new(expected.media_type(), digest, size))
    }

    /// Convenience wrapper around [`LocalStore::ingest`] for in-memory content.
    pub fn ingest_bytes(&self, media_type: &str, data: &[u8]) -> Result<Descriptor> {
        self.ingest(media_type, data)
    }

    /// Remove a blob.
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);
        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DiffError::ContentRetrieval {
                    digest: digest.to_string(),
                    message: "blob not found".to_string(),
                }
            } else {
                DiffError::Other(format!("Failed to remove blob {}: {}", path.display(), e))
            }
        })
    }

    fn write_ingest(&self, reader: impl Read) -> Result<(Digest, u64, tempfile::NamedTempFile)> {
        self.write_ingest_with(reader, Digester::canonical())
    }

    fn write_ingest_with(
        &self,
        mut reader: impl Read,
        mut digester: Digester,
    ) -> Result<(Digest, u64, tempfile::NamedTempFile)> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join("ingest"))?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            digester.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }
        tmp.as_file().sync_all()?;

        Ok((digester.finalize(), size, tmp))
    }

    fn commit(&self, tmp: tempfile::NamedTempFile, digest: &Digest) -> Result<()> {
        let target = self.blob_path(digest);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tmp.persist(&target).map_err(|e| {
            DiffError::Other(format!(
                "Failed to commit blob {}: {}",
                target.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}

impl Provider for LocalStore {
    fn reader_at(&self, desc: &Descriptor) -> Result<Arc<dyn ReaderAt>> {
        let path = self.blob_path(desc.digest());
        let file = File::open(&path).map_err(|e| DiffError::ContentRetrieval {
            digest: desc.digest().to_string(),
            message: if e.kind() == io::ErrorKind::NotFound {
                "blob not found".to_string()
            } else {
                format!("Failed to open {}: {}", path.display(), e)
            },
        })?;
        let size = file
            .metadata()
            .map_err(|e| DiffError::ContentRetrieval {
                digest: desc.digest().to_string(),
                message: format!("Failed to stat {}: {}", path.display(), e),
            })?
            .len();

        Ok(Arc::new(FileReaderAt { file, size }))
    }
}

/// Positional reader over a blob file; safe for concurrent use.
struct FileReaderAt {
    file: File,
    size: u64,
}

impl ReaderAt for FileReaderAt {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::SectionReader;
    use a3s_diff_core::media_types;
    use a3s_diff_core::Algorithm;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("content");
        LocalStore::new(&root).unwrap();

        assert!(root.join("blobs").is_dir());
        assert!(root.join("ingest").is_dir());
    }

    #[test]
    fn test_ingest_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();

        let desc = store
            .ingest_bytes(media_types::IMAGE_LAYER_GZIP, b"layer bytes")
            .unwrap();
        assert_eq!(desc.size(), 11);
        assert_eq!(
            desc.digest(),
            &Digest::from_bytes(Algorithm::Sha256, b"layer bytes")
        );
        assert!(store.exists(desc.digest()));

        let ra = store.reader_at(&desc).unwrap();
        assert_eq!(ra.size(), 11);

        let mut out = Vec::new();
        SectionReader::new(ra).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"layer bytes");
    }

    #[test]
    fn test_ingest_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        store.ingest_bytes(media_types::IMAGE_LAYER, b"abc").unwrap();

        let leftover = std::fs::read_dir(tmp.path().join("ingest")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_reader_at_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        let desc = Descriptor::new(
            media_types::IMAGE_LAYER,
            Digest::from_bytes(Algorithm::Sha256, b"missing"),
            7,
        );

        let err = store.reader_at(&desc).err().unwrap();
        assert!(matches!(err, DiffError::ContentRetrieval { .. }));
        assert!(err.to_string().contains("blob not found"));
    }

    #[test]
    fn test_ingest_verified_rejects_mismatch() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        let expected = Descriptor::new(
            media_types::IMAGE_LAYER,
            Digest::from_bytes(Algorithm::Sha256, b"expected"),
            8,
        );

        let err = store.ingest_verified(&expected, &b"tampered"[..]).unwrap_err();
        assert!(matches!(err, DiffError::DigestMismatch { .. }));
        assert!(!store.exists(expected.digest()));
    }

    #[test]
    fn test_ingest_verified_accepts_match() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        let expected = Descriptor::new(
            media_types::IMAGE_LAYER,
            Digest::from_bytes(Algorithm::Sha256, b"expected"),
            8,
        );

        let desc = store.ingest_verified(&expected, &b"expected"[..]).unwrap();
        assert_eq!(desc, expected);
        assert!(store.exists(expected.digest()));
    }

    #[test]
    fn test_delete_blob() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path()).unwrap();
        let desc = store.ingest_bytes(media_types::IMAGE_LAYER, b"gone").unwrap();

        store.delete(desc.digest()).unwrap();
        assert!(!store.exists(desc.digest()));
        assert!(matches!(
            store.delete(desc.digest()),
            Err(DiffError::ContentRetrieval { .. })
        ));
    }
}
