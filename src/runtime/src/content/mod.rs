//! Content store access.
//!
//! The engine only needs read access: a [`Provider`] hands out positional
//! [`ReaderAt`] handles which may be used concurrently by independent
//! applies. [`LocalStore`] is the on-disk implementation.

mod store;

use std::io::{self, Read};
use std::sync::Arc;

use a3s_diff_core::error::Result;
use a3s_diff_core::Descriptor;

pub use store::LocalStore;

/// Random-access, read-only view of one blob.
pub trait ReaderAt: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns 0 at end of content.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size of the blob in bytes.
    fn size(&self) -> u64;

    /// Release the underlying handle.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Source of blob readers, keyed by descriptor.
pub trait Provider: Send + Sync {
    fn reader_at(&self, desc: &Descriptor) -> Result<Arc<dyn ReaderAt>>;
}

/// Sequential reader over a [`ReaderAt`], from offset 0 to its size.
pub struct SectionReader {
    inner: Arc<dyn ReaderAt>,
    offset: u64,
    size: u64,
}

impl SectionReader {
    pub fn new(inner: Arc<dyn ReaderAt>) -> Self {
        let size = inner.size();
        Self {
            inner,
            offset: 0,
            size,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.offset
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let max = (self.size - self.offset).min(buf.len() as u64) as usize;
        let n = self.inner.read_at(&mut buf[..max], self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}
