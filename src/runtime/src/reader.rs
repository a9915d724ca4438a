//! Counting, digesting reader over the canonical layer stream.

use std::fmt;
use std::io::{self, Read};

use a3s_diff_core::{Digest, Digester};
use tokio_util::sync::CancellationToken;

/// Marker carried inside the `io::Error` returned once a read is cancelled.
#[derive(Debug)]
pub struct ReadCancelled;

impl fmt::Display for ReadCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("read cancelled")
    }
}

impl std::error::Error for ReadCancelled {}

/// Returns true if `err` was produced by a cancelled [`CanonicalReader`].
pub fn is_cancelled(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<ReadCancelled>())
        .unwrap_or(false)
}

/// Wraps a reader, hashing and counting exactly the bytes it returns.
///
/// Read boundaries, short reads and errors of the wrapped reader pass
/// through untouched. The digest is only available from
/// [`CanonicalReader::finish`], which consumes the reader.
pub struct CanonicalReader<R> {
    inner: R,
    digester: Digester,
    size: u64,
    cancel: CancellationToken,
}

impl<R: Read> CanonicalReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            digester: Digester::canonical(),
            size: 0,
            cancel,
        }
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finalize the digest. Returns `(digest, size)`.
    pub fn finish(self) -> (Digest, u64) {
        (self.digester.finalize(), self.size)
    }

    /// Like [`CanonicalReader::finish`], also handing back the wrapped reader.
    pub fn into_parts(self) -> (R, Digest, u64) {
        (self.inner, self.digester.finalize(), self.size)
    }
}

impl<R: Read> Read for CanonicalReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, ReadCancelled));
        }
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }
}
