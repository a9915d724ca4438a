//! Built-in decompressing processor for OCI and Docker layer media types.

use std::fmt;
use std::io::{self, Cursor, Read};

use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::{media_types, DecompressOptions, ProcessorPayloads};
use flate2::read::{GzDecoder, MultiGzDecoder};

use super::{ProcessorHandler, Stage};

/// Longest magic prefix of any supported compression.
const MAX_MAGIC_LEN: usize = 6;

/// Compression applied to a layer tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Gzip,
    Zstd,
    Bzip2,
    Xz,
}

impl Compression {
    /// Compression implied by a layer media type, or `None` for non-layer types.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            media_types::IMAGE_LAYER
            | media_types::IMAGE_LAYER_NON_DISTRIBUTABLE
            | media_types::DOCKER_LAYER => Some(Self::Uncompressed),
            media_types::IMAGE_LAYER_GZIP
            | media_types::IMAGE_LAYER_NON_DISTRIBUTABLE_GZIP
            | media_types::DOCKER_LAYER_GZIP
            | media_types::DOCKER_LAYER_FOREIGN_GZIP => Some(Self::Gzip),
            media_types::IMAGE_LAYER_ZSTD | media_types::IMAGE_LAYER_NON_DISTRIBUTABLE_ZSTD => {
                Some(Self::Zstd)
            }
            media_types::IMAGE_LAYER_BZIP2 => Some(Self::Bzip2),
            media_types::IMAGE_LAYER_XZ => Some(Self::Xz),
            _ => None,
        }
    }

    /// Leading bytes every stream of this compression starts with.
    pub fn magic(&self) -> &'static [u8] {
        match self {
            Self::Uncompressed => &[],
            Self::Gzip => &[0x1f, 0x8b],
            Self::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            Self::Bzip2 => b"BZh",
            Self::Xz => &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
        }
    }

    /// Guess the compression of a stream from its first bytes.
    pub fn detect(header: &[u8]) -> Self {
        [Self::Gzip, Self::Zstd, Self::Bzip2, Self::Xz]
            .into_iter()
            .find(|c| header.starts_with(c.magic()))
            .unwrap_or(Self::Uncompressed)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uncompressed => "uncompressed",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        })
    }
}

/// Decodes compressed layer media types to the canonical layer type.
///
/// Uncompressed layer types get an identity stage. Honors a
/// [`DecompressOptions`] payload registered for the input media type.
pub struct CompressedHandler;

impl ProcessorHandler for CompressedHandler {
    fn name(&self) -> &str {
        "compressed"
    }

    fn accepts(&self, media_type: &str) -> bool {
        Compression::from_media_type(media_type).is_some()
    }

    fn open(
        &self,
        media_type: &str,
        input: Box<dyn Read + Send>,
        payloads: &ProcessorPayloads,
    ) -> Result<Stage> {
        let compression = Compression::from_media_type(media_type)
            .ok_or_else(|| DiffError::NoDecoder(media_type.to_string()))?;
        let options = match payloads.get(media_type) {
            Some(payload) => DecompressOptions::from_payload(payload)?.unwrap_or_default(),
            None => DecompressOptions::default(),
        };

        let reader = decompress(compression, input, &options).map_err(|source| {
            DiffError::InvalidStream {
                media_type: media_type.to_string(),
                source,
            }
        })?;
        Ok(Stage::new(media_types::IMAGE_LAYER, reader))
    }
}

/// Wrap `input` in the decoder for `compression`.
///
/// The magic header is checked up front so a mislabelled or corrupt blob
/// fails here rather than midway through extraction.
fn decompress(
    compression: Compression,
    mut input: Box<dyn Read + Send>,
    options: &DecompressOptions,
) -> io::Result<Box<dyn Read + Send>> {
    if compression == Compression::Uncompressed {
        return Ok(input);
    }

    let mut header = vec![0u8; MAX_MAGIC_LEN];
    let n = read_up_to(&mut input, &mut header)?;
    header.truncate(n);
    if !header.starts_with(compression.magic()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "missing {} header, stream looks {} ({:02x?})",
                compression,
                Compression::detect(&header),
                header
            ),
        ));
    }
    let stream = Cursor::new(header).chain(input);

    Ok(match compression {
        Compression::Gzip if options.gzip_multi_member.unwrap_or(true) => {
            Box::new(MultiGzDecoder::new(stream))
        }
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(stream)?;
            if let Some(window_log_max) = options.zstd_window_log_max {
                decoder.window_log_max(window_log_max)?;
            }
            Box::new(decoder)
        }
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(stream)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(stream)),
        Compression::Uncompressed => unreachable!("handled above"),
    })
}

/// Fill `buf` unless the stream ends first. Returns bytes read.
fn read_up_to(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
