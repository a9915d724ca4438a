//! A3S Diff Runtime - layer-diff application engine.
//!
//! Reads layer blobs from a content store, decodes them through a chain of
//! stream processors, extracts the result onto a temporarily mounted
//! filesystem and reports the digest and size of the decoded layer.

#![allow(clippy::result_large_err)]

pub mod apply;
pub mod archive;
pub mod auth;
pub mod content;
pub mod mount;
pub mod processor;
pub mod reader;

// Re-export common types
pub use apply::{Applier, FsApplier};
pub use archive::{Extractor, TarExtractor};
pub use auth::{
    fetch_token, fetch_token_with_oauth, generate_token_options, Challenge, TokenOptions,
};
pub use content::{LocalStore, Provider, ReaderAt, SectionReader};
pub use mount::{with_temp_mount, Mounter, SystemMounter};
pub use processor::{
    BinaryHandler, CompressedHandler, Compression, ProcessorChain, ProcessorHandler,
    ProcessorRegistry, Stage,
};
pub use reader::CanonicalReader;

/// A3S Diff Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
