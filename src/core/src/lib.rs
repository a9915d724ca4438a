//! A3S Diff Core - Foundational Types
//!
//! Descriptors, digests, mount specifications, configuration, errors and
//! events shared by the layer-diff runtime and CLI.

pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod event;
pub mod mount;

// Re-export commonly used types
pub use config::{
    with_processor_payload, with_processor_payloads, ApplyConfig, ApplyOpt, DecompressOptions,
    DiffConfig, LogLevel, ProcessorPayload, ProcessorPayloads, StreamProcessorConfig,
};
pub use descriptor::{media_types, Descriptor};
pub use digest::{Algorithm, Digest, Digester};
pub use error::{DiffError, Result};
pub use event::{DiffEvent, EventEmitter};
pub use mount::{Mount, MountSpec};

/// A3S Diff version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
