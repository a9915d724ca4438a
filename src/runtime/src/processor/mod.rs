//! Stream processor chain.
//!
//! A layer blob is labelled with a media type describing how it is encoded
//! (e.g. `...tar+gzip`). The chain repeatedly asks the registry for a
//! handler accepting the current label and stacks the stage it opens, until
//! the label reaches the canonical uncompressed layer type.
//!
//! # Ownership
//!
//! ```text
//!   data path:  top stage reader ──owns──▶ ... ──owns──▶ store reader
//!   stack:      [closer 0, closer 1, ..., closer N]   (acquisition order)
//! ```
//!
//! Each stage's reader owns the stage below it, so the data path is a
//! single value. Stages holding out-of-band resources (child processes,
//! payload files) register a closer. Closing drops the data path first and
//! then runs closers from N down to 0.

mod binary;
mod compressed;

use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;

use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::{media_types, DiffConfig, ProcessorPayloads};

pub use binary::{BinaryHandler, MEDIA_TYPE_ENV, PAYLOAD_ENV};
pub use compressed::{Compression, CompressedHandler};

/// Releases the out-of-band resources of one stage.
pub type Closer = Box<dyn FnOnce() -> Result<()> + Send>;

/// A freshly opened decoding stage.
pub struct Stage {
    reader: Box<dyn Read + Send>,
    media_type: String,
    closer: Option<Closer>,
}

impl Stage {
    /// A stage exposing `reader`, whose content is encoded as `media_type`.
    pub fn new(media_type: impl Into<String>, reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            media_type: media_type.into(),
            closer: None,
        }
    }

    pub fn with_closer(mut self, closer: Closer) -> Self {
        self.closer = Some(closer);
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}

/// Opens decoding stages for the media types it accepts.
pub trait ProcessorHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether this handler can decode `media_type`.
    fn accepts(&self, media_type: &str) -> bool;

    /// Wrap `input` (encoded as `media_type`) in a decoding stage.
    ///
    /// `payloads` are the caller's side-channel hints, keyed by media type.
    fn open(
        &self,
        media_type: &str,
        input: Box<dyn Read + Send>,
        payloads: &ProcessorPayloads,
    ) -> Result<Stage>;
}

/// Ordered set of processor handlers.
///
/// Lookup walks handlers newest-first, so a handler registered later
/// overrides an earlier one for the same media type.
#[derive(Clone)]
pub struct ProcessorRegistry {
    handlers: Vec<Arc<dyn ProcessorHandler>>,
}

impl ProcessorRegistry {
    /// A registry with no handlers at all.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Built-in decoders plus the external processors in `config`.
    pub fn from_config(config: &DiffConfig) -> Self {
        let mut registry = Self::default();
        for processor in &config.stream_processors {
            registry.register(Arc::new(BinaryHandler::new(processor.clone())));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ProcessorHandler>) {
        tracing::debug!(handler = handler.name(), "Registered stream processor");
        self.handlers.push(handler);
    }

    pub fn handler_for(&self, media_type: &str) -> Option<&Arc<dyn ProcessorHandler>> {
        self.handlers.iter().rev().find(|h| h.accepts(media_type))
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CompressedHandler));
        registry
    }
}

struct StageRecord {
    handler: String,
    media_type: String,
    closer: Option<Closer>,
}

/// A resolved stack of decoding stages, readable as the decoded stream.
pub struct ProcessorChain {
    reader: Option<Box<dyn Read + Send>>,
    media_type: String,
    stages: Vec<StageRecord>,
}

impl ProcessorChain {
    /// An empty chain over `input`, labelled `media_type`.
    pub fn new(media_type: impl Into<String>, input: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Some(input),
            media_type: media_type.into(),
            stages: Vec::new(),
        }
    }

    /// Stack stages over `input` until it decodes to the canonical layer type.
    ///
    /// At least one stage is always opened. Fails if no handler accepts a
    /// label, if a label repeats, or if more than `max_depth` stages would
    /// be needed. On failure every stage opened so far is closed.
    pub fn resolve(
        registry: &ProcessorRegistry,
        media_type: &str,
        input: Box<dyn Read + Send>,
        payloads: &ProcessorPayloads,
        max_depth: usize,
    ) -> Result<Self> {
        let mut chain = Self::new(media_type, input);
        let mut seen = HashSet::new();
        seen.insert(media_type.to_string());

        loop {
            if chain.depth() >= max_depth {
                let reason = format!(
                    "still at {} after {} stages",
                    chain.media_type, max_depth
                );
                return Err(chain.abandon(DiffError::UnresolvableChain {
                    media_type: media_type.to_string(),
                    reason,
                }));
            }

            let current = chain.media_type.clone();
            let Some(handler) = registry.handler_for(&current) else {
                return Err(chain.abandon(DiffError::NoDecoder(current)));
            };
            let Some(input) = chain.reader.take() else {
                return Err(chain.abandon(DiffError::Other(
                    "processor chain has no stream".to_string(),
                )));
            };

            let stage = match handler.open(&current, input, payloads) {
                Ok(stage) => stage,
                Err(e) => return Err(chain.abandon(e)),
            };
            tracing::debug!(
                handler = handler.name(),
                from = %current,
                to = %stage.media_type,
                "Opened stream processor"
            );
            chain.push(handler.name(), stage);

            if chain.media_type == media_types::IMAGE_LAYER {
                return Ok(chain);
            }
            if !seen.insert(chain.media_type.clone()) {
                let reason = format!("media type {} repeated", chain.media_type);
                return Err(chain.abandon(DiffError::UnresolvableChain {
                    media_type: media_type.to_string(),
                    reason,
                }));
            }
        }
    }

    /// Media type of the stream the chain currently exposes.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Number of stages opened.
    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    /// Media types produced by each stage, in acquisition order.
    pub fn stage_media_types(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.media_type.as_str()).collect()
    }

    /// Release every stage, newest first.
    ///
    /// All closers run even if one fails; the first failure is returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn push(&mut self, handler: &str, stage: Stage) {
        self.reader = Some(stage.reader);
        self.media_type = stage.media_type.clone();
        self.stages.push(StageRecord {
            handler: handler.to_string(),
            media_type: stage.media_type,
            closer: stage.closer,
        });
    }

    /// Close after a failure. Close errors are logged; `err` is returned.
    fn abandon(mut self, err: DiffError) -> DiffError {
        if let Err(close_err) = self.release() {
            tracing::warn!(
                error = %close_err,
                cause = %err,
                "Failed to release processor chain after error"
            );
        }
        err
    }

    fn release(&mut self) -> Result<()> {
        drop(self.reader.take());

        let mut first_err = None;
        while let Some(stage) = self.stages.pop() {
            let Some(closer) = stage.closer else {
                continue;
            };
            if let Err(e) = closer() {
                tracing::warn!(
                    handler = %stage.handler,
                    media_type = %stage.media_type,
                    error = %e,
                    "Failed to close stream processor"
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Read for ProcessorChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ProcessorChain {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to release dropped processor chain");
        }
    }
}
