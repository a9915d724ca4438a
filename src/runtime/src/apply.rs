//! Applier - applies a layer diff blob onto a mounted filesystem.
//!
//! ```text
//!   store ──▶ ProcessorChain ──▶ CanonicalReader ──▶ Extractor(root)
//!                                      │                    │
//!                                      │          drain trailing bytes
//!                                      ▼
//!                          Descriptor { tar, digest, size }
//! ```
//!
//! The returned descriptor always identifies the decoded stream, never the
//! stored blob.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use a3s_diff_core::config::DEFAULT_MAX_CHAIN_DEPTH;
use a3s_diff_core::error::{DiffError, Result};
use a3s_diff_core::event::events;
use a3s_diff_core::{
    media_types, ApplyConfig, ApplyOpt, Descriptor, DiffConfig, DiffEvent, EventEmitter,
    MountSpec,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::archive::{Extractor, TarExtractor};
use crate::content::{Provider, ReaderAt, SectionReader};
use crate::mount::{with_temp_mount, Mounter};
use crate::processor::{ProcessorChain, ProcessorRegistry};
use crate::reader::{is_cancelled, CanonicalReader};

/// Applies layer diffs onto mounts.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply the blob described by `desc` onto a temporary mount of
    /// `mounts`, returning the descriptor of the uncompressed layer.
    async fn apply(
        &self,
        desc: &Descriptor,
        mounts: &MountSpec,
        opts: Vec<ApplyOpt>,
        cancel: &CancellationToken,
    ) -> Result<Descriptor>;
}

/// Filesystem applier backed by a content store.
#[derive(Clone)]
pub struct FsApplier {
    store: Arc<dyn Provider>,
    registry: Arc<ProcessorRegistry>,
    mounter: Arc<dyn Mounter>,
    extractor: Arc<dyn Extractor>,
    events: Option<EventEmitter>,
    temp_dir: Option<PathBuf>,
    max_chain_depth: usize,
}

impl FsApplier {
    /// Applier with the built-in decoders and the tar extractor.
    pub fn new(store: Arc<dyn Provider>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            store,
            registry: Arc::new(ProcessorRegistry::default()),
            mounter,
            extractor: Arc::new(TarExtractor),
            events: None,
            temp_dir: None,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        }
    }

    /// Applier configured from engine configuration.
    pub fn from_config(
        config: &DiffConfig,
        store: Arc<dyn Provider>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let mut applier = Self::new(store, mounter)
            .with_registry(ProcessorRegistry::from_config(config))
            .with_max_chain_depth(config.max_chain_depth);
        applier.temp_dir = config.temp_dir.clone();
        applier
    }

    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    pub fn with_max_chain_depth(mut self, max_chain_depth: usize) -> Self {
        self.max_chain_depth = max_chain_depth;
        self
    }

    /// Synchronous body of [`Applier::apply`]. Blocks on I/O.
    pub fn apply_blocking(
        &self,
        desc: &Descriptor,
        mounts: &MountSpec,
        config: &ApplyConfig,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        if cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }

        let ra = self.store.reader_at(desc).map_err(|e| match e {
            DiffError::ContentRetrieval { .. } => e,
            other => DiffError::ContentRetrieval {
                digest: desc.digest().to_string(),
                message: other.to_string(),
            },
        })?;

        let result = self.apply_from(desc, ra.clone(), mounts, config, cancel);
        if let Err(e) = ra.close() {
            tracing::warn!(digest = %desc.digest(), error = %e, "Failed to close content reader");
        }
        result
    }

    fn apply_from(
        &self,
        desc: &Descriptor,
        ra: Arc<dyn ReaderAt>,
        mounts: &MountSpec,
        config: &ApplyConfig,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let input: Box<dyn Read + Send> = Box::new(SectionReader::new(ra));
        let chain = ProcessorChain::resolve(
            &self.registry,
            desc.media_type(),
            input,
            &config.processor_payloads,
            self.max_chain_depth,
        )?;
        let mut reader = CanonicalReader::new(chain, cancel.clone());

        let extracted = with_temp_mount(
            self.mounter.as_ref(),
            mounts,
            self.temp_dir.as_deref(),
            cancel,
            self.events.as_ref(),
            |root| {
                self.extractor
                    .apply(root, &mut reader)
                    .map_err(|e| match e {
                        _ if cancel.is_cancelled() => DiffError::Cancelled,
                        DiffError::ExtractionError(_) => e,
                        other => DiffError::ExtractionError(other.to_string()),
                    })?;

                // Trailing bytes the extractor skipped still belong to the layer.
                io::copy(&mut reader, &mut io::sink()).map_err(|e| {
                    if is_cancelled(&e) || cancel.is_cancelled() {
                        DiffError::Cancelled
                    } else {
                        DiffError::IncompleteStream(e.to_string())
                    }
                })?;
                Ok(())
            },
        );

        let (chain, digest, size) = reader.into_parts();
        match (extracted, chain.close()) {
            (Ok(()), Ok(())) => Ok(Descriptor::new(media_types::IMAGE_LAYER, digest, size)),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                tracing::warn!(
                    digest = %desc.digest(),
                    error = %close_err,
                    cause = %e,
                    "Failed to close processor chain after error"
                );
                if let Some(events) = &self.events {
                    events.emit(
                        DiffEvent::new(events::PROCESSOR_CLOSE_FAILED)
                            .with_field("digest", desc.digest().to_string())
                            .with_field("error", close_err.to_string())
                            .with_field("cause", e.to_string()),
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Applier for FsApplier {
    async fn apply(
        &self,
        desc: &Descriptor,
        mounts: &MountSpec,
        opts: Vec<ApplyOpt>,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let started = Instant::now();
        let config = ApplyConfig::from_opts(desc, opts)?;

        // Dropping this future cancels the blocking work, which then unwinds
        // through mount teardown.
        let token = cancel.child_token();
        let _cancel_on_drop = token.clone().drop_guard();

        let this = self.clone();
        let input = desc.clone();
        let mounts = mounts.clone();
        let applied = tokio::task::spawn_blocking(move || {
            this.apply_blocking(&input, &mounts, &config, &token)
        })
        .await
        .map_err(|e| DiffError::Other(format!("apply task failed: {}", e)))??;

        let elapsed = started.elapsed();
        tracing::debug!(
            d = ?elapsed,
            digest = %desc.digest(),
            size = applied.size(),
            media = %desc.media_type(),
            "diff applied"
        );

        if let Some(events) = &self.events {
            events.emit(
                DiffEvent::new(events::DIFF_APPLIED)
                    .with_field("digest", desc.digest().to_string())
                    .with_field("media_type", desc.media_type())
                    .with_field("applied_digest", applied.digest().to_string())
                    .with_field("size", applied.size())
                    .with_field("elapsed_ms", elapsed.as_millis() as u64),
            );
        }

        Ok(applied)
    }
}
