//! Content descriptors and layer media types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::digest::Digest;

/// Layer media types understood by the engine.
pub mod media_types {
    /// Canonical, uncompressed layer. Every apply resolves to this.
    pub const IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const IMAGE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    pub const IMAGE_LAYER_BZIP2: &str = "application/vnd.oci.image.layer.v1.tar+bzip2";
    pub const IMAGE_LAYER_XZ: &str = "application/vnd.oci.image.layer.v1.tar+xz";

    pub const IMAGE_LAYER_NON_DISTRIBUTABLE: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    pub const IMAGE_LAYER_NON_DISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
    pub const IMAGE_LAYER_NON_DISTRIBUTABLE_ZSTD: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// Identifies a piece of content by media type, digest and size.
///
/// Fields are fixed at construction; build a new descriptor rather than
/// editing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    media_type: String,
    digest: Digest,
    size: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    annotations: HashMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: HashMap::new(),
        }
    }

    /// Return a copy of this descriptor carrying `annotations`.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }
}
