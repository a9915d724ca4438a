use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::descriptor::Descriptor;
use crate::error::{DiffError, Result};

/// Default bound on the number of decoding stages in one processor chain.
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 8;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Root of the local content store
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,

    /// Parent directory for temporary mount roots (system temp dir if unset)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Maximum number of decoding stages before a chain is rejected
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// External stream processors, consulted before the built-in decoders
    #[serde(default)]
    pub stream_processors: Vec<StreamProcessorConfig>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_content_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("diff")
        .join("content")
}

fn default_max_chain_depth() -> usize {
    DEFAULT_MAX_CHAIN_DEPTH
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            temp_dir: None,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            stream_processors: Vec::new(),
            log_level: LogLevel::default(),
        }
    }
}

impl DiffConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiffError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            processors = config.stream_processors.len(),
            "Loaded diff configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chain_depth == 0 {
            return Err(DiffError::ConfigError(
                "max_chain_depth must be at least 1".to_string(),
            ));
        }
        for processor in &self.stream_processors {
            processor.validate()?;
        }
        Ok(())
    }
}

/// An external binary that decodes one media type into another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProcessorConfig {
    /// Identifier used in logs and errors
    pub id: String,

    /// Media types this processor accepts as input
    pub accepts: Vec<String>,

    /// Media type of the stream the processor writes to stdout
    pub returns: String,

    /// Path to the processor binary
    pub path: PathBuf,

    /// Extra arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl StreamProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(DiffError::ConfigError(
                "stream processor id must not be empty".to_string(),
            ));
        }
        if self.accepts.is_empty() {
            return Err(DiffError::ConfigError(format!(
                "stream processor '{}' accepts no media types",
                self.id
            )));
        }
        if self.returns.is_empty() {
            return Err(DiffError::ConfigError(format!(
                "stream processor '{}' has no return media type",
                self.id
            )));
        }
        if self.path.as_os_str().is_empty() {
            return Err(DiffError::ConfigError(format!(
                "stream processor '{}' has no path",
                self.id
            )));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Opaque side-channel configuration handed to a stream processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorPayload {
    /// Identifies how `value` is encoded
    pub type_url: String,

    /// Encoded payload
    pub value: Vec<u8>,
}

impl ProcessorPayload {
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }
}

/// Payload hints keyed by the media type they apply to.
pub type ProcessorPayloads = HashMap<String, ProcessorPayload>;

/// Parameters for the built-in decompressors, carried as a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressOptions {
    /// Largest zstd window (as a power of two) the decoder accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zstd_window_log_max: Option<u32>,

    /// Decode every gzip member instead of stopping after the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip_multi_member: Option<bool>,
}

impl DecompressOptions {
    /// Type URL identifying a JSON-encoded `DecompressOptions` payload.
    pub const TYPE_URL: &'static str = "a3s.diff.decompress.v1";

    pub fn to_payload(&self) -> Result<ProcessorPayload> {
        Ok(ProcessorPayload::new(Self::TYPE_URL, serde_json::to_vec(self)?))
    }

    /// Decode a payload, or `None` if it is of another type.
    pub fn from_payload(payload: &ProcessorPayload) -> Result<Option<Self>> {
        if payload.type_url != Self::TYPE_URL {
            return Ok(None);
        }
        serde_json::from_slice(&payload.value)
            .map(Some)
            .map_err(|e| DiffError::InvalidConfig(format!("malformed decompress payload: {}", e)))
    }
}

/// Per-call apply configuration.
///
/// Built by [`ApplyConfig::from_opts`] and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ApplyConfig {
    /// Payload hints for stream processors, by media type
    pub processor_payloads: ProcessorPayloads,
}

/// An option applied to an [`ApplyConfig`] before an apply starts.
pub type ApplyOpt = Box<dyn FnOnce(&Descriptor, &mut ApplyConfig) -> Result<()> + Send>;

impl ApplyConfig {
    /// Apply each option in order, then validate the result.
    pub fn from_opts(desc: &Descriptor, opts: Vec<ApplyOpt>) -> Result<Self> {
        let mut config = Self::default();
        for opt in opts {
            opt(desc, &mut config).map_err(|e| match e {
                DiffError::InvalidConfig(_) => e,
                other => DiffError::InvalidConfig(format!("failed to apply config opt: {}", other)),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (media_type, payload) in &self.processor_payloads {
            if media_type.is_empty() {
                return Err(DiffError::InvalidConfig(
                    "processor payload registered for an empty media type".to_string(),
                ));
            }
            if payload.type_url.is_empty() {
                return Err(DiffError::InvalidConfig(format!(
                    "processor payload for {} has no type url",
                    media_type
                )));
            }
            DecompressOptions::from_payload(payload)?;
        }
        Ok(())
    }
}

/// Merge `payloads` into the configuration; later options win per media type.
pub fn with_processor_payloads(payloads: ProcessorPayloads) -> ApplyOpt {
    Box::new(move |_desc, config| {
        config.processor_payloads.extend(payloads);
        Ok(())
    })
}

/// Set the payload for a single media type.
pub fn with_processor_payload(
    media_type: impl Into<String>,
    payload: ProcessorPayload,
) -> ApplyOpt {
    let media_type = media_type.into();
    Box::new(move |_desc, config| {
        config.processor_payloads.insert(media_type, payload);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::media_types;
    use crate::digest::{Algorithm, Digest};

    fn desc() -> Descriptor {
        Descriptor::new(
            media_types::IMAGE_LAYER_GZIP,
            Digest::from_bytes(Algorithm::Sha256, b"x"),
            1,
        )
    }

    #[test]
    fn test_diff_config_default() {
        let config = DiffConfig::default();
        assert_eq!(config.max_chain_depth, DEFAULT_MAX_CHAIN_DEPTH);
        assert!(config.stream_processors.is_empty());
        assert!(config.content_dir.ends_with("diff/content"));
        config.validate().unwrap();
    }

    #[test]
    fn test_diff_config_load_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
content_dir: /var/lib/a3s/content
max_chain_depth: 4
log_level: debug
stream_processors:
  - id: decrypt
    accepts: ["application/vnd.oci.image.layer.v1.tar+gzip+encrypted"]
    returns: "application/vnd.oci.image.layer.v1.tar+gzip"
    path: /usr/local/bin/ctd-decoder
    args: ["--decryption-keys-path", "/keys"]
"#,
        )
        .unwrap();

        let config = DiffConfig::load(&path).unwrap();
        assert_eq!(config.content_dir, PathBuf::from("/var/lib/a3s/content"));
        assert_eq!(config.max_chain_depth, 4);
        assert!(matches!(config.log_level, LogLevel::Debug));
        assert_eq!(config.stream_processors.len(), 1);
        assert_eq!(config.stream_processors[0].args.len(), 2);
    }

    #[test]
    fn test_diff_config_load_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_chain_depth": 2}"#).unwrap();

        let config = DiffConfig::load(&path).unwrap();
        assert_eq!(config.max_chain_depth, 2);
    }

    #[test]
    fn test_diff_config_rejects_zero_depth() {
        let config = DiffConfig {
            max_chain_depth: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DiffError::ConfigError(_))));
    }

    #[test]
    fn test_stream_processor_requires_accepts() {
        let processor = StreamProcessorConfig {
            id: "p".to_string(),
            accepts: vec![],
            returns: media_types::IMAGE_LAYER.to_string(),
            path: PathBuf::from("/bin/cat"),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(processor.validate().is_err());
    }

    #[test]
    fn test_apply_config_later_options_override() {
        let first = ProcessorPayload::new("example.v1", b"one".to_vec());
        let second = ProcessorPayload::new("example.v1", b"two".to_vec());

        let config = ApplyConfig::from_opts(
            &desc(),
            vec![
                with_processor_payload(media_types::IMAGE_LAYER_GZIP, first),
                with_processor_payload(media_types::IMAGE_LAYER_GZIP, second.clone()),
            ],
        )
        .unwrap();

        assert_eq!(
            config.processor_payloads.get(media_types::IMAGE_LAYER_GZIP),
            Some(&second)
        );
    }

    #[test]
    fn test_apply_config_failing_option_is_invalid_config() {
        let failing: ApplyOpt = Box::new(|_, _| Err(DiffError::Other("boom".to_string())));
        let err = ApplyConfig::from_opts(&desc(), vec![failing]).unwrap_err();
        assert!(matches!(err, DiffError::InvalidConfig(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_apply_config_rejects_empty_type_url() {
        let opt = with_processor_payload("x", ProcessorPayload::new("", vec![]));
        assert!(ApplyConfig::from_opts(&desc(), vec![opt]).is_err());
    }

    #[test]
    fn test_apply_config_rejects_malformed_decompress_payload() {
        let bad = ProcessorPayload::new(DecompressOptions::TYPE_URL, b"{not json".to_vec());
        let opt = with_processor_payload(media_types::IMAGE_LAYER_ZSTD, bad);
        let err = ApplyConfig::from_opts(&desc(), vec![opt]).unwrap_err();
        assert!(err.to_string().contains("malformed decompress payload"));
    }

    #[test]
    fn test_decompress_options_payload_roundtrip() {
        let options = DecompressOptions {
            zstd_window_log_max: Some(31),
            gzip_multi_member: None,
        };
        let payload = options.to_payload().unwrap();
        assert_eq!(
            DecompressOptions::from_payload(&payload).unwrap(),
            Some(options)
        );

        let other = ProcessorPayload::new("other.v1", vec![1, 2, 3]);
        assert_eq!(DecompressOptions::from_payload(&other).unwrap(), None);
    }
}
