//! `a3s-diff apply` command.

use std::path::PathBuf;
use std::sync::Arc;

use a3s_diff_core::{
    with_processor_payload, ApplyOpt, Descriptor, Digest, DiffConfig, Mount, MountSpec,
    ProcessorPayload,
};
use a3s_diff_runtime::{Applier, FsApplier, SystemMounter};
use clap::Args;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct ApplyArgs {
    /// Digest of the stored layer blob (e.g., "sha256:...")
    #[arg(long)]
    pub digest: Digest,

    /// Media type of the stored layer blob
    #[arg(long)]
    pub media_type: String,

    /// Blob size in bytes [default: size of the stored blob]
    #[arg(long)]
    pub size: Option<u64>,

    /// Mount to apply onto, as type=bind,source=/path[,target=sub][,options=a,b] (repeatable;
    /// options must come last)
    #[arg(long = "mount", required = true)]
    pub mounts: Vec<Mount>,

    /// Processor payload, as <media-type>=<type-url>:<file> (repeatable)
    #[arg(long = "payload", value_parser = parse_payload)]
    pub payloads: Vec<PayloadArg>,
}

/// A `--payload` argument whose file has not been read yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadArg {
    pub media_type: String,
    pub type_url: String,
    pub path: PathBuf,
}

fn parse_payload(s: &str) -> Result<PayloadArg, String> {
    let (media_type, rest) = s.split_once('=').ok_or_else(|| {
        format!(
            "invalid payload '{}' (expected <media-type>=<type-url>:<file>)",
            s
        )
    })?;
    let (type_url, path) = rest
        .split_once(':')
        .ok_or_else(|| format!("invalid payload '{}' (missing :<file>)", s))?;
    if media_type.is_empty() || type_url.is_empty() || path.is_empty() {
        return Err(format!("invalid payload '{}' (empty field)", s));
    }
    Ok(PayloadArg {
        media_type: media_type.to_string(),
        type_url: type_url.to_string(),
        path: PathBuf::from(path),
    })
}

pub async fn execute(
    args: ApplyArgs,
    config: &DiffConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(super::open_store(config)?);

    let size = match args.size {
        Some(size) => size,
        None => std::fs::metadata(store.blob_path(&args.digest))
            .map(|m| m.len())
            .unwrap_or(0),
    };
    let desc = Descriptor::new(&args.media_type, args.digest, size);

    let mut opts: Vec<ApplyOpt> = Vec::new();
    for payload in args.payloads {
        let value = std::fs::read(&payload.path)
            .map_err(|e| format!("Failed to read payload {}: {}", payload.path.display(), e))?;
        opts.push(with_processor_payload(
            payload.media_type,
            ProcessorPayload::new(payload.type_url, value),
        ));
    }

    let applier = FsApplier::from_config(config, store, Arc::new(SystemMounter));
    let mounts = MountSpec::new(args.mounts);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling apply");
                cancel.cancel();
            }
        })
    };

    let result = applier.apply(&desc, &mounts, opts, &cancel).await;
    interrupt.abort();

    let applied = result?;
    println!("{}", serde_json::to_string_pretty(&applied)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{Cli, Command};
    use super::*;
    use clap::Parser;

    const DIGEST: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "a3s-diff",
            "apply",
            "--digest",
            DIGEST,
            "--media-type",
            "application/vnd.oci.image.layer.v1.tar+gzip",
            "--mount",
            "type=bind,source=/snapshots/1/fs,options=rbind,rw",
            "--mount",
            "type=overlay,source=overlay,options=lowerdir=/l2:/l1,upperdir=/u,workdir=/w",
            "--mount",
            "type=tmpfs,source=tmpfs,target=tmp",
            "--payload",
            "application/vnd.oci.image.layer.v1.tar+gzip=a3s.diff.decompress.v1:/etc/opts.json",
        ])
        .unwrap();

        let Command::Apply(args) = cli.command else {
            panic!("Expected apply command");
        };
        assert_eq!(args.digest.to_string(), DIGEST);
        assert_eq!(args.size, None);
        assert_eq!(args.mounts.len(), 3);
        assert_eq!(args.mounts[0].options, vec!["rbind", "rw"]);
        assert_eq!(args.mounts[1].options[0], "lowerdir=/l2:/l1");
        assert_eq!(args.mounts[2].target.as_deref(), Some("tmp"));
        assert_eq!(
            args.payloads,
            vec![PayloadArg {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                type_url: "a3s.diff.decompress.v1".to_string(),
                path: PathBuf::from("/etc/opts.json"),
            }]
        );
    }

    #[test]
    fn test_apply_requires_mount() {
        let result = Cli::try_parse_from([
            "a3s-diff",
            "apply",
            "--digest",
            DIGEST,
            "--media-type",
            "application/vnd.oci.image.layer.v1.tar",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_rejects_bad_digest() {
        let result = Cli::try_parse_from([
            "a3s-diff",
            "apply",
            "--digest",
            "sha256:nothex",
            "--media-type",
            "application/vnd.oci.image.layer.v1.tar",
            "--mount",
            "type=bind,source=/x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_payload_errors() {
        assert!(parse_payload("no-equals").is_err());
        assert!(parse_payload("mt=no-colon").is_err());
        assert!(parse_payload("mt=:file").is_err());
    }
}
