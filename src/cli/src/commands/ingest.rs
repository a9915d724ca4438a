//! `a3s-diff ingest` command.

use std::fs::File;
use std::path::PathBuf;

use a3s_diff_core::DiffConfig;
use clap::Args;

#[derive(Args)]
pub struct IngestArgs {
    /// Layer blob to add to the content store
    pub file: PathBuf,

    /// Media type of the blob (e.g., "application/vnd.oci.image.layer.v1.tar+gzip")
    #[arg(long)]
    pub media_type: String,
}

pub async fn execute(
    args: IngestArgs,
    config: &DiffConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::open_store(config)?;
    let file = File::open(&args.file)
        .map_err(|e| format!("Failed to open {}: {}", args.file.display(), e))?;

    let desc = store.ingest(&args.media_type, file)?;
    println!("{}", serde_json::to_string_pretty(&desc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::try_parse_from([
            "a3s-diff",
            "ingest",
            "layer.tar.gz",
            "--media-type",
            "application/vnd.oci.image.layer.v1.tar+gzip",
        ])
        .unwrap();

        let Command::Ingest(args) = cli.command else {
            panic!("Expected ingest command");
        };
        assert_eq!(args.file.to_str(), Some("layer.tar.gz"));
        assert_eq!(args.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");
    }

    #[test]
    fn test_ingest_requires_media_type() {
        assert!(Cli::try_parse_from(["a3s-diff", "ingest", "layer.tar"]).is_err());
    }
}
