//! CLI command definitions and dispatch.

mod apply;
mod ingest;
mod token;
mod version;

use std::path::{Path, PathBuf};

use a3s_diff_core::DiffConfig;
use a3s_diff_runtime::LocalStore;
use clap::{Parser, Subcommand};

/// A3S Diff - apply container image layer diffs onto mounts.
#[derive(Parser)]
#[command(name = "a3s-diff", version, about)]
pub struct Cli {
    /// Configuration file (YAML or JSON) [default: ~/.a3s/diff/config.yaml]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Add a layer blob to the local content store
    Ingest(ingest::IngestArgs),
    /// Apply a stored layer blob onto a mount
    Apply(apply::ApplyArgs),
    /// Fetch a registry bearer token
    Token(token::TokenArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Return the default configuration path (~/.a3s/diff/config.yaml).
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("diff")
        .join("config.yaml")
}

/// Load `path`, or the default configuration file if it exists.
pub fn load_config(path: Option<&Path>) -> Result<DiffConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return Ok(DiffConfig::load(path)?);
    }
    let default = default_config_path();
    if default.is_file() {
        Ok(DiffConfig::load(&default)?)
    } else {
        Ok(DiffConfig::default())
    }
}

/// Open the content store named by the configuration.
pub(crate) fn open_store(config: &DiffConfig) -> Result<LocalStore, Box<dyn std::error::Error>> {
    Ok(LocalStore::new(&config.content_dir)?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: DiffConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Ingest(args) => ingest::execute(args, &config).await,
        Command::Apply(args) => apply::execute(args, &config).await,
        Command::Token(args) => token::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "a3s-diff",
            "version",
            "--debug",
            "--config",
            "/etc/diff.yaml",
        ])
        .unwrap();

        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/diff.yaml")));
        assert!(matches!(cli.command, Command::Version(_)));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["a3s-diff"]).is_err());
    }

    #[test]
    fn test_load_explicit_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("diff.yaml");
        std::fs::write(
            &path,
            "content_dir: /var/lib/a3s/content\nmax_chain_depth: 4\nlog_level: debug\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.content_dir, PathBuf::from("/var/lib/a3s/content"));
        assert_eq!(config.max_chain_depth, 4);
    }

    #[test]
    fn test_load_missing_explicit_config_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(load_config(Some(&tmp.path().join("absent.yaml"))).is_err());
    }
}
