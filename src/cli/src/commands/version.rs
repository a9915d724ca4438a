//! `a3s-diff version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-diff version {}", a3s_diff_core::VERSION);
    Ok(())
}
