//! CLI entry-point for building the MeSH dictionary files.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::{config::Settings, data::mesh_dict};

/// Args for the `mesh-dict` sub-command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// MeSH descriptor XML (desc20xx.xml).
    #[arg(long)]
    pub xml: PathBuf,
    /// Output directory; defaults to DATA_DIR/dictionaries.
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let out_dir = args
        .out_dir
        .unwrap_or_else(|| settings.join_data("dictionaries"));
    let dict = mesh_dict::parse_descriptor_file(&args.xml)?;
    mesh_dict::write_outputs(&dict, &out_dir)?;
    Ok(())
}
