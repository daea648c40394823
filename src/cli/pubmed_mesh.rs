//! CLI entry-point for joining PubMed MeSH headings onto records.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use crate::{
    config::Settings,
    data::{pubmed::PubmedMesh, records},
};

/// Args for the `pubmed-mesh` sub-command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// Input records (JSON Lines) carrying an `article_id` PMID.
    #[arg(long)]
    pub input: PathBuf,
    /// Output records with the `pubmed_mesh` column.
    #[arg(long)]
    pub output: PathBuf,
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let mut rows = records::read_jsonl(&args.input)?;
    let pmids: Vec<String> = rows.iter().filter_map(records::article_id).collect();

    let mut pubmed = PubmedMesh::from_settings(&settings)?;
    let headings = pubmed.fetch_mesh_headings(&pmids).await?;
    for row in rows.iter_mut() {
        records::attach_pubmed_mesh(row, &headings);
    }
    records::write_jsonl(&args.output, &rows)?;
    info!(rows = rows.len(), pmids = headings.len(), "pubmed mesh attached");
    Ok(())
}
