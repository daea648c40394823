//! Command-line interface wiring for mesh2icd.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Settings;

pub mod crosswalk;
pub mod mesh_dict;
pub mod pubmed_mesh;
pub mod resolve;

/// Top-level CLI definition.
#[derive(Debug, Parser)]
#[command(author, version, about = "MeSH to ICD-10-CM crosswalk for clinical cases", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Parse CLI arguments from the environment.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Dispatch the selected sub-command.
    pub async fn dispatch(self, settings: Settings) -> Result<()> {
        match self.command {
            Commands::Resolve(args) => resolve::run(args, settings).await,
            Commands::Crosswalk(args) => crosswalk::run(args, settings).await,
            Commands::PubmedMesh(args) => pubmed_mesh::run(args, settings).await,
            Commands::MeshDict(args) => mesh_dict::run(args, settings).await,
        }
    }
}

/// Supported sub-commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve MeSH ids to ICD-10-CM codes and print them as JSON.
    Resolve(resolve::Args),
    /// Add mesh_clean, icd10_codes and icd10_trace columns to a JSONL dataset.
    Crosswalk(crosswalk::Args),
    /// Add the pubmed_mesh column from PubMed MeSH headings.
    PubmedMesh(pubmed_mesh::Args),
    /// Build the MeSH term dictionary and check-tag list from descriptor XML.
    MeshDict(mesh_dict::Args),
}
