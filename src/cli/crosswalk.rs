//! CLI entry-point for enriching a dataset with ICD-10-CM codes.

use std::{collections::BTreeSet, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{info, instrument, warn};

use crate::{
    config::Settings,
    crosswalk::{Resolver, ResolverOptions, UmlsClient},
    data::{mesh_dict, records},
};

/// Args for the `crosswalk` sub-command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// Input records (JSON Lines).
    #[arg(long)]
    pub input: PathBuf,
    /// Enriched output records (JSON Lines).
    #[arg(long)]
    pub output: PathBuf,
    /// Check-tag list to drop from mesh_clean; defaults to the one in DATA_DIR when present.
    #[arg(long)]
    pub checktags: Option<PathBuf>,
    /// Also write a Parquet summary of the crosswalk cache.
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let umls = UmlsClient::from_settings(&settings)?;
    let check_tags = load_check_tags(args.checktags, &settings)?;

    let mut rows = records::read_jsonl(&args.input)?;
    for row in rows.iter_mut() {
        records::ensure_mesh_from_gliner(row);
    }
    let wanted: BTreeSet<String> = rows
        .iter()
        .flat_map(|row| records::mesh_clean(row, &check_tags))
        .collect();

    let resolver = Resolver::open(umls, ResolverOptions::from_settings(&settings))
        .context("opening crosswalk cache")?;
    let report = resolver.resolve_batch(&wanted).await?;
    let cache = resolver.snapshot().await;

    for row in rows.iter_mut() {
        records::apply_crosswalk(row, &check_tags, &report.codes, &cache)?;
    }
    records::write_jsonl(&args.output, &rows)?;

    let with_codes = rows
        .iter()
        .filter(|row| !records::string_list(row, records::ICD10_CODES).is_empty())
        .count();
    info!(rows = rows.len(), with_codes, summary = ?report.summary, "crosswalk complete");

    if let Some(path) = args.summary {
        records::write_cache_summary(&cache, &path)?;
    }
    Ok(())
}

fn load_check_tags(explicit: Option<PathBuf>, settings: &Settings) -> Result<BTreeSet<String>> {
    if let Some(path) = explicit {
        return mesh_dict::load_check_tags(&path);
    }
    let default = settings.join_data("dictionaries/mesh_checktags.json");
    if default.exists() {
        mesh_dict::load_check_tags(&default)
    } else {
        warn!(path = %default.display(), "no check-tag list; keeping every MeSH id");
        Ok(BTreeSet::new())
    }
}
