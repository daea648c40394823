//! CLI entry-point for ad-hoc MeSH id resolution.

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use crate::{
    config::Settings,
    crosswalk::{Resolver, ResolverOptions, UmlsClient},
};

/// Args for the `resolve` sub-command.
#[derive(Debug, Clone, ClapArgs)]
pub struct Args {
    /// MeSH descriptor ids (e.g. D006973).
    #[arg(required = true)]
    pub mesh_ids: Vec<String>,
}

#[instrument(skip(settings))]
pub async fn run(args: Args, settings: Settings) -> Result<()> {
    let umls = UmlsClient::from_settings(&settings)?;
    let resolver = Resolver::open(umls, ResolverOptions::from_settings(&settings))?;
    let codes = resolver.resolve_many(&args.mesh_ids).await?;
    println!("{}", serde_json::to_string_pretty(&codes)?);
    Ok(())
}
