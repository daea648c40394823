//! PubMed MeSH heading lookup through E-utilities, memoised per PMID.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use quick_xml::de::from_str;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    config::Settings,
    http::{self, RetryPolicy},
};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
/// PMIDs per `efetch` call.
pub const CHUNK_SIZE: usize = 100;

/// Fetches descriptor UIs for PubMed articles and keeps a JSON memo of them.
pub struct PubmedMesh {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    tool: String,
    email: String,
    retry: RetryPolicy,
    cache_path: PathBuf,
    cache: BTreeMap<String, Vec<String>>,
}

impl PubmedMesh {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let cache = load_cache(&settings.pubmed_cache)?;
        Ok(Self {
            client: http::build_client(settings)?,
            base_url: EUTILS_BASE.to_string(),
            api_key: settings.ncbi_api_key.clone(),
            tool: settings.pubmed_tool.clone(),
            email: settings.pubmed_email.clone(),
            retry: settings.retry_policy(),
            cache_path: settings.pubmed_cache.clone(),
            cache,
        })
    }

    /// Point requests at another E-utilities host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Pause between chunks; NCBI allows more requests with an API key.
    fn pause(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(340)
        } else {
            Duration::from_millis(400)
        }
    }

    /// MeSH descriptor UIs for every PMID, sorted and deduplicated.
    ///
    /// PMIDs missing from the answer (retracted, embargoed) map to an empty
    /// list. A chunk that still fails after retries maps to empty lists and
    /// is left out of the memo so the next run asks again.
    pub async fn fetch_mesh_headings(
        &mut self,
        pmids: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let wanted: BTreeSet<String> = pmids
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let missing: Vec<String> = wanted
            .iter()
            .filter(|p| !self.cache.contains_key(*p))
            .cloned()
            .collect();
        info!(
            requested = wanted.len(),
            to_fetch = missing.len(),
            "fetching pubmed mesh headings"
        );

        let mut fetched_any = false;
        for (idx, chunk) in missing.chunks(CHUNK_SIZE).enumerate() {
            if idx > 0 {
                sleep(self.pause()).await;
            }
            match self.fetch_chunk(chunk).await {
                Ok(headings) => {
                    for pmid in chunk {
                        let mesh = headings.get(pmid).cloned().unwrap_or_default();
                        self.cache.insert(pmid.clone(), mesh);
                    }
                    fetched_any = true;
                }
                Err(err) => warn!(%err, size = chunk.len(), "efetch chunk failed"),
            }
        }
        if fetched_any {
            save_cache(&self.cache_path, &self.cache)?;
        }

        Ok(wanted
            .into_iter()
            .map(|pmid| {
                let mesh = self.cache.get(&pmid).cloned().unwrap_or_default();
                (pmid, mesh)
            })
            .collect())
    }

    async fn fetch_chunk(&self, pmids: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut url = format!(
            "{base}/efetch.fcgi?db=pubmed&retmode=xml&id={ids}&tool={tool}&email={email}",
            base = self.base_url,
            ids = pmids.join(","),
            tool = urlencoding::encode(&self.tool),
            email = urlencoding::encode(&self.email),
        );
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&api_key={}", urlencoding::encode(key)));
        }
        let xml = http::get_text(&self.client, &url, &self.retry).await?;
        parse_mesh_headings(&xml)
    }
}

/// Map each article's PMID to its sorted, deduplicated descriptor UIs.
pub fn parse_mesh_headings(xml: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let set: PubmedArticleSet = from_str(xml).context("parsing efetch xml")?;
    Ok(set
        .articles
        .into_iter()
        .map(|article| {
            let citation = article.citation;
            let uis: BTreeSet<String> = citation
                .mesh_headings
                .map(|list| list.headings)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|h| h.descriptor.ui)
                .map(|ui| ui.trim().to_string())
                .filter(|ui| !ui.is_empty())
                .collect();
            (citation.pmid.value.trim().to_string(), uis.into_iter().collect())
        })
        .collect())
}

fn load_cache(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    let cache: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&text).with_context(|| format!("parse {path:?}"))?;
    info!(path = %path.display(), entries = cache.len(), "loaded pubmed cache");
    Ok(cache)
}

fn save_cache(path: &Path, cache: &BTreeMap<String, Vec<String>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(cache)?).with_context(|| format!("write {path:?}"))?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PubmedArticleSet {
    #[serde(rename = "PubmedArticle", default)]
    articles: Vec<PubmedArticle>,
}

#[derive(Debug, Deserialize)]
struct PubmedArticle {
    #[serde(rename = "MedlineCitation")]
    citation: MedlineCitation,
}

#[derive(Debug, Deserialize)]
struct MedlineCitation {
    #[serde(rename = "PMID")]
    pmid: TextNode,
    #[serde(rename = "MeshHeadingList")]
    mesh_headings: Option<MeshHeadingList>,
}

#[derive(Debug, Deserialize)]
struct MeshHeadingList {
    #[serde(rename = "MeshHeading", default)]
    headings: Vec<MeshHeading>,
}

#[derive(Debug, Deserialize)]
struct MeshHeading {
    #[serde(rename = "DescriptorName")]
    descriptor: DescriptorName,
}

#[derive(Debug, Deserialize)]
struct DescriptorName {
    #[serde(rename = "@UI")]
    ui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text")]
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">31234567</PMID>
      <Article><ArticleTitle>Hypertensive crisis</ArticleTitle></Article>
      <MeshHeadingList>
        <MeshHeading>
          <DescriptorName UI="D006973" MajorTopicYN="Y">Hypertension</DescriptorName>
          <QualifierName UI="Q000188" MajorTopicYN="N">drug therapy</QualifierName>
        </MeshHeading>
        <MeshHeading>
          <DescriptorName UI="D006801" MajorTopicYN="N">Humans</DescriptorName>
        </MeshHeading>
        <MeshHeading>
          <DescriptorName UI="D006973" MajorTopicYN="N">Hypertension</DescriptorName>
        </MeshHeading>
      </MeshHeadingList>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation Status="In-Data-Review" Owner="NLM">
      <PMID Version="1">39999999</PMID>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn descriptor_uis_are_sorted_and_unique() {
        let parsed = parse_mesh_headings(SAMPLE).unwrap();
        assert_eq!(parsed["31234567"], vec!["D006801", "D006973"]);
        assert!(parsed["39999999"].is_empty());
    }

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubmed.json");
        assert!(load_cache(&path).unwrap().is_empty());

        let mut cache = BTreeMap::new();
        cache.insert("1".to_string(), vec!["D1".to_string()]);
        save_cache(&path, &cache).unwrap();
        assert_eq!(load_cache(&path).unwrap(), cache);
    }
}
