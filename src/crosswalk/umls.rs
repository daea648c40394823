//! UTS REST client implementing both crosswalk hops.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use urlencoding::encode;

use super::{Lookup, Terminology};
use crate::{
    config::Settings,
    http::{self, RetryPolicy},
};

const ICD10CM: &str = "ICD10CM";
/// Sentinel the search endpoint returns instead of an empty list.
const NO_RESULTS_UI: &str = "NONE";

pub struct UmlsClient {
    client: Client,
    base_url: String,
    release: String,
    api_key: String,
    retry: RetryPolicy,
}

impl UmlsClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        release: impl Into<String>,
        api_key: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            release: release.into(),
            api_key: api_key.into(),
            retry,
        }
    }

    /// Client configured from settings; fails when no API key is set.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_umls_key()?.to_string();
        let client = http::build_client(settings)?;
        Ok(Self::new(
            client,
            settings.umls_base_url.clone(),
            settings.umls_release.clone(),
            api_key,
            settings.retry_policy(),
        ))
    }

    fn concepts_url(&self, mesh_id: &str) -> String {
        format!(
            "{base}/search/{release}?string={mesh}&inputType=sourceUi&searchType=exact&sabs=MSH&returnIdType=concept&apiKey={key}",
            base = self.base_url,
            release = self.release,
            mesh = encode(mesh_id),
            key = encode(&self.api_key),
        )
    }

    fn atoms_url(&self, concept_id: &str) -> String {
        format!(
            "{base}/content/{release}/CUI/{cui}/atoms?sabs={sab}&pageSize=200&apiKey={key}",
            base = self.base_url,
            release = self.release,
            cui = encode(concept_id),
            sab = ICD10CM,
            key = encode(&self.api_key),
        )
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Lookup<T> {
        let body = match http::get_text(&self.client, url, &self.retry).await {
            Ok(body) => body,
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => return Lookup::NotFound,
            Err(err) => return Lookup::Failed(err.to_string()),
        };
        match serde_json::from_str(&body) {
            Ok(value) => Lookup::Found(value),
            Err(err) => Lookup::Failed(format!("unexpected payload from {}: {err}", http::redact(url))),
        }
    }
}

impl Terminology for UmlsClient {
    async fn concepts(&self, mesh_id: &str) -> Lookup<Vec<String>> {
        let url = self.concepts_url(mesh_id);
        match self.get_json::<SearchResponse>(&url).await {
            Lookup::Found(payload) => {
                let concepts = payload.concept_ids();
                debug!(%mesh_id, ?concepts, "search answered");
                if concepts.is_empty() {
                    Lookup::NotFound
                } else {
                    Lookup::Found(concepts)
                }
            }
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(reason) => Lookup::Failed(reason),
        }
    }

    async fn icd10cm_codes(&self, concept_id: &str) -> Lookup<Vec<String>> {
        let url = self.atoms_url(concept_id);
        match self.get_json::<AtomsResponse>(&url).await {
            Lookup::Found(payload) => Lookup::Found(payload.icd10cm_codes()),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(reason) => Lookup::Failed(reason),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    ui: String,
}

impl SearchResponse {
    fn concept_ids(self) -> Vec<String> {
        self.result
            .results
            .into_iter()
            .map(|hit| hit.ui)
            .filter(|ui| !ui.is_empty() && ui != NO_RESULTS_UI)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct AtomsResponse {
    #[serde(default)]
    result: Vec<Atom>,
}

#[derive(Debug, Deserialize)]
struct Atom {
    code: String,
    #[serde(rename = "rootSource", alias = "sourceSystem")]
    root_source: String,
}

impl AtomsResponse {
    fn icd10cm_codes(self) -> Vec<String> {
        self.result
            .into_iter()
            .filter(|atom| atom.root_source == ICD10CM)
            .filter_map(|atom| atom.code.rsplit('/').next().map(str::to_string))
            .filter(|code| !code.is_empty())
            .collect()
    }
}
