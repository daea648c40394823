//! Runtime configuration utilities for mesh2icd.

use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::http::RetryPolicy;

const DEFAULT_UMLS_BASE: &str = "https://uts-ws.nlm.nih.gov/rest";

/// When the crosswalk cache is written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// Rewrite the file after every new entry.
    Every,
    /// Rewrite the file once, after the batch completes.
    End,
}

impl FromStr for PersistMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every" => Ok(Self::Every),
            "end" => Ok(Self::End),
            other => Err(anyhow!("unknown CACHE_PERSIST value {other:?}")),
        }
    }
}

/// Application configuration resolved from `.env` and defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// UTS API key, required by every command touching the terminology service.
    pub umls_api_key: Option<String>,
    /// Base URL of the UTS REST API.
    pub umls_base_url: String,
    /// UMLS release segment used in request paths.
    pub umls_release: String,
    /// Optional NCBI key raising the E-utilities quota.
    pub ncbi_api_key: Option<String>,
    /// Contact email for PubMed E-utilities courtesy policy.
    pub pubmed_email: String,
    /// Tool name sent with PubMed requests.
    pub pubmed_tool: String,
    /// Root folder for cached data artefacts.
    pub data_dir: PathBuf,
    /// MeSH to ICD-10-CM cache file.
    pub crosswalk_cache: PathBuf,
    /// PMID to MeSH headings cache file.
    pub pubmed_cache: PathBuf,
    /// Ceiling on concurrent resolutions.
    pub workers: usize,
    /// Per-request timeout.
    pub http_timeout: Duration,
    /// Completions between two cooperative pauses.
    pub pace_every: usize,
    /// Length of each cooperative pause.
    pub pace_pause: Duration,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    pub persist: PersistMode,
    /// Cache failed lookups as empty entries, like the historical scripts did.
    pub cache_transient_failures: bool,
}

impl Settings {
    /// Load configuration from environment with reasonable defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        std::fs::create_dir_all(&data_dir).context("creating data dir")?;

        let crosswalk_cache = env::var("CROSSWALK_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dictionaries/umls_mesh2icd_cache.json"));
        let pubmed_cache = env::var("PUBMED_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("dictionaries/pubmed_mesh_cache.json"));
        let persist = match env::var("CACHE_PERSIST") {
            Ok(raw) => raw.parse()?,
            Err(_) => PersistMode::Every,
        };

        Ok(Self {
            umls_api_key: non_empty_var("UMLS_API_KEY"),
            umls_base_url: env::var("UMLS_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_UMLS_BASE.to_string()),
            umls_release: env::var("UMLS_RELEASE").unwrap_or_else(|_| "current".to_string()),
            ncbi_api_key: non_empty_var("NCBI_API_KEY"),
            pubmed_email: env::var("PUBMED_EMAIL")
                .unwrap_or_else(|_| "research@example.com".to_string()),
            pubmed_tool: env::var("PUBMED_TOOL").unwrap_or_else(|_| "mesh2icd".to_string()),
            data_dir,
            crosswalk_cache,
            pubmed_cache,
            workers: parsed_var("CROSSWALK_WORKERS", 8usize).max(1),
            http_timeout: Duration::from_secs(parsed_var("HTTP_TIMEOUT_SECS", 25)),
            pace_every: parsed_var("PACE_EVERY", 100),
            pace_pause: Duration::from_millis(parsed_var("PACE_MILLIS", 1000)),
            retry_max_attempts: parsed_var("RETRY_MAX_ATTEMPTS", 3),
            retry_backoff: Duration::from_millis(parsed_var("RETRY_BACKOFF_MS", 1500)),
            persist,
            cache_transient_failures: parsed_var("CACHE_TRANSIENT_FAILURES", false),
        })
    }

    /// The UTS key, or an error explaining how to provide one.
    pub fn require_umls_key(&self) -> anyhow::Result<&str> {
        self.umls_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("UMLS_API_KEY is missing (set it in .env or the environment)"))
    }

    /// Transport retry policy shared by every outgoing request.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            backoff: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }

    /// Convenience helper for derived path segments.
    pub fn join_data<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.data_dir.join(path)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
