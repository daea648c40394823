//! Cache-first resolution of MeSH identifiers to ICD-10-CM codes.

use std::{collections::BTreeMap, path::PathBuf, pin::pin, time::Duration};

use futures::stream::{self, StreamExt};
use indexmap::IndexSet;
use tokio::{sync::RwLock, time::sleep};
use tracing::{debug, info, instrument, warn};

use super::{
    cache::{sorted_unique, CacheEntry, CacheError, CrosswalkCache},
    Lookup, Terminology,
};
use crate::config::{PersistMode, Settings};

/// Tunables for batch resolution and cache persistence.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Where the cache is written; `None` keeps it in memory only.
    pub cache_path: Option<PathBuf>,
    pub persist: PersistMode,
    /// Ceiling on in-flight resolutions in [`Resolver::resolve_many`].
    pub workers: usize,
    /// Network-backed completions between two pauses (0 disables pacing).
    pub pace_every: usize,
    pub pace_pause: Duration,
    /// Record failed lookups as empty entries instead of retrying them next run.
    pub cache_transient_failures: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            cache_path: None,
            persist: PersistMode::Every,
            workers: 8,
            pace_every: 0,
            pace_pause: Duration::ZERO,
            cache_transient_failures: false,
        }
    }
}

impl ResolverOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cache_path: Some(settings.crosswalk_cache.clone()),
            persist: settings.persist,
            workers: settings.workers,
            pace_every: settings.pace_every,
            pace_pause: settings.pace_pause,
            cache_transient_failures: settings.cache_transient_failures,
        }
    }
}

/// How a single identifier was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Hit(CacheEntry),
    Fetched(CacheEntry),
    /// Confirmed absence of any concept; cached as empty.
    NotFound,
    /// At least one hop failed; holds whatever codes were gathered.
    Failed(CacheEntry),
}

impl Resolution {
    fn into_codes(self) -> Vec<String> {
        match self {
            Self::Hit(entry) | Self::Fetched(entry) | Self::Failed(entry) => entry.codes,
            Self::NotFound => Vec::new(),
        }
    }

    fn touched_network(&self) -> bool {
        !matches!(self, Self::Hit(_))
    }
}

/// Per-batch counters, logged once the batch completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub requested: usize,
    pub unique: usize,
    pub cache_hits: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Hit(_) => self.cache_hits += 1,
            Resolution::Fetched(_) => self.fetched += 1,
            Resolution::NotFound => self.not_found += 1,
            Resolution::Failed(_) => self.failed += 1,
        }
    }
}

/// Resolved codes for a batch, keyed by MeSH id, plus the batch counters.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub codes: BTreeMap<String, Vec<String>>,
    pub summary: BatchSummary,
}

/// Resolves MeSH ids through a [`Terminology`] and memoises the answers.
///
/// The cache sits behind an async `RwLock`: lookups take the read side,
/// inserts and saves the write side, so concurrent workers never interleave
/// two file rewrites.
pub struct Resolver<T> {
    terminology: T,
    cache: RwLock<CrosswalkCache>,
    options: ResolverOptions,
}

impl<T: Terminology> Resolver<T> {
    pub fn new(terminology: T, cache: CrosswalkCache, options: ResolverOptions) -> Self {
        Self {
            terminology,
            cache: RwLock::new(cache),
            options,
        }
    }

    /// Build a resolver whose cache is loaded from `options.cache_path`.
    pub fn open(terminology: T, options: ResolverOptions) -> Result<Self, CacheError> {
        let cache = match &options.cache_path {
            Some(path) => CrosswalkCache::load(path)?,
            None => CrosswalkCache::new(),
        };
        Ok(Self::new(terminology, cache, options))
    }

    /// Sorted ICD-10-CM codes for `mesh_id`.
    ///
    /// Lookup failures degrade to an empty (or partial) answer; only a cache
    /// write failure is returned as an error.
    ///
    /// With [`PersistMode::End`] a new entry stays in memory until
    /// [`Self::flush`] is called; only [`Self::resolve_batch`] flushes on its
    /// own.
    pub async fn resolve(&self, mesh_id: &str) -> Result<Vec<String>, CacheError> {
        let mesh_id = mesh_id.trim();
        if mesh_id.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.resolve_one(mesh_id).await?.into_codes())
    }

    /// Resolve every distinct id in `mesh_ids` across the bounded worker pool.
    pub async fn resolve_many<I, S>(
        &self,
        mesh_ids: I,
    ) -> Result<BTreeMap<String, Vec<String>>, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.resolve_batch(mesh_ids).await?.codes)
    }

    /// Like [`Self::resolve_many`], also returning the batch counters.
    #[instrument(skip_all, fields(workers = self.options.workers))]
    pub async fn resolve_batch<I, S>(&self, mesh_ids: I) -> Result<BatchReport, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = BatchSummary::default();
        let mut unique = IndexSet::new();
        for id in mesh_ids {
            summary.requested += 1;
            let id = id.as_ref().trim();
            if !id.is_empty() {
                unique.insert(id.to_string());
            }
        }
        summary.unique = unique.len();
        info!(requested = summary.requested, unique = summary.unique, "resolving batch");

        let mut codes = BTreeMap::new();
        let mut network_done = 0usize;
        let mut results = pin!(stream::iter(unique)
            .map(|id| async move {
                let outcome = self.resolve_one(&id).await;
                (id, outcome)
            })
            .buffer_unordered(self.options.workers.max(1)));

        while let Some((id, outcome)) = results.next().await {
            let resolution = outcome?;
            summary.record(&resolution);
            if resolution.touched_network() {
                network_done += 1;
                self.pace(network_done).await;
            }
            codes.insert(id, resolution.into_codes());
        }

        if self.options.persist == PersistMode::End {
            self.flush().await?;
        }
        info!(?summary, "batch resolved");
        Ok(BatchReport { codes, summary })
    }

    /// Write the cache to its configured path, if any.
    pub async fn flush(&self) -> Result<(), CacheError> {
        if let Some(path) = &self.options.cache_path {
            let cache = self.cache.write().await;
            cache.save(path)?;
            info!(path = %path.display(), entries = cache.len(), "crosswalk cache written");
        }
        Ok(())
    }

    pub fn terminology(&self) -> &T {
        &self.terminology
    }

    /// Cached entry for `mesh_id`, without touching the network.
    pub async fn cached(&self, mesh_id: &str) -> Option<CacheEntry> {
        self.cache.read().await.get(mesh_id).cloned()
    }

    /// Copy of the whole in-memory cache.
    pub async fn snapshot(&self) -> CrosswalkCache {
        self.cache.read().await.clone()
    }

    async fn pace(&self, network_done: usize) {
        let every = self.options.pace_every;
        if every == 0 || self.options.pace_pause.is_zero() || network_done % every != 0 {
            return;
        }
        info!(
            done = network_done,
            pause_ms = self.options.pace_pause.as_millis() as u64,
            "pausing to respect the service rate limit"
        );
        sleep(self.options.pace_pause).await;
    }

    async fn resolve_one(&self, mesh_id: &str) -> Result<Resolution, CacheError> {
        if let Some(entry) = self.cache.read().await.get(mesh_id) {
            debug!(%mesh_id, codes = entry.codes.len(), "cache hit");
            return Ok(Resolution::Hit(entry.clone()));
        }

        match self.fetch(mesh_id).await {
            Resolution::Fetched(entry) => {
                let stored = self.store(mesh_id, entry).await?;
                Ok(Resolution::Fetched(stored))
            }
            Resolution::NotFound => {
                self.store(mesh_id, CacheEntry::default()).await?;
                Ok(Resolution::NotFound)
            }
            Resolution::Failed(entry) => {
                if self.options.cache_transient_failures {
                    self.store(mesh_id, entry.clone()).await?;
                }
                Ok(Resolution::Failed(entry))
            }
            hit @ Resolution::Hit(_) => Ok(hit),
        }
    }

    async fn fetch(&self, mesh_id: &str) -> Resolution {
        let concepts = match self.terminology.concepts(mesh_id).await {
            Lookup::Found(found) if !found.is_empty() => sorted_unique(found),
            Lookup::Found(_) | Lookup::NotFound => {
                debug!(%mesh_id, "no concept for mesh id");
                return Resolution::NotFound;
            }
            Lookup::Failed(reason) => {
                warn!(%mesh_id, %reason, "concept lookup failed");
                return Resolution::Failed(CacheEntry::default());
            }
        };

        let mut codes = Vec::new();
        let mut failed = false;
        for concept in &concepts {
            match self.terminology.icd10cm_codes(concept).await {
                Lookup::Found(found) => codes.extend(found),
                Lookup::NotFound => debug!(%mesh_id, %concept, "concept has no ICD-10-CM atom"),
                Lookup::Failed(reason) => {
                    warn!(%mesh_id, %concept, %reason, "code lookup failed");
                    failed = true;
                }
            }
        }

        let entry = CacheEntry::new(concepts, codes);
        if failed {
            Resolution::Failed(entry)
        } else {
            Resolution::Fetched(entry)
        }
    }

    /// Insert unless another worker got there first; the stored entry wins.
    ///
    /// Under [`PersistMode::Every`] each insert rewrites the whole file
    /// synchronously while the write lock is held, so concurrent workers
    /// queue behind it. Large batches should prefer [`PersistMode::End`].
    async fn store(&self, mesh_id: &str, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        let mut cache = self.cache.write().await;
        if !cache.put(mesh_id, entry.clone()) {
            return Ok(cache.get(mesh_id).cloned().unwrap_or(entry));
        }
        if self.options.persist == PersistMode::Every {
            if let Some(path) = &self.options.cache_path {
                cache.save(path)?;
            }
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;

    #[derive(Default)]
    struct FakeTerminology {
        concepts: HashMap<String, Lookup<Vec<String>>>,
        codes: HashMap<String, Lookup<Vec<String>>>,
        concept_calls: AtomicUsize,
        code_calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl FakeTerminology {
        fn with_concepts(mut self, mesh: &str, lookup: Lookup<Vec<&str>>) -> Self {
            self.concepts.insert(mesh.to_string(), owned(lookup));
            self
        }

        fn with_codes(mut self, cui: &str, lookup: Lookup<Vec<&str>>) -> Self {
            self.codes.insert(cui.to_string(), owned(lookup));
            self
        }

        fn calls(&self) -> usize {
            self.concept_calls.load(Ordering::SeqCst) + self.code_calls.load(Ordering::SeqCst)
        }
    }

    fn owned(lookup: Lookup<Vec<&str>>) -> Lookup<Vec<String>> {
        match lookup {
            Lookup::Found(v) => Lookup::Found(v.into_iter().map(str::to_string).collect()),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(r) => Lookup::Failed(r),
        }
    }

    impl Terminology for FakeTerminology {
        async fn concepts(&self, mesh_id: &str) -> Lookup<Vec<String>> {
            self.concept_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(mesh_id.to_string());
            self.concepts.get(mesh_id).cloned().unwrap_or(Lookup::NotFound)
        }

        async fn icd10cm_codes(&self, concept_id: &str) -> Lookup<Vec<String>> {
            self.code_calls.fetch_add(1, Ordering::SeqCst);
            self.codes.get(concept_id).cloned().unwrap_or(Lookup::NotFound)
        }
    }

    fn resolver(fake: FakeTerminology) -> Resolver<FakeTerminology> {
        Resolver::new(fake, CrosswalkCache::new(), ResolverOptions::default())
    }

    #[tokio::test]
    async fn codes_are_merged_across_concepts() {
        let fake = FakeTerminology::default()
            .with_concepts("D1", Lookup::Found(vec!["c2", "c1"]))
            .with_codes("c1", Lookup::Found(vec!["A1"]))
            .with_codes("c2", Lookup::Found(vec!["B2", "A1"]));
        let resolver = resolver(fake);

        assert_eq!(resolver.resolve("D1").await.unwrap(), vec!["A1", "B2"]);
        let entry = resolver.cached("D1").await.unwrap();
        assert_eq!(entry.concepts, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let fake = FakeTerminology::default()
            .with_concepts("D1", Lookup::Found(vec!["c1"]))
            .with_codes("c1", Lookup::Found(vec!["I10"]));
        let resolver = resolver(fake);

        let first = resolver.resolve("D1").await.unwrap();
        let calls = resolver.terminology.calls();
        let second = resolver.resolve("D1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.terminology.calls(), calls);
    }

    #[tokio::test]
    async fn missing_concepts_are_cached_as_empty() {
        let resolver = resolver(FakeTerminology::default());
        assert!(resolver.resolve("D404").await.unwrap().is_empty());
        assert_eq!(resolver.cached("D404").await, Some(CacheEntry::default()));

        resolver.resolve("D404").await.unwrap();
        assert_eq!(resolver.terminology.concept_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookups_are_not_cached_by_default() {
        let fake = FakeTerminology::default()
            .with_concepts("D1", Lookup::Failed("timeout".into()))
            .with_concepts("D2", Lookup::Found(vec!["c1", "c2"]))
            .with_codes("c1", Lookup::Found(vec!["A1"]))
            .with_codes("c2", Lookup::Failed("503".into()));
        let resolver = resolver(fake);

        assert!(resolver.resolve("D1").await.unwrap().is_empty());
        assert_eq!(resolver.resolve("D2").await.unwrap(), vec!["A1"]);
        assert!(resolver.cached("D1").await.is_none());
        assert!(resolver.cached("D2").await.is_none());
    }

    #[tokio::test]
    async fn legacy_mode_caches_failures() {
        let fake =
            FakeTerminology::default().with_concepts("D1", Lookup::Failed("timeout".into()));
        let options = ResolverOptions {
            cache_transient_failures: true,
            ..ResolverOptions::default()
        };
        let resolver = Resolver::new(fake, CrosswalkCache::new(), options);

        resolver.resolve("D1").await.unwrap();
        assert_eq!(resolver.cached("D1").await, Some(CacheEntry::default()));
    }

    #[tokio::test]
    async fn batch_resolves_each_distinct_id_once() {
        let fake = FakeTerminology::default()
            .with_concepts("D1", Lookup::Found(vec!["c1"]))
            .with_codes("c1", Lookup::Found(vec!["I10"]));
        let resolver = resolver(fake);

        let report = resolver.resolve_batch(["D1", "D1", " D2 ", ""]).await.unwrap();
        assert_eq!(report.codes.keys().collect::<Vec<_>>(), vec!["D1", "D2"]);
        assert_eq!(report.codes["D1"], vec!["I10"]);
        assert_eq!(report.summary.requested, 4);
        assert_eq!(report.summary.unique, 2);
        assert_eq!(report.summary.fetched, 1);
        assert_eq!(report.summary.not_found, 1);

        let mut seen = resolver.terminology.seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["D1", "D2"]);
    }

    #[tokio::test]
    async fn blank_ids_resolve_to_nothing_without_network() {
        let resolver = resolver(FakeTerminology::default());
        assert!(resolver.resolve("   ").await.unwrap().is_empty());
        assert_eq!(resolver.terminology.calls(), 0);
    }
}
