//! MeSH to ICD-10-CM crosswalk: a two-hop terminology lookup memoised in a
//! persistent cache.

pub mod cache;
pub mod resolver;
pub mod umls;

use std::future::Future;

pub use cache::{CacheEntry, CacheError, CrosswalkCache};
pub use resolver::{BatchReport, BatchSummary, Resolver, ResolverOptions};
pub use umls::UmlsClient;

/// Outcome of one call to the terminology service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    /// The service confirmed there is nothing to map.
    NotFound,
    /// The call failed; the answer is unknown and worth retrying later.
    Failed(String),
}

/// The two hops of the crosswalk, abstracted so the resolver can run against
/// the UTS REST API or an in-memory fake.
pub trait Terminology: Send + Sync {
    /// Hop 1: concept identifiers attached to a MeSH descriptor.
    fn concepts(&self, mesh_id: &str) -> impl Future<Output = Lookup<Vec<String>>> + Send;

    /// Hop 2: ICD-10-CM codes attached to a concept.
    fn icd10cm_codes(&self, concept_id: &str) -> impl Future<Output = Lookup<Vec<String>>> + Send;
}
