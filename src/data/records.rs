//! Clinical-case records kept as JSON Lines, and the columns the crosswalk
//! adds to them.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
use polars::prelude::{DataFrame, NamedFrom, ParquetWriter, Series};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::crosswalk::CrosswalkCache;

/// One dataset row; unknown columns are carried through untouched.
pub type Record = Map<String, Value>;

pub const MESH_FROM_GLINER: &str = "mesh_from_gliner";
pub const PUBMED_MESH: &str = "pubmed_mesh";
pub const MESH_CLEAN: &str = "mesh_clean";
pub const ICD10_CODES: &str = "icd10_codes";
pub const ICD10_TRACE: &str = "icd10_trace";

/// Where a MeSH id attached to a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Gliner,
    Pubmed,
    Both,
}

impl Provenance {
    fn of(in_gliner: bool, in_pubmed: bool) -> Option<Self> {
        match (in_gliner, in_pubmed) {
            (true, true) => Some(Self::Both),
            (true, false) => Some(Self::Gliner),
            (false, true) => Some(Self::Pubmed),
            (false, false) => None,
        }
    }
}

/// Trace of the first MeSH id that produced an ICD-10-CM code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub cui: Option<String>,
    pub mesh_id: String,
    pub provenance: Provenance,
}

#[derive(Debug, Deserialize)]
struct DetectedEntity {
    #[serde(default)]
    mesh_id: Option<String>,
}

pub fn read_jsonl(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid json", path.display(), idx + 1))?;
        match value {
            Value::Object(map) => records.push(map),
            _ => return Err(anyhow!("{}:{}: expected an object", path.display(), idx + 1)),
        }
    }
    info!(path = %path.display(), rows = records.len(), "loaded records");
    Ok(records)
}

pub fn write_jsonl(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("create {path:?}"))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    info!(path = %path.display(), rows = records.len(), "saved records");
    Ok(())
}

/// String array column, or an empty list when missing or mistyped.
pub fn string_list(record: &Record, column: &str) -> Vec<String> {
    record
        .get(column)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn set_string_list<I: IntoIterator<Item = String>>(record: &mut Record, column: &str, values: I) {
    let values = values.into_iter().map(Value::String).collect();
    record.insert(column.to_string(), Value::Array(values));
}

/// Fill `mesh_from_gliner` from `detected_entities` when it is absent.
pub fn ensure_mesh_from_gliner(record: &mut Record) {
    if record.contains_key(MESH_FROM_GLINER) {
        return;
    }
    let ids: BTreeSet<String> = record
        .get("detected_entities")
        .cloned()
        .and_then(|v| serde_json::from_value::<Vec<DetectedEntity>>(v).ok())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| e.mesh_id)
        .filter(|id| !id.trim().is_empty())
        .collect();
    set_string_list(record, MESH_FROM_GLINER, ids);
}

/// The article id as a string, whatever its JSON type.
pub fn article_id(record: &Record) -> Option<String> {
    match record.get("article_id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Attach the `pubmed_mesh` column from a PMID lookup.
pub fn attach_pubmed_mesh(record: &mut Record, headings: &BTreeMap<String, Vec<String>>) {
    let mesh = article_id(record)
        .and_then(|id| headings.get(&id).cloned())
        .unwrap_or_default();
    set_string_list(record, PUBMED_MESH, mesh);
}

/// Sorted union of both MeSH columns, minus check tags.
pub fn mesh_clean(record: &Record, check_tags: &BTreeSet<String>) -> Vec<String> {
    string_list(record, MESH_FROM_GLINER)
        .into_iter()
        .chain(string_list(record, PUBMED_MESH))
        .filter(|id| !check_tags.contains(id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Write `mesh_clean`, `icd10_codes` and `icd10_trace` onto `record`.
///
/// `codes` must hold an answer for every id in `mesh_clean`; ids it lacks
/// contribute nothing. The first id in sorted order owns a code's trace.
pub fn apply_crosswalk(
    record: &mut Record,
    check_tags: &BTreeSet<String>,
    codes: &BTreeMap<String, Vec<String>>,
    cache: &CrosswalkCache,
) -> Result<()> {
    let clean = mesh_clean(record, check_tags);
    let gliner: BTreeSet<String> = string_list(record, MESH_FROM_GLINER).into_iter().collect();
    let pubmed: BTreeSet<String> = string_list(record, PUBMED_MESH).into_iter().collect();

    let mut icd = BTreeSet::new();
    let mut trace: BTreeMap<String, TraceEntry> = BTreeMap::new();
    for mesh_id in &clean {
        let Some(found) = codes.get(mesh_id) else {
            continue;
        };
        let Some(provenance) = Provenance::of(gliner.contains(mesh_id), pubmed.contains(mesh_id))
        else {
            continue;
        };
        let cui = cache
            .get(mesh_id)
            .and_then(|entry| entry.concepts.first().cloned());
        for code in found {
            icd.insert(code.clone());
            trace.entry(code.clone()).or_insert_with(|| TraceEntry {
                cui: cui.clone(),
                mesh_id: mesh_id.clone(),
                provenance,
            });
        }
    }

    set_string_list(record, MESH_CLEAN, clean);
    set_string_list(record, ICD10_CODES, icd);
    record.insert(
        ICD10_TRACE.to_string(),
        Value::String(serde_json::to_string(&trace)?),
    );
    Ok(())
}

/// Flat table of the crosswalk cache: one row per MeSH id, lists joined by `;`.
pub fn write_cache_summary(cache: &CrosswalkCache, path: &Path) -> Result<()> {
    if cache.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut ids = Vec::with_capacity(cache.len());
    let mut concepts = Vec::with_capacity(cache.len());
    let mut codes = Vec::with_capacity(cache.len());
    let mut n_codes = Vec::with_capacity(cache.len());
    for (mesh_id, entry) in cache.iter() {
        ids.push(mesh_id.clone());
        concepts.push(entry.concepts.join(";"));
        codes.push(entry.codes.join(";"));
        n_codes.push(entry.codes.len() as u32);
    }
    let mut df = DataFrame::new(vec![
        Series::new("mesh_id".into(), ids),
        Series::new("concepts".into(), concepts),
        Series::new("icd10_codes".into(), codes),
        Series::new("n_codes".into(), n_codes),
    ])?;
    let file = File::create(path)?;
    ParquetWriter::new(file).finish(&mut df)?;
    info!(path = %path.display(), rows = cache.len(), "wrote crosswalk summary parquet");
    Ok(())
}
