//! Streaming extraction of the MeSH descriptor dictionary and check tags.
//!
//! Descriptor files (`desc2025.xml` and friends) are several hundred
//! megabytes, so records are read event by event and dropped as soon as
//! their closing tag is seen.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use quick_xml::{events::Event, Reader};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One dictionary line: a surface term and the descriptor it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshTerm {
    pub term: String,
    pub id: String,
}

#[derive(Debug, Default)]
pub struct MeshDictionary {
    pub terms: Vec<MeshTerm>,
    /// Descriptor ids flagged as check tags (Humans, Male, Adult...).
    pub check_tags: BTreeSet<String>,
}

/// Class attribute value MeSH uses for check-tag descriptors.
const CHECK_TAG_CLASS: &[u8] = b"3";

#[derive(Default)]
struct Record {
    ui: Option<String>,
    name: Option<String>,
    terms: BTreeSet<String>,
    check_tag: bool,
}

pub fn parse_descriptor_file(path: &Path) -> Result<MeshDictionary> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;
    let dict = parse_descriptors(BufReader::new(file))
        .with_context(|| format!("parse descriptors in {path:?}"))?;
    info!(
        path = %path.display(),
        terms = dict.terms.len(),
        check_tags = dict.check_tags.len(),
        "parsed mesh descriptors"
    );
    Ok(dict)
}

pub fn parse_descriptors<R: BufRead>(input: R) -> Result<MeshDictionary> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut dict = MeshDictionary::default();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut record: Option<Record> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if name == b"DescriptorRecord" {
                    let class = e.try_get_attribute("DescriptorClass")?;
                    record = Some(Record {
                        check_tag: class.is_some_and(|a| &*a.value == CHECK_TAG_CLASS),
                        ..Record::default()
                    });
                }
                path.push(name);
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some(b"DescriptorRecord".as_slice()) {
                    if let Some(done) = record.take() {
                        finish_record(done, &mut dict);
                    }
                }
            }
            Event::Text(t) => {
                if let Some(rec) = record.as_mut() {
                    let text = t.unescape()?.trim().to_string();
                    if !text.is_empty() {
                        absorb_text(rec, &path, text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(dict)
}

/// Route text by its position under `DescriptorRecord`.
fn absorb_text(rec: &mut Record, path: &[Vec<u8>], text: String) {
    let Some(start) = path.iter().rposition(|p| p == b"DescriptorRecord") else {
        return;
    };
    let rel: Vec<&[u8]> = path[start + 1..].iter().map(Vec::as_slice).collect();
    match rel.as_slice() {
        [b"DescriptorUI"] => rec.ui = Some(text),
        [b"DescriptorName", b"String"] => rec.name = Some(text),
        [b"IsCheckTag"] => rec.check_tag |= text.eq_ignore_ascii_case("y"),
        [b"ConceptList", b"Concept", b"TermList", b"Term", b"String"] => {
            rec.terms.insert(text);
        }
        _ => {}
    }
}

fn finish_record(rec: Record, dict: &mut MeshDictionary) {
    let Some(id) = rec.ui else {
        return;
    };
    if rec.check_tag {
        dict.check_tags.insert(id.clone());
    }
    let mut terms = rec.terms;
    if let Some(name) = rec.name {
        terms.insert(name);
    }
    dict.terms.extend(terms.into_iter().map(|term| MeshTerm {
        term,
        id: id.clone(),
    }));
}

/// Write `mesh_dict.json` and `mesh_checktags.json` into `out_dir`.
pub fn write_outputs(dict: &MeshDictionary, out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(out_dir)?;
    let dict_path = out_dir.join("mesh_dict.json");
    let tags_path = out_dir.join("mesh_checktags.json");
    std::fs::write(&dict_path, serde_json::to_vec_pretty(&dict.terms)?)
        .with_context(|| format!("write {dict_path:?}"))?;
    std::fs::write(&tags_path, serde_json::to_vec(&dict.check_tags)?)
        .with_context(|| format!("write {tags_path:?}"))?;
    info!(dict = %dict_path.display(), tags = %tags_path.display(), "wrote mesh dictionary");
    Ok((dict_path, tags_path))
}

/// Load a check-tag list written by [`write_outputs`].
pub fn load_check_tags(path: &Path) -> Result<BTreeSet<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    serde_json::from_str(&text).with_context(|| format!("parse {path:?}"))
}
