//! MeSH to ICD-10-CM crosswalk for clinical case datasets.

pub mod cli;
pub mod config;
pub mod crosswalk;
pub mod data;
pub mod http;
pub mod logging;
