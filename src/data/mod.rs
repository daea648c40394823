//! Dataset-side inputs and outputs around the crosswalk.

pub mod mesh_dict;
pub mod pubmed;
pub mod records;
