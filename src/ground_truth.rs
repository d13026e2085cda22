//! Rebuilds source → related mappings from the names of persisted
//! document records. Nothing but file names is read.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{GroundTruthError, StoreError};
use crate::groups::is_excluded;
use crate::record::{Level, KEY_SEPARATOR};
use crate::store::WorkUnitStore;

/// Source identifier → related identifiers, both in first-seen order.
pub type GroundTruth = IndexMap<String, Vec<String>>;

/// Split `<source>_<related>` into its two parts.
pub fn split_identifier(name: &str) -> Result<(&str, &str), GroundTruthError> {
    let mut parts = name.split(KEY_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(source), Some(related), None) if !source.is_empty() && !related.is_empty() => {
            Ok((source, related))
        }
        _ => Err(GroundTruthError::MalformedIdentifier(name.to_string())),
    }
}

/// Malformed names are logged and left out.
pub fn aggregate<I, S>(names: I) -> GroundTruth
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut truth = GroundTruth::new();
    for name in names {
        match split_identifier(name.as_ref()) {
            Ok((source, related)) => truth
                .entry(source.to_string())
                .or_default()
                .push(related.to_string()),
            Err(e) => warn!(error = %e, "Skipping record name"),
        }
    }
    truth
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTruth {
    pub group: String,
    pub sources: usize,
    pub related: usize,
    pub path: PathBuf,
}

/// Write `{out_dir}/{group}.json` for every group with document records.
/// Groups are independent and are built in parallel.
pub fn build_all(
    store: &WorkUnitStore,
    out_dir: &Path,
    exclude: &[String],
) -> Result<Vec<GroupTruth>, StoreError> {
    fs::create_dir_all(out_dir).map_err(|e| StoreError::io(out_dir, e))?;

    let groups: Vec<String> = store
        .groups(Level::Document)?
        .into_iter()
        .filter(|g| !is_excluded(g, exclude))
        .collect();

    groups
        .par_iter()
        .map(|group| build_group(store, out_dir, group))
        .collect()
}

fn build_group(store: &WorkUnitStore, out_dir: &Path, group: &str) -> Result<GroupTruth, StoreError> {
    let truth = aggregate(store.related_identifiers(group)?);
    let path = out_dir.join(format!("{group}.json"));
    let json = serde_json::to_vec_pretty(&truth).map_err(|source| StoreError::Json {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, json).map_err(|e| StoreError::io(&path, e))?;

    let related = truth.values().map(Vec::len).sum();
    info!(%group, sources = truth.len(), related, "Ground truth written");
    Ok(GroupTruth {
        group: group.to_string(),
        sources: truth.len(),
        related,
        path,
    })
}
