//! Class-group files: one `{group}.txt` per class, one identifier per line.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::HarvestError;
use crate::record::KEY_SEPARATOR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassGroup {
    pub name: String,
    pub identifiers: Vec<String>,
}

impl ClassGroup {
    /// Group name is the file stem. Whitespace anywhere in a line is removed;
    /// lines left empty are skipped, unusable identifiers are logged and
    /// skipped.
    pub fn load(path: &Path) -> Result<Self, HarvestError> {
        let text = fs::read_to_string(path).map_err(|source| HarvestError::ClassGroup {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            identifiers: parse_identifiers(&text),
        })
    }
}

pub fn parse_identifiers(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|id| !id.is_empty())
        .filter(|id| {
            let usable = is_usable_identifier(id);
            if !usable {
                warn!(%id, "Skipping identifier that cannot name a record file");
            }
            usable
        })
        .collect()
}

/// Identifiers become file stems, and related stems are split on the key
/// separator, so none of these may appear in one.
pub fn is_usable_identifier(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\', '.', KEY_SEPARATOR])
}

/// An exclusion entry matches a group by name, with or without the file
/// extension (`F04D17` and `F04D17.txt` both exclude group `F04D17`).
pub fn is_excluded(group: &str, exclude: &[String]) -> bool {
    exclude
        .iter()
        .any(|entry| entry == group || Path::new(entry).file_stem().is_some_and(|stem| stem == group))
}

/// Paths of the class-group files in `dir` that are not excluded, in
/// file-name order.
pub fn class_group_files(dir: &Path, exclude: &[String]) -> Result<Vec<PathBuf>, HarvestError> {
    let class_error = |source| HarvestError::ClassGroup {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(class_error)? {
        let path = entry.map_err(class_error)?.path();
        if !path.is_file() {
            continue;
        }
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        if stem.is_some_and(|stem| is_excluded(&stem, exclude)) {
            info!(group = %path.display(), "Group excluded");
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}
