use std::sync::LazyLock;

use regex::Regex;

/// CPC code prefix: section letter, two-digit class, subclass letter,
/// optional main group, slash, subgroup.
static CPC_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]\d{2}[A-Z]\d*/\d+").unwrap());

/// Collect the classification codes that open each row, in row order.
pub fn extract_codes(block: &str) -> Vec<String> {
    block
        .lines()
        .filter_map(|row| CPC_CODE_RE.find(row))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}
