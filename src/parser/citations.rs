use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Publication number at the start of a row, then a single whitespace
/// separator (or end of row) and an optional examiner marker.
static CITATION_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z0-9]+)(?:\s(\*)?|$)").unwrap());

/// Citations of one patent, split by who added them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationClassification {
    /// Rows flagged with `*` on the page.
    pub examiner_cited: Vec<String>,
    pub other_cited: Vec<String>,
}

impl CitationClassification {
    /// Examiner citations first, then the rest, each in page order.
    pub fn all_cited(&self) -> Vec<String> {
        self.examiner_cited
            .iter()
            .chain(self.other_cited.iter())
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.examiner_cited.is_empty() && self.other_cited.is_empty()
    }
}

/// Split the rendered text of a citations table into examiner and other
/// citations. Rows that don't start with a publication number are ignored;
/// an input without any such row yields two empty lists.
///
/// A number that appears both with and without the marker is an examiner
/// citation; its unmarked rows are dropped so the two lists stay disjoint.
pub fn extract_citations(block: &str) -> CitationClassification {
    let rows: Vec<(&str, bool)> = block
        .lines()
        .filter_map(|row| CITATION_ROW_RE.captures(row))
        .map(|caps| {
            let marked = caps.get(2).is_some();
            (caps.get(1).map_or("", |m| m.as_str()), marked)
        })
        .collect();

    let examiner: HashSet<&str> = rows
        .iter()
        .filter(|(_, marked)| *marked)
        .map(|(number, _)| *number)
        .collect();

    let mut out = CitationClassification::default();
    for (number, marked) in rows {
        if marked {
            out.examiner_cited.push(number.to_string());
        } else if !examiner.contains(number) {
            out.other_cited.push(number.to_string());
        }
    }
    out
}


#[cfg(test)]
mod proptests {
    use std::collections::HashSet;

    use super::*;
    use proptest::prelude::*;

    fn row() -> impl Strategy<Value = String> {
        prop_oneof![
            ("[A-Z0-9]{1,12}", any::<bool>(), "[a-z0-9 -]{0,20}").prop_map(
                |(number, marked, tail)| {
                    if marked {
                        format!("{number} *{tail}")
                    } else {
                        format!("{number} {tail}")
                    }
                }
            ),
            "[ -~]{0,30}",
        ]
    }

    proptest! {
        /// Property: no identifier lands in both lists.
        #[test]
        fn examiner_and_other_are_disjoint(rows in prop::collection::vec(row(), 0..40)) {
            let c = extract_citations(&rows.join("\n"));
            let examiner: HashSet<_> = c.examiner_cited.iter().collect();
            let other: HashSet<_> = c.other_cited.iter().collect();
            prop_assert!(examiner.is_disjoint(&other));
        }

        /// Property: all_cited is examiner_cited followed by other_cited.
        #[test]
        fn all_cited_is_examiner_first(rows in prop::collection::vec(row(), 0..40)) {
            let c = extract_citations(&rows.join("\n"));
            let all = c.all_cited();
            prop_assert_eq!(&all[..c.examiner_cited.len()], &c.examiner_cited[..]);
            prop_assert_eq!(&all[c.examiner_cited.len()..], &c.other_cited[..]);
        }
    }
}
