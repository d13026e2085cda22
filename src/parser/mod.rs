pub mod citations;
pub mod classification;

pub use citations::{extract_citations, CitationClassification};
pub use classification::extract_codes;
