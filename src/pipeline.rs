//! Ordered, all-or-nothing field extraction for one identifier.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parser::CitationClassification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Abstract,
    Citations,
    ClassificationCodes,
    FirstClaim,
    FrontImage,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Abstract => "abstract",
            Field::Citations => "citations",
            Field::ClassificationCodes => "classification_codes",
            Field::FirstClaim => "first_claim",
            Field::FrontImage => "front_image",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fetch order for query patents.
pub const SOURCE_FIELDS: &[Field] = &[
    Field::Abstract,
    Field::Citations,
    Field::Title,
    Field::ClassificationCodes,
    Field::FirstClaim,
    Field::FrontImage,
];

/// Fetch order for cited (document) patents. No citations: expansion stops
/// one level down.
pub const RELATED_FIELDS: &[Field] = &[
    Field::Abstract,
    Field::Title,
    Field::ClassificationCodes,
    Field::FirstClaim,
    Field::FrontImage,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub source_url: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Citations(CitationClassification),
    Codes(Vec<String>),
    Image(ImageAsset),
}

/// Result of one fetcher call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Value(FieldValue),
    Empty,
    TimedOut,
    Failed(String),
}

/// The page a pipeline run is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub identifier: String,
    pub url: String,
}

/// Produces field values for a target, typically by driving a browser.
#[async_trait]
pub trait FieldSource: Send {
    async fn fetch(&mut self, field: Field, target: &Target) -> FetchOutcome;
}

/// Which fields may come back empty without discarding the record.
/// The default requires every field.
#[derive(Debug, Clone, Default)]
pub struct FieldPolicy {
    optional: HashSet<Field>,
}

impl FieldPolicy {
    pub fn all_required() -> Self {
        Self::default()
    }

    pub fn with_optional(fields: impl IntoIterator<Item = Field>) -> Self {
        Self {
            optional: fields.into_iter().collect(),
        }
    }

    pub fn is_required(&self, field: Field) -> bool {
        !self.optional.contains(&field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shortfall {
    Empty,
    TimedOut,
    Failed(String),
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::Empty => f.write_str("empty"),
            Shortfall::TimedOut => f.write_str("timed out"),
            Shortfall::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The first required field that could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incomplete {
    pub field: Field,
    pub reason: Shortfall,
}

impl fmt::Display for Incomplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incomplete at {} ({})", self.field, self.reason)
    }
}

/// Values collected by a successful run. Accessors move the value out;
/// a field that was optional and missing yields an empty value.
#[derive(Debug, Default)]
pub struct FieldSet {
    values: HashMap<Field, FieldValue>,
    missing: Vec<Field>,
}

impl FieldSet {
    pub fn text(&mut self, field: Field) -> String {
        match self.values.remove(&field) {
            Some(FieldValue::Text(text)) => text,
            _ => String::new(),
        }
    }

    pub fn citations(&mut self) -> CitationClassification {
        match self.values.remove(&Field::Citations) {
            Some(FieldValue::Citations(c)) => c,
            _ => CitationClassification::default(),
        }
    }

    pub fn codes(&mut self) -> Vec<String> {
        match self.values.remove(&Field::ClassificationCodes) {
            Some(FieldValue::Codes(codes)) => codes,
            _ => Vec::new(),
        }
    }

    pub fn image(&mut self) -> Option<ImageAsset> {
        match self.values.remove(&Field::FrontImage) {
            Some(FieldValue::Image(image)) => Some(image),
            _ => None,
        }
    }

    /// Optional fields that came back without a value.
    pub fn missing(&self) -> &[Field] {
        &self.missing
    }
}

/// Run `fields` in order against `source`. The first required field without
/// a value stops the run; nothing after it is fetched.
pub async fn run_pipeline<S: FieldSource + ?Sized>(
    source: &mut S,
    target: &Target,
    fields: &[Field],
    policy: &FieldPolicy,
) -> Result<FieldSet, Incomplete> {
    let mut set = FieldSet::default();

    for &field in fields {
        let reason = match source.fetch(field, target).await {
            FetchOutcome::Value(value) => {
                set.values.insert(field, value);
                continue;
            }
            FetchOutcome::Empty => Shortfall::Empty,
            FetchOutcome::TimedOut => Shortfall::TimedOut,
            FetchOutcome::Failed(reason) => Shortfall::Failed(reason),
        };

        if policy.is_required(field) {
            return Err(Incomplete { field, reason });
        }
        debug!(id = %target.identifier, %field, %reason, "Optional field missing");
        set.missing.push(field);
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every field with text except those listed in `fail`.
    struct Scripted {
        fail: HashMap<Field, FetchOutcome>,
        calls: Vec<Field>,
    }

    impl Scripted {
        fn new(fail: &[(Field, FetchOutcome)]) -> Self {
            Self {
                fail: fail.iter().cloned().collect(),
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl FieldSource for Scripted {
        async fn fetch(&mut self, field: Field, _target: &Target) -> FetchOutcome {
            self.calls.push(field);
            self.fail
                .get(&field)
                .cloned()
                .unwrap_or_else(|| FetchOutcome::Value(FieldValue::Text(field.name().into())))
        }
    }

    fn target() -> Target {
        Target {
            identifier: "US1".into(),
            url: "https://example.test/US1".into(),
        }
    }

    #[tokio::test]
    async fn all_fields_in_declared_order() {
        let mut source = Scripted::new(&[]);
        let mut set = run_pipeline(&mut source, &target(), RELATED_FIELDS, &FieldPolicy::default())
            .await
            .unwrap();
        assert_eq!(source.calls, RELATED_FIELDS);
        assert_eq!(set.text(Field::Title), "title");
        assert!(set.missing().is_empty());
    }

    #[tokio::test]
    async fn first_failure_halts() {
        let mut source = Scripted::new(&[
            (Field::Title, FetchOutcome::TimedOut),
            (Field::FirstClaim, FetchOutcome::Empty),
        ]);
        let err = run_pipeline(&mut source, &target(), SOURCE_FIELDS, &FieldPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Incomplete {
                field: Field::Title,
                reason: Shortfall::TimedOut
            }
        );
        // Abstract, citations, title; nothing after the failure.
        assert_eq!(source.calls, &SOURCE_FIELDS[..3]);
    }

    #[tokio::test]
    async fn failed_reason_is_kept() {
        let mut source = Scripted::new(&[(
            Field::FrontImage,
            FetchOutcome::Failed("status 404".into()),
        )]);
        let err = run_pipeline(&mut source, &target(), RELATED_FIELDS, &FieldPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.field, Field::FrontImage);
        assert_eq!(err.to_string(), "incomplete at front_image (failed: status 404)");
    }

    #[tokio::test]
    async fn optional_field_does_not_halt() {
        let mut source = Scripted::new(&[(Field::Abstract, FetchOutcome::Empty)]);
        let policy = FieldPolicy::with_optional([Field::Abstract]);
        let mut set = run_pipeline(&mut source, &target(), RELATED_FIELDS, &policy)
            .await
            .unwrap();
        assert_eq!(source.calls.len(), RELATED_FIELDS.len());
        assert_eq!(set.missing(), &[Field::Abstract]);
        assert_eq!(set.text(Field::Abstract), "");
        assert!(set.image().is_none());
    }

    #[test]
    fn default_policy_requires_everything() {
        let policy = FieldPolicy::all_required();
        assert!(SOURCE_FIELDS.iter().all(|f| policy.is_required(*f)));
    }
}
