//! Crawl orchestration: class group → source identifier → sampled
//! examiner citations.
//!
//! Every identifier goes through the same steps: skip if a record exists,
//! claim it, run the field pipeline, persist on full success. Whatever goes
//! wrong stays with that identifier; siblings and other groups carry on.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::groups::ClassGroup;
use crate::page::patent_url;
use crate::pipeline::{
    run_pipeline, Field, FieldPolicy, FieldSet, FieldSource, Incomplete, Target, RELATED_FIELDS,
    SOURCE_FIELDS,
};
use crate::record::{Record, RecordKey, RelatedRecord, SourceRecord};
use crate::sampler::Sampler;
use crate::store::WorkUnitStore;

/// What happened to one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    SkippedExisting,
    /// Another live worker holds the claim.
    Claimed,
    Persisted,
    Incomplete(Incomplete),
    Failed(String),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::SkippedExisting => "skipped_existing",
            Outcome::Claimed => "claimed",
            Outcome::Persisted => "persisted",
            Outcome::Incomplete(_) => "incomplete",
            Outcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Incomplete(incomplete) => Some(incomplete.to_string()),
            Outcome::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Counts toward a source's quota.
    fn is_accounted(&self) -> bool {
        matches!(self, Outcome::SkippedExisting | Outcome::Persisted)
    }

    /// A pipeline ran for this identifier.
    fn is_attempt(&self) -> bool {
        matches!(
            self,
            Outcome::Persisted | Outcome::Incomplete(_) | Outcome::Failed(_)
        )
    }
}

/// Receives every outcome exactly once, e.g. the run ledger.
pub trait OutcomeSink: Send {
    fn record(&mut self, key: &RecordKey, outcome: &Outcome);
}

/// Sink that keeps nothing.
pub struct NoSink;

impl OutcomeSink for NoSink {
    fn record(&mut self, _key: &RecordKey, _outcome: &Outcome) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub persisted: usize,
    pub skipped_existing: usize,
    pub claimed: usize,
    pub incomplete: usize,
    pub failed: usize,
}

impl Tally {
    pub fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::SkippedExisting => self.skipped_existing += 1,
            Outcome::Claimed => self.claimed += 1,
            Outcome::Persisted => self.persisted += 1,
            Outcome::Incomplete(_) => self.incomplete += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.persisted += other.persisted;
        self.skipped_existing += other.skipped_existing;
        self.claimed += other.claimed;
        self.incomplete += other.incomplete;
        self.failed += other.failed;
    }

    pub fn attempted(&self) -> usize {
        self.persisted + self.incomplete + self.failed
    }

    pub fn succeeded(&self) -> usize {
        self.persisted
    }

    pub fn skipped(&self) -> usize {
        self.skipped_existing + self.claimed
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempted ({} incomplete, {} failed), {} succeeded, {} skipped",
            self.attempted(),
            self.incomplete,
            self.failed,
            self.succeeded(),
            self.skipped()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupTally {
    pub group: String,
    pub queries: Tally,
    pub documents: Tally,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub groups: Vec<GroupTally>,
    /// Stopped early because the attempt limit was reached.
    pub limited: bool,
}

impl RunSummary {
    pub fn queries(&self) -> Tally {
        let mut total = Tally::default();
        for group in &self.groups {
            total.merge(&group.queries);
        }
        total
    }

    pub fn documents(&self) -> Tally {
        let mut total = Tally::default();
        for group in &self.groups {
            total.merge(&group.documents);
        }
        total
    }
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub base_url: String,
    pub sampler: Sampler,
    pub policy: FieldPolicy,
    /// Also expand sources that were already harvested by an earlier run.
    pub expand_existing: bool,
    /// Max source pipelines to run before stopping.
    pub limit: Option<usize>,
}

pub struct Harvester {
    store: WorkUnitStore,
    options: HarvestOptions,
}

impl Harvester {
    pub fn new(store: WorkUnitStore, options: HarvestOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &WorkUnitStore {
        &self.store
    }

    /// Harvest every class-group file in order, expanding each newly
    /// persisted source into its sampled examiner citations.
    pub async fn run<F: FieldSource + ?Sized>(
        &self,
        source: &mut F,
        group_files: &[PathBuf],
        sink: &mut dyn OutcomeSink,
    ) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut attempts = 0usize;

        for path in group_files {
            let group = match ClassGroup::load(path) {
                Ok(group) => group,
                Err(e) => {
                    error!(error = %e, "Skipping class group");
                    continue;
                }
            };

            info!(group = %group.name, ids = group.identifiers.len(), "Starting class group");
            let pb = group_bar(group.identifiers.len());
            let mut tally = GroupTally {
                group: group.name.clone(),
                ..Default::default()
            };

            for id in &group.identifiers {
                if self.limit_reached(attempts) {
                    summary.limited = true;
                    break;
                }
                let outcome = self
                    .harvest_source(source, &group.name, id, &mut tally, sink)
                    .await;
                if outcome.is_attempt() {
                    attempts += 1;
                }
                pb.inc(1);
            }

            pb.finish_and_clear();
            info!(group = %tally.group, queries = %tally.queries, documents = %tally.documents, "Finished class group");
            summary.groups.push(tally);

            if summary.limited {
                info!(limit = ?self.options.limit, "Attempt limit reached");
                break;
            }
        }

        summary
    }

    /// Expansion only: walk the persisted source records of each group and
    /// harvest their sampled citations that are still missing.
    pub async fn expand<F: FieldSource + ?Sized>(
        &self,
        source: &mut F,
        groups: &[String],
        sink: &mut dyn OutcomeSink,
    ) -> RunSummary {
        let mut summary = RunSummary::default();

        for group in groups {
            let records = match self.store.source_records(group) {
                Ok(records) => records,
                Err(e) => {
                    error!(%group, error = %e, "Cannot read source records");
                    continue;
                }
            };

            info!(%group, sources = records.len(), "Expanding class group");
            let pb = group_bar(records.len());
            let mut tally = GroupTally {
                group: group.clone(),
                ..Default::default()
            };

            for record in &records {
                self.expand_source(source, record, &mut tally, sink).await;
                pb.inc(1);
            }

            pb.finish_and_clear();
            info!(%group, documents = %tally.documents, "Finished class group");
            summary.groups.push(tally);
        }

        summary
    }

    fn limit_reached(&self, attempts: usize) -> bool {
        self.options.limit.is_some_and(|limit| attempts >= limit)
    }

    async fn harvest_source<F: FieldSource + ?Sized>(
        &self,
        source: &mut F,
        group: &str,
        id: &str,
        tally: &mut GroupTally,
        sink: &mut dyn OutcomeSink,
    ) -> Outcome {
        let key = RecordKey::source(group, id);
        let (outcome, record) = self.harvest_one(source, &key).await;
        report(&key, &outcome, &mut tally.queries, sink);

        let record = match (record, &outcome) {
            (Some(record), _) => Some(record),
            (None, Outcome::SkippedExisting) if self.options.expand_existing => {
                match self.store.load(&key) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(%key, error = %e, "Cannot reload source record for expansion");
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some(Record::Source(record)) = record {
            self.expand_source(source, &record, tally, sink).await;
        }
        outcome
    }

    async fn expand_source<F: FieldSource + ?Sized>(
        &self,
        source: &mut F,
        record: &SourceRecord,
        tally: &mut GroupTally,
        sink: &mut dyn OutcomeSink,
    ) {
        let mut run = self.options.sampler.run(&record.citations.examiner_cited);
        if run.candidates() == 0 {
            info!(
                id = %record.identifier,
                cited = record.citations.examiner_cited.len(),
                quota = self.options.sampler.quota,
                "Too few examiner citations to expand"
            );
            return;
        }

        while let Some(related) = run.next_candidate() {
            let key = RecordKey::related(&record.group_name, &record.identifier, &related);
            let (outcome, _) = self.harvest_one(source, &key).await;
            if outcome.is_accounted() {
                run.account();
            }
            report(&key, &outcome, &mut tally.documents, sink);
        }

        debug!(
            id = %record.identifier,
            accounted = run.accounted(),
            target = run.target(),
            "Expansion finished"
        );
    }

    /// One identifier through skip → claim → pipeline → persist.
    async fn harvest_one<F: FieldSource + ?Sized>(
        &self,
        source: &mut F,
        key: &RecordKey,
    ) -> (Outcome, Option<Record>) {
        if self.store.exists(key) {
            return (Outcome::SkippedExisting, None);
        }

        let claim = match self.store.claim(key) {
            Ok(Some(claim)) => claim,
            Ok(None) => return (Outcome::Claimed, None),
            Err(e) => return (Outcome::Failed(e.to_string()), None),
        };
        // Another worker may have finished between the check and the claim.
        if self.store.exists(key) {
            return (Outcome::SkippedExisting, None);
        }

        let target = Target {
            identifier: key.identifier().to_string(),
            url: patent_url(&self.options.base_url, key.identifier()),
        };
        let fields = match key {
            RecordKey::Source { .. } => SOURCE_FIELDS,
            RecordKey::Related { .. } => RELATED_FIELDS,
        };

        let set = match run_pipeline(source, &target, fields, &self.options.policy).await {
            Ok(set) => set,
            Err(incomplete) => {
                self.discard(key);
                return (Outcome::Incomplete(incomplete), None);
            }
        };

        let (record, asset) = self.build_record(key, target.url, set);
        let outcome = match self.store.persist(&record, asset.as_deref()) {
            Ok(_) => (Outcome::Persisted, Some(record)),
            Err(e @ StoreError::WriteConflict(_)) => (Outcome::Failed(e.to_string()), None),
            Err(e) => {
                self.discard(key);
                (Outcome::Failed(e.to_string()), None)
            }
        };
        claim.release();
        outcome
    }

    fn discard(&self, key: &RecordKey) {
        if let Err(e) = self.store.discard_asset(key) {
            warn!(%key, error = %e, "Could not discard asset");
        }
    }

    fn build_record(
        &self,
        key: &RecordKey,
        url: String,
        mut set: FieldSet,
    ) -> (Record, Option<Vec<u8>>) {
        let image = set.image();
        let front_image = image.as_ref().map(|_| self.store.asset_path(key));
        let front_image_url = image.as_ref().map(|image| image.source_url.clone());
        let title = set.text(Field::Title);
        let abstract_text = set.text(Field::Abstract);
        let first_claim = set.text(Field::FirstClaim);
        let classification_codes = set.codes();
        let harvested_at = Utc::now();

        let record = match key {
            RecordKey::Source { group, id } => {
                let citations = set.citations();
                Record::Source(SourceRecord {
                    identifier: id.clone(),
                    group_name: group.clone(),
                    url,
                    title,
                    abstract_text,
                    classification_codes,
                    all_cited: citations.all_cited(),
                    citations,
                    first_claim,
                    front_image,
                    front_image_url,
                    harvested_at,
                })
            }
            RecordKey::Related { group, source, id } => Record::Related(RelatedRecord {
                identifier: id.clone(),
                source_identifier: source.clone(),
                group_name: group.clone(),
                url,
                title,
                abstract_text,
                classification_codes,
                first_claim,
                front_image,
                front_image_url,
                harvested_at,
            }),
        };
        (record, image.map(|image| image.bytes))
    }
}

fn report(key: &RecordKey, outcome: &Outcome, tally: &mut Tally, sink: &mut dyn OutcomeSink) {
    match outcome {
        Outcome::SkippedExisting => info!(%key, "Already harvested"),
        Outcome::Claimed => info!(%key, "Claimed by another worker"),
        Outcome::Persisted => info!(%key, "Harvested"),
        Outcome::Incomplete(incomplete) => {
            warn!(%key, field = %incomplete.field, reason = %incomplete.reason, "Incomplete, skipped")
        }
        Outcome::Failed(reason) => error!(%key, error = %reason, "Failed"),
    }
    tally.add(outcome);
    sink.record(key, outcome);
}

fn group_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Shortfall;

    #[test]
    fn tally_counts() {
        let mut tally = Tally::default();
        for outcome in [
            Outcome::Persisted,
            Outcome::SkippedExisting,
            Outcome::Claimed,
            Outcome::Failed("write conflict".into()),
            Outcome::Incomplete(Incomplete {
                field: Field::Title,
                reason: Shortfall::TimedOut,
            }),
        ] {
            tally.add(&outcome);
        }
        assert_eq!(tally.attempted(), 3);
        assert_eq!(tally.succeeded(), 1);
        assert_eq!(tally.skipped(), 2);
        assert_eq!(
            tally.to_string(),
            "3 attempted (1 incomplete, 1 failed), 1 succeeded, 2 skipped"
        );
    }

    #[test]
    fn outcome_detail_names_the_field() {
        let outcome = Outcome::Incomplete(Incomplete {
            field: Field::FrontImage,
            reason: Shortfall::Empty,
        });
        assert_eq!(outcome.kind(), "incomplete");
        assert_eq!(
            outcome.detail().as_deref(),
            Some("incomplete at front_image (empty)")
        );
        assert_eq!(Outcome::Persisted.detail(), None);
    }

    #[test]
    fn summary_totals_across_groups() {
        let mut a = GroupTally::default();
        a.queries.persisted = 2;
        a.documents.persisted = 5;
        let mut b = GroupTally::default();
        b.queries.failed = 1;
        let summary = RunSummary {
            groups: vec![a, b],
            limited: false,
        };
        assert_eq!(summary.queries().attempted(), 3);
        assert_eq!(summary.documents().succeeded(), 5);
    }
}
