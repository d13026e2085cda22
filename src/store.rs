//! JSON-file work-unit store.
//!
//! Layout:
//!   {json_dir}/query/{group}/{id}.json
//!   {json_dir}/document/{group}/{source}_{id}.json
//!   {image_dir}/{level}/{group}/{stem}.png
//!
//! A record file is the completion marker for its key and is never
//! overwritten. While a worker runs a key's pipeline it holds a
//! `{stem}.claim` file next to where the record will go.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{Level, Record, RecordKey, SourceRecord};

pub struct WorkUnitStore {
    json_dir: PathBuf,
    image_dir: PathBuf,
    claim_ttl: Duration,
}

/// Exclusive hold on one key. Dropping it releases the claim.
#[derive(Debug)]
pub struct Claim {
    path: PathBuf,
}

impl Claim {
    /// Give the key back. Same as dropping the claim.
    pub fn release(self) {}
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to release claim");
            }
        }
    }
}

impl WorkUnitStore {
    pub fn new(json_dir: impl Into<PathBuf>, image_dir: impl Into<PathBuf>, claim_ttl: Duration) -> Self {
        Self {
            json_dir: json_dir.into(),
            image_dir: image_dir.into(),
            claim_ttl,
        }
    }

    pub fn json_dir(&self) -> &Path {
        &self.json_dir
    }

    fn group_dir(&self, level: Level, group: &str) -> PathBuf {
        self.json_dir.join(level.as_str()).join(group)
    }

    pub fn record_path(&self, key: &RecordKey) -> PathBuf {
        self.group_dir(key.level(), key.group())
            .join(format!("{}.json", key.stem()))
    }

    pub fn asset_path(&self, key: &RecordKey) -> PathBuf {
        self.image_dir
            .join(key.level().as_str())
            .join(key.group())
            .join(format!("{}.png", key.stem()))
    }

    fn claim_path(&self, key: &RecordKey) -> PathBuf {
        self.group_dir(key.level(), key.group())
            .join(format!("{}.claim", key.stem()))
    }

    /// True iff a record for `key` has been persisted.
    pub fn exists(&self, key: &RecordKey) -> bool {
        self.record_path(key).is_file()
    }

    /// Take the exclusive claim on `key`. `None` means another live worker
    /// holds it. Claims older than the TTL are left over from a crashed run
    /// and are taken over, one worker at a time.
    pub fn claim(&self, key: &RecordKey) -> Result<Option<Claim>, StoreError> {
        let path = self.claim_path(key);
        ensure_parent(&path)?;

        if create_exclusive(&path)? {
            return Ok(Some(Claim { path }));
        }
        if !self.is_stale(&path) {
            return Ok(None);
        }

        let lock = path.with_extension("claim.takeover");
        if !create_exclusive(&lock)? {
            // Someone else is taking over. A lock that outlived the TTL was
            // left by a crash mid-takeover; clear it for the next attempt.
            if self.is_stale(&lock) {
                remove_if_present(&lock)?;
            }
            return Ok(None);
        }
        let _lock = Claim { path: lock };

        // The previous lock holder may already have replaced the claim.
        if !self.is_stale(&path) {
            return Ok(None);
        }
        warn!(%key, "Taking over stale claim");
        remove_if_present(&path)?;
        if create_exclusive(&path)? {
            Ok(Some(Claim { path }))
        } else {
            Ok(None)
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        // Unreadable mtime: leave the claim alone.
        age.is_some_and(|age| age > self.claim_ttl)
    }

    /// Write the asset (if any) and then the record. The record appears
    /// atomically and never replaces an existing one.
    pub fn persist(&self, record: &Record, asset: Option<&[u8]>) -> Result<PathBuf, StoreError> {
        let key = record.key();
        let path = self.record_path(&key);
        if path.exists() {
            return Err(StoreError::WriteConflict(key.to_string()));
        }
        ensure_parent(&path)?;

        if let Some(bytes) = asset {
            let asset_path = self.asset_path(&key);
            ensure_parent(&asset_path)?;
            self.write_asset(&key, &path, &asset_path, bytes)?;
        }

        let json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, &json).map_err(|e| StoreError::io(&tmp, e))?;

        // hard_link refuses to replace an existing file.
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                debug!(%key, path = %path.display(), "Record persisted");
                Ok(path)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::WriteConflict(key.to_string()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Link the asset into place without replacing anything. An asset that
    /// is already there while the record is not was left by a crashed run
    /// and is swapped out; once the record exists the asset is never touched.
    fn write_asset(
        &self,
        key: &RecordKey,
        record_path: &Path,
        asset_path: &Path,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let tmp = asset_path.with_extension(format!("png.{}.tmp", std::process::id()));
        fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;

        let mut linked = fs::hard_link(&tmp, asset_path);
        if matches!(&linked, Err(e) if e.kind() == ErrorKind::AlreadyExists) {
            if record_path.exists() {
                let _ = fs::remove_file(&tmp);
                return Err(StoreError::WriteConflict(key.to_string()));
            }
            debug!(%key, "Replacing asset left by an unfinished run");
            linked = fs::rename(&tmp, asset_path);
        }
        let _ = fs::remove_file(&tmp);
        linked.map_err(|e| StoreError::io(asset_path, e))
    }

    /// Remove whatever asset a failed pipeline may have left for `key`.
    pub fn discard_asset(&self, key: &RecordKey) -> Result<(), StoreError> {
        let path = self.asset_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%key, "Discarded asset of incomplete record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn load(&self, key: &RecordKey) -> Result<Record, StoreError> {
        read_record(&self.record_path(key))
    }

    /// Group names with persisted output at `level`, sorted.
    pub fn groups(&self, level: Level) -> Result<Vec<String>, StoreError> {
        let dir = self.json_dir.join(level.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if entry.path().is_dir() {
                groups.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        groups.sort();
        Ok(groups)
    }

    /// Stems of the record files in one group, sorted.
    pub fn stems(&self, level: Level, group: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.group_dir(level, group);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut stems = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    stems.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        stems.sort();
        Ok(stems)
    }

    /// `<source>_<related>` names of every document record in a group.
    pub fn related_identifiers(&self, group: &str) -> Result<Vec<String>, StoreError> {
        self.stems(Level::Document, group)
    }

    /// Query records of a group, in identifier order.
    pub fn source_records(&self, group: &str) -> Result<Vec<SourceRecord>, StoreError> {
        let mut records = Vec::new();
        for stem in self.stems(Level::Query, group)? {
            let path = self.group_dir(Level::Query, group).join(format!("{stem}.json"));
            match read_record(&path)? {
                Record::Source(record) => records.push(record),
                Record::Related(_) => warn!(path = %path.display(), "Document record in query tree"),
            }
        }
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<Record, StoreError> {
    let text = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&text).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e)),
        None => Ok(()),
    }
}

/// `false` when the file already exists.
fn create_exclusive(path: &Path) -> Result<bool, StoreError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::record::RelatedRecord;

    fn store(dir: &Path) -> WorkUnitStore {
        WorkUnitStore::new(dir.join("json"), dir.join("img"), Duration::from_secs(3600))
    }

    fn related(source: &str, id: &str) -> Record {
        Record::Related(RelatedRecord {
            identifier: id.into(),
            source_identifier: source.into(),
            group_name: "G01".into(),
            url: format!("https://patents.test/{id}"),
            title: "t".into(),
            abstract_text: "a".into(),
            classification_codes: vec!["G01N21/00".into()],
            first_claim: "1.".into(),
            front_image: None,
            front_image_url: None,
            harvested_at: Utc::now(),
        })
    }

    #[test]
    fn persist_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = related("Q1", "D1");
        let key = record.key();

        assert!(!store.exists(&key));
        let path = store.persist(&record, Some(&b"png"[..])).unwrap();
        assert!(store.exists(&key));
        assert!(path.ends_with("json/document/G01/Q1_D1.json"));
        assert_eq!(fs::read(store.asset_path(&key)).unwrap(), b"png");
        assert_eq!(store.load(&key).unwrap(), record);
    }

    #[test]
    fn second_persist_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = related("Q1", "D1");
        store.persist(&record, None).unwrap();

        let err = store.persist(&related("Q1", "D1"), None).unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(k) if k == "G01/Q1_D1"));
        // First record untouched, no temp files left behind.
        assert_eq!(store.load(&record.key()).unwrap(), record);
        assert_eq!(store.stems(Level::Document, "G01").unwrap(), vec!["Q1_D1"]);
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = RecordKey::source("G01", "Q1");

        let claim = store.claim(&key).unwrap().expect("first claim");
        assert!(store.claim(&key).unwrap().is_none());
        claim.release();
        assert!(store.claim(&key).unwrap().is_some());
    }

    #[test]
    fn stale_claim_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkUnitStore::new(dir.path().join("json"), dir.path().join("img"), Duration::ZERO);
        let key = RecordKey::source("G01", "Q1");

        let first = store.claim(&key).unwrap().expect("first claim");
        std::thread::sleep(Duration::from_millis(20));
        let second = store.claim(&key).unwrap();
        assert!(second.is_some());
        assert!(!store.claim_path(&key).with_extension("claim.takeover").exists());
        std::mem::forget(first);
    }

    fn backdate(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn only_one_worker_takes_over_a_stale_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = RecordKey::source("G01", "Q1");

        let crashed = store.claim(&key).unwrap().expect("first claim");
        let path = store.claim_path(&key);
        backdate(&path, Duration::from_secs(7200));

        // Another worker is mid-takeover.
        let lock = path.with_extension("claim.takeover");
        fs::write(&lock, "42").unwrap();
        assert!(store.claim(&key).unwrap().is_none());
        assert!(lock.exists());
        assert!(path.exists());

        fs::remove_file(&lock).unwrap();
        let taken = store.claim(&key).unwrap();
        assert!(taken.is_some());
        // The fresh claim is not stale, so nobody else can take it.
        assert!(store.claim(&key).unwrap().is_none());
        std::mem::forget(crashed);
    }

    #[test]
    fn abandoned_takeover_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = RecordKey::source("G01", "Q1");

        let crashed = store.claim(&key).unwrap().expect("first claim");
        let path = store.claim_path(&key);
        backdate(&path, Duration::from_secs(7200));
        let lock = path.with_extension("claim.takeover");
        fs::write(&lock, "42").unwrap();
        backdate(&lock, Duration::from_secs(7200));

        assert!(store.claim(&key).unwrap().is_none());
        assert!(!lock.exists());
        assert!(store.claim(&key).unwrap().is_some());
        std::mem::forget(crashed);
    }

    #[test]
    fn asset_of_a_persisted_record_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = related("Q1", "D1");
        let key = record.key();
        store.persist(&record, Some(&b"first"[..])).unwrap();

        let err = store
            .write_asset(&key, &store.record_path(&key), &store.asset_path(&key), b"second")
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));
        assert_eq!(fs::read(store.asset_path(&key)).unwrap(), b"first");

        let err = store.persist(&related("Q1", "D1"), Some(&b"second"[..])).unwrap_err();
        assert!(matches!(err, StoreError::WriteConflict(_)));
        assert_eq!(fs::read(store.asset_path(&key)).unwrap(), b"first");
    }

    #[test]
    fn leftover_asset_without_record_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = related("Q1", "D1");
        let key = record.key();
        let asset = store.asset_path(&key);
        fs::create_dir_all(asset.parent().unwrap()).unwrap();
        fs::write(&asset, b"stale").unwrap();

        store.persist(&record, Some(&b"fresh"[..])).unwrap();
        assert_eq!(fs::read(&asset).unwrap(), b"fresh");
        let leftovers: Vec<_> = fs::read_dir(asset.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn claims_are_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = RecordKey::related("G01", "Q1", "D1");
        let _claim = store.claim(&key).unwrap();
        assert!(!store.exists(&key));
        assert!(store.stems(Level::Document, "G01").unwrap().is_empty());
    }

    #[test]
    fn discard_missing_asset_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = RecordKey::source("G01", "Q1");
        store.discard_asset(&key).unwrap();

        fs::create_dir_all(store.asset_path(&key).parent().unwrap()).unwrap();
        fs::write(store.asset_path(&key), b"partial").unwrap();
        store.discard_asset(&key).unwrap();
        assert!(!store.asset_path(&key).exists());
    }

    #[test]
    fn groups_and_stems_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for (source, id) in [("Q2", "D1"), ("Q1", "D2"), ("Q1", "D1")] {
            store.persist(&related(source, id), None).unwrap();
        }
        assert_eq!(store.groups(Level::Document).unwrap(), vec!["G01"]);
        assert_eq!(
            store.stems(Level::Document, "G01").unwrap(),
            vec!["Q1_D1", "Q1_D2", "Q2_D1"]
        );
        assert!(store.groups(Level::Query).unwrap().is_empty());
    }
}
