//! Minimal store mutation for each incoming trial.
//!
//! | stored | status changed | incoming class | action          |
//! |--------|----------------|----------------|-----------------|
//! | no     | -              | active         | put             |
//! | no     | -              | inactive       | nothing         |
//! | yes    | no             | -              | nothing         |
//! | yes    | yes            | inactive       | delete          |
//! | yes    | yes            | active         | patch status    |

use dermsync_core::{Field, SourceFamily, TrialDraft, TrialId, TrialRecord, UnlinkedTrial};
use dermsync_storage::{LookupField, RecordPatch, RecordStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::classify::{StatusClass, StatusClassifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Outcome {
    Inserted,
    Updated { from: Field<String>, to: Field<String> },
    Deleted,
    Unchanged,
    SkippedInactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub identifier: TrialId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped_inactive: usize,
    pub unlinked: Vec<UnlinkedTrial>,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated { .. } => self.updated += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::SkippedInactive => self.skipped_inactive += 1,
        }
    }

    pub fn mutations(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.skipped_inactive += other.skipped_inactive;
        self.unlinked.extend(other.unlinked);
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub deleted: Vec<TrialId>,
    pub failures: Vec<ReconcileFailure>,
}

impl PurgeReport {
    pub fn merge(&mut self, other: PurgeReport) {
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
    }
}

pub struct Reconciler<'a, S: RecordStore + ?Sized> {
    store: &'a mut S,
    classifier: &'a StatusClassifier,
}

impl<'a, S: RecordStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a mut S, classifier: &'a StatusClassifier) -> Self {
        Self { store, classifier }
    }

    /// Apply one incoming record. Identity is resolved with `get` only.
    pub fn reconcile(&mut self, record: &TrialRecord) -> Result<Outcome, StoreError> {
        let span = info_span!("reconcile", id = %record.identifier, source = %record.source);
        let _guard = span.enter();

        let class = self
            .classifier
            .classify_field(record.source, &record.overall_status);
        let outcome = match self.store.get(&record.identifier)? {
            None => match class {
                StatusClass::Active => {
                    self.store.put(record)?;
                    Outcome::Inserted
                }
                StatusClass::Inactive => Outcome::SkippedInactive,
            },
            Some(existing) if existing.overall_status == record.overall_status => Outcome::Unchanged,
            Some(existing) => match class {
                StatusClass::Inactive => {
                    self.store.delete(&record.identifier)?;
                    Outcome::Deleted
                }
                StatusClass::Active => {
                    self.store.patch(
                        &record.identifier,
                        &RecordPatch::status(record.overall_status.clone()),
                    )?;
                    Outcome::Updated {
                        from: existing.overall_status,
                        to: record.overall_status.clone(),
                    }
                }
            },
        };

        debug!(?outcome, status = %record.overall_status, "reconciled");
        Ok(outcome)
    }

    /// Reconcile every draft in order. Unlinked drafts and store failures are
    /// reported and do not stop the batch.
    pub fn reconcile_batch(&mut self, drafts: impl IntoIterator<Item = TrialDraft>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for draft in drafts {
            let record = match draft.into_record() {
                Ok(record) => record,
                Err(unlinked) => {
                    warn!(
                        source = %unlinked.source,
                        title = %unlinked.title,
                        url = %unlinked.source_url,
                        "skipping trial without a recognisable identifier"
                    );
                    report.unlinked.push(unlinked);
                    continue;
                }
            };
            match self.reconcile(&record) {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(id = %record.identifier, error = %err, "store failure during reconcile");
                    report.failures.push(ReconcileFailure {
                        identifier: record.identifier,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            skipped_inactive = report.skipped_inactive,
            unlinked = report.unlinked.len(),
            failures = report.failures.len(),
            "batch reconciled"
        );
        report
    }

    /// Delete every stored record of `family` whose status is no longer on the
    /// allow-list. A failed delete is recorded and the sweep moves on; only a
    /// failure to enumerate the family is returned as an error.
    pub fn purge_inactive(&mut self, family: SourceFamily) -> Result<PurgeReport, StoreError> {
        let stored = self.store.find(LookupField::Source, family.as_str())?;
        let mut report = PurgeReport::default();
        for record in stored {
            if self.classifier.classify_field(family, &record.overall_status) == StatusClass::Active {
                continue;
            }
            match self.store.delete(&record.identifier) {
                Ok(()) => {
                    info!(id = %record.identifier, status = %record.overall_status, "purged inactive trial");
                    report.deleted.push(record.identifier);
                }
                Err(err) => {
                    warn!(id = %record.identifier, error = %err, "store failure during purge");
                    report.failures.push(ReconcileFailure {
                        identifier: record.identifier,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use chrono::{TimeZone, Utc};
    use dermsync_core::Provenance;
    use dermsync_storage::MemoryRecordStore;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Get(String),
        Find(LookupField, String),
        Put(String),
        Patch(String, RecordPatch),
        Delete(String),
    }

    /// Memory store that logs every call and can fail lookups for one id.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryRecordStore,
        calls: RefCell<Vec<Call>>,
        unavailable_for: Option<TrialId>,
        undeletable: Option<TrialId>,
    }

    impl RecordingStore {
        fn seeded(records: &[TrialRecord]) -> Self {
            let mut inner = MemoryRecordStore::new();
            for record in records {
                inner.put(record).unwrap();
            }
            Self {
                inner,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn log(&self, call: Call) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl RecordStore for RecordingStore {
        fn get(&self, id: &TrialId) -> Result<Option<TrialRecord>, StoreError> {
            self.log(Call::Get(id.to_string()));
            if self.unavailable_for.as_ref() == Some(id) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.get(id)
        }

        fn find(&self, field: LookupField, value: &str) -> Result<Vec<TrialRecord>, StoreError> {
            self.log(Call::Find(field, value.to_string()));
            self.inner.find(field, value)
        }

        fn put(&mut self, record: &TrialRecord) -> Result<(), StoreError> {
            self.log(Call::Put(record.identifier.to_string()));
            self.inner.put(record)
        }

        fn patch(&mut self, id: &TrialId, patch: &RecordPatch) -> Result<(), StoreError> {
            self.log(Call::Patch(id.to_string(), patch.clone()));
            self.inner.patch(id, patch)
        }

        fn delete(&mut self, id: &TrialId) -> Result<(), StoreError> {
            self.log(Call::Delete(id.to_string()));
            if self.undeletable.as_ref() == Some(id) {
                return Err(StoreError::Unavailable("write timeout".to_string()));
            }
            self.inner.delete(id)
        }
    }

    fn record(id: &str, status: &str) -> TrialRecord {
        TrialRecord {
            identifier: TrialId::new(id),
            source: SourceFamily::Ctis,
            title: Field::Available(format!("Trial {id}")),
            overall_status: Field::Available(status.to_string()),
            age_group: Field::Available(vec!["18-64 years".to_string()]),
            conditions: Field::Available(vec!["Psoriasis".to_string()]),
            products: Field::Unavailable,
            phase: Field::Unavailable,
            sponsor: Field::Available("Sponsor A".to_string()),
            primary_endpoint: Field::Unavailable,
            linked_eudract: Field::Unavailable,
            provenance: Provenance {
                raw_artifact_id: Uuid::nil(),
                source_url: "https://euclinicaltrials.eu/ctis-public-api/rss/updates.rss".to_string(),
                fetched_at: Utc.with_ymd_and_hms(2025, 9, 1, 6, 0, 0).single().unwrap(),
                extractor_version: "test".to_string(),
            },
        }
    }

    fn draft_of(record: &TrialRecord) -> TrialDraft {
        TrialDraft {
            identifier: Some(record.identifier.clone()),
            source: record.source,
            title: record.title.clone(),
            overall_status: record.overall_status.clone(),
            age_group: record.age_group.clone(),
            conditions: record.conditions.clone(),
            products: record.products.clone(),
            phase: record.phase.clone(),
            sponsor: record.sponsor.clone(),
            primary_endpoint: record.primary_endpoint.clone(),
            linked_eudract: record.linked_eudract.clone(),
            provenance: record.provenance.clone(),
        }
    }

    #[test]
    fn new_active_trial_is_inserted() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::default();
        let incoming = record("2022-500123-45-00", "Authorised, recruiting");

        let outcome = Reconciler::new(&mut store, &classifier).reconcile(&incoming).unwrap();

        assert_eq!(outcome, Outcome::Inserted);
        assert_eq!(store.inner.get(&incoming.identifier).unwrap(), Some(incoming));
    }

    #[test]
    fn same_record_twice_mutates_once() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::default();
        let incoming = record("2022-500123-45-00", "Ongoing, recruiting");

        let mut reconciler = Reconciler::new(&mut store, &classifier);
        assert_eq!(reconciler.reconcile(&incoming).unwrap(), Outcome::Inserted);
        assert_eq!(reconciler.reconcile(&incoming).unwrap(), Outcome::Unchanged);

        let mutations = store
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Get(_) | Call::Find(..)))
            .count();
        assert_eq!(mutations, 1);
    }

    #[test]
    fn inactive_trial_with_no_match_leaves_store_untouched() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::default();

        let outcome = Reconciler::new(&mut store, &classifier)
            .reconcile(&record("2023-501111-22-00", "Ended"))
            .unwrap();

        assert_eq!(outcome, Outcome::SkippedInactive);
        assert!(store.inner.is_empty());
        assert_eq!(store.calls(), vec![Call::Get("2023-501111-22-00".to_string())]);
    }

    #[test]
    fn active_status_change_patches_status_only() {
        let classifier = StatusClassifier::with_defaults();
        let stored = record("2021-001234-56", "Authorised, recruiting");
        let mut store = RecordingStore::seeded(&[stored.clone()]);

        let mut incoming = record("2021-001234-56", "Ongoing, recruiting");
        incoming.title = Field::Available("Retitled in the feed".to_string());
        incoming.sponsor = Field::Unavailable;

        let outcome = Reconciler::new(&mut store, &classifier).reconcile(&incoming).unwrap();
        assert_eq!(
            outcome,
            Outcome::Updated {
                from: Field::Available("Authorised, recruiting".to_string()),
                to: Field::Available("Ongoing, recruiting".to_string()),
            }
        );

        let after = store.inner.get(&stored.identifier).unwrap().unwrap();
        let mut expected = stored;
        expected.overall_status = incoming.overall_status.clone();
        assert_eq!(after, expected);
    }

    #[test]
    fn ended_trial_is_fetched_then_deleted() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::seeded(&[record("2021-001234-56", "Authorised, recruiting")]);

        let outcome = Reconciler::new(&mut store, &classifier)
            .reconcile(&record("2021-001234-56", "Ended"))
            .unwrap();

        assert_eq!(outcome, Outcome::Deleted);
        assert_eq!(
            store.calls(),
            vec![
                Call::Get("2021-001234-56".to_string()),
                Call::Delete("2021-001234-56".to_string()),
            ]
        );
        assert!(store.inner.is_empty());
    }

    #[test]
    fn unchanged_inactive_status_is_left_alone() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::seeded(&[record("2021-001234-56", "Temporarily halted")]);

        let outcome = Reconciler::new(&mut store, &classifier)
            .reconcile(&record("2021-001234-56", "Temporarily halted"))
            .unwrap();

        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(store.inner.len(), 1);
    }

    #[test]
    fn store_failure_is_reported_and_batch_continues() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore {
            unavailable_for: Some(TrialId::new("2022-500123-45-00")),
            ..RecordingStore::default()
        };
        let mut unlinked = draft_of(&record("ignored", "Ongoing, recruiting"));
        unlinked.identifier = None;
        let drafts = vec![
            draft_of(&record("2022-500123-45-00", "Ongoing, recruiting")),
            unlinked,
            draft_of(&record("2021-001234-56", "Ongoing, recruiting")),
            draft_of(&record("2023-501111-22-00", "Ended")),
        ];

        let report = Reconciler::new(&mut store, &classifier).reconcile_batch(drafts);

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_inactive, 1);
        assert_eq!(report.unlinked.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].identifier.as_str(), "2022-500123-45-00");
        assert_eq!(report.mutations(), 1);
    }

    #[test]
    fn purge_removes_only_inactive_records_of_the_family() {
        let classifier = StatusClassifier::with_defaults();
        let mut us_trial = record("NCT05123456", "COMPLETED");
        us_trial.source = SourceFamily::ClinicalTrialsGov;
        let mut store = RecordingStore::seeded(&[
            record("2021-001234-56", "Ongoing, recruiting"),
            record("2023-501111-22-00", "Ended"),
            us_trial,
        ]);

        let report = Reconciler::new(&mut store, &classifier)
            .purge_inactive(SourceFamily::Ctis)
            .unwrap();

        assert_eq!(report.deleted, vec![TrialId::new("2023-501111-22-00")]);
        assert!(report.failures.is_empty());
        assert_eq!(store.inner.len(), 2);
        assert_eq!(
            store.calls()[0],
            Call::Find(LookupField::Source, "ctis".to_string())
        );
    }

    #[test]
    fn failed_purge_delete_is_reported_and_sweep_continues() {
        let classifier = StatusClassifier::with_defaults();
        let mut store = RecordingStore::seeded(&[
            record("2019-000111-22", "Ended"),
            record("2020-000333-44", "Ended"),
        ]);
        store.undeletable = Some(TrialId::new("2019-000111-22"));

        let report = Reconciler::new(&mut store, &classifier)
            .purge_inactive(SourceFamily::Ctis)
            .unwrap();

        assert_eq!(report.deleted, vec![TrialId::new("2020-000333-44")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].identifier.as_str(), "2019-000111-22");
        assert_eq!(store.inner.len(), 1);
    }
}
