use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::metrics::Rollup;
use crate::models::{
    HistoryRecord, Lane, NewQueueEntry, QueueEntry, QueueSnapshot, TopArrivalsRecord,
};
use crate::reconcile::reconcile_positions;
use crate::roster::RosterDirectory;
use crate::store::{Admission, HistoryLedger, MetricStore, QueueStore};

#[derive(Default)]
struct QueueState {
    entries: HashMap<Uuid, QueueEntry>,
    ledger: Vec<HistoryRecord>,
}

impl QueueState {
    fn lane_entries<'a>(
        &'a self,
        campus: &'a str,
        lane: Lane,
    ) -> impl Iterator<Item = &'a QueueEntry> + 'a {
        self.entries
            .values()
            .filter(move |entry| entry.campus == campus && entry.lane == lane)
    }

    fn reconcile(&mut self, campus: &str, lane: Lane) {
        let mut remaining: Vec<QueueEntry> = self.lane_entries(campus, lane).cloned().collect();
        if reconcile_positions(&mut remaining) == 0 {
            return;
        }
        for entry in remaining {
            self.entries.insert(entry.id, entry);
        }
    }

    fn append(&mut self, mut record: HistoryRecord) -> HistoryRecord {
        record.sequence = self.ledger.len() as i64 + 1;
        self.ledger.push(record.clone());
        record
    }
}

/// Single-process store. The queue mutex makes every mutation, including its
/// ledger append and lane renumbering, one serializable unit.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<QueueState>,
    rollup: Mutex<Rollup>,
    top_arrivals: Mutex<HashMap<(String, String), TopArrivalsRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends already-completed lifecycles to the ledger, assigning fresh sequences.
    pub async fn import_history(&self, records: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
        let mut state = self.queues.lock().await;
        records
            .into_iter()
            .map(|record| state.append(record))
            .collect()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn admit(
        &self,
        entry: NewQueueEntry,
        roster: &dyn RosterDirectory,
    ) -> StoreResult<Admission> {
        let mut state = self.queues.lock().await;
        let Some(found) = roster
            .resolve_car_number(entry.car_number, &entry.campus)
            .await?
        else {
            return Ok(Admission::NoStudents);
        };
        let duplicate = state
            .entries
            .values()
            .any(|active| active.campus == entry.campus && active.car_number == entry.car_number);
        if duplicate {
            return Ok(Admission::Duplicate);
        }

        let position = state.lane_entries(&entry.campus, entry.lane).count() as i32 + 1;
        let entry = entry.into_entry(position, found);
        state.entries.insert(entry.id, entry.clone());
        Ok(Admission::Admitted(entry))
    }

    async fn find_entry(&self, id: Uuid) -> StoreResult<Option<QueueEntry>> {
        Ok(self.queues.lock().await.entries.get(&id).cloned())
    }

    async fn dispatch(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Option<HistoryRecord>> {
        let mut state = self.queues.lock().await;
        let Some(entry) = state.entries.remove(&id) else {
            return Ok(None);
        };
        let record = state.append(HistoryRecord::close(&entry, completed_at, date));
        state.reconcile(&entry.campus, entry.lane);
        Ok(Some(record))
    }

    async fn clear_campus(
        &self,
        campus: &str,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Vec<HistoryRecord>> {
        let mut state = self.queues.lock().await;
        let mut cleared: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|entry| entry.campus == campus)
            .cloned()
            .collect();
        cleared.sort_by_key(|entry| (entry.lane, entry.position));

        let mut records = Vec::with_capacity(cleared.len());
        for entry in &cleared {
            state.entries.remove(&entry.id);
            records.push(state.append(HistoryRecord::close(entry, completed_at, date)));
        }
        Ok(records)
    }

    async fn snapshot(&self, campus: &str) -> StoreResult<QueueSnapshot> {
        let state = self.queues.lock().await;
        Ok(QueueSnapshot::from_entries(
            campus,
            state
                .entries
                .values()
                .filter(|entry| entry.campus == campus)
                .cloned(),
        ))
    }

    async fn counts_by_campus(&self) -> StoreResult<BTreeMap<String, usize>> {
        let state = self.queues.lock().await;
        let mut counts = BTreeMap::new();
        for entry in state.entries.values() {
            *counts.entry(entry.campus.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl HistoryLedger for MemoryStore {
    async fn history_after(&self, sequence: i64) -> StoreResult<Vec<HistoryRecord>> {
        let state = self.queues.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|record| record.sequence > sequence)
            .cloned()
            .collect())
    }

    async fn history_for_month(
        &self,
        month: &str,
        campus: Option<&str>,
    ) -> StoreResult<Vec<HistoryRecord>> {
        let state = self.queues.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|record| record.month() == month)
            .filter(|record| campus.map_or(true, |campus| record.campus == campus))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn load_rollup(&self) -> StoreResult<Rollup> {
        Ok(self.rollup.lock().await.clone())
    }

    async fn save_rollup(&self, rollup: &Rollup) -> StoreResult<i64> {
        let mut stored = self.rollup.lock().await;
        if stored.revision != rollup.revision {
            return Err(StoreError::Conflict {
                expected: rollup.revision,
            });
        }
        let mut next = rollup.clone();
        next.revision = stored.revision + 1;
        *stored = next;
        Ok(stored.revision)
    }

    async fn reset_metrics(&self) -> StoreResult<()> {
        let mut stored = self.rollup.lock().await;
        let revision = stored.revision + 1;
        *stored = Rollup {
            revision,
            ..Rollup::default()
        };
        Ok(())
    }

    async fn replace_top_arrivals(&self, record: &TopArrivalsRecord) -> StoreResult<()> {
        self.top_arrivals
            .lock()
            .await
            .insert((record.campus.clone(), record.month.clone()), record.clone());
        Ok(())
    }

    async fn top_arrivals(
        &self,
        campus: &str,
        month: &str,
    ) -> StoreResult<Option<TopArrivalsRecord>> {
        Ok(self
            .top_arrivals
            .lock()
            .await
            .get(&(campus.to_string(), month.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Student;
    use crate::roster::MemoryRoster;
    use chrono::TimeZone;

    fn roster() -> MemoryRoster {
        let roster = MemoryRoster::new();
        for campus in ["Main", "North"] {
            for car in [1, 2, 3] {
                let student = Student {
                    id: Uuid::new_v4(),
                    name: format!("{campus} {car}"),
                    grade: "2".to_string(),
                    avatar: None,
                };
                roster.add_student(campus, car, student, Some("gray"));
            }
        }
        roster
    }

    fn new_entry(campus: &str, lane: Lane, car_number: i32) -> NewQueueEntry {
        NewQueueEntry {
            campus: campus.to_string(),
            lane,
            car_number,
            queued_at: Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn admission_resolves_roster_before_duplicates() {
        let store = MemoryStore::new();
        let roster = roster();

        let entry = match store.admit(new_entry("Main", Lane::Left, 1), &roster).await.unwrap() {
            Admission::Admitted(entry) => entry,
            other => panic!("expected admission, got {other:?}"),
        };
        assert_eq!(entry.position, 1);
        assert_eq!(entry.students.len(), 1);
        assert_eq!(entry.car_color.as_deref(), Some("gray"));

        assert_eq!(
            store.admit(new_entry("Main", Lane::Right, 1), &roster).await.unwrap(),
            Admission::Duplicate
        );
        assert_eq!(
            store.admit(new_entry("Main", Lane::Left, 9), &roster).await.unwrap(),
            Admission::NoStudents
        );
        assert_eq!(store.snapshot("Main").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ledger_sequences_follow_commit_order() {
        let store = MemoryStore::new();
        let roster = roster();
        let completed = Utc.with_ymd_and_hms(2026, 3, 2, 14, 5, 0).unwrap();
        let date = completed.date_naive();
        for car in [1, 2, 3] {
            store.admit(new_entry("Main", Lane::Left, car), &roster).await.unwrap();
        }
        let records = store.clear_campus("Main", completed, date).await.unwrap();
        let sequences: Vec<i64> = records.iter().map(|record| record.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.history_after(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn month_filter_scopes_by_campus() {
        let store = MemoryStore::new();
        let roster = roster();
        let completed = Utc.with_ymd_and_hms(2026, 3, 2, 14, 5, 0).unwrap();
        store.admit(new_entry("Main", Lane::Left, 1), &roster).await.unwrap();
        store.admit(new_entry("North", Lane::Right, 1), &roster).await.unwrap();
        store
            .clear_campus("Main", completed, completed.date_naive())
            .await
            .unwrap();
        store
            .clear_campus("North", completed, completed.date_naive())
            .await
            .unwrap();

        assert_eq!(store.history_for_month("2026-03", None).await.unwrap().len(), 2);
        assert_eq!(
            store
                .history_for_month("2026-03", Some("North"))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store.history_for_month("2026-04", None).await.unwrap().is_empty());
    }
}
