//! Persistence seams for the dismissal engine.
//!
//! - [`QueueStore`]: active entries; every mutation is one atomic unit per campus.
//! - [`HistoryLedger`]: append-only dispatch records, read by the batch jobs.
//! - [`MetricStore`]: rollup rows and top-arrival lists.
//!
//! [`MemoryStore`] backs tests and embedders, [`PgStore`] backs the CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::metrics::Rollup;
use crate::models::{HistoryRecord, NewQueueEntry, QueueEntry, QueueSnapshot, TopArrivalsRecord};
use crate::roster::RosterDirectory;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(QueueEntry),
    /// No student is registered to the car at this campus.
    NoStudents,
    /// An active entry already holds this (campus, car number).
    Duplicate,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Roster lookup, duplicate check, lane count and insert as one atomic unit
    /// relative to every other mutation of the campus.
    async fn admit(
        &self,
        entry: NewQueueEntry,
        roster: &dyn RosterDirectory,
    ) -> StoreResult<Admission>;

    async fn find_entry(&self, id: Uuid) -> StoreResult<Option<QueueEntry>>;

    /// Deletes the entry, appends its history record and renumbers its lane atomically.
    /// `None` when the entry is already gone.
    async fn dispatch(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Option<HistoryRecord>>;

    /// Dispatches every entry of one campus in a single unit.
    async fn clear_campus(
        &self,
        campus: &str,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Vec<HistoryRecord>>;

    async fn snapshot(&self, campus: &str) -> StoreResult<QueueSnapshot>;

    /// Active entries per campus; campuses with an empty queue are absent.
    async fn counts_by_campus(&self) -> StoreResult<BTreeMap<String, usize>>;
}

#[async_trait]
pub trait HistoryLedger: Send + Sync {
    /// Records with a sequence strictly greater than `sequence`, in ledger order.
    async fn history_after(&self, sequence: i64) -> StoreResult<Vec<HistoryRecord>>;

    async fn history_for_month(
        &self,
        month: &str,
        campus: Option<&str>,
    ) -> StoreResult<Vec<HistoryRecord>>;
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn load_rollup(&self) -> StoreResult<Rollup>;

    /// Replaces the stored rollup if its revision still equals `rollup.revision`.
    /// Returns the new revision, or `StoreError::Conflict` when another writer won.
    async fn save_rollup(&self, rollup: &Rollup) -> StoreResult<i64>;

    async fn reset_metrics(&self) -> StoreResult<()>;

    /// Overwrites the (campus, month) list.
    async fn replace_top_arrivals(&self, record: &TopArrivalsRecord) -> StoreResult<()>;

    async fn top_arrivals(&self, campus: &str, month: &str)
        -> StoreResult<Option<TopArrivalsRecord>>;
}
