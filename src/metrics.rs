use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::models::{month_of, HistoryRecord, Metric, MetricKey, MetricType, MetricValue, Scope};
use crate::store::{HistoryLedger, MetricStore};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    /// `None` tracks the day across every campus.
    pub campus: Option<String>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDay {
    pub first_arrival: DateTime<Utc>,
    pub last_pickup: DateTime<Utc>,
}

impl SessionDay {
    pub fn seconds(&self) -> i64 {
        (self.last_pickup - self.first_arrival).num_seconds().max(0)
    }
}

/// Accumulated metric state plus the ledger position it reflects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rollup {
    /// Optimistic concurrency token of the stored copy this rollup was loaded from.
    pub revision: i64,
    /// Highest ledger sequence already folded.
    pub watermark: i64,
    pub metrics: BTreeMap<MetricKey, MetricValue>,
    pub open_sessions: BTreeMap<SessionKey, SessionDay>,
}

impl Rollup {
    fn value_mut(&mut self, metric_type: MetricType, scope: &Scope) -> &mut MetricValue {
        self.metrics
            .entry(MetricKey {
                metric_type,
                scope: scope.clone(),
            })
            .or_insert_with(|| MetricValue::empty(metric_type))
    }

    /// Folds one ledger record. Records at or below the watermark are ignored,
    /// so replaying an overlapping batch never double-counts.
    pub fn fold(&mut self, record: &HistoryRecord) -> bool {
        if record.sequence <= self.watermark {
            return false;
        }

        let month = record.month();
        for scope in Scope::fan_out(&record.campus, &month) {
            if let MetricValue::CampusActivity { total_events } =
                self.value_mut(MetricType::CampusActivity, &scope)
            {
                *total_events += 1;
            }
            if let MetricValue::AvgWaitTime {
                record_count,
                total_wait_seconds,
                avg_wait_seconds,
            } = self.value_mut(MetricType::AvgWaitTime, &scope)
            {
                *record_count += 1;
                *total_wait_seconds += record.wait_time_seconds;
                *avg_wait_seconds = *total_wait_seconds as f64 / *record_count as f64;
            }
        }

        // Sessions spanning midnight UTC are left out of the duration metric entirely.
        if record.same_utc_day() {
            for campus in [None, Some(record.campus.clone())] {
                let key = SessionKey {
                    campus,
                    date: record.date,
                };
                self.open_sessions
                    .entry(key)
                    .and_modify(|day| {
                        day.first_arrival = day.first_arrival.min(record.queued_at);
                        day.last_pickup = day.last_pickup.max(record.completed_at);
                    })
                    .or_insert(SessionDay {
                        first_arrival: record.queued_at,
                        last_pickup: record.completed_at,
                    });
            }
        }

        self.watermark = record.sequence;
        true
    }

    /// Closes sessions dated at least two days before `today`. The one-day grace
    /// absorbs campus-local dates that run behind UTC.
    pub fn close_sessions(&mut self, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(1);
        let closing: Vec<SessionKey> = self
            .open_sessions
            .keys()
            .filter(|key| key.date < cutoff)
            .cloned()
            .collect();

        for key in &closing {
            let Some(day) = self.open_sessions.remove(key) else {
                continue;
            };
            let seconds = day.seconds();
            let month = month_of(key.date);
            let scopes = [
                Scope {
                    campus: key.campus.clone(),
                    month: None,
                },
                Scope {
                    campus: key.campus.clone(),
                    month: Some(month),
                },
            ];
            for scope in scopes {
                if let MetricValue::SessionDuration {
                    total_session_seconds,
                    days_count,
                    avg_session_seconds,
                } = self.value_mut(MetricType::SessionDuration, &scope)
                {
                    *total_session_seconds += seconds;
                    *days_count += 1;
                    *avg_session_seconds = *total_session_seconds as f64 / *days_count as f64;
                }
            }
        }

        closing.len()
    }

    pub fn metric(&self, metric_type: MetricType, scope: &Scope) -> Option<&MetricValue> {
        self.metrics.get(&MetricKey {
            metric_type,
            scope: scope.clone(),
        })
    }

    pub fn scope_metrics(&self, scope: &Scope) -> Vec<Metric> {
        MetricType::ALL
            .iter()
            .filter_map(|metric_type| {
                self.metric(*metric_type, scope).map(|value| Metric {
                    scope: scope.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }
}

/// Full recompute from the ledger alone. Pure, so re-running it is idempotent.
pub fn recompute(ledger: &[HistoryRecord], today: NaiveDate) -> Rollup {
    rebuild(ledger, today).0
}

/// [`recompute`] plus how many session days it closed.
fn rebuild(ledger: &[HistoryRecord], today: NaiveDate) -> (Rollup, usize) {
    let mut ordered: Vec<&HistoryRecord> = ledger.iter().collect();
    ordered.sort_by_key(|record| record.sequence);

    let mut rollup = Rollup::default();
    for record in ordered {
        rollup.fold(record);
    }
    let sessions_closed = rollup.close_sessions(today);
    (rollup, sessions_closed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldSummary {
    pub folded: usize,
    pub sessions_closed: usize,
    pub watermark: i64,
    pub revision: i64,
}

/// Out-of-band job folding the history ledger into metric rollups.
pub struct MetricsAggregator {
    ledger: Arc<dyn HistoryLedger>,
    store: Arc<dyn MetricStore>,
    clock: Arc<dyn Clock>,
    gate: Mutex<()>,
}

impl MetricsAggregator {
    pub fn new(
        ledger: Arc<dyn HistoryLedger>,
        store: Arc<dyn MetricStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            store,
            clock,
            gate: Mutex::new(()),
        }
    }

    /// Folds every ledger record past the stored watermark.
    pub async fn catch_up(&self) -> StoreResult<FoldSummary> {
        let _guard = self.gate.lock().await;
        let mut rollup = self.store.load_rollup().await?;
        let pending = self.ledger.history_after(rollup.watermark).await?;

        let mut folded = 0;
        for record in &pending {
            if rollup.fold(record) {
                folded += 1;
            }
        }
        let sessions_closed = rollup.close_sessions(self.clock.now().date_naive());

        if folded == 0 && sessions_closed == 0 {
            debug!(watermark = rollup.watermark, "metrics already current");
            return Ok(FoldSummary {
                folded,
                sessions_closed,
                watermark: rollup.watermark,
                revision: rollup.revision,
            });
        }

        let revision = self.store.save_rollup(&rollup).await?;
        info!(
            folded,
            sessions_closed,
            watermark = rollup.watermark,
            revision,
            "metrics caught up"
        );
        Ok(FoldSummary {
            folded,
            sessions_closed,
            watermark: rollup.watermark,
            revision,
        })
    }

    /// Per-record trigger. Anything between the watermark and `record` is folded too.
    pub async fn record(&self, record: &HistoryRecord) -> StoreResult<FoldSummary> {
        let current = self.store.load_rollup().await?;
        if record.sequence <= current.watermark {
            return Ok(FoldSummary {
                folded: 0,
                sessions_closed: 0,
                watermark: current.watermark,
                revision: current.revision,
            });
        }
        self.catch_up().await
    }

    /// Rebuilds every metric row from the full ledger, replacing what was stored.
    pub async fn initialize_dashboard_metrics(&self) -> StoreResult<FoldSummary> {
        let _guard = self.gate.lock().await;
        let stored = self.store.load_rollup().await?;
        let ledger = self.ledger.history_after(0).await?;

        let (mut rollup, sessions_closed) = rebuild(&ledger, self.clock.now().date_naive());
        rollup.revision = stored.revision;
        let revision = self.store.save_rollup(&rollup).await?;

        info!(
            records = ledger.len(),
            rows = rollup.metrics.len(),
            open_sessions = rollup.open_sessions.len(),
            sessions_closed,
            revision,
            "dashboard metrics recomputed"
        );
        Ok(FoldSummary {
            folded: ledger.len(),
            sessions_closed,
            watermark: rollup.watermark,
            revision,
        })
    }

    pub async fn reset(&self) -> StoreResult<()> {
        let _guard = self.gate.lock().await;
        self.store.reset_metrics().await?;
        info!("metrics reset");
        Ok(())
    }

    pub async fn dashboard(&self, scope: &Scope) -> StoreResult<Vec<Metric>> {
        Ok(self.store.load_rollup().await?.scope_metrics(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn record(
        sequence: i64,
        campus: &str,
        queued_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            sequence,
            campus: campus.to_string(),
            car_number: 100 + sequence as i32,
            date: completed_at.date_naive(),
            queued_at,
            completed_at,
            wait_time_seconds: crate::models::wait_time_seconds(queued_at, completed_at),
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn march(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn sample_ledger() -> Vec<HistoryRecord> {
        vec![
            record(1, "Main", at(2, 14, 0), at(2, 14, 10)),
            record(2, "Main", at(2, 14, 5), at(2, 14, 25)),
            record(3, "North", at(2, 14, 30), at(2, 14, 40)),
            record(4, "Main", at(3, 13, 50), at(3, 14, 20)),
        ]
    }

    #[test]
    fn activity_and_wait_fan_out_to_four_scopes() {
        let rollup = recompute(&sample_ledger(), march(20));

        let global = Scope::global();
        let main_march = Scope {
            campus: Some("Main".to_string()),
            month: Some("2026-03".to_string()),
        };
        assert_eq!(
            rollup.metric(MetricType::CampusActivity, &global),
            Some(&MetricValue::CampusActivity { total_events: 4 })
        );
        assert_eq!(
            rollup.metric(MetricType::CampusActivity, &main_march),
            Some(&MetricValue::CampusActivity { total_events: 3 })
        );

        let Some(MetricValue::AvgWaitTime {
            record_count,
            total_wait_seconds,
            avg_wait_seconds,
        }) = rollup.metric(MetricType::AvgWaitTime, &main_march)
        else {
            panic!("missing wait metric");
        };
        assert_eq!(*record_count, 3);
        assert_eq!(*total_wait_seconds, 600 + 1200 + 1800);
        assert!((avg_wait_seconds - 1200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn session_duration_spans_first_arrival_to_last_pickup() {
        let rollup = recompute(&sample_ledger(), march(20));
        let main_all_time = Scope {
            campus: Some("Main".to_string()),
            month: None,
        };

        // 2 Mar: 14:00 -> 14:25, 3 Mar: 13:50 -> 14:20
        assert_eq!(
            rollup.metric(MetricType::SessionDuration, &main_all_time),
            Some(&MetricValue::SessionDuration {
                total_session_seconds: 1500 + 1800,
                days_count: 2,
                avg_session_seconds: 1650.0,
            })
        );

        // Across campuses 2 Mar runs 14:00 -> 14:40.
        let Some(MetricValue::SessionDuration {
            total_session_seconds,
            days_count,
            ..
        }) = rollup.metric(MetricType::SessionDuration, &Scope::global())
        else {
            panic!("missing global session metric");
        };
        assert_eq!(*days_count, 2);
        assert_eq!(*total_session_seconds, 2400 + 1800);
        assert!(rollup.open_sessions.is_empty());
    }

    #[test]
    fn cross_midnight_records_never_touch_sessions() {
        let late = record(
            1,
            "Main",
            Utc.with_ymd_and_hms(2026, 3, 4, 23, 58, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 5, 0, 3, 0).unwrap(),
        );
        let rollup = recompute(&[late], march(20));

        assert!(rollup.metric(MetricType::SessionDuration, &Scope::global()).is_none());
        assert!(rollup.open_sessions.is_empty());
        assert_eq!(
            rollup.metric(MetricType::CampusActivity, &Scope::global()),
            Some(&MetricValue::CampusActivity { total_events: 1 })
        );
    }

    #[test]
    fn recent_sessions_stay_open() {
        let rollup = recompute(&sample_ledger(), march(4));
        // 2 Mar closes, 3 Mar is within the grace day.
        assert_eq!(rollup.open_sessions.len(), 2);
        assert!(rollup
            .open_sessions
            .keys()
            .all(|key| key.date == march(3)));
    }

    #[test]
    fn recompute_is_idempotent() {
        let ledger = sample_ledger();
        assert_eq!(recompute(&ledger, march(20)), recompute(&ledger, march(20)));
    }

    #[test]
    fn replayed_records_are_skipped() {
        let ledger = sample_ledger();
        let mut rollup = recompute(&ledger, march(20));
        let before = rollup.clone();
        for record in &ledger {
            assert!(!rollup.fold(record));
        }
        assert_eq!(rollup, before);
    }

    async fn aggregator_over(
        ledger: Vec<HistoryRecord>,
        now: DateTime<Utc>,
    ) -> (Arc<MemoryStore>, Arc<ManualClock>, MetricsAggregator) {
        let store = Arc::new(MemoryStore::new());
        store.import_history(ledger).await;
        let clock = Arc::new(ManualClock::new(now));
        let aggregator = MetricsAggregator::new(store.clone(), store.clone(), clock.clone());
        (store, clock, aggregator)
    }

    #[tokio::test]
    async fn incremental_catch_up_matches_full_recompute() {
        let ledger = sample_ledger();
        let (store, clock, aggregator) = aggregator_over(ledger[..3].to_vec(), at(3, 9, 0)).await;

        let first = aggregator.catch_up().await.unwrap();
        assert_eq!(first.folded, 3);
        assert_eq!(first.sessions_closed, 0);

        clock.set(at(20, 9, 0));
        store.import_history(ledger[3..].to_vec()).await;
        let second = aggregator.catch_up().await.unwrap();
        assert_eq!(second.folded, 1);
        assert_eq!(second.sessions_closed, 5);

        let again = aggregator.catch_up().await.unwrap();
        assert_eq!(again.folded, 0);

        let incremental = store.load_rollup().await.unwrap();
        let full = recompute(&store.history_after(0).await.unwrap(), march(20));
        assert_eq!(incremental.metrics, full.metrics);
    }

    #[tokio::test]
    async fn initialize_twice_does_not_double_count() {
        let (store, _clock, aggregator) = aggregator_over(sample_ledger(), at(20, 9, 0)).await;

        let first = aggregator.initialize_dashboard_metrics().await.unwrap();
        assert_eq!(first.sessions_closed, 5);
        let once = store.load_rollup().await.unwrap();
        let second = aggregator.initialize_dashboard_metrics().await.unwrap();
        assert_eq!(second.sessions_closed, 5);
        let twice = store.load_rollup().await.unwrap();

        assert_eq!(once.metrics, twice.metrics);
        assert_eq!(
            twice.metric(MetricType::CampusActivity, &Scope::global()),
            Some(&MetricValue::CampusActivity { total_events: 4 })
        );
    }

    #[tokio::test]
    async fn initialize_reports_only_sessions_past_the_grace_day() {
        let (store, _clock, aggregator) = aggregator_over(sample_ledger(), at(4, 9, 0)).await;
        let summary = aggregator.initialize_dashboard_metrics().await.unwrap();

        // 2 Mar closes for Main, North and all campuses; 3 Mar stays open.
        assert_eq!(summary.sessions_closed, 3);
        assert_eq!(summary.folded, 4);
        assert_eq!(store.load_rollup().await.unwrap().open_sessions.len(), 2);
    }

    #[tokio::test]
    async fn initialize_after_catch_up_replaces_rows() {
        let (store, _clock, aggregator) = aggregator_over(sample_ledger(), at(20, 9, 0)).await;
        aggregator.catch_up().await.unwrap();
        aggregator.initialize_dashboard_metrics().await.unwrap();

        let rollup = store.load_rollup().await.unwrap();
        assert_eq!(
            rollup.metric(MetricType::CampusActivity, &Scope::global()),
            Some(&MetricValue::CampusActivity { total_events: 4 })
        );
    }

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let (store, _clock, aggregator) = aggregator_over(sample_ledger(), at(20, 9, 0)).await;
        let stale = store.load_rollup().await.unwrap();
        aggregator.catch_up().await.unwrap();

        let err = store.save_rollup(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn reset_clears_rows_and_watermark() {
        let (store, _clock, aggregator) = aggregator_over(sample_ledger(), at(20, 9, 0)).await;
        aggregator.catch_up().await.unwrap();
        aggregator.reset().await.unwrap();

        let rollup = store.load_rollup().await.unwrap();
        assert!(rollup.metrics.is_empty());
        assert_eq!(rollup.watermark, 0);
        assert!(aggregator.dashboard(&Scope::global()).await.unwrap().is_empty());
    }
}
