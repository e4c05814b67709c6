use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::metrics::{Rollup, SessionDay, SessionKey};
use crate::models::{
    HistoryRecord, Lane, MetricKey, MetricType, MetricValue, NewQueueEntry, QueueEntry,
    QueueSnapshot, Scope, Student, TopArrival, TopArrivalsRecord,
};
use crate::publish::QueuePublisher;
use crate::reconcile::reconcile_positions;
use crate::roster::{Campus, CampusDirectory, RosterDirectory, RosterMatch, RosterRow};
use crate::store::{Admission, HistoryLedger, MetricStore, QueueStore};

/// Channel notified, with the campus as payload, by every committed queue mutation.
pub const QUEUE_CHANNEL: &str = "dismissal_queue";

/// Advisory lock key serializing ledger appends so sequences become visible in order.
const LEDGER_LOCK: i64 = 0x6c65_6467_6572;

const ACTIVE_CAR_CONSTRAINT: &str = "queue_entries_active_car";

const ENTRY_COLUMNS: &str =
    "id, campus, lane, position, car_number, students, queued_at, car_color";

const HISTORY_COLUMNS: &str =
    "sequence, id, campus, car_number, date, queued_at, completed_at, wait_time_seconds";

pub struct PgStore {
    pool: PgPool,
}

type Tx = Transaction<'static, Postgres>;

fn entry_from_row(row: &PgRow) -> StoreResult<QueueEntry> {
    let lane: String = row.try_get("lane")?;
    let lane = lane.parse::<Lane>().map_err(|_| StoreError::Corrupt {
        table: "queue_entries",
        detail: format!("unknown lane {lane}"),
    })?;
    let students: Json<Vec<Student>> = row.try_get("students")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        campus: row.try_get("campus")?,
        lane,
        position: row.try_get("position")?,
        car_number: row.try_get("car_number")?,
        students: students.0,
        queued_at: row.try_get("queued_at")?,
        car_color: row.try_get("car_color")?,
    })
}

fn history_from_row(row: &PgRow) -> StoreResult<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.try_get("id")?,
        sequence: row.try_get("sequence")?,
        campus: row.try_get("campus")?,
        car_number: row.try_get("car_number")?,
        date: row.try_get("date")?,
        queued_at: row.try_get("queued_at")?,
        completed_at: row.try_get("completed_at")?,
        wait_time_seconds: row.try_get("wait_time_seconds")?,
    })
}

fn metric_from_row(row: &PgRow) -> StoreResult<(MetricKey, MetricValue)> {
    let raw_type: String = row.try_get("metric_type")?;
    let metric_type = raw_type
        .parse::<MetricType>()
        .map_err(|detail| StoreError::Corrupt {
            table: "metrics",
            detail,
        })?;
    let count = |column: &str| -> StoreResult<i64> {
        Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or(0))
    };
    let average = |column: &str| -> StoreResult<f64> {
        Ok(row.try_get::<Option<f64>, _>(column)?.unwrap_or(0.0))
    };

    let value = match metric_type {
        MetricType::CampusActivity => MetricValue::CampusActivity {
            total_events: count("total_events")?,
        },
        MetricType::AvgWaitTime => MetricValue::AvgWaitTime {
            record_count: count("record_count")?,
            total_wait_seconds: count("total_wait_seconds")?,
            avg_wait_seconds: average("avg_wait_seconds")?,
        },
        MetricType::SessionDuration => MetricValue::SessionDuration {
            total_session_seconds: count("total_session_seconds")?,
            days_count: count("days_count")?,
            avg_session_seconds: average("avg_session_seconds")?,
        },
    };
    let key = MetricKey {
        metric_type,
        scope: Scope {
            campus: row.try_get("campus")?,
            month: row.try_get("month")?,
        },
    };
    Ok((key, value))
}

async fn lock_campus(tx: &mut Tx, campus: &str) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(campus)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn notify(tx: &mut Tx, campus: &str) -> StoreResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(QUEUE_CHANNEL)
        .bind(campus)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn append_history(tx: &mut Tx, record: HistoryRecord) -> StoreResult<HistoryRecord> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(LEDGER_LOCK)
        .execute(&mut **tx)
        .await?;
    let sequence: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO dismissal.history_records
        (id, campus, car_number, date, queued_at, completed_at, wait_time_seconds)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING sequence
        "#,
    )
    .bind(record.id)
    .bind(&record.campus)
    .bind(record.car_number)
    .bind(record.date)
    .bind(record.queued_at)
    .bind(record.completed_at)
    .bind(record.wait_time_seconds)
    .fetch_one(&mut **tx)
    .await?;
    Ok(HistoryRecord { sequence, ..record })
}

async fn reconcile_lane(tx: &mut Tx, campus: &str, lane: Lane) -> StoreResult<usize> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM dismissal.queue_entries \
         WHERE campus = $1 AND lane = $2 ORDER BY position"
    ))
    .bind(campus)
    .bind(lane.as_str())
    .fetch_all(&mut **tx)
    .await?;

    let mut remaining = rows
        .iter()
        .map(entry_from_row)
        .collect::<StoreResult<Vec<_>>>()?;
    let before: BTreeMap<Uuid, i32> = remaining
        .iter()
        .map(|entry| (entry.id, entry.position))
        .collect();
    let moved = reconcile_positions(&mut remaining);

    for entry in remaining
        .iter()
        .filter(|entry| before.get(&entry.id) != Some(&entry.position))
    {
        sqlx::query("UPDATE dismissal.queue_entries SET position = $2 WHERE id = $1")
            .bind(entry.id)
            .bind(entry.position)
            .execute(&mut **tx)
            .await?;
    }
    Ok(moved)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_campus(&self, campus: &Campus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dismissal.campuses (id, label, timezone)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET label = EXCLUDED.label, timezone = EXCLUDED.timezone
            "#,
        )
        .bind(&campus.id)
        .bind(&campus.label)
        .bind(campus.timezone.name())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts roster rows, creating unknown campuses with a UTC timezone.
    /// Returns how many rows were written.
    pub async fn import_roster(&self, rows: &[RosterRow]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for row in rows {
            sqlx::query(
                "INSERT INTO dismissal.campuses (id, label) VALUES ($1, $1) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&row.campus)
            .execute(&mut *tx)
            .await?;

            let student = row.student();
            let result = sqlx::query(
                r#"
                INSERT INTO dismissal.roster_students
                (id, campus, car_number, full_name, grade, avatar_ref, car_color)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (campus, car_number, full_name) DO UPDATE
                SET grade = EXCLUDED.grade,
                    avatar_ref = EXCLUDED.avatar_ref,
                    car_color = COALESCE(EXCLUDED.car_color, dismissal.roster_students.car_color)
                "#,
            )
            .bind(student.id)
            .bind(&row.campus)
            .bind(row.car_number)
            .bind(&student.name)
            .bind(&student.grade)
            .bind(&student.avatar)
            .bind(&row.car_color)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                written += 1;
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    pub async fn seed(&self) -> StoreResult<usize> {
        let campuses = [
            Campus::new("Main", "Main Campus", chrono_tz::America::Chicago),
            Campus::new("North", "North Campus", chrono_tz::America::Chicago),
        ];
        for campus in &campuses {
            self.upsert_campus(campus).await?;
        }

        let roster = [
            ("Main", 101, "Avery Lee", "3", Some("blue")),
            ("Main", 101, "Jordan Lee", "5", None),
            ("Main", 102, "Jules Moreno", "K", Some("silver")),
            ("Main", 103, "Kiara Patel", "2", Some("red")),
            ("North", 101, "Sam Ortiz", "4", Some("white")),
            ("North", 204, "Noor Haddad", "1", Some("green")),
        ];
        let rows: Vec<RosterRow> = roster
            .into_iter()
            .map(|(campus, car_number, name, grade, color)| RosterRow {
                campus: campus.to_string(),
                car_number,
                student_name: name.to_string(),
                grade: grade.to_string(),
                avatar: None,
                car_color: color.map(str::to_string),
                student_id: None,
            })
            .collect();
        self.import_roster(&rows).await
    }

    /// Registers for commit notifications. Await this before taking the snapshot
    /// a watcher starts from, so no commit after that snapshot goes unseen.
    pub async fn listen(&self) -> StoreResult<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(QUEUE_CHANNEL).await?;
        info!(channel = QUEUE_CHANNEL, "listening for queue commits");
        Ok(listener)
    }

    /// Forwards committed mutations from any process to local subscribers.
    /// Returns only when the listener connection fails.
    pub async fn relay_notifications(
        &self,
        mut listener: PgListener,
        publisher: Arc<QueuePublisher>,
    ) -> StoreResult<()> {
        loop {
            let notification = listener.recv().await?;
            publisher.refresh(self, notification.payload()).await;
        }
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn admit(
        &self,
        entry: NewQueueEntry,
        roster: &dyn RosterDirectory,
    ) -> StoreResult<Admission> {
        let mut tx = self.pool.begin().await?;
        lock_campus(&mut tx, &entry.campus).await?;

        // Resolved while the campus lock is held, so no other mutation of the
        // campus interleaves between lookup and insert.
        let Some(found) = roster
            .resolve_car_number(entry.car_number, &entry.campus)
            .await?
        else {
            tx.rollback().await?;
            return Ok(Admission::NoStudents);
        };

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM dismissal.queue_entries WHERE campus = $1 AND car_number = $2)",
        )
        .bind(&entry.campus)
        .bind(entry.car_number)
        .fetch_one(&mut *tx)
        .await?;
        if exists {
            tx.rollback().await?;
            return Ok(Admission::Duplicate);
        }

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dismissal.queue_entries WHERE campus = $1 AND lane = $2",
        )
        .bind(&entry.campus)
        .bind(entry.lane.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let entry = entry.into_entry(count as i32 + 1, found);
        let inserted = sqlx::query(&format!(
            "INSERT INTO dismissal.queue_entries ({ENTRY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(entry.id)
        .bind(&entry.campus)
        .bind(entry.lane.as_str())
        .bind(entry.position)
        .bind(entry.car_number)
        .bind(Json(&entry.students))
        .bind(entry.queued_at)
        .bind(&entry.car_color)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            let duplicate = err
                .as_database_error()
                .and_then(|db| db.constraint())
                .is_some_and(|constraint| constraint == ACTIVE_CAR_CONSTRAINT);
            if duplicate {
                debug!(campus = %entry.campus, car_number = entry.car_number, "duplicate caught by constraint");
                return Ok(Admission::Duplicate);
            }
            return Err(err.into());
        }

        notify(&mut tx, &entry.campus).await?;
        tx.commit().await?;
        Ok(Admission::Admitted(entry))
    }

    async fn find_entry(&self, id: Uuid) -> StoreResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM dismissal.queue_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn dispatch(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Option<HistoryRecord>> {
        let mut tx = self.pool.begin().await?;
        let campus: Option<String> =
            sqlx::query_scalar("SELECT campus FROM dismissal.queue_entries WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(campus) = campus else {
            tx.rollback().await?;
            return Ok(None);
        };
        lock_campus(&mut tx, &campus).await?;

        let row = sqlx::query(&format!(
            "DELETE FROM dismissal.queue_entries WHERE id = $1 RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;

        let record = append_history(&mut tx, HistoryRecord::close(&entry, completed_at, date)).await?;
        let moved = reconcile_lane(&mut tx, &entry.campus, entry.lane).await?;
        notify(&mut tx, &entry.campus).await?;
        tx.commit().await?;

        debug!(campus = %entry.campus, lane = %entry.lane, moved, "lane reconciled");
        Ok(Some(record))
    }

    async fn clear_campus(
        &self,
        campus: &str,
        completed_at: DateTime<Utc>,
        date: NaiveDate,
    ) -> StoreResult<Vec<HistoryRecord>> {
        let mut tx = self.pool.begin().await?;
        lock_campus(&mut tx, campus).await?;

        let rows = sqlx::query(&format!(
            "DELETE FROM dismissal.queue_entries WHERE campus = $1 RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(campus)
        .fetch_all(&mut *tx)
        .await?;
        let mut cleared = rows
            .iter()
            .map(entry_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        cleared.sort_by_key(|entry| (entry.lane, entry.position));

        let mut records = Vec::with_capacity(cleared.len());
        for entry in &cleared {
            records.push(
                append_history(&mut tx, HistoryRecord::close(entry, completed_at, date)).await?,
            );
        }
        if !records.is_empty() {
            notify(&mut tx, campus).await?;
        }
        tx.commit().await?;
        Ok(records)
    }

    async fn snapshot(&self, campus: &str) -> StoreResult<QueueSnapshot> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM dismissal.queue_entries \
             WHERE campus = $1 ORDER BY lane, position"
        ))
        .bind(campus)
        .fetch_all(&self.pool)
        .await?;
        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(QueueSnapshot::from_entries(campus, entries))
    }

    async fn counts_by_campus(&self) -> StoreResult<BTreeMap<String, usize>> {
        let rows = sqlx::query(
            "SELECT campus, COUNT(*) AS cars FROM dismissal.queue_entries GROUP BY campus",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let cars: i64 = row.try_get("cars")?;
            counts.insert(row.try_get("campus")?, cars as usize);
        }
        Ok(counts)
    }
}

#[async_trait]
impl HistoryLedger for PgStore {
    async fn history_after(&self, sequence: i64) -> StoreResult<Vec<HistoryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM dismissal.history_records \
             WHERE sequence > $1 ORDER BY sequence"
        ))
        .bind(sequence)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn history_for_month(
        &self,
        month: &str,
        campus: Option<&str>,
    ) -> StoreResult<Vec<HistoryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM dismissal.history_records \
             WHERE to_char(date, 'YYYY-MM') = $1 AND ($2::text IS NULL OR campus = $2) \
             ORDER BY sequence"
        ))
        .bind(month)
        .bind(campus)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn load_rollup(&self) -> StoreResult<Rollup> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let state = sqlx::query("SELECT revision, watermark FROM dismissal.rollup_state")
            .fetch_optional(&mut *tx)
            .await?;
        let (revision, watermark): (i64, i64) = match state {
            Some(row) => (row.try_get("revision")?, row.try_get("watermark")?),
            None => (0, 0),
        };

        let metric_rows = sqlx::query(
            r#"
            SELECT metric_type, campus, month, total_events, record_count, total_wait_seconds,
                   avg_wait_seconds, total_session_seconds, days_count, avg_session_seconds
            FROM dismissal.metrics
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let metrics = metric_rows
            .iter()
            .map(metric_from_row)
            .collect::<StoreResult<BTreeMap<_, _>>>()?;

        let session_rows =
            sqlx::query("SELECT campus, date, first_arrival, last_pickup FROM dismissal.session_days")
                .fetch_all(&mut *tx)
                .await?;
        let mut open_sessions = BTreeMap::new();
        for row in &session_rows {
            open_sessions.insert(
                SessionKey {
                    campus: row.try_get("campus")?,
                    date: row.try_get("date")?,
                },
                SessionDay {
                    first_arrival: row.try_get("first_arrival")?,
                    last_pickup: row.try_get("last_pickup")?,
                },
            );
        }
        tx.commit().await?;

        Ok(Rollup {
            revision,
            watermark,
            metrics,
            open_sessions,
        })
    }

    async fn save_rollup(&self, rollup: &Rollup) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        let revision: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE dismissal.rollup_state
            SET revision = revision + 1, watermark = $2, updated_at = now()
            WHERE revision = $1
            RETURNING revision
            "#,
        )
        .bind(rollup.revision)
        .bind(rollup.watermark)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(revision) = revision else {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                expected: rollup.revision,
            });
        };

        for (key, value) in &rollup.metrics {
            let query = sqlx::query(
                r#"
                INSERT INTO dismissal.metrics
                (metric_type, campus, month, total_events, record_count, total_wait_seconds,
                 avg_wait_seconds, total_session_seconds, days_count, avg_session_seconds, revision)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT ON CONSTRAINT metrics_key DO UPDATE
                SET total_events = EXCLUDED.total_events,
                    record_count = EXCLUDED.record_count,
                    total_wait_seconds = EXCLUDED.total_wait_seconds,
                    avg_wait_seconds = EXCLUDED.avg_wait_seconds,
                    total_session_seconds = EXCLUDED.total_session_seconds,
                    days_count = EXCLUDED.days_count,
                    avg_session_seconds = EXCLUDED.avg_session_seconds,
                    revision = EXCLUDED.revision,
                    updated_at = now()
                "#,
            )
            .bind(key.metric_type.as_str())
            .bind(&key.scope.campus)
            .bind(&key.scope.month);

            let query = match value {
                MetricValue::CampusActivity { total_events } => query
                    .bind(Some(*total_events))
                    .bind(None::<i64>)
                    .bind(None::<i64>)
                    .bind(None::<f64>)
                    .bind(None::<i64>)
                    .bind(None::<i64>)
                    .bind(None::<f64>),
                MetricValue::AvgWaitTime {
                    record_count,
                    total_wait_seconds,
                    avg_wait_seconds,
                } => query
                    .bind(None::<i64>)
                    .bind(Some(*record_count))
                    .bind(Some(*total_wait_seconds))
                    .bind(Some(*avg_wait_seconds))
                    .bind(None::<i64>)
                    .bind(None::<i64>)
                    .bind(None::<f64>),
                MetricValue::SessionDuration {
                    total_session_seconds,
                    days_count,
                    avg_session_seconds,
                } => query
                    .bind(None::<i64>)
                    .bind(None::<i64>)
                    .bind(None::<i64>)
                    .bind(None::<f64>)
                    .bind(Some(*total_session_seconds))
                    .bind(Some(*days_count))
                    .bind(Some(*avg_session_seconds)),
            };
            query.bind(revision).execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM dismissal.metrics WHERE revision <> $1")
            .bind(revision)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM dismissal.session_days")
            .execute(&mut *tx)
            .await?;
        for (key, day) in &rollup.open_sessions {
            sqlx::query(
                r#"
                INSERT INTO dismissal.session_days (campus, date, first_arrival, last_pickup)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&key.campus)
            .bind(key.date)
            .bind(day.first_arrival)
            .bind(day.last_pickup)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(revision)
    }

    async fn reset_metrics(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dismissal.metrics")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dismissal.session_days")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE dismissal.rollup_state SET revision = revision + 1, watermark = 0, updated_at = now()",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_top_arrivals(&self, record: &TopArrivalsRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dismissal.top_arrivals (campus, month, arrivals, computed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (campus, month) DO UPDATE
            SET arrivals = EXCLUDED.arrivals, computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(&record.campus)
        .bind(&record.month)
        .bind(Json(&record.arrivals))
        .bind(record.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn top_arrivals(
        &self,
        campus: &str,
        month: &str,
    ) -> StoreResult<Option<TopArrivalsRecord>> {
        let row = sqlx::query(
            "SELECT arrivals, computed_at FROM dismissal.top_arrivals WHERE campus = $1 AND month = $2",
        )
        .bind(campus)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let arrivals: Json<Vec<TopArrival>> = row.try_get("arrivals")?;
        Ok(Some(TopArrivalsRecord {
            campus: campus.to_string(),
            month: month.to_string(),
            arrivals: arrivals.0,
            computed_at: row.try_get("computed_at")?,
        }))
    }
}

#[async_trait]
impl CampusDirectory for PgStore {
    async fn campuses(&self) -> StoreResult<Vec<Campus>> {
        let rows = sqlx::query("SELECT id, label, timezone FROM dismissal.campuses ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut campuses = Vec::with_capacity(rows.len());
        for row in rows {
            let timezone: String = row.try_get("timezone")?;
            let timezone = timezone.parse::<Tz>().map_err(|_| StoreError::Corrupt {
                table: "campuses",
                detail: format!("unknown timezone {timezone}"),
            })?;
            campuses.push(Campus {
                id: row.try_get("id")?,
                label: row.try_get("label")?,
                timezone,
            });
        }
        Ok(campuses)
    }
}

#[async_trait]
impl RosterDirectory for PgStore {
    async fn resolve_car_number(
        &self,
        car_number: i32,
        campus: &str,
    ) -> StoreResult<Option<RosterMatch>> {
        let rows = sqlx::query(
            r#"
            SELECT id, full_name, grade, avatar_ref, car_color
            FROM dismissal.roster_students
            WHERE campus = $1 AND car_number = $2
            ORDER BY full_name
            "#,
        )
        .bind(campus)
        .bind(car_number)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut students = Vec::with_capacity(rows.len());
        let mut car_color = None;
        for row in rows {
            if car_color.is_none() {
                car_color = row.try_get::<Option<String>, _>("car_color")?;
            }
            students.push(Student {
                id: row.try_get("id")?,
                name: row.try_get("full_name")?,
                grade: row.try_get("grade")?,
                avatar: row.try_get("avatar_ref")?,
            });
        }
        Ok(Some(RosterMatch {
            students,
            car_color,
        }))
    }
}
