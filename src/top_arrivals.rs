use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::models::{month_of, HistoryRecord, TopArrival, TopArrivalsRecord};
use crate::roster::{Campus, CampusDirectory};
use crate::store::{HistoryLedger, MetricStore};

struct CarBest {
    queued_at: DateTime<Utc>,
    arrival_time: NaiveTime,
    visits: u32,
}

/// Ranks the month's cars by their earliest campus-local arrival time of day.
/// Each car holds at most one slot; ties go to the lower car number.
pub fn compute_top_arrivals(
    records: &[HistoryRecord],
    campus: &Campus,
    month: &str,
    limit: usize,
    computed_at: DateTime<Utc>,
) -> TopArrivalsRecord {
    let mut best: HashMap<i32, CarBest> = HashMap::new();
    for record in records
        .iter()
        .filter(|record| record.campus == campus.id && record.month() == month)
    {
        let arrival_time = record.queued_at.with_timezone(&campus.timezone).time();
        best.entry(record.car_number)
            .and_modify(|current| {
                current.visits += 1;
                if arrival_time < current.arrival_time {
                    current.arrival_time = arrival_time;
                    current.queued_at = record.queued_at;
                }
            })
            .or_insert(CarBest {
                queued_at: record.queued_at,
                arrival_time,
                visits: 1,
            });
    }

    let mut ranked: Vec<(i32, CarBest)> = best.into_iter().collect();
    ranked.sort_by(|(car_a, a), (car_b, b)| {
        a.arrival_time
            .cmp(&b.arrival_time)
            .then(car_a.cmp(car_b))
    });

    let arrivals = ranked
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(index, (car_number, car))| TopArrival {
            rank: index as u32 + 1,
            car_number,
            queued_at: car.queued_at,
            arrival_time: car.arrival_time,
            visits: car.visits,
        })
        .collect();

    TopArrivalsRecord {
        campus: campus.id.clone(),
        month: month.to_string(),
        arrivals,
        computed_at,
    }
}

/// Monthly batch job. Each run overwrites the (campus, month) lists it touches.
pub struct TopArrivalsCalculator {
    ledger: Arc<dyn HistoryLedger>,
    store: Arc<dyn MetricStore>,
    campuses: Arc<dyn CampusDirectory>,
    clock: Arc<dyn Clock>,
    limit: usize,
    gate: Mutex<()>,
}

impl TopArrivalsCalculator {
    pub fn new(
        ledger: Arc<dyn HistoryLedger>,
        store: Arc<dyn MetricStore>,
        campuses: Arc<dyn CampusDirectory>,
        clock: Arc<dyn Clock>,
        limit: usize,
    ) -> Self {
        Self {
            ledger,
            store,
            campuses,
            clock,
            limit,
            gate: Mutex::new(()),
        }
    }

    /// The month a campus is in right now, by its own calendar. Ledger dates are
    /// campus-local, so a UTC month would be off for hours around every boundary.
    pub fn current_month(&self, campus: &Campus) -> String {
        month_of(campus.local_date(self.clock.now()))
    }

    /// Recomputes every campus for `month`, defaulting to each campus's current one.
    pub async fn run(&self, month: Option<&str>) -> StoreResult<Vec<TopArrivalsRecord>> {
        let _guard = self.gate.lock().await;
        let computed_at = self.clock.now();

        let mut written = Vec::new();
        for campus in self.campuses.campuses().await? {
            let month = month.map_or_else(|| self.current_month(&campus), str::to_string);
            let records = self
                .ledger
                .history_for_month(&month, Some(&campus.id))
                .await?;
            let ranked = compute_top_arrivals(&records, &campus, &month, self.limit, computed_at);
            self.store.replace_top_arrivals(&ranked).await?;
            info!(
                campus = %campus.id,
                month = %month,
                records = records.len(),
                ranked = ranked.arrivals.len(),
                "top arrivals recomputed"
            );
            written.push(ranked);
        }
        Ok(written)
    }
}
