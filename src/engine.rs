use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::access::{Actor, Operation};
use crate::clock::Clock;
use crate::error::{ErrorCode, QueueError, Result};
use crate::models::{Lane, NewQueueEntry, QueueEntry, QueueSnapshot};
use crate::publish::QueuePublisher;
use crate::roster::{Campus, CampusDirectory, RosterDirectory};
use crate::store::{Admission, QueueStore};

/// Parses operator input into a car number. Anything but a positive integer is rejected.
pub fn parse_car_number(raw: &str) -> std::result::Result<i32, ErrorCode> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ErrorCode::InvalidCarNumber)?;
    validate_car_number(value)
}

fn validate_car_number(value: i64) -> std::result::Result<i32, ErrorCode> {
    if value <= 0 {
        return Err(ErrorCode::InvalidCarNumber);
    }
    i32::try_from(value).map_err(|_| ErrorCode::InvalidCarNumber)
}

/// The queue engine: admission, dispatch, clearing and live reads for every campus.
///
/// Mutations on one campus are serialized through a per-campus gate that is held
/// across the store transaction and the snapshot publish, so subscribers observe
/// snapshots in commit order.
pub struct DismissalEngine {
    store: Arc<dyn QueueStore>,
    roster: Arc<dyn RosterDirectory>,
    campuses: Arc<dyn CampusDirectory>,
    publisher: Arc<QueuePublisher>,
    clock: Arc<dyn Clock>,
    gates: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DismissalEngine {
    pub fn new(
        store: Arc<dyn QueueStore>,
        roster: Arc<dyn RosterDirectory>,
        campuses: Arc<dyn CampusDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            roster,
            campuses,
            publisher: Arc::new(QueuePublisher::default()),
            clock,
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> Arc<QueuePublisher> {
        Arc::clone(&self.publisher)
    }

    fn gate(&self, campus: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(gates.entry(campus.to_string()).or_default())
    }

    async fn resolve_campus(&self, campus: &str) -> Result<Campus> {
        if campus.trim().is_empty() {
            return Err(ErrorCode::InvalidCampus.into());
        }
        self.campuses
            .campus(campus)
            .await?
            .ok_or(QueueError::Rejected(ErrorCode::InvalidCampus))
    }

    /// Admits a car at the tail of `lane`.
    pub async fn add_car(
        &self,
        actor: &Actor,
        car_number: i64,
        campus: &str,
        lane: Lane,
    ) -> Result<QueueEntry> {
        let car_number = validate_car_number(car_number).inspect_err(|code| {
            debug!(car_number, campus, code = %code, "admission rejected");
        })?;
        let campus = self.resolve_campus(campus).await?;
        actor.authorize(Operation::AddCar, &campus.id)?;

        let gate = self.gate(&campus.id);
        let _guard = gate.lock().await;

        let admission = self
            .store
            .admit(
                NewQueueEntry {
                    campus: campus.id.clone(),
                    lane,
                    car_number,
                    queued_at: self.clock.now(),
                },
                self.roster.as_ref(),
            )
            .await?;

        match admission {
            Admission::Admitted(entry) => {
                info!(
                    campus = %entry.campus,
                    lane = %entry.lane,
                    car_number = entry.car_number,
                    position = entry.position,
                    "car queued"
                );
                self.publish(&campus.id).await;
                Ok(entry)
            }
            Admission::NoStudents => {
                debug!(car_number, campus = %campus.id, "no students registered to car");
                Err(ErrorCode::NoStudentsFound.into())
            }
            Admission::Duplicate => {
                debug!(car_number, campus = %campus.id, "car already in queue");
                Err(ErrorCode::CarAlreadyInQueue.into())
            }
        }
    }

    /// Dispatches one entry, returning its car number.
    pub async fn remove_car(&self, actor: &Actor, entry_id: Uuid) -> Result<i32> {
        let Some(entry) = self.store.find_entry(entry_id).await? else {
            return Err(ErrorCode::NotFound.into());
        };
        actor.authorize(Operation::RemoveCar, &entry.campus)?;

        let completed_at = self.clock.now();
        let date = match self.campuses.campus(&entry.campus).await? {
            Some(campus) => campus.local_date(completed_at),
            None => completed_at.date_naive(),
        };

        let gate = self.gate(&entry.campus);
        let _guard = gate.lock().await;

        let Some(record) = self.store.dispatch(entry_id, completed_at, date).await? else {
            // Lost a race with another dispatcher or a clear.
            return Err(ErrorCode::NotFound.into());
        };
        info!(
            campus = %record.campus,
            lane = %entry.lane,
            car_number = record.car_number,
            wait_time_seconds = record.wait_time_seconds,
            "car dispatched"
        );
        self.publish(&record.campus).await;
        Ok(record.car_number)
    }

    /// Dispatches every active entry of one campus, returning how many were cleared.
    pub async fn clear_all_cars(&self, actor: &Actor, campus: &str) -> Result<usize> {
        let campus = self.resolve_campus(campus).await?;
        actor.authorize(Operation::ClearAll, &campus.id)?;

        let completed_at = self.clock.now();
        let gate = self.gate(&campus.id);
        let _guard = gate.lock().await;

        let records = self
            .store
            .clear_campus(&campus.id, completed_at, campus.local_date(completed_at))
            .await?;
        info!(campus = %campus.id, cleared = records.len(), "campus queue cleared");
        if !records.is_empty() {
            self.publish(&campus.id).await;
        }
        Ok(records.len())
    }

    pub async fn get_current_queue(&self, actor: &Actor, campus: &str) -> Result<QueueSnapshot> {
        let campus = self.resolve_campus(campus).await?;
        actor.authorize(Operation::Read, &campus.id)?;
        Ok(self.store.snapshot(&campus.id).await?)
    }

    /// Current snapshot plus a receiver for every snapshot committed after it.
    pub async fn subscribe(
        &self,
        actor: &Actor,
        campus: &str,
    ) -> Result<(QueueSnapshot, broadcast::Receiver<Arc<QueueSnapshot>>)> {
        let campus = self.resolve_campus(campus).await?;
        actor.authorize(Operation::Read, &campus.id)?;
        let gate = self.gate(&campus.id);
        let _guard = gate.lock().await;
        let receiver = self.publisher.subscribe(&campus.id);
        let snapshot = self.store.snapshot(&campus.id).await?;
        Ok((snapshot, receiver))
    }

    /// Active car count for every known campus the actor may read, zero included.
    pub async fn get_car_counts_by_campus(&self, actor: &Actor) -> Result<BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, usize> = self
            .campuses
            .campuses()
            .await?
            .into_iter()
            .filter(|campus| actor.authorize(Operation::Read, &campus.id).is_ok())
            .map(|campus| (campus.id, 0))
            .collect();
        for (campus, count) in self.store.counts_by_campus().await? {
            if let Some(slot) = counts.get_mut(&campus) {
                *slot = count;
            }
        }
        Ok(counts)
    }

    /// Called with the campus gate held, right after a commit.
    async fn publish(&self, campus: &str) {
        self.publisher.refresh(self.store.as_ref(), campus).await;
    }
}
