use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::models::QueueSnapshot;
use crate::store::QueueStore;

const DEFAULT_CAPACITY: usize = 64;

/// Per-campus fan-out of committed queue snapshots.
///
/// A lagging subscriber drops old snapshots rather than blocking writers; since each
/// message is a full snapshot, the next one received is still authoritative.
pub struct QueuePublisher {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<QueueSnapshot>>>>,
    capacity: usize,
}

impl Default for QueuePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueuePublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, campus: &str) -> broadcast::Receiver<Arc<QueueSnapshot>> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(campus.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns how many subscribers received the snapshot.
    pub fn publish(&self, snapshot: QueueSnapshot) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = channels.get(&snapshot.campus) else {
            return 0;
        };
        let campus = snapshot.campus.clone();
        match sender.send(Arc::new(snapshot)) {
            Ok(delivered) => {
                trace!(campus = %campus, delivered, "queue snapshot published");
                delivered
            }
            Err(_) => {
                // Last subscriber went away.
                channels.remove(&campus);
                0
            }
        }
    }

    /// Reads the committed queue of `campus` and publishes it, if anyone listens.
    pub async fn refresh(&self, store: &dyn QueueStore, campus: &str) -> usize {
        if self.subscriber_count(campus) == 0 {
            return 0;
        }
        match store.snapshot(campus).await {
            Ok(snapshot) => self.publish(snapshot),
            Err(err) => {
                warn!(campus, error = %err, "failed to read snapshot for subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self, campus: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .get(campus)
            .map_or(0, |sender| sender.receiver_count())
    }
}
