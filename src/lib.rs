//! Car-pickup dismissal queues for school campuses.
//!
//! The crate exposes:
//! - [`DismissalEngine`]: admission, dispatch, clearing and live reads of two-lane campus queues.
//! - [`MetricsAggregator`] / [`TopArrivalsCalculator`]: batch rollups over the history ledger.
//! - [`store`]: the persistence traits with in-memory and Postgres implementations.

pub mod access;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod publish;
pub mod reconcile;
pub mod report;
pub mod roster;
pub mod store;
pub mod top_arrivals;

pub use access::{Actor, Role};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{parse_car_number, DismissalEngine};
pub use error::{ErrorCode, QueueError, StoreError};
pub use metrics::{recompute, MetricsAggregator, Rollup};
pub use models::{HistoryRecord, Lane, Metric, QueueEntry, QueueSnapshot, TopArrivalsRecord};
pub use publish::QueuePublisher;
pub use top_arrivals::TopArrivalsCalculator;
