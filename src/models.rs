use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::roster::RosterMatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Left,
    Right,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Left, Lane::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Left => "left",
            Lane::Right => "right",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = ErrorCode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Lane::Left),
            "right" => Ok(Lane::Right),
            _ => Err(ErrorCode::InvalidLane),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: Uuid,
    pub name: String,
    pub grade: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: Uuid,
    pub campus: String,
    pub lane: Lane,
    pub position: i32,
    pub car_number: i32,
    pub students: Vec<Student>,
    pub queued_at: DateTime<Utc>,
    pub car_color: Option<String>,
}

/// An admission request. The store resolves the roster and assigns the position.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub campus: String,
    pub lane: Lane,
    pub car_number: i32,
    pub queued_at: DateTime<Utc>,
}

impl NewQueueEntry {
    pub fn into_entry(self, position: i32, found: RosterMatch) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            campus: self.campus,
            lane: self.lane,
            position,
            car_number: self.car_number,
            students: found.students,
            queued_at: self.queued_at,
            car_color: found.car_color,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Uuid,
    /// Ledger order, assigned by the store on append. Zero until persisted.
    pub sequence: i64,
    pub campus: String,
    pub car_number: i32,
    pub date: NaiveDate,
    pub queued_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub wait_time_seconds: i64,
}

impl HistoryRecord {
    pub fn close(entry: &QueueEntry, completed_at: DateTime<Utc>, date: NaiveDate) -> Self {
        HistoryRecord {
            id: Uuid::new_v4(),
            sequence: 0,
            campus: entry.campus.clone(),
            car_number: entry.car_number,
            date,
            queued_at: entry.queued_at,
            completed_at,
            wait_time_seconds: wait_time_seconds(entry.queued_at, completed_at),
        }
    }

    pub fn month(&self) -> String {
        month_of(self.date)
    }

    /// Both ends of the lifecycle fall on the same UTC calendar day.
    pub fn same_utc_day(&self) -> bool {
        self.queued_at.date_naive() == self.completed_at.date_naive()
    }
}

pub fn wait_time_seconds(queued_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> i64 {
    let millis = (completed_at - queued_at).num_milliseconds();
    (millis / 1000).max(0)
}

/// `YYYY-MM`, the first seven characters of the ledger date string.
pub fn month_of(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CampusActivity,
    AvgWaitTime,
    SessionDuration,
}

impl MetricType {
    pub const ALL: [MetricType; 3] = [
        MetricType::CampusActivity,
        MetricType::AvgWaitTime,
        MetricType::SessionDuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::CampusActivity => "campus_activity",
            MetricType::AvgWaitTime => "avg_wait_time",
            MetricType::SessionDuration => "session_duration",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "campus_activity" => Ok(MetricType::CampusActivity),
            "avg_wait_time" => Ok(MetricType::AvgWaitTime),
            "session_duration" => Ok(MetricType::SessionDuration),
            other => Err(format!("unknown metric type {other}")),
        }
    }
}

/// Aggregation scope: campus and month both absent is the global all-time row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub campus: Option<String>,
    pub month: Option<String>,
}

impl Scope {
    pub fn global() -> Self {
        Scope {
            campus: None,
            month: None,
        }
    }

    /// The four scopes every ledger record contributes to.
    pub fn fan_out(campus: &str, month: &str) -> [Scope; 4] {
        [
            Scope::global(),
            Scope {
                campus: None,
                month: Some(month.to_string()),
            },
            Scope {
                campus: Some(campus.to_string()),
                month: None,
            },
            Scope {
                campus: Some(campus.to_string()),
                month: Some(month.to_string()),
            },
        ]
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let campus = self.campus.as_deref().unwrap_or("all campuses");
        let month = self.month.as_deref().unwrap_or("all time");
        write!(f, "{campus} / {month}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKey {
    pub metric_type: MetricType,
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metricType", rename_all = "snake_case")]
pub enum MetricValue {
    #[serde(rename_all = "camelCase")]
    CampusActivity { total_events: i64 },
    #[serde(rename_all = "camelCase")]
    AvgWaitTime {
        record_count: i64,
        total_wait_seconds: i64,
        avg_wait_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    SessionDuration {
        total_session_seconds: i64,
        days_count: i64,
        avg_session_seconds: f64,
    },
}

impl MetricValue {
    pub fn empty(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::CampusActivity => MetricValue::CampusActivity { total_events: 0 },
            MetricType::AvgWaitTime => MetricValue::AvgWaitTime {
                record_count: 0,
                total_wait_seconds: 0,
                avg_wait_seconds: 0.0,
            },
            MetricType::SessionDuration => MetricValue::SessionDuration {
                total_session_seconds: 0,
                days_count: 0,
                avg_session_seconds: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub scope: Scope,
    #[serde(flatten)]
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopArrival {
    pub rank: u32,
    pub car_number: i32,
    pub queued_at: DateTime<Utc>,
    pub arrival_time: NaiveTime,
    pub visits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopArrivalsRecord {
    pub campus: String,
    pub month: String,
    pub arrivals: Vec<TopArrival>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub campus: String,
    pub left_lane: Vec<QueueEntry>,
    pub right_lane: Vec<QueueEntry>,
}

impl QueueSnapshot {
    pub fn empty(campus: &str) -> Self {
        QueueSnapshot {
            campus: campus.to_string(),
            left_lane: Vec::new(),
            right_lane: Vec::new(),
        }
    }

    /// Builds a snapshot from unordered entries, sorting each lane by position.
    pub fn from_entries(campus: &str, entries: impl IntoIterator<Item = QueueEntry>) -> Self {
        let mut snapshot = QueueSnapshot::empty(campus);
        for entry in entries {
            match entry.lane {
                Lane::Left => snapshot.left_lane.push(entry),
                Lane::Right => snapshot.right_lane.push(entry),
            }
        }
        snapshot.left_lane.sort_by_key(|entry| entry.position);
        snapshot.right_lane.sort_by_key(|entry| entry.position);
        snapshot
    }

    pub fn lane(&self, lane: Lane) -> &[QueueEntry] {
        match lane {
            Lane::Left => &self.left_lane,
            Lane::Right => &self.right_lane,
        }
    }

    pub fn len(&self) -> usize {
        self.left_lane.len() + self.right_lane.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry_queued_at(queued_at: DateTime<Utc>) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            campus: "Main".to_string(),
            lane: Lane::Left,
            position: 1,
            car_number: 101,
            students: Vec::new(),
            queued_at,
            car_color: None,
        }
    }

    #[test]
    fn lane_parses_case_insensitively() {
        assert_eq!("Left".parse::<Lane>(), Ok(Lane::Left));
        assert_eq!(" right ".parse::<Lane>(), Ok(Lane::Right));
        assert_eq!("middle".parse::<Lane>(), Err(ErrorCode::InvalidLane));
    }

    #[test]
    fn wait_time_floors_to_whole_seconds() {
        let queued = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
        let completed = queued + chrono::Duration::milliseconds(90_999);
        assert_eq!(wait_time_seconds(queued, completed), 90);
    }

    #[test]
    fn wait_time_never_goes_negative() {
        let queued = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
        let completed = queued - chrono::Duration::seconds(5);
        assert_eq!(wait_time_seconds(queued, completed), 0);
    }

    #[test]
    fn closing_an_entry_captures_the_lifecycle() {
        let queued = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
        let completed = Utc.with_ymd_and_hms(2026, 3, 2, 14, 7, 30).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let record = HistoryRecord::close(&entry_queued_at(queued), completed, date);

        assert_eq!(record.car_number, 101);
        assert_eq!(record.wait_time_seconds, 450);
        assert_eq!(record.month(), "2026-03");
        assert!(record.same_utc_day());
    }

    #[test]
    fn scope_fan_out_covers_four_rollups() {
        let scopes = Scope::fan_out("Main", "2026-03");
        assert_eq!(scopes[0], Scope::global());
        assert_eq!(scopes[1].month.as_deref(), Some("2026-03"));
        assert!(scopes[1].campus.is_none());
        assert_eq!(scopes[2].campus.as_deref(), Some("Main"));
        assert!(scopes[2].month.is_none());
        assert_eq!(scopes[3].campus.as_deref(), Some("Main"));
        assert_eq!(scopes[3].month.as_deref(), Some("2026-03"));
    }
}
