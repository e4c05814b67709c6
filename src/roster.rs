use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::Student;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campus {
    pub id: String,
    pub label: String,
    pub timezone: Tz,
}

impl Campus {
    pub fn new(id: &str, label: &str, timezone: Tz) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            timezone,
        }
    }

    /// Campus-local calendar date of an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }
}

/// Students picked up by one car, plus what the roster knows about the car itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterMatch {
    pub students: Vec<Student>,
    pub car_color: Option<String>,
}

#[async_trait]
pub trait CampusDirectory: Send + Sync {
    async fn campuses(&self) -> StoreResult<Vec<Campus>>;

    async fn campus(&self, id: &str) -> StoreResult<Option<Campus>> {
        Ok(self.campuses().await?.into_iter().find(|campus| campus.id == id))
    }
}

#[async_trait]
pub trait RosterDirectory: Send + Sync {
    /// `None` when no student is registered to the car at this campus.
    async fn resolve_car_number(&self, car_number: i32, campus: &str)
        -> StoreResult<Option<RosterMatch>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RosterRow {
    pub campus: String,
    pub car_number: i32,
    pub student_name: String,
    pub grade: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub car_color: Option<String>,
    #[serde(default)]
    pub student_id: Option<Uuid>,
}

impl RosterRow {
    pub fn student(&self) -> Student {
        Student {
            id: self.student_id.unwrap_or_else(Uuid::new_v4),
            name: self.student_name.clone(),
            grade: self.grade.clone(),
            avatar: self.avatar.clone().filter(|value| !value.is_empty()),
        }
    }
}

pub fn parse_roster_csv<R: Read>(reader: R) -> anyhow::Result<Vec<RosterRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<RosterRow>().enumerate() {
        let row = result?;
        if row.car_number <= 0 {
            anyhow::bail!("row {}: car_number must be positive", index + 1);
        }
        if row.campus.trim().is_empty() {
            anyhow::bail!("row {}: campus is empty", index + 1);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Default)]
struct RosterState {
    campuses: BTreeMap<String, Campus>,
    cars: HashMap<(String, i32), RosterMatch>,
}

/// Roster and campus directory held in memory, for tests and embedders.
#[derive(Default)]
pub struct MemoryRoster {
    state: RwLock<RosterState>,
}

impl MemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campus(&self, campus: Campus) {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.campuses.insert(campus.id.clone(), campus);
    }

    pub fn add_student(&self, campus: &str, car_number: i32, student: Student, car_color: Option<&str>) {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = state
            .cars
            .entry((campus.to_string(), car_number))
            .or_insert_with(|| RosterMatch {
                students: Vec::new(),
                car_color: None,
            });
        entry.students.push(student);
        if let Some(color) = car_color {
            entry.car_color = Some(color.to_string());
        }
    }

    pub fn load_rows(&self, rows: &[RosterRow]) {
        for row in rows {
            self.add_student(&row.campus, row.car_number, row.student(), row.car_color.as_deref());
        }
    }
}

#[async_trait]
impl CampusDirectory for MemoryRoster {
    async fn campuses(&self) -> StoreResult<Vec<Campus>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.campuses.values().cloned().collect())
    }
}

#[async_trait]
impl RosterDirectory for MemoryRoster {
    async fn resolve_car_number(
        &self,
        car_number: i32,
        campus: &str,
    ) -> StoreResult<Option<RosterMatch>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state
            .cars
            .get(&(campus.to_string(), car_number))
            .filter(|found| !found.students.is_empty())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_roster_csv_with_optional_columns() {
        let data = "campus,car_number,student_name,grade,avatar,car_color,student_id\n\
                    Main,101,Avery Lee,3,,blue,\n\
                    Main,101,Jules Lee,5,avatars/jules.png,,\n";
        let rows = parse_roster_csv(data.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].car_color.as_deref(), Some("blue"));
        assert_eq!(rows[1].student().avatar.as_deref(), Some("avatars/jules.png"));
        assert!(rows[0].student().avatar.is_none());
    }

    #[test]
    fn rejects_non_positive_car_numbers() {
        let data = "campus,car_number,student_name,grade\nMain,0,Avery Lee,3\n";
        assert!(parse_roster_csv(data.as_bytes()).is_err());
    }

    #[test]
    fn local_date_follows_campus_timezone() {
        let campus = Campus::new("Main", "Main Campus", chrono_tz::America::Chicago);
        let late_evening_utc = Utc.with_ymd_and_hms(2026, 3, 3, 2, 30, 0).unwrap();
        assert_eq!(
            campus.local_date(late_evening_utc),
            NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
        );
    }

    #[tokio::test]
    async fn memory_roster_groups_students_by_car() {
        let roster = MemoryRoster::new();
        let rows = parse_roster_csv(
            "campus,car_number,student_name,grade,car_color\nMain,7,A,1,red\nMain,7,B,2,\n".as_bytes(),
        )
        .unwrap();
        roster.load_rows(&rows);

        let found = roster.resolve_car_number(7, "Main").await.unwrap().unwrap();
        assert_eq!(found.students.len(), 2);
        assert_eq!(found.car_color.as_deref(), Some("red"));
        assert!(roster.resolve_car_number(7, "North").await.unwrap().is_none());
    }
}
