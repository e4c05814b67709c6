use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::QueueEntry;

/// Validation outcomes returned to callers. None of these are retried by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCarNumber,
    InvalidCampus,
    InvalidLane,
    NoStudentsFound,
    CarAlreadyInQueue,
    NotFound,
    Forbidden,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCarNumber => "INVALID_CAR_NUMBER",
            ErrorCode::InvalidCampus => "INVALID_CAMPUS",
            ErrorCode::InvalidLane => "INVALID_LANE",
            ErrorCode::NoStudentsFound => "NO_STUDENTS_FOUND",
            ErrorCode::CarAlreadyInQueue => "CAR_ALREADY_IN_QUEUE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("rollup revision {expected} is stale, another aggregation committed first")]
    Conflict { expected: i64 },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("rejected: {0}")]
    Rejected(ErrorCode),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            QueueError::Rejected(code) => Some(*code),
            QueueError::Store(_) => None,
        }
    }

    /// Only infrastructure failures are worth a caller-side retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Store(_))
    }
}

impl From<ErrorCode> for QueueError {
    fn from(code: ErrorCode) -> Self {
        QueueError::Rejected(code)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCarResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub car: Option<QueueEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl AddCarResponse {
    /// Folds a validation rejection into the response; store failures stay errors.
    pub fn from_result(result: Result<QueueEntry>) -> std::result::Result<Self, StoreError> {
        match result {
            Ok(car) => Ok(AddCarResponse {
                success: true,
                car: Some(car),
                error: None,
            }),
            Err(QueueError::Rejected(code)) => Ok(AddCarResponse {
                success: false,
                car: None,
                error: Some(code),
            }),
            Err(QueueError::Store(err)) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCarResponse {
    pub car_number: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearAllResponse {
    pub success: bool,
    pub cleared_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_in_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::CarAlreadyInQueue).unwrap();
        assert_eq!(json, "\"CAR_ALREADY_IN_QUEUE\"");
        assert_eq!(ErrorCode::NoStudentsFound.to_string(), "NO_STUDENTS_FOUND");
    }

    #[test]
    fn rejected_admission_becomes_unsuccessful_response() {
        let response =
            AddCarResponse::from_result(Err(QueueError::Rejected(ErrorCode::InvalidCampus)))
                .unwrap();
        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorCode::InvalidCampus));
        assert!(response.car.is_none());
    }

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(!QueueError::from(ErrorCode::NotFound).is_retryable());
        let conflict = QueueError::Store(StoreError::Conflict { expected: 3 });
        assert!(conflict.is_retryable());
        assert_eq!(conflict.code(), None);
    }
}
