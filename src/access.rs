use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Allocator,
    Dispatcher,
    Viewer,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Allocator => "allocator",
            Role::Dispatcher => "dispatcher",
            Role::Viewer => "viewer",
            Role::Admin => "admin",
        };
        f.write_str(label)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allocator" => Ok(Role::Allocator),
            "dispatcher" => Ok(Role::Dispatcher),
            "viewer" => Ok(Role::Viewer),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddCar,
    RemoveCar,
    ClearAll,
    Read,
}

/// The resolved caller. Resolution itself belongs to the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub role: Role,
    /// `None` grants every campus.
    pub campus_scope: Option<String>,
}

impl Actor {
    pub fn new(role: Role, campus_scope: Option<String>) -> Self {
        Self { role, campus_scope }
    }

    pub fn admin() -> Self {
        Self::new(Role::Admin, None)
    }

    pub fn permits(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => true,
            Operation::AddCar => matches!(self.role, Role::Allocator | Role::Admin),
            Operation::RemoveCar | Operation::ClearAll => {
                matches!(self.role, Role::Dispatcher | Role::Admin)
            }
        }
    }

    pub fn covers(&self, campus: &str) -> bool {
        self.campus_scope
            .as_deref()
            .map_or(true, |scope| scope == campus)
    }

    pub fn authorize(&self, operation: Operation, campus: &str) -> Result<(), ErrorCode> {
        if self.permits(operation) && self.covers(campus) {
            Ok(())
        } else {
            Err(ErrorCode::Forbidden)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_gate_mutations() {
        let allocator = Actor::new(Role::Allocator, None);
        let dispatcher = Actor::new(Role::Dispatcher, None);
        let viewer = Actor::new(Role::Viewer, None);

        assert!(allocator.authorize(Operation::AddCar, "Main").is_ok());
        assert_eq!(
            allocator.authorize(Operation::RemoveCar, "Main"),
            Err(ErrorCode::Forbidden)
        );
        assert!(dispatcher.authorize(Operation::ClearAll, "Main").is_ok());
        assert_eq!(
            viewer.authorize(Operation::AddCar, "Main"),
            Err(ErrorCode::Forbidden)
        );
        assert!(viewer.authorize(Operation::Read, "North").is_ok());
    }

    #[test]
    fn campus_scope_limits_reach() {
        let scoped = Actor::new(Role::Admin, Some("North".to_string()));
        assert!(scoped.authorize(Operation::AddCar, "North").is_ok());
        assert_eq!(
            scoped.authorize(Operation::AddCar, "Main"),
            Err(ErrorCode::Forbidden)
        );
    }
}
