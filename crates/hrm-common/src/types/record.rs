//! Validated record shapes
//!
//! A [`Record`] only exists after validation succeeded; every field is typed
//! and in range.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TableKind;

/// A department. The id is supplied by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: i32,
    pub name: String,
}

/// A job title. Same shape as [`Department`], separate namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    pub name: String,
}

/// A hired employee. When `id` is `None` the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiredEmployee {
    pub id: Option<i32>,
    pub name: String,
    pub hired_at: DateTime<Utc>,
    pub department_id: i32,
    pub job_id: i32,
}

/// A validated record of one of the three tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Record {
    Department(Department),
    Job(Job),
    HiredEmployee(HiredEmployee),
}

impl Record {
    pub fn kind(&self) -> TableKind {
        match self {
            Record::Department(_) => TableKind::Departments,
            Record::Job(_) => TableKind::Jobs,
            Record::HiredEmployee(_) => TableKind::HiredEmployees,
        }
    }

    /// Explicit id, if the record carries one
    pub fn id(&self) -> Option<i32> {
        match self {
            Record::Department(d) => Some(d.id),
            Record::Job(j) => Some(j.id),
            Record::HiredEmployee(e) => e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Record::Department(d) => &d.name,
            Record::Job(j) => &j.name,
            Record::HiredEmployee(e) => &e.name,
        }
    }
}

impl From<Department> for Record {
    fn from(value: Department) -> Self {
        Record::Department(value)
    }
}

impl From<Job> for Record {
    fn from(value: Job) -> Self {
        Record::Job(value)
    }
}

impl From<HiredEmployee> for Record {
    fn from(value: HiredEmployee) -> Self {
        Record::HiredEmployee(value)
    }
}
