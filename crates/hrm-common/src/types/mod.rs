//! Common types used across HRM
//!
//! The migration only knows three tables. Each has a fixed column set in the
//! upstream files and a fixed record shape once validated.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::HrmError;

pub mod raw;
pub mod record;
pub mod rejection;

pub use raw::{RawEmployee, RawNamed, RawRecord};
pub use record::{Department, HiredEmployee, Job, Record};
pub use rejection::{Rejection, RejectionKind};

/// Largest id accepted for any table (PostgreSQL `INTEGER`).
pub const MAX_ID: i64 = i32::MAX as i64;

/// Target table of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Departments,
    Jobs,
    HiredEmployees,
}

impl TableKind {
    /// All tables in dependency order: employees reference the other two.
    pub const LOAD_ORDER: [TableKind; 3] =
        [TableKind::Departments, TableKind::Jobs, TableKind::HiredEmployees];

    /// Name of the table in the relational store and in object-storage paths
    pub fn table_name(&self) -> &'static str {
        match self {
            TableKind::Departments => "departments",
            TableKind::Jobs => "jobs",
            TableKind::HiredEmployees => "hired_employees",
        }
    }

    /// Columns of the upstream delimited file, in positional order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Departments | TableKind::Jobs => &["id", "name"],
            TableKind::HiredEmployees => &["id", "name", "datetime", "department_id", "job_id"],
        }
    }

    /// Fields that must be present and non-blank. Employee ids are optional
    /// because the store assigns them when absent.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            TableKind::Departments | TableKind::Jobs => &["id", "name"],
            TableKind::HiredEmployees => &["name", "datetime", "department_id", "job_id"],
        }
    }

    /// Default upstream file name (`departments.csv`, ...)
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.table_name())
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for TableKind {
    type Err = HrmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "departments" => Ok(TableKind::Departments),
            "jobs" => Ok(TableKind::Jobs),
            "hired_employees" => Ok(TableKind::HiredEmployees),
            other => Err(HrmError::UnknownTable(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_kind_round_trips_through_name() {
        for kind in TableKind::LOAD_ORDER {
            assert_eq!(kind.table_name().parse::<TableKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let err = "payroll".parse::<TableKind>().unwrap_err();
        assert!(matches!(err, HrmError::UnknownTable(ref name) if name == "payroll"));
    }

    #[test]
    fn test_load_order_puts_employees_last() {
        assert_eq!(TableKind::LOAD_ORDER[2], TableKind::HiredEmployees);
        assert!(TableKind::Departments < TableKind::HiredEmployees);
    }

    #[test]
    fn test_employee_id_is_not_required() {
        let required = TableKind::HiredEmployees.required_fields();
        assert!(!required.contains(&"id"));
        assert!(TableKind::Jobs.required_fields().contains(&"id"));
    }
}
