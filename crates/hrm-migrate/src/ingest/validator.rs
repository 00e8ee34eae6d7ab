//! Record validation
//!
//! [`RecordValidator`] turns a [`RawRecord`] into either a typed [`Record`] or
//! a [`Rejection`]. Business-rule violations are returned as values; only a
//! failing reference lookup surfaces as an error.
//!
//! Rules, in order:
//!
//! 1. Every required field is present. All missing fields are reported
//!    together and no further rule runs.
//! 2. Format: name length and charset, employee `datetime` parseable and not
//!    in the future, ids positive integers within `INTEGER` range. Every
//!    format problem of the record is reported in one rejection.
//! 3. Employee `department_id` and `job_id` reference existing rows.
//! 4. An explicit id is not already present in the target table.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use hrm_common::types::{
    Department, HiredEmployee, Job, RawRecord, Record, Rejection, RejectionKind, TableKind, MAX_ID,
};
use regex::Regex;
use tracing::warn;

use crate::db::DbResult;

/// Inclusive bounds on name length, in characters
pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 255;

/// Letters (including combining marks), whitespace, periods and hyphens
const NAME_PATTERN: &str = r"^[\p{L}\p{M}\s.\-]+$";

/// Accepted layouts for naive employee timestamps, interpreted as UTC
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Existence checks against the current contents of the store
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    async fn exists(&self, table: TableKind, id: i32) -> DbResult<bool>;
}

/// Lookup used while a table is being replaced: its own ids count as absent
/// because the table is truncated before the load, foreign keys are checked
/// against the wrapped lookup.
pub struct ReplacingTarget<'a> {
    inner: &'a dyn ReferenceLookup,
    target: TableKind,
}

impl<'a> ReplacingTarget<'a> {
    pub fn new(inner: &'a dyn ReferenceLookup, target: TableKind) -> Self {
        Self { inner, target }
    }
}

#[async_trait]
impl ReferenceLookup for ReplacingTarget<'_> {
    async fn exists(&self, table: TableKind, id: i32) -> DbResult<bool> {
        if table == self.target {
            return Ok(false);
        }
        self.inner.exists(table, id).await
    }
}

/// Outcome of validating one record
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid(Record),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }
}

pub struct RecordValidator {
    name_pattern: Regex,
}

impl RecordValidator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            name_pattern: Regex::new(NAME_PATTERN)?,
        })
    }

    /// Validate `raw` for its own table kind against the current time
    pub async fn validate(&self, raw: &RawRecord, lookup: &dyn ReferenceLookup) -> DbResult<Verdict> {
        self.validate_at(raw, lookup, Utc::now()).await
    }

    /// Like [`validate`](Self::validate), but a lookup failure becomes an
    /// `INFRASTRUCTURE_ERROR` rejection so the caller can keep going.
    pub async fn validate_or_reject(&self, raw: &RawRecord, lookup: &dyn ReferenceLookup) -> Verdict {
        match self.validate(raw, lookup).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(table = %raw.kind(), error = %e, "Reference lookup failed during validation");
                Verdict::Rejected(Rejection::new(
                    RejectionKind::Infrastructure,
                    format!("reference lookup failed: {}", e),
                    raw,
                ))
            }
        }
    }

    /// Validate with an explicit notion of "now" for the future-date rule
    pub async fn validate_at(
        &self,
        raw: &RawRecord,
        lookup: &dyn ReferenceLookup,
        now: DateTime<Utc>,
    ) -> DbResult<Verdict> {
        let kind = raw.kind();

        let missing: Vec<String> = kind
            .required_fields()
            .iter()
            .filter(|field| raw.present(field).is_none())
            .map(|field| field.to_string())
            .collect();
        if !missing.is_empty() {
            return Ok(Verdict::Rejected(Rejection::missing_fields(missing, raw)));
        }

        let mut problems = Vec::new();
        let candidate = self.parse_fields(raw, now, &mut problems);
        let record = match candidate {
            Some(record) if problems.is_empty() => record,
            _ => {
                return Ok(Verdict::Rejected(Rejection::new(
                    RejectionKind::Format,
                    problems.join("; "),
                    raw,
                )))
            }
        };

        if let Record::HiredEmployee(employee) = &record {
            for (table, field, id) in [
                (TableKind::Departments, "department_id", employee.department_id),
                (TableKind::Jobs, "job_id", employee.job_id),
            ] {
                if !lookup.exists(table, id).await? {
                    return Ok(Verdict::Rejected(Rejection::new(
                        RejectionKind::ReferentialIntegrity,
                        format!("{} {} does not exist in {}", field, id, table),
                        raw,
                    )));
                }
            }
        }

        if let Some(id) = record.id() {
            if lookup.exists(kind, id).await? {
                return Ok(Verdict::Rejected(Rejection::new(
                    RejectionKind::DuplicateId,
                    format!("id {} already exists in {}", id, kind),
                    raw,
                )));
            }
        }

        Ok(Verdict::Valid(record))
    }

    /// Parse every field, pushing a message per format problem. Returns the
    /// typed record only when all fields parsed.
    fn parse_fields(
        &self,
        raw: &RawRecord,
        now: DateTime<Utc>,
        problems: &mut Vec<String>,
    ) -> Option<Record> {
        let name = raw.present("name").unwrap_or_default();
        self.check_name(name, problems);

        let id = match raw.present("id") {
            Some(text) => note(parse_id("id", text), problems).map(Some),
            None => Some(None),
        };

        match raw {
            RawRecord::Department(_) | RawRecord::Job(_) => {
                let id = id.flatten()?;
                if !problems.is_empty() {
                    return None;
                }
                let name = name.to_string();
                Some(match raw.kind() {
                    TableKind::Departments => Department { id, name }.into(),
                    _ => Job { id, name }.into(),
                })
            }
            RawRecord::HiredEmployee(_) => {
                let hired_at = note(
                    parse_hired_at(raw.present("datetime").unwrap_or_default(), now),
                    problems,
                );
                let department_id = note(
                    parse_id("department_id", raw.present("department_id").unwrap_or_default()),
                    problems,
                );
                let job_id = note(
                    parse_id("job_id", raw.present("job_id").unwrap_or_default()),
                    problems,
                );

                if !problems.is_empty() {
                    return None;
                }
                Some(
                    HiredEmployee {
                        id: id?,
                        name: name.to_string(),
                        hired_at: hired_at?,
                        department_id: department_id?,
                        job_id: job_id?,
                    }
                    .into(),
                )
            }
        }
    }

    fn check_name(&self, name: &str, problems: &mut Vec<String>) {
        let length = name.chars().count();
        if length < NAME_MIN_CHARS {
            problems.push(format!("name must be at least {} characters", NAME_MIN_CHARS));
        } else if length > NAME_MAX_CHARS {
            problems.push(format!("name must not exceed {} characters", NAME_MAX_CHARS));
        } else if !self.name_pattern.is_match(name) {
            problems.push("name contains invalid characters".to_string());
        }
    }
}

fn note<T>(result: Result<T, String>, problems: &mut Vec<String>) -> Option<T> {
    result.map_err(|message| problems.push(message)).ok()
}

/// Positive integer within `INTEGER` range. Integral floats such as `3.0`
/// are accepted since spreadsheet exports write ids that way.
pub fn parse_id(field: &str, text: &str) -> Result<i32, String> {
    let value = match text.parse::<i64>() {
        Ok(value) => value,
        Err(_) => match text.parse::<f64>() {
            Ok(float) if float.is_finite() && float.fract() == 0.0 && float.abs() < 1e18 => {
                float as i64
            }
            _ => return Err(format!("{} must be a positive integer, got '{}'", field, text)),
        },
    };

    if value <= 0 {
        return Err(format!("{} must be a positive integer, got {}", field, value));
    }
    if value > MAX_ID {
        return Err(format!("{} {} exceeds maximum value {}", field, value, MAX_ID));
    }
    Ok(value as i32)
}

/// Parse an employee timestamp and reject dates after `now`
pub fn parse_hired_at(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| naive.and_utc())
        })
        .ok_or_else(|| {
            format!(
                "invalid datetime '{}' (expected YYYY-MM-DDTHH:MM:SS or YYYY-MM-DD HH:MM:SS)",
                text
            )
        })?;

    if parsed > now {
        return Err(format!("datetime {} is in the future", text));
    }
    Ok(parsed)
}
