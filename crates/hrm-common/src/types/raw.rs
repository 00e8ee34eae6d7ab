//! Unvalidated input records
//!
//! Upstream values arrive either as delimited-text cells or as JSON scalars in
//! an envelope payload. Both are kept as text, exactly as received, until the
//! validator decides what they mean.

use serde_json::{Map, Value};

use super::TableKind;
use crate::error::{HrmError, Result};

/// Tokens that upstream exports use for "no value"
const NULL_SENTINELS: [&str; 4] = ["nan", "null", "none", "nat"];

/// Raw department or job: `id,name`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawNamed {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Raw hired employee: `id,name,datetime,department_id,job_id`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEmployee {
    pub id: Option<String>,
    pub name: Option<String>,
    pub datetime: Option<String>,
    pub department_id: Option<String>,
    pub job_id: Option<String>,
}

/// An unvalidated record, tagged by its target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Department(RawNamed),
    Job(RawNamed),
    HiredEmployee(RawEmployee),
}

impl RawRecord {
    /// Build a record by asking `field` for each column of `kind`.
    pub fn from_fields<F>(kind: TableKind, mut field: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        match kind {
            TableKind::Departments => RawRecord::Department(RawNamed {
                id: field("id"),
                name: field("name"),
            }),
            TableKind::Jobs => RawRecord::Job(RawNamed {
                id: field("id"),
                name: field("name"),
            }),
            TableKind::HiredEmployees => RawRecord::HiredEmployee(RawEmployee {
                id: field("id"),
                name: field("name"),
                datetime: field("datetime"),
                department_id: field("department_id"),
                job_id: field("job_id"),
            }),
        }
    }

    /// Build a record from an envelope payload, which must be a JSON object.
    /// Unknown keys are ignored.
    pub fn from_payload(kind: TableKind, payload: &Value) -> Result<Self> {
        let object = payload.as_object().ok_or_else(|| HrmError::MalformedPayload {
            table: kind.to_string(),
            message: format!("expected a JSON object, got {}", json_type(payload)),
        })?;

        Ok(Self::from_fields(kind, |name| object.get(name).and_then(scalar_text)))
    }

    pub fn kind(&self) -> TableKind {
        match self {
            RawRecord::Department(_) => TableKind::Departments,
            RawRecord::Job(_) => TableKind::Jobs,
            RawRecord::HiredEmployee(_) => TableKind::HiredEmployees,
        }
    }

    /// Value of a column as received, before trimming
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match self {
            RawRecord::Department(r) | RawRecord::Job(r) => match name {
                "id" => &r.id,
                "name" => &r.name,
                _ => return None,
            },
            RawRecord::HiredEmployee(r) => match name {
                "id" => &r.id,
                "name" => &r.name,
                "datetime" => &r.datetime,
                "department_id" => &r.department_id,
                "job_id" => &r.job_id,
                _ => return None,
            },
        };
        value.as_deref()
    }

    /// Trimmed value of a column, or `None` when it is blank or a null token
    pub fn present(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(present_text)
    }

    /// Id as received, used to identify the record in the validation log
    pub fn raw_id(&self) -> Option<&str> {
        self.present("id")
    }

    /// JSON rendering of the record for the validation log
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for column in self.kind().columns() {
            let value = self
                .field(column)
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null);
            object.insert((*column).to_string(), value);
        }
        Value::Object(object)
    }
}

/// Trim `value` and drop it when nothing meaningful is left
pub fn present_text(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if NULL_SENTINELS
        .iter()
        .any(|sentinel| trimmed.eq_ignore_ascii_case(sentinel))
    {
        return None;
    }
    Some(trimmed)
}

/// Text form of a JSON scalar. Objects and arrays have no text form.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
