//! Business-rule rejections
//!
//! A rejection is a value, not an error: it travels back to the caller, which
//! forwards it to the validation log and keeps processing the batch.

use serde_json::Value;

use super::RawRecord;

/// Why a record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// One or more required fields are null or blank
    MissingFields,
    /// Name charset/length, unparseable or future date, non-numeric id
    Format,
    /// department_id or job_id does not reference an existing row
    ReferentialIntegrity,
    /// Explicit id already present in the table or in the same batch
    DuplicateId,
    /// Envelope addressed to a table the pipeline does not know
    UnknownTable,
    /// The store could not be asked whether a referenced row exists
    Infrastructure,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::MissingFields => "MISSING_REQUIRED_FIELDS",
            RejectionKind::Format => "FORMAT_ERROR",
            RejectionKind::ReferentialIntegrity => "REFERENTIAL_INTEGRITY_ERROR",
            RejectionKind::DuplicateId => "DUPLICATE_ID",
            RejectionKind::UnknownTable => "UNKNOWN_TABLE",
            RejectionKind::Infrastructure => "INFRASTRUCTURE_ERROR",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected record together with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
    /// Every missing field, for [`RejectionKind::MissingFields`]
    pub missing_fields: Vec<String>,
    /// Id as received, if any
    pub record_id: Option<String>,
    /// The record as received
    pub raw: Value,
}

impl Rejection {
    pub fn new(kind: RejectionKind, message: impl Into<String>, raw: &RawRecord) -> Self {
        Self {
            kind,
            message: message.into(),
            missing_fields: Vec::new(),
            record_id: raw.raw_id().map(str::to_string),
            raw: raw.to_json(),
        }
    }

    pub fn missing_fields(fields: Vec<String>, raw: &RawRecord) -> Self {
        let message = format!("missing required fields: {}", fields.join(", "));
        Self {
            missing_fields: fields,
            ..Self::new(RejectionKind::MissingFields, message, raw)
        }
    }

    /// Rejection for a payload that never became a [`RawRecord`]
    pub fn unparsed(kind: RejectionKind, message: impl Into<String>, raw: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            missing_fields: Vec::new(),
            record_id: None,
            raw,
        }
    }
}
