use serde::{Deserialize, Serialize};
use std::fmt;

/// A single column value as it arrives from the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Text(String),
    /// The driver could not decode the value as text; carries the driver's message
    Undecodable(String),
}

impl FieldValue {
    #[cfg(test)]
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }
}

/// Raw row as produced by a `RecordSource`, before validation
pub type RawRow = Vec<FieldValue>;

/// A validated row of a source table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// 1-based position of the row in the table scan
    pub ordinal: u64,
    pub fields: Vec<Option<String>>,
}

/// Why a raw row could not be turned into a `SourceRecord`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordIssue {
    WidthMismatch { expected: usize, actual: usize },
    Undecodable { column: String, message: String },
    /// The value cannot be written without quoting, and quoting is disabled
    Unquotable { column: String },
}

impl RecordIssue {
    pub fn column(&self) -> Option<&str> {
        match self {
            RecordIssue::WidthMismatch { .. } => None,
            RecordIssue::Undecodable { column, .. } | RecordIssue::Unquotable { column } => {
                Some(column)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RecordIssue::WidthMismatch { .. } => "width_mismatch",
            RecordIssue::Undecodable { .. } => "undecodable",
            RecordIssue::Unquotable { .. } => "unquotable",
        }
    }
}

impl fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordIssue::WidthMismatch { expected, actual } => {
                write!(f, "expected {expected} fields, got {actual}")
            }
            RecordIssue::Undecodable { column, message } => {
                write!(f, "column '{column}' could not be decoded as text: {message}")
            }
            RecordIssue::Unquotable { column } => write!(
                f,
                "column '{column}' contains a separator, quote or line break and quoting is disabled"
            ),
        }
    }
}

/// Record of a row that was skipped (kept in the run manifest)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub ordinal: u64,
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub error_message: String,
}

impl Rejection {
    pub fn new(ordinal: u64, issue: &RecordIssue) -> Self {
        Self {
            ordinal,
            error_type: issue.kind().to_string(),
            column: issue.column().map(str::to_string),
            error_message: issue.to_string(),
        }
    }
}
