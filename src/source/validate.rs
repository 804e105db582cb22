use super::record::{FieldValue, RawRow, RecordIssue, SourceRecord};
use crate::formats::{CsvOptions, QuoteStyle};

/// Check the shape of a raw row against the table header and the output
/// dialect, producing a record that is safe to encode
pub fn validate_row(
    columns: &[String],
    ordinal: u64,
    row: RawRow,
    csv: &CsvOptions,
) -> Result<SourceRecord, RecordIssue> {
    if row.len() != columns.len() {
        return Err(RecordIssue::WidthMismatch {
            expected: columns.len(),
            actual: row.len(),
        });
    }

    let mut fields = Vec::with_capacity(row.len());
    for (column, value) in columns.iter().zip(row) {
        match value {
            FieldValue::Null => fields.push(None),
            FieldValue::Text(text) => {
                if csv.quote_style == QuoteStyle::None && csv.needs_quoting(&text) {
                    return Err(RecordIssue::Unquotable {
                        column: column.clone(),
                    });
                }
                fields.push(Some(text));
            }
            FieldValue::Undecodable(message) => {
                return Err(RecordIssue::Undecodable {
                    column: column.clone(),
                    message,
                });
            }
        }
    }

    Ok(SourceRecord { ordinal, fields })
}

/// Decides when skipped records stop being tolerable for a table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RejectPolicy {
    /// Largest tolerated share of rejected rows, in `[0, 1]`
    pub max_ratio: f64,
}

impl Default for RejectPolicy {
    fn default() -> Self {
        Self {
            max_ratio: crate::config::DEFAULT_MAX_REJECT_RATIO,
        }
    }
}

impl RejectPolicy {
    /// Abort on the first malformed record
    pub fn strict() -> Self {
        Self { max_ratio: 0.0 }
    }

    pub fn aborts_immediately(&self) -> bool {
        self.max_ratio <= 0.0
    }

    pub fn is_exceeded(&self, rejected: u64, total: u64) -> bool {
        rejected > 0 && rejected as f64 > self.max_ratio * total as f64
    }
}
