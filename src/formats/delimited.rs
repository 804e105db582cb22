use anyhow::{Context, Result, anyhow, bail};

use crate::source::SourceRecord;

/// Quoting rule applied to every field of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteStyle {
    /// Quote only fields containing the separator, the quote character or a line break
    #[default]
    Minimal,
    /// Quote every field
    All,
    /// Quote every field that does not parse as a number
    NonNumeric,
    /// Never quote; records that would need quoting are rejected
    None,
}

impl QuoteStyle {
    /// Parse a quote style name (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MINIMAL" => Some(QuoteStyle::Minimal),
            "ALL" => Some(QuoteStyle::All),
            "NONNUMERIC" => Some(QuoteStyle::NonNumeric),
            "NONE" => Some(QuoteStyle::None),
            _ => None,
        }
    }

    fn to_csv(self) -> csv::QuoteStyle {
        match self {
            QuoteStyle::Minimal => csv::QuoteStyle::Necessary,
            QuoteStyle::All => csv::QuoteStyle::Always,
            QuoteStyle::NonNumeric => csv::QuoteStyle::NonNumeric,
            QuoteStyle::None => csv::QuoteStyle::Never,
        }
    }
}

/// Record terminator written after every line, header included
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTerminator {
    CrLf,
    Byte(u8),
}

impl Default for LineTerminator {
    fn default() -> Self {
        LineTerminator::Byte(b'\n')
    }
}

impl LineTerminator {
    /// Parse a terminator, accepting the literal characters or their `\n`,
    /// `\r` and `\r\n` escapes as they usually arrive from environment variables
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "\r\n" | "\\r\\n" => Ok(LineTerminator::CrLf),
            "\\n" => Ok(LineTerminator::Byte(b'\n')),
            "\\r" => Ok(LineTerminator::Byte(b'\r')),
            _ if s.len() == 1 => Ok(LineTerminator::Byte(s.as_bytes()[0])),
            _ => Err(anyhow!(
                "Invalid line terminator {:?}. Expected \\n, \\r\\n, \\r or a single character",
                s
            )),
        }
    }

    fn to_csv(self) -> csv::Terminator {
        match self {
            LineTerminator::CrLf => csv::Terminator::CRLF,
            LineTerminator::Byte(b) => csv::Terminator::Any(b),
        }
    }

    fn contains(self, byte: u8) -> bool {
        match self {
            LineTerminator::CrLf => byte == b'\r' || byte == b'\n',
            LineTerminator::Byte(b) => byte == b,
        }
    }
}

/// Parse a field separator: a single byte, or `\t` for tab
pub fn parse_delimiter(s: &str) -> Result<u8> {
    match s {
        "\\t" => Ok(b'\t'),
        _ if s.len() == 1 => Ok(s.as_bytes()[0]),
        _ => bail!("Separator must be a single character or \\t, got {:?}", s),
    }
}

/// CSV dialect used for every artifact of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub quote: u8,
    pub quote_style: QuoteStyle,
    pub terminator: LineTerminator,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            quote_style: QuoteStyle::Minimal,
            terminator: LineTerminator::default(),
        }
    }
}

impl CsvOptions {
    /// True if the value can only be written correctly inside quotes
    pub fn needs_quoting(&self, value: &str) -> bool {
        value.bytes().any(|b| {
            b == self.delimiter
                || b == self.quote
                || b == b'\n'
                || b == b'\r'
                || self.terminator.contains(b)
        })
    }

    fn writer(&self) -> csv::Writer<Vec<u8>> {
        csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote)
            .quote_style(self.quote_style.to_csv())
            .terminator(self.terminator.to_csv())
            .has_headers(false)
            .from_writer(Vec::new())
    }

    /// Encode the header line
    pub fn encode_header(&self, columns: &[String]) -> Result<Vec<u8>> {
        if self.quote_style == QuoteStyle::None
            && let Some(column) = columns.iter().find(|c| self.needs_quoting(c))
        {
            bail!(
                "Column name '{}' cannot be written without quoting; choose another CSV_QUOTE",
                column
            );
        }

        let mut writer = self.writer();
        writer
            .write_record(columns)
            .context("Failed to encode CSV header")?;
        finish(writer)
    }

    /// Encode a chunk of validated records; `NULL` becomes the empty field
    pub fn encode_records(&self, records: &[SourceRecord]) -> Result<Vec<u8>> {
        let mut writer = self.writer();
        for record in records {
            writer
                .write_record(record.fields.iter().map(|f| f.as_deref().unwrap_or("")))
                .with_context(|| format!("Failed to encode record {}", record.ordinal))?;
        }
        finish(writer)
    }
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV buffer: {}", e.error()))
}
