//! CSV dialect and chunk encoding for output artifacts

pub mod delimited;

pub use delimited::{CsvOptions, LineTerminator, QuoteStyle, parse_delimiter};
