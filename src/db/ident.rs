use anyhow::{Result, bail};

/// Validate a table or schema name before it is spliced into SQL
///
/// Only ASCII letters, digits and underscores are accepted.
pub fn safe_ident(name: &str) -> Result<&str> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        bail!("Invalid identifier {:?}: only a-z, A-Z, 0-9 and _ are allowed", name);
    }
    Ok(name)
}

/// Quote an identifier that comes from the catalog (column names may contain
/// spaces or quotes)
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
