// Input validation utilities
//
// Identifiers and passwords end up interpolated into DDL/DCL (GRANT, CREATE USER), which cannot be
// parameterized. Everything is checked here before any SQL is generated.

use anyhow::Result;
use regex::Regex;

/// PostgreSQL truncates identifiers past NAMEDATALEN-1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// MySQL account names are limited to 32 characters.
pub const MAX_MYSQL_USER_LEN: usize = 32;

/// Dollar-quote tag wrapping the PostgreSQL conditional CREATE USER block.
pub const PG_DO_BLOCK_TAG: &str = "$provision$";

/// Validate a database or role identifier.
///
/// Allows letters, digits, underscore and `$` after a leading letter or underscore. Quoting is
/// still applied when the identifier is rendered; this check keeps names portable across both
/// engines.
pub fn validate_identifier(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("must not be empty"));
    }

    if name.len() > max_len {
        return Err(anyhow::anyhow!(
            "must be {} characters or fewer (got {})",
            max_len,
            name.len()
        ));
    }

    let ident_re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").map_err(|e| {
        anyhow::anyhow!("Internal error: failed to compile identifier regex: {}", e)
    })?;
    if !ident_re.is_match(name) {
        return Err(anyhow::anyhow!(
            "must start with a letter or underscore and contain only letters, digits, '_' or '$'"
        ));
    }

    Ok(())
}

/// Validate a role password.
pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(anyhow::anyhow!("must not be empty"));
    }

    if password.contains('\0') {
        return Err(anyhow::anyhow!("must not contain NUL bytes"));
    }

    // MySQL reads a backslash as an escape unless NO_BACKSLASH_ESCAPES is set, so one literal
    // would stand for two different passwords depending on the server's sql_mode.
    if password.contains('\\') {
        return Err(anyhow::anyhow!("must not contain backslashes"));
    }

    if password.contains(PG_DO_BLOCK_TAG) {
        return Err(anyhow::anyhow!(
            "must not contain the reserved sequence '{}'",
            PG_DO_BLOCK_TAG
        ));
    }

    Ok(())
}
