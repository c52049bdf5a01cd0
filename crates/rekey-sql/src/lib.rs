//! SQL quoting and naming helpers.
//!
//! Everything rekey sends to Postgres is assembled from catalog data it did
//! not write itself, so every identifier goes through [`Ident`]; values
//! travel as bind parameters.


/// Postgres silently truncates identifiers longer than this (NAMEDATALEN - 1).
pub const PG_IDENT_MAX: usize = 63;

/// Suffix appended to a table name to form its shadow table name.
pub const SHADOW_SUFFIX: &str = "_ulid";

/// SQL type of every re-keyed column: a 26-character Crockford base32 ULID.
pub const ULID_SQL_TYPE: &str = "CHAR(26)";

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// # Example
/// ```
/// use rekey_sql::Ident;
/// assert_eq!(format!("{}", Ident("user")), "\"user\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> std::fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// Quote a PostgreSQL identifier.
///
/// Always quotes identifiers to avoid issues with reserved keywords like
/// `user`, `order`, `table`, `group`, etc. Doubles any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Quote a schema-qualified name: `"schema"."name"`.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", Ident(schema), Ident(name))
}

/// Name of the shadow table built for `table`.
///
/// This is `<table>_ulid` whenever that fits in a Postgres identifier.
/// Longer names are truncated and disambiguated with a stable hash of the
/// full table name, so two long tables sharing a prefix never collide.
///
/// # Examples
///
/// ```
/// assert_eq!(rekey_sql::shadow_table_name("user"), "user_ulid");
/// assert!(rekey_sql::shadow_table_name(&"x".repeat(70)).len() <= 63);
/// ```
pub fn shadow_table_name(table: &str) -> String {
    bounded_name(table, SHADOW_SUFFIX)
}

/// Name of the primary-key constraint declared on `table`.
///
/// Matches what Postgres picks by default (`<table>_pkey`) for short names.
pub fn pkey_constraint_name(table: &str) -> String {
    bounded_name(table, "_pkey")
}

/// Join `base` and `suffix`, keeping the result within [`PG_IDENT_MAX`].
fn bounded_name(base: &str, suffix: &str) -> String {
    if base.len() + suffix.len() <= PG_IDENT_MAX {
        return format!("{}{}", base, suffix);
    }

    let hex = blake3::hash(base.as_bytes()).to_hex().to_string();
    let tag = &hex[..8];

    // "_" + tag sits between the truncated base and the suffix
    let max_base_len = PG_IDENT_MAX.saturating_sub(suffix.len() + 1 + tag.len());
    let mut len = max_base_len.min(base.len());
    while len > 0 && !base.is_char_boundary(len) {
        len -= 1;
    }

    format!("{}_{}{}", &base[..len], tag, suffix)
}

/// Whether `name` is the shadow of some table in `tables`.
pub fn is_shadow_of_any<'a>(name: &str, tables: impl IntoIterator<Item = &'a str>) -> bool {
    tables
        .into_iter()
        .any(|t| t != name && shadow_table_name(t) == name)
}
