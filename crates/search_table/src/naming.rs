//! Remote collection and config-set naming.
//!
//! A collection is named `table` or `qualifier.table`. Table names and
//! qualifiers never contain `.`, so the mapping can be reversed.

use crate::config::is_valid_name_part;

const QUALIFIER_SEPARATOR: char = '.';

/// Remote collection name for `table`, optionally qualified.
pub fn remote_collection_name(table: &str, qualifier: Option<&str>) -> String {
    match qualifier {
        Some(qualifier) => format!("{qualifier}{QUALIFIER_SEPARATOR}{table}"),
        None => table.to_string(),
    }
}

/// Splits a collection name back into `(qualifier, table)`.
pub fn parse_remote_collection_name(collection: &str) -> Option<(Option<&str>, &str)> {
    match collection.split_once(QUALIFIER_SEPARATOR) {
        Some((qualifier, table)) if is_valid_name_part(qualifier) && is_valid_name_part(table) => {
            Some((Some(qualifier), table))
        }
        Some(_) => None,
        None if is_valid_name_part(collection) => Some((None, collection)),
        None => None,
    }
}

/// Config set owned by `collection`, derived from its base template.
pub fn config_set_name(collection: &str, base_config: &str) -> String {
    format!("{collection}{QUALIFIER_SEPARATOR}{base_config}")
}
