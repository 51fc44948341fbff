//! Deep merge of configuration documents.

use toml::{Table, Value};

/// Merge `overlay` over `base`, returning a new table.
///
/// Nested tables merge recursively; any other value (arrays included) in
/// `overlay` replaces the base value outright. Keys keep the base order, with
/// overlay-only keys appended in their own order. Neither input is modified.
pub fn merge(base: &Table, overlay: &Table) -> Table {
    let mut result = base.clone();
    for (key, value) in overlay {
        let merged = match (result.get(key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                Value::Table(merge(existing, incoming))
            }
            _ => value.clone(),
        };
        result.insert(key.clone(), merged);
    }
    result
}
