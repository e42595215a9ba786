use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value as Json;

use super::{BackendError, SqliteBackend, quote_ident};

/// Tables larger than this are described from a random sample.
const SAMPLE_ROWS: i64 = 100;
const EXAMPLE_VALUES: usize = 3;

/// Render the markdown description of one table: a heading and one row per
/// column with up to three distinct example values.
pub fn describe_table(backend: &SqliteBackend, table: &str) -> Result<String, BackendError> {
    let columns = backend.columns(table)?;
    let total = backend.row_count(table)?;
    let sql = if total > SAMPLE_ROWS {
        format!("SELECT * FROM {} ORDER BY RANDOM() LIMIT {SAMPLE_ROWS}", quote_ident(table))
    } else {
        format!("SELECT * FROM {}", quote_ident(table))
    };
    let sample = backend.query(&sql)?;

    let mut lines = vec![
        format!("## Table: {table}\n"),
        "| Column Name | Type | Example Value 1 | Example Value 2 | Example Value 3 |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for (name, decl_type) in columns {
        let mut examples: Vec<String> = Vec::with_capacity(EXAMPLE_VALUES);
        for cell in sample.column(&name).unwrap_or_default() {
            if examples.len() == EXAMPLE_VALUES {
                break;
            }
            let text = match cell {
                Json::Null => continue,
                Json::String(s) => s,
                other => other.to_string(),
            };
            if !examples.contains(&text) {
                examples.push(text);
            }
        }
        examples.resize(EXAMPLE_VALUES, String::new());
        lines.push(format!(
            "| {name} | {decl_type} | {} | {} | {} |",
            examples[0], examples[1], examples[2]
        ));
    }
    Ok(lines.join("\n"))
}

/// Per-table schema descriptions, rebuilt on refresh and read by every
/// analysis when composing the system prompt.
#[derive(Default)]
pub struct SchemaCatalog {
    entries: RwLock<BTreeMap<String, String>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe every table. Tables that fail are logged and left out.
    pub fn refresh(&self, backend: &SqliteBackend) -> Result<usize, BackendError> {
        let mut fresh = BTreeMap::new();
        for table in backend.table_names()? {
            match describe_table(backend, &table) {
                Ok(markdown) => {
                    fresh.insert(table, markdown);
                }
                Err(e) => tracing::warn!(table = %table, error = %e, "skipping table in schema catalog"),
            }
        }
        let count = fresh.len();
        self.replace(fresh);
        tracing::info!(tables = count, "schema catalog refreshed");
        Ok(count)
    }

    pub fn replace(&self, entries: BTreeMap<String, String>) {
        if let Ok(mut guard) = self.entries.write() {
            *guard = entries;
        }
    }

    pub fn is_registered(&self) -> bool {
        self.entries.read().map(|e| !e.is_empty()).unwrap_or(false)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Concatenate the descriptions of the requested tables, or of every
    /// table when none are requested. Unknown names are ignored.
    pub fn describe(&self, tables: &[String]) -> String {
        let Ok(entries) = self.entries.read() else {
            return String::new();
        };
        let mut out = String::new();
        let mut push = |markdown: &String| {
            out.push_str(markdown);
            out.push_str("\n\n");
        };
        if tables.is_empty() {
            entries.values().for_each(&mut push);
        } else {
            tables.iter().filter_map(|t| entries.get(t)).for_each(&mut push);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::sample_backend;

    #[test]
    fn table_markdown_lists_distinct_examples() {
        let backend = sample_backend();
        let md = describe_table(&backend, "orders").unwrap();
        let lines: Vec<&str> = md.lines().collect();
        assert_eq!(lines[0], "## Table: orders");
        assert_eq!(lines[1], "");
        assert_eq!(
            lines[2],
            "| Column Name | Type | Example Value 1 | Example Value 2 | Example Value 3 |"
        );
        assert_eq!(lines[3], "|---|---|---|---|---|");
        assert_eq!(lines[5], "| customer | TEXT | ana | bo |  |");
    }

    #[test]
    fn refresh_registers_all_tables() {
        let backend = sample_backend();
        let catalog = SchemaCatalog::new();
        assert!(!catalog.is_registered());
        assert_eq!(catalog.refresh(&backend).unwrap(), 2);
        assert!(catalog.is_registered());
        assert_eq!(catalog.table_names(), vec!["customers", "orders"]);
    }

    #[test]
    fn describe_filters_and_skips_unknown() {
        let backend = sample_backend();
        let catalog = SchemaCatalog::new();
        catalog.refresh(&backend).unwrap();

        let one = catalog.describe(&["orders".into(), "ghost".into()]);
        assert!(one.starts_with("## Table: orders"));
        assert!(!one.contains("customers"));
        assert!(one.ends_with("\n\n"));

        let all = catalog.describe(&[]);
        assert!(all.contains("## Table: customers") && all.contains("## Table: orders"));
    }
}
