use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use super::{BackendError, SqliteBackend, cell_to_json, quote_ident};

/// Longest identifier kept after normalization.
const MAX_IDENT_CHARS: usize = 63;

static UNDERSCORE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

/// Words that cannot be used bare as a table name in the databases the
/// uploads come from.
const RESERVED_WORDS: &[&str] = &[
    "all", "and", "any", "array", "as", "asc", "asymmetric", "both", "case", "cast", "check",
    "collate", "column", "constraint", "create", "current_catalog", "current_date",
    "current_role", "current_time", "current_timestamp", "current_user", "default",
    "deferrable", "desc", "distinct", "do", "else", "end", "except", "false", "fetch", "for",
    "foreign", "from", "grant", "group", "having", "in", "initially", "intersect", "into",
    "leading", "limit", "localtime", "localtimestamp", "not", "null", "offset", "on", "only",
    "or", "order", "placing", "primary", "references", "returning", "select", "session_user",
    "some", "symmetric", "table", "then", "to", "trailing", "true", "union", "unique", "user",
    "using", "variadic", "when", "where", "window", "with",
];

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Canonical table/column identifier: NFKC, collapsed underscores, no
/// leading or trailing underscore, lowercase, at most 63 chars, and a
/// `_table` suffix on reserved words.
pub fn normalize_name(name: &str) -> Result<String, BackendError> {
    if name.is_empty() {
        return Err(BackendError::InvalidName("table name must not be empty".into()));
    }
    let nfkc: String = name.nfkc().collect();
    let collapsed = UNDERSCORE_RUN.replace_all(&nfkc, "_");
    let mut normalized = collapsed.trim_matches('_').to_lowercase();

    if normalized.chars().count() > MAX_IDENT_CHARS {
        normalized = truncate_chars(&normalized, MAX_IDENT_CHARS).trim_end_matches('_').to_string();
    }
    if normalized.is_empty() {
        return Err(BackendError::InvalidName("name is empty after normalization".into()));
    }

    if RESERVED_WORDS.contains(&normalized.as_str()) {
        normalized.push_str("_table");
        if normalized.chars().count() > MAX_IDENT_CHARS {
            normalized = format!("{}_tbl", truncate_chars(&normalized, MAX_IDENT_CHARS - 4));
        }
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(raw: Option<&str>) -> Result<Self, BackendError> {
        match raw.map(str::to_ascii_lowercase).as_deref() {
            Some("asc") => Ok(SortDirection::Asc),
            Some("desc") => Ok(SortDirection::Desc),
            _ => Err(BackendError::InvalidQuery(format!(
                "invalid sort direction: {}",
                raw.unwrap_or("")
            ))),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

fn default_limit() -> u32 {
    100
}

/// Query string of a table preview.
#[derive(Debug, Clone, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub sort_column: Option<String>,
    pub sort_direction: Option<String>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
            sort_column: None,
            sort_direction: None,
            filter_column: None,
            filter_value: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub table_name: String,
    pub columns: Vec<String>,
    pub data: Vec<Map<String, Json>>,
    pub total_rows: i64,
    pub preview_rows: usize,
    pub sort_column: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub filter_column: Option<String>,
    pub filter_value: Option<String>,
}

fn is_text_type(decl_type: &str) -> bool {
    let t = decl_type.to_ascii_uppercase();
    t.is_empty() || t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB")
}

impl SqliteBackend {
    fn ensure_table(&self, table: &str) -> Result<(), BackendError> {
        if self.table_names()?.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(BackendError::UnknownTable(table.to_string()))
        }
    }

    /// One page of a table, optionally filtered and sorted. Column names are
    /// checked against the table before they reach the SQL text.
    pub fn table_page(&self, table: &str, page: &PageRequest) -> Result<TablePage, BackendError> {
        self.ensure_table(table)?;
        let columns = self.columns(table)?;
        let known = |name: &str| columns.iter().find(|(c, _)| c == name);

        let sort = match &page.sort_column {
            Some(col) => {
                if known(col).is_none() {
                    return Err(BackendError::InvalidQuery(format!("invalid sort column: {col}")));
                }
                Some((col.clone(), SortDirection::parse(page.sort_direction.as_deref())?))
            }
            None => None,
        };

        let mut where_sql = String::new();
        let mut params: Vec<String> = Vec::new();
        if let Some(col) = &page.filter_column {
            let Some((_, decl_type)) = known(col) else {
                return Err(BackendError::InvalidQuery(format!("invalid filter column: {col}")));
            };
            if let Some(value) = &page.filter_value {
                if is_text_type(decl_type) {
                    where_sql = format!(" WHERE {} LIKE ?1", quote_ident(col));
                    params.push(format!("%{value}%"));
                } else {
                    where_sql = format!(" WHERE {} = ?1", quote_ident(col));
                    params.push(value.clone());
                }
            }
        }
        let order_sql = sort
            .as_ref()
            .map(|(col, dir)| format!(" ORDER BY {} {}", quote_ident(col), dir.sql()))
            .unwrap_or_default();

        let from = format!("FROM {}{where_sql}", quote_ident(table));
        let (total_rows, names, data) = self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) {from}"),
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT * {from}{order_sql} LIMIT {} OFFSET {}",
                page.limit, page.offset
            ))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut data = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = Map::new();
                for (i, name) in names.iter().enumerate() {
                    record.insert(name.clone(), cell_to_json(row.get_ref(i)?));
                }
                data.push(record);
            }
            Ok((total, names, data))
        })?;

        Ok(TablePage {
            table_name: table.to_string(),
            columns: names,
            preview_rows: data.len(),
            data,
            total_rows,
            sort_column: sort.as_ref().map(|(c, _)| c.clone()),
            sort_direction: sort.map(|(_, d)| d),
            filter_column: page.filter_column.clone(),
            filter_value: page.filter_value.clone(),
        })
    }

    pub fn delete_table(&self, name: &str) -> Result<String, BackendError> {
        let table = normalize_name(name)?;
        self.ensure_table(&table)?;
        self.with_conn(|conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table)))?;
            Ok(())
        })?;
        tracing::info!(table = %table, "table dropped");
        Ok(table)
    }

    /// Rename a table, both names normalized first. Returns the new name.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<String, BackendError> {
        let old = normalize_name(from)?;
        let new = normalize_name(to)?;
        let existing = self.table_names()?;
        if !existing.contains(&old) {
            return Err(BackendError::UnknownTable(from.to_string()));
        }
        if existing.contains(&new) {
            return Err(BackendError::NameInUse(to.to_string()));
        }
        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&old),
                quote_ident(&new)
            ))?;
            Ok(())
        })?;
        tracing::info!(from = %old, to = %new, "table renamed");
        Ok(new)
    }

    /// Copy every table of another SQLite file into this database under
    /// normalized table and column names, replacing same-named tables.
    /// Tables that fail to copy are logged and skipped.
    pub fn import_sqlite(&self, source: &Path) -> Result<Vec<String>, BackendError> {
        let source_path = source.to_string_lossy().into_owned();
        self.with_conn(|conn| {
            conn.execute("ATTACH DATABASE ?1 AS upload", [&source_path])?;
            let copied = copy_attached_tables(conn);
            conn.execute_batch("DETACH DATABASE upload")?;
            copied
        })
    }
}

fn copy_attached_tables(conn: &rusqlite::Connection) -> Result<Vec<String>, BackendError> {
    let mut stmt =
        conn.prepare("SELECT name FROM upload.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut copied = Vec::new();
    for table in tables {
        match copy_attached_table(conn, &table) {
            Ok(name) => copied.push(name),
            Err(e) => tracing::warn!(table = %table, error = %e, "skipping uploaded table"),
        }
    }
    Ok(copied)
}

fn copy_attached_table(conn: &rusqlite::Connection, table: &str) -> Result<String, BackendError> {
    let target = normalize_name(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA upload.table_info({})", quote_ident(table)))?;
    let source_columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    let select = source_columns
        .iter()
        .map(|c| -> Result<String, BackendError> {
            Ok(format!("{} AS {}", quote_ident(c), quote_ident(&normalize_name(c)?)))
        })
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS main.{t}; CREATE TABLE main.{t} AS SELECT {select} FROM upload.{src};",
        t = quote_ident(&target),
        src = quote_ident(table),
    ))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::sample_backend;
    use rusqlite::Connection;
    use serde_json::json;

    #[test]
    fn normalize_collapses_and_lowercases() {
        assert_eq!(normalize_name("__Sales__2024__").unwrap(), "sales_2024");
        assert_eq!(normalize_name("Ｏｒｄｅｒｓ").unwrap(), "orders");
    }

    #[test]
    fn normalize_suffixes_reserved_words() {
        assert_eq!(normalize_name("Order").unwrap(), "order_table");
        assert_eq!(normalize_name("select").unwrap(), "select_table");
    }

    #[test]
    fn normalize_truncates_long_names() {
        let long = "a".repeat(80);
        assert_eq!(normalize_name(&long).unwrap().len(), 63);
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(matches!(normalize_name(""), Err(BackendError::InvalidName(_))));
        assert!(matches!(normalize_name("___"), Err(BackendError::InvalidName(_))));
    }

    #[test]
    fn page_sorts_and_limits() {
        let backend = sample_backend();
        let page = backend
            .table_page(
                "orders",
                &PageRequest {
                    limit: 2,
                    offset: 0,
                    sort_column: Some("total".into()),
                    sort_direction: Some("DESC".into()),
                    ..PageRequest::default()
                },
            )
            .unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.preview_rows, 2);
        assert_eq!(page.columns, vec!["id", "customer", "total"]);
        assert_eq!(page.data[0]["total"], json!(40.0));
        assert_eq!(page.sort_direction, Some(SortDirection::Desc));
    }

    #[test]
    fn page_offset_and_text_filter() {
        let backend = sample_backend();
        let page = backend
            .table_page(
                "orders",
                &PageRequest {
                    offset: 1,
                    filter_column: Some("customer".into()),
                    filter_value: Some("AN".into()),
                    ..PageRequest::default()
                },
            )
            .unwrap();
        assert_eq!(page.total_rows, 2);
        assert_eq!(page.preview_rows, 1);
        assert_eq!(page.data[0]["id"], json!(3));
    }

    #[test]
    fn page_rejects_unknown_columns_and_directions() {
        let backend = sample_backend();
        let bad_dir = PageRequest {
            sort_column: Some("total".into()),
            sort_direction: Some("sideways".into()),
            ..PageRequest::default()
        };
        assert!(matches!(backend.table_page("orders", &bad_dir), Err(BackendError::InvalidQuery(_))));

        let bad_col = PageRequest {
            sort_column: Some("total; DROP TABLE orders".into()),
            sort_direction: Some("asc".into()),
            ..PageRequest::default()
        };
        assert!(matches!(backend.table_page("orders", &bad_col), Err(BackendError::InvalidQuery(_))));

        assert!(matches!(
            backend.table_page("missing", &PageRequest::default()),
            Err(BackendError::UnknownTable(_))
        ));
    }

    #[test]
    fn rename_normalizes_and_checks_conflicts() {
        let backend = sample_backend();
        assert_eq!(backend.rename_table("orders", "Order").unwrap(), "order_table");
        assert_eq!(backend.table_names().unwrap(), vec!["customers", "order_table"]);

        assert!(matches!(
            backend.rename_table("order_table", "Customers"),
            Err(BackendError::NameInUse(_))
        ));
        assert!(matches!(
            backend.rename_table("orders", "anything"),
            Err(BackendError::UnknownTable(_))
        ));
    }

    #[test]
    fn delete_drops_table() {
        let backend = sample_backend();
        assert_eq!(backend.delete_table("Customers").unwrap(), "customers");
        assert_eq!(backend.table_names().unwrap(), vec!["orders"]);
        assert!(matches!(backend.delete_table("customers"), Err(BackendError::UnknownTable(_))));
    }

    #[test]
    fn import_copies_tables_with_normalized_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.db");
        let src = Connection::open(&path).unwrap();
        src.execute_batch(
            "CREATE TABLE \"Monthly__Sales\" (\"Region_\" TEXT, \"Amount\" REAL);
             INSERT INTO \"Monthly__Sales\" VALUES ('north', 10.0), ('south', 4.5);
             CREATE TABLE \"orders\" (\"Id\" INTEGER);
             INSERT INTO \"orders\" VALUES (99);",
        )
        .unwrap();
        drop(src);

        let backend = sample_backend();
        let mut copied = backend.import_sqlite(&path).unwrap();
        copied.sort();
        assert_eq!(copied, vec!["monthly_sales", "orders"]);

        let frame = backend.query("SELECT region, amount FROM monthly_sales ORDER BY amount").unwrap();
        assert_eq!(frame.rows[0], vec![json!("south"), json!(4.5)]);
        // same-named tables are replaced
        let orders = backend.query("SELECT * FROM orders").unwrap();
        assert_eq!(orders.columns, vec!["id"]);
        assert_eq!(orders.nrows(), 1);
    }
}
