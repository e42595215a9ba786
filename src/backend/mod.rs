pub mod schema;
pub mod tables;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value as Json;

use crate::store::value::Frame;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Table '{0}' not found.")]
    UnknownTable(String),

    #[error("Table name '{0}' is already in use.")]
    NameInUse(String),

    #[error("Table name validation error: {0}")]
    InvalidName(String),

    #[error("{0}")]
    InvalidQuery(String),

    #[error("scripts may only read from the database")]
    ReadOnly,

    #[error("backend connection poisoned")]
    Poisoned,
}

/// SQLite connection shared by the schema catalog, the table routes and
/// scripts. Scripts only get [`SqliteBackend::query`], which refuses writes.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        tracing::info!(path = %path.display(), "opened data backend");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let conn = self.conn.lock().map_err(|_| BackendError::Poisoned)?;
        f(&conn)
    }

    pub fn table_names(&self) -> Result<Vec<String>, BackendError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    /// Column name and declared type, in table order.
    pub fn columns(&self, table: &str) -> Result<Vec<(String, String)>, BackendError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
            let cols = stmt
                .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            if cols.is_empty() {
                return Err(BackendError::UnknownTable(table.to_string()));
            }
            Ok(cols)
        })
    }

    pub fn row_count(&self, table: &str) -> Result<i64, BackendError> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Run a read-only query and collect the full result into a frame.
    pub fn query(&self, sql: &str) -> Result<Frame, BackendError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            if !stmt.readonly() {
                return Err(BackendError::ReadOnly);
            }
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(width);
                for i in 0..width {
                    cells.push(cell_to_json(row.get_ref(i)?));
                }
                out.push(cells);
            }
            Ok(Frame::new(columns, out))
        })
    }
}

fn cell_to_json(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null),
        ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Json::String(format!("<{} bytes>", b.len())),
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_backend() -> SqliteBackend {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER, customer TEXT, total REAL);
             INSERT INTO orders VALUES (1, 'ana', 12.5), (2, 'bo', 40.0), (3, 'ana', 7.25);
             CREATE TABLE customers (name TEXT, city TEXT);
             INSERT INTO customers VALUES ('ana', 'Lisbon'), ('bo', 'Oslo');",
        )
        .unwrap();
        SqliteBackend::from_connection(conn)
    }

    #[test]
    fn lists_user_tables_sorted() {
        let backend = sample_backend();
        assert_eq!(backend.table_names().unwrap(), vec!["customers", "orders"]);
    }

    #[test]
    fn query_builds_frame() {
        let backend = sample_backend();
        let frame = backend
            .query("SELECT customer, SUM(total) AS spent FROM orders GROUP BY customer ORDER BY customer")
            .unwrap();
        assert_eq!(frame.columns, vec!["customer", "spent"]);
        assert_eq!(frame.rows[0], vec![json!("ana"), json!(19.75)]);
        assert!(frame.has_trivial_index());
    }

    #[test]
    fn columns_report_declared_types() {
        let backend = sample_backend();
        let cols = backend.columns("orders").unwrap();
        assert_eq!(cols[2], ("total".to_string(), "REAL".to_string()));
    }

    #[test]
    fn unknown_table_is_an_error() {
        let backend = sample_backend();
        assert!(matches!(
            backend.columns("nope"),
            Err(BackendError::UnknownTable(t)) if t == "nope"
        ));
    }

    #[test]
    fn query_refuses_writes() {
        let backend = sample_backend();
        assert!(matches!(backend.query("DELETE FROM orders"), Err(BackendError::ReadOnly)));
        assert_eq!(backend.row_count("orders").unwrap(), 3);
    }

    #[test]
    fn bad_sql_surfaces_sqlite_error() {
        let backend = sample_backend();
        let err = backend.query("SELEC 1").unwrap_err();
        assert!(err.to_string().starts_with("sqlite:"));
    }
}
