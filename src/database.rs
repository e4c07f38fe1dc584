use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::error::{ApiTestError, Result};

/// A single result row, column name to value
pub type Row = Map<String, Value>;

// statement keywords that modify data or schema
const WRITE_KEYWORDS: [&str; 11] = [
    "insert", "update", "delete", "drop", "alter", "truncate", "create", "replace", "grant", "revoke", "merge",
];

/// Relational database used by `sql` actions and SQL assertions
pub trait SqlClient: Send + Sync {
    /// First row of a read-only statement, `None` when it returns nothing
    fn query(&self, sql: &str) -> Result<Option<Row>>;

    /// Run a statement and return the number of affected rows
    fn execute(&self, sql: &str) -> Result<usize>;
}

/// Reject statements containing a write keyword outside of quoted literals.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let mut unquoted = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' || ch == '`' => {
                quote = Some(ch);
                unquoted.push(' ');
            }
            None => unquoted.push(ch),
        }
    }

    let found = unquoted
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(str::to_lowercase)
        .find(|word| WRITE_KEYWORDS.contains(&word.as_str()));

    match found {
        Some(keyword) => Err(ApiTestError::SqlSyntax(format!(
            "'{sql}' contains the write keyword '{keyword}'; only read-only statements are allowed"
        ))),
        None => Ok(()),
    }
}

/// SQLite engine, one connection shared behind a mutex
pub struct SqliteClient {
    connection: Mutex<Connection>,
}

impl SqliteClient {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Opening sqlite database {path:?}");
        let connection = Connection::open(path)
            .map_err(|e| ApiTestError::ConfigInit(format!("cannot open database {path:?}: {e}")))?;
        Ok(SqliteClient {
            connection: Mutex::new(connection),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteClient {
            connection: Mutex::new(Connection::open_in_memory()?),
        })
    }
}

impl SqlClient for SqliteClient {
    fn query(&self, sql: &str) -> Result<Option<Row>> {
        ensure_read_only(sql)?;
        log::debug!("SQL query: {sql}");

        let connection = self.connection.lock();
        let mut statement = connection.prepare(sql)?;
        let columns: Vec<String> = statement.column_names().into_iter().map(String::from).collect();
        let mut rows = statement.query([])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), to_json(row.get_ref(index)?));
        }
        Ok(Some(record))
    }

    fn execute(&self, sql: &str) -> Result<usize> {
        log::debug!("SQL execute: {sql}");
        Ok(self.connection.lock().execute(sql, [])?)
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_keywords_are_rejected() {
        assert!(ensure_read_only("SELECT id FROM users WHERE name = 'drop'").is_ok());
        assert!(matches!(ensure_read_only("DELETE FROM users"), Err(ApiTestError::SqlSyntax(_))));
        assert!(matches!(ensure_read_only("select 1; Drop table users"), Err(ApiTestError::SqlSyntax(_))));
        // `updated_at` is a column name, not the keyword
        assert!(ensure_read_only("select updated_at from users").is_ok());
    }

    #[test]
    fn test_sqlite_query_first_row() {
        let client = SqliteClient::in_memory().unwrap();
        client.execute("CREATE TABLE users (id INTEGER, name TEXT, score REAL)").unwrap();
        assert_eq!(client.execute("INSERT INTO users VALUES (7, 'ann', 1.5), (8, 'bob', NULL)").unwrap(), 2);

        let row = client.query("SELECT id, name, score FROM users ORDER BY id").unwrap().unwrap();
        assert_eq!(Value::Object(row), json!({"id": 7, "name": "ann", "score": 1.5}));
        assert!(client.query("SELECT id FROM users WHERE id = 99").unwrap().is_none());
    }
}
