//! Small SQL building helpers shared by the catalog, record store and
//! resolver: identifier quoting, storage types and a parameterized fragment
//! builder.

use crate::config::{StoreOptions, IN_MEMORY};
use crate::error::Result;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Open a SQLite connection at `path` (or in memory for `:memory:`) and apply
/// the store options.
pub fn connect(path: &str, options: &StoreOptions) -> Result<Connection> {
    let conn = if path == IN_MEMORY {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Connection::open(path)?
    };
    conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    if path != IN_MEMORY {
        let _mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            options.journal_mode.pragma_value(),
            |row| row.get(0),
        )?;
    }
    Ok(conn)
}

/// Quote an identifier for SQLite (`"name"`, embedded quotes doubled).
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal for SQLite (`'text'`, embedded quotes doubled).
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `?, ?, ?` for `n` bound values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Physical column type in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    Text,
    Integer,
    Real,
}

impl StorageType {
    pub fn as_sql(self) -> &'static str {
        match self {
            StorageType::Text => "TEXT",
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
        }
    }

    /// Parse the declared type reported by `PRAGMA table_info`.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(StorageType::Text),
            "INTEGER" => Some(StorageType::Integer),
            "REAL" => Some(StorageType::Real),
            _ => None,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A piece of SQL text together with the values bound to its `?` placeholders,
/// in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    sql: String,
    params: Vec<Value>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        SqlFragment {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a `?` placeholder bound to `value`.
    pub fn push_param(&mut self, value: impl Into<Value>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    pub fn push(&mut self, other: SqlFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    /// Join fragments with `separator`, keeping parameter order.
    pub fn join(parts: impl IntoIterator<Item = SqlFragment>, separator: &str) -> Self {
        let mut out = SqlFragment::default();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.push_sql(separator);
            }
            out.push(part);
        }
        out
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

impl fmt::Display for SqlFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.sql, self.params)
    }
}
