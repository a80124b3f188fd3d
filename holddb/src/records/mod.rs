//! Record store: one physical table per collection, kept structurally in
//! lockstep with the catalog.

use crate::catalog::Collection;
use crate::config::StoreOptions;
use crate::context::Context;
use crate::error::{HoldError, Result};
use crate::sql::{self, placeholders, quote_identifier, SqlFragment, StorageType};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Mutex;

/// Name of the implicit integer primary key of every record table.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub storage: StorageType,
}

/// Physical shape of one collection's table (excluding the `id` key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    /// One column per catalog field, in field-name order.
    pub fn for_collection(collection: &Collection) -> Self {
        TableDef {
            name: collection.table.clone(),
            columns: collection
                .fields
                .values()
                .map(|f| ColumnDef {
                    name: f.name.clone(),
                    storage: f.storage_type(),
                })
                .collect(),
        }
    }

    fn create_sql(&self, if_not_exists: bool) -> String {
        let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote_identifier(ID_COLUMN))];
        columns.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", quote_identifier(&c.name), c.storage)),
        );
        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }
}

/// What [`RecordStore::ensure_table`] had to change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub created: bool,
    pub columns_added: usize,
}

/// SQLite-backed store of collection rows.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    pub fn open(path: &str, options: &StoreOptions) -> Result<Self> {
        let conn = sql::connect(path, options)?;
        Ok(RecordStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory record store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(RecordStore {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn with_conn<T>(
        &self,
        ctx: &Context,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| HoldError::Other("record store connection mutex poisoned".into()))?;
        ctx.run(&mut guard, op)
    }

    // ── DDL ──────────────────────────────────────────────────────────

    /// Create all tables in one transaction. Fails (creating nothing) if any
    /// of them already exists.
    pub fn create_tables(&self, ctx: &Context, tables: &[TableDef]) -> Result<()> {
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            for table in tables {
                tx.execute_batch(&table.create_sql(false))?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Bring a table up to `table`: create it if missing, then add whatever
    /// columns are missing. Existing columns and rows are left alone.
    pub fn ensure_table(&self, ctx: &Context, table: &TableDef) -> Result<EnsureOutcome> {
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            let existing = read_columns(&tx, &table.name)?;
            let mut outcome = EnsureOutcome::default();
            if existing.is_empty() {
                tx.execute_batch(&table.create_sql(true))?;
                outcome.created = true;
            } else {
                for column in &table.columns {
                    if !existing.iter().any(|(name, _)| name == &column.name) {
                        tx.execute_batch(&add_column_sql(&table.name, column))?;
                        outcome.columns_added += 1;
                    }
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Add a column unless it is already there. Returns whether it was added.
    /// An existing column with a different storage type is an error.
    pub fn add_column(&self, ctx: &Context, table: &str, column: &ColumnDef) -> Result<bool> {
        self.with_conn(ctx, |conn| {
            let existing = read_columns(conn, table)?;
            if existing.is_empty() {
                return Err(HoldError::NotFound(format!("table {table}")));
            }
            match existing.iter().find(|(name, _)| name == &column.name) {
                Some((_, ty)) if *ty == Some(column.storage) => Ok(false),
                Some((_, ty)) => Err(HoldError::AlreadyExists(format!(
                    "column {table}.{} with type {}",
                    column.name,
                    ty.map(|t| t.as_sql()).unwrap_or("?")
                ))),
                None => {
                    conn.execute_batch(&add_column_sql(table, column))?;
                    Ok(true)
                }
            }
        })
    }

    /// Columns of `table` (including `id`) with their storage types. Empty
    /// when the table does not exist.
    pub fn table_columns(
        &self,
        ctx: &Context,
        table: &str,
    ) -> Result<Vec<(String, Option<StorageType>)>> {
        self.with_conn(ctx, |conn| read_columns(conn, table))
    }

    // ── Rows ─────────────────────────────────────────────────────────

    /// Insert one row. Returns the row id (explicit `id` value or assigned).
    pub fn insert_record(
        &self,
        ctx: &Context,
        table: &str,
        values: &[(String, Value)],
    ) -> Result<i64> {
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_identifier(table))
        } else {
            let columns: Vec<String> = values.iter().map(|(c, _)| quote_identifier(c)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_identifier(table),
                columns.join(", "),
                placeholders(values.len())
            )
        };
        self.with_conn(ctx, |conn| {
            conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Run a statement projecting a single JSON text column and return the
    /// first row's value, or `None` when no row matched.
    pub fn query_json(&self, ctx: &Context, query: &SqlFragment) -> Result<Option<String>> {
        log::debug!("record query: {query}");
        self.with_conn(ctx, |conn| {
            let mut stmt = conn.prepare(query.sql())?;
            let json = stmt
                .query_row(params_from_iter(query.params()), |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?;
            Ok(json.flatten())
        })
    }

    /// Count rows of a table (used by status reporting).
    pub fn count_rows(&self, ctx: &Context, table: &str) -> Result<i64> {
        self.with_conn(ctx, |conn| {
            let n = conn.query_row(
                &format!("SELECT count(*) FROM {}", quote_identifier(table)),
                params![],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn add_column_sql(table: &str, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(table),
        quote_identifier(&column.name),
        column.storage
    )
}

fn read_columns(conn: &Connection, table: &str) -> Result<Vec<(String, Option<StorageType>)>> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map(params![table], |row| {
        let name: String = row.get(0)?;
        let declared: String = row.get(1)?;
        Ok((name, StorageType::from_declared(&declared)))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn column(name: &str, storage: StorageType) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            storage,
        }
    }

    fn post_table() -> TableDef {
        TableDef {
            name: "Post".into(),
            columns: vec![
                column("title", StorageType::Text),
                column("score", StorageType::Real),
            ],
        }
    }

    #[test]
    fn test_create_tables_and_columns() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();

        let columns = store.table_columns(&ctx, "Post").unwrap();
        assert_eq!(
            columns,
            vec![
                ("id".to_string(), Some(StorageType::Integer)),
                ("title".to_string(), Some(StorageType::Text)),
                ("score".to_string(), Some(StorageType::Real)),
            ]
        );
    }

    #[test]
    fn test_create_tables_is_all_or_nothing() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();

        let person = TableDef {
            name: "Person".into(),
            columns: vec![column("name", StorageType::Text)],
        };
        assert!(store.create_tables(&ctx, &[person, post_table()]).is_err());
        assert!(store.table_columns(&ctx, "Person").unwrap().is_empty());
    }

    #[test]
    fn test_add_column_is_idempotent() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();

        let author = column("author", StorageType::Integer);
        assert!(store.add_column(&ctx, "Post", &author).unwrap());
        assert!(!store.add_column(&ctx, "Post", &author).unwrap());

        let clash = column("title", StorageType::Integer);
        assert!(matches!(
            store.add_column(&ctx, "Post", &clash),
            Err(HoldError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.add_column(&ctx, "Missing", &author),
            Err(HoldError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_column_keeps_existing_rows() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();
        let id = store
            .insert_record(&ctx, "Post", &[("title".into(), Value::Text("Hello".into()))])
            .unwrap();

        store
            .add_column(&ctx, "Post", &column("views", StorageType::Integer))
            .unwrap();

        let mut query = SqlFragment::new(
            "SELECT json_object('title', \"title\", 'views', \"views\") FROM \"Post\" WHERE id = ",
        );
        query.push_param(id);
        let json = store.query_json(&ctx, &query).unwrap().unwrap();
        assert_eq!(json, r#"{"title":"Hello","views":null}"#);
    }

    #[test]
    fn test_ensure_table_creates_then_completes() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();

        let outcome = store.ensure_table(&ctx, &post_table()).unwrap();
        assert_eq!(
            outcome,
            EnsureOutcome {
                created: true,
                columns_added: 0
            }
        );

        let mut wider = post_table();
        wider.columns.push(column("author", StorageType::Integer));
        let outcome = store.ensure_table(&ctx, &wider).unwrap();
        assert_eq!(
            outcome,
            EnsureOutcome {
                created: false,
                columns_added: 1
            }
        );
        assert_eq!(store.ensure_table(&ctx, &wider).unwrap(), EnsureOutcome::default());
    }

    #[test]
    fn test_query_json_no_row() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();

        let mut query = SqlFragment::new("SELECT json_object() FROM \"Post\" WHERE id = ");
        query.push_param(42i64);
        assert_eq!(store.query_json(&ctx, &query).unwrap(), None);
    }

    #[test]
    fn test_insert_with_explicit_id_and_count() {
        let store = RecordStore::open_in_memory().unwrap();
        let ctx = Context::background();
        store.create_tables(&ctx, &[post_table()]).unwrap();

        let id = store
            .insert_record(&ctx, "Post", &[("id".into(), Value::Integer(7))])
            .unwrap();
        assert_eq!(id, 7);
        store.insert_record(&ctx, "Post", &[]).unwrap();
        assert_eq!(store.count_rows(&ctx, "Post").unwrap(), 2);
    }
}
