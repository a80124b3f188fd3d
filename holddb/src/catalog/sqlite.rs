use super::types::{Collection, CollectionField, CollectionId, CollectionSpec};
use super::{CollectionDao, IdFieldRequest, SpecFieldRequest};
use crate::config::StoreOptions;
use crate::context::Context;
use crate::error::{HoldError, Result};
use crate::sql::{self, placeholders, SqlFragment};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lifecycle state of a schema registration in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Complete,
    Failed,
}

impl RegistrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Complete => "complete",
            RegistrationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RegistrationStatus::Pending),
            "complete" => Some(RegistrationStatus::Complete),
            "failed" => Some(RegistrationStatus::Failed),
            _ => None,
        }
    }
}

/// A journal entry written before a registration touches either store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: i64,
    pub version: String,
    pub source: String,
    pub status: RegistrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// SQLite-backed catalog store.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

const COLLECTION_COLUMNS: &str = "c.id, c.name, c.namespace, c.version, c.table_name, \
     f.name, f.type, f.ref, f.is_list";

impl SqliteCatalog {
    /// Open or create the catalog database at `path`.
    pub fn open(path: &str, options: &StoreOptions) -> Result<Self> {
        let conn = sql::connect(path, options)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        initialize_tables(&conn)?;
        Ok(SqliteCatalog {
            conn: Mutex::new(conn),
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
            .map_err(|_| HoldError::Other("catalog connection mutex poisoned".into()))?;
        ctx.run(&mut guard, op)
    }

    // ── Registration Journal ─────────────────────────────────────────

    /// Record the start of a registration. Returns the journal id.
    pub fn begin_registration(&self, ctx: &Context, version: &str, source: &str) -> Result<i64> {
        self.with_conn(ctx, |conn| {
            conn.execute(
                "INSERT INTO _registrations (version, source, status, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    version,
                    source,
                    RegistrationStatus::Pending.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn finish_registration(
        &self,
        ctx: &Context,
        id: i64,
        status: RegistrationStatus,
    ) -> Result<()> {
        self.with_conn(ctx, |conn| {
            conn.execute(
                "UPDATE _registrations SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        })
    }

    /// Journal entries, oldest first, optionally filtered by status.
    pub fn registrations(
        &self,
        ctx: &Context,
        status: Option<RegistrationStatus>,
    ) -> Result<Vec<Registration>> {
        self.with_conn(ctx, |conn| {
            let mut query = SqlFragment::new(
                "SELECT id, version, source, status, started_at, finished_at FROM _registrations",
            );
            if let Some(status) = status {
                query.push_sql(" WHERE status = ").push_param(status.as_str().to_string());
            }
            query.push_sql(" ORDER BY id");

            let mut stmt = conn.prepare(query.sql())?;
            let rows = stmt.query_map(params_from_iter(query.params()), registration_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    // ── Collection Writes ────────────────────────────────────────────

    /// Insert a batch of collections (with their fields) in one transaction.
    /// Assigns each collection its id. The new collections stay invisible to
    /// readers until [`SqliteCatalog::mark_ready`].
    pub fn add_collections(
        &self,
        ctx: &Context,
        registration_id: Option<i64>,
        collections: &mut [Collection],
    ) -> Result<()> {
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            for collection in collections.iter_mut() {
                tx.execute(
                    "INSERT INTO _collections (name, namespace, version, table_name, registration_id, ready)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    params![
                        collection.name,
                        collection.namespace,
                        collection.version,
                        collection.table,
                        registration_id
                    ],
                )
                .map_err(|e| conflict(e, || format!("collection {}", collection.spec())))?;
                collection.id = tx.last_insert_rowid();

                for field in collection.fields.values() {
                    insert_field(&tx, collection.id, field).map_err(|e| {
                        conflict(e, || format!("field {}.{}", collection.spec(), field.name))
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Make collections visible to readers once their tables exist.
    pub fn mark_ready(&self, ctx: &Context, ids: &[CollectionId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(ctx, |conn| {
            let sql = format!(
                "UPDATE _collections SET ready = 1 WHERE id IN ({})",
                placeholders(ids.len())
            );
            conn.execute(&sql, params_from_iter(ids))?;
            Ok(())
        })
    }

    /// Remove collections that never became ready, with their fields. Used to
    /// undo a pass-1 batch whose tables could not be created.
    pub fn discard_unready(&self, ctx: &Context, ids: &[CollectionId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            let list = placeholders(ids.len());
            tx.execute(
                &format!(
                    "DELETE FROM _collection_fields WHERE collection_id IN
                     (SELECT id FROM _collections WHERE ready = 0 AND id IN ({list}))"
                ),
                params_from_iter(ids),
            )?;
            let removed = tx.execute(
                &format!("DELETE FROM _collections WHERE ready = 0 AND id IN ({list})"),
                params_from_iter(ids),
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Collections whose tables were never confirmed, with all fields.
    pub fn unready_collections(&self, ctx: &Context) -> Result<Vec<Collection>> {
        self.with_conn(ctx, |conn| {
            load_collections(conn, None, SqlFragment::new("c.ready = 0"))
        })
    }

    /// Every collection regardless of readiness, with all fields.
    pub fn all_collections(&self, ctx: &Context) -> Result<Vec<Collection>> {
        self.with_conn(ctx, |conn| load_collections(conn, None, SqlFragment::new("1")))
    }

    /// Collections created by one registration, ready or not, with all
    /// fields.
    pub fn registration_collections(
        &self,
        ctx: &Context,
        registration_id: i64,
    ) -> Result<Vec<Collection>> {
        let mut filter = SqlFragment::new("c.registration_id = ");
        filter.push_param(registration_id);
        self.with_conn(ctx, |conn| load_collections(conn, None, filter))
    }

    /// Append a field to an existing collection.
    pub fn add_collection_field(
        &self,
        ctx: &Context,
        collection_id: CollectionId,
        field: &CollectionField,
    ) -> Result<()> {
        self.with_conn(ctx, |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM _collections WHERE id = ?1",
                    params![collection_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(HoldError::NotFound(format!("collection id {collection_id}")));
            }
            insert_field(&tx, collection_id, field).map_err(|e| {
                conflict(e, || format!("field {} on collection id {collection_id}", field.name))
            })?;
            tx.commit()?;
            Ok(())
        })
    }
}

impl CollectionDao for SqliteCatalog {
    fn find_collection_by_spec(&self, ctx: &Context, spec: &CollectionSpec) -> Result<Collection> {
        let mut filter = SqlFragment::new("c.ready = 1 AND c.name = ");
        filter
            .push_param(spec.name.clone())
            .push_sql(" AND c.namespace = ")
            .push_param(spec.namespace.clone());

        self.with_conn(ctx, |conn| load_collections(conn, None, filter))?
            .into_iter()
            .next()
            .ok_or_else(|| HoldError::NotFound(format!("collection {spec}")))
    }

    fn find_collection_by_id(&self, ctx: &Context, id: CollectionId) -> Result<Collection> {
        let mut filter = SqlFragment::new("c.ready = 1 AND c.id = ");
        filter.push_param(id);

        self.with_conn(ctx, |conn| load_collections(conn, None, filter))?
            .into_iter()
            .next()
            .ok_or_else(|| HoldError::NotFound(format!("collection id {id}")))
    }

    fn get_collection_id(&self, ctx: &Context, spec: &CollectionSpec) -> Result<CollectionId> {
        self.with_conn(ctx, |conn| {
            conn.query_row(
                "SELECT id FROM _collections WHERE ready = 1 AND name = ?1 AND namespace = ?2",
                params![spec.name, spec.namespace],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| HoldError::NotFound(format!("collection {spec}")))
        })
    }

    fn find_collection_fields_by_spec(
        &self,
        ctx: &Context,
        requested: &SpecFieldRequest,
    ) -> Result<HashMap<CollectionSpec, Collection>> {
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let mut field_filters = Vec::new();
        let mut collection_filters = Vec::new();
        for (spec, names) in requested {
            let mut key = SqlFragment::new("(c.name = ");
            key.push_param(spec.name.clone())
                .push_sql(" AND c.namespace = ")
                .push_param(spec.namespace.clone());

            if !names.is_empty() {
                let mut field = key.clone();
                field.push_sql(" AND f.name IN (").push(name_list(names)).push_sql("))");
                field_filters.push(field);
            }
            key.push_sql(")");
            collection_filters.push(key);
        }

        let collections = self.with_conn(ctx, |conn| {
            load_collections(
                conn,
                Some(or_all(field_filters)),
                ready_and(or_all(collection_filters)),
            )
        })?;
        Ok(collections.into_iter().map(|c| (c.spec(), c)).collect())
    }

    fn find_collection_fields_by_id(
        &self,
        ctx: &Context,
        requested: &IdFieldRequest,
    ) -> Result<HashMap<CollectionId, Collection>> {
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let mut field_filters = Vec::new();
        let mut collection_filters = Vec::new();
        for (id, names) in requested {
            if !names.is_empty() {
                let mut field = SqlFragment::new("(c.id = ");
                field
                    .push_param(*id)
                    .push_sql(" AND f.name IN (")
                    .push(name_list(names))
                    .push_sql("))");
                field_filters.push(field);
            }
            let mut key = SqlFragment::new("c.id = ");
            key.push_param(*id);
            collection_filters.push(key);
        }

        let collections = self.with_conn(ctx, |conn| {
            load_collections(
                conn,
                Some(or_all(field_filters)),
                ready_and(or_all(collection_filters)),
            )
        })?;
        Ok(collections.into_iter().map(|c| (c.id, c)).collect())
    }

    fn list_collections(&self, ctx: &Context) -> Result<Vec<Collection>> {
        self.with_conn(ctx, |conn| {
            load_collections(conn, None, SqlFragment::new("c.ready = 1"))
        })
    }
}

fn initialize_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS _registrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS _collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            namespace TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL DEFAULT '',
            table_name TEXT NOT NULL UNIQUE,
            registration_id INTEGER REFERENCES _registrations(id),
            ready INTEGER NOT NULL DEFAULT 0,
            UNIQUE (name, namespace)
        );

        CREATE TABLE IF NOT EXISTS _collection_fields (
            collection_id INTEGER NOT NULL REFERENCES _collections(id),
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            ref INTEGER NOT NULL DEFAULT 0,
            is_list INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (collection_id, name)
        );
        ",
    )?;
    Ok(())
}

fn insert_field(
    conn: &Connection,
    collection_id: CollectionId,
    field: &CollectionField,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO _collection_fields (collection_id, name, type, ref, is_list)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            collection_id,
            field.name,
            field.field_type,
            field.reference,
            field.is_list
        ],
    )
}

/// Map unique-constraint failures to `AlreadyExists`.
fn conflict(err: rusqlite::Error, what: impl FnOnce() -> String) -> HoldError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            HoldError::AlreadyExists(what())
        }
        _ => HoldError::Storage(err),
    }
}

fn name_list(names: &std::collections::BTreeSet<String>) -> SqlFragment {
    SqlFragment::join(
        names.iter().map(|name| {
            let mut p = SqlFragment::default();
            p.push_param(name.clone());
            p
        }),
        ", ",
    )
}

/// `(a OR b OR ...)`, or a false predicate when empty.
fn or_all(parts: Vec<SqlFragment>) -> SqlFragment {
    if parts.is_empty() {
        return SqlFragment::new("0");
    }
    let mut out = SqlFragment::new("(");
    out.push(SqlFragment::join(parts, " OR ")).push_sql(")");
    out
}

fn ready_and(filter: SqlFragment) -> SqlFragment {
    let mut out = SqlFragment::new("c.ready = 1 AND ");
    out.push(filter);
    out
}

/// Load collections matching `filter`, joined with the fields matching
/// `field_filter` (all fields when `None`).
fn load_collections(
    conn: &Connection,
    field_filter: Option<SqlFragment>,
    filter: SqlFragment,
) -> Result<Vec<Collection>> {
    let mut query = SqlFragment::new(format!(
        "SELECT {COLLECTION_COLUMNS} FROM _collections c \
         LEFT JOIN _collection_fields f ON f.collection_id = c.id"
    ));
    if let Some(field_filter) = field_filter {
        query.push_sql(" AND ").push(field_filter);
    }
    query.push_sql(" WHERE ").push(filter).push_sql(" ORDER BY c.id, f.name");

    let mut stmt = conn.prepare(query.sql())?;
    let rows = stmt.query_map(params_from_iter(query.params()), |row| {
        let collection = Collection {
            id: row.get(0)?,
            name: row.get(1)?,
            namespace: row.get(2)?,
            version: row.get(3)?,
            table: row.get(4)?,
            fields: Default::default(),
        };
        let field = match row.get::<_, Option<String>>(5)? {
            Some(name) => Some(CollectionField {
                name,
                field_type: row.get(6)?,
                reference: row.get(7)?,
                is_list: row.get(8)?,
            }),
            None => None,
        };
        Ok((collection, field))
    })?;

    let mut collections: Vec<Collection> = Vec::new();
    for row in rows {
        let (collection, field) = row?;
        let same = collections.last().is_some_and(|last| last.id == collection.id);
        if !same {
            collections.push(collection);
        }
        if let (Some(field), Some(current)) = (field, collections.last_mut()) {
            current.add_field(field);
        }
    }
    Ok(collections)
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    let status: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let finished_at: Option<String> = row.get(5)?;
    Ok(Registration {
        id: row.get(0)?,
        version: row.get(1)?,
        source: row.get(2)?,
        status: RegistrationStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown registration status '{status}'").into(),
            )
        })?,
        started_at: parse_timestamp(4, &started_at)?,
        finished_at: finished_at
            .map(|s| parse_timestamp(5, &s))
            .transpose()?,
    })
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScalarType;
    use std::collections::BTreeSet;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn person() -> Collection {
        let mut c = Collection::new(&CollectionSpec::named("Person"), "v1");
        c.add_field(CollectionField::scalar("name", ScalarType::String, false));
        c.add_field(CollectionField::scalar("age", ScalarType::Int, false));
        c
    }

    fn post() -> Collection {
        let mut c = Collection::new(&CollectionSpec::named("Post"), "v1");
        c.add_field(CollectionField::scalar("title", ScalarType::String, false));
        c.add_field(CollectionField::scalar("body", ScalarType::String, false));
        c
    }

    /// Insert and mark ready, returning the assigned ids.
    fn seed(catalog: &SqliteCatalog, mut collections: Vec<Collection>) -> Vec<CollectionId> {
        let ctx = Context::background();
        catalog.add_collections(&ctx, None, &mut collections).unwrap();
        let ids: Vec<_> = collections.iter().map(|c| c.id).collect();
        catalog.mark_ready(&ctx, &ids).unwrap();
        ids
    }

    #[test]
    fn test_add_and_find_by_spec() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ids = seed(&catalog, vec![person(), post()]);
        assert_ne!(ids[0], ids[1]);

        let ctx = Context::background();
        let found = catalog
            .find_collection_by_spec(&ctx, &CollectionSpec::named("Person"))
            .unwrap();
        assert_eq!(found.id, ids[0]);
        assert_eq!(found.version, "v1");
        assert_eq!(found.table, "Person");
        assert_eq!(found.fields.len(), 2);
        assert_eq!(found.fields["age"].field_type, "Int");

        let by_id = catalog.find_collection_by_id(&ctx, ids[1]).unwrap();
        assert_eq!(by_id.name, "Post");
        assert_eq!(
            catalog.get_collection_id(&ctx, &CollectionSpec::named("Post")).unwrap(),
            ids[1]
        );
    }

    #[test]
    fn test_unknown_spec_is_not_found() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let err = catalog
            .find_collection_by_spec(&Context::background(), &CollectionSpec::named("Nope"))
            .unwrap_err();
        assert!(matches!(err, HoldError::NotFound(_)));
    }

    #[test]
    fn test_unready_collections_are_hidden() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ctx = Context::background();
        let mut batch = vec![person()];
        catalog.add_collections(&ctx, None, &mut batch).unwrap();

        assert!(catalog.list_collections(&ctx).unwrap().is_empty());
        assert_eq!(catalog.unready_collections(&ctx).unwrap().len(), 1);

        catalog.mark_ready(&ctx, &[batch[0].id]).unwrap();
        assert_eq!(catalog.list_collections(&ctx).unwrap().len(), 1);
        assert!(catalog.unready_collections(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_collections_by_registration() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ctx = Context::background();
        let first = catalog.begin_registration(&ctx, "v1", "type Person").unwrap();
        let second = catalog.begin_registration(&ctx, "v2", "type Post").unwrap();

        let mut batch = vec![person()];
        catalog.add_collections(&ctx, Some(first), &mut batch).unwrap();
        let mut batch = vec![post()];
        catalog.add_collections(&ctx, Some(second), &mut batch).unwrap();

        let owned = catalog.registration_collections(&ctx, first).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "Person");
        assert_eq!(owned[0].fields.len(), person().fields.len());
        assert!(catalog.registration_collections(&ctx, 99).unwrap().is_empty());
    }

    #[test]
    fn test_batched_lookup_by_spec_loads_only_requested_fields() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        seed(&catalog, vec![person(), post()]);

        let mut requested = SpecFieldRequest::new();
        requested.insert(CollectionSpec::named("Person"), names(&["name", "missing"]));
        requested.insert(CollectionSpec::named("Post"), names(&["title"]));
        requested.insert(CollectionSpec::named("Ghost"), names(&["x"]));

        let found = catalog
            .find_collection_fields_by_spec(&Context::background(), &requested)
            .unwrap();
        assert_eq!(found.len(), 2);

        let person = &found[&CollectionSpec::named("Person")];
        assert_eq!(person.fields.keys().collect::<Vec<_>>(), vec!["name"]);
        let post = &found[&CollectionSpec::named("Post")];
        assert_eq!(post.fields.keys().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn test_batched_lookup_by_id() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ids = seed(&catalog, vec![person(), post()]);

        let mut requested = IdFieldRequest::new();
        requested.insert(ids[0], names(&["age"]));
        requested.insert(ids[1], names(&["title", "body"]));

        let found = catalog
            .find_collection_fields_by_id(&Context::background(), &requested)
            .unwrap();
        assert_eq!(found[&ids[0]].fields.len(), 1);
        assert_eq!(found[&ids[1]].fields.len(), 2);
    }

    #[test]
    fn test_namespaces_partition_names() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let mut blog = post();
        blog.namespace = "blog".into();
        blog.table = blog.spec().table_name();
        seed(&catalog, vec![post(), blog]);

        let ctx = Context::background();
        let found = catalog
            .find_collection_by_spec(&ctx, &CollectionSpec::new("Post", "blog"))
            .unwrap();
        assert_eq!(found.table, "blog__Post");
        assert_eq!(catalog.list_collections(&ctx).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_collection_rolls_back_batch() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        seed(&catalog, vec![person()]);

        let ctx = Context::background();
        let mut batch = vec![post(), person()];
        let err = catalog.add_collections(&ctx, None, &mut batch).unwrap_err();
        assert!(matches!(err, HoldError::AlreadyExists(_)));
        assert!(catalog.unready_collections(&ctx).unwrap().is_empty());
        assert_eq!(catalog.all_collections(&ctx).unwrap().len(), 1);
    }

    #[test]
    fn test_add_collection_field() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ids = seed(&catalog, vec![person(), post()]);
        let ctx = Context::background();

        let author = CollectionField::reference("author", "Person", ids[0], false);
        catalog.add_collection_field(&ctx, ids[1], &author).unwrap();

        let post = catalog.find_collection_by_id(&ctx, ids[1]).unwrap();
        assert_eq!(post.fields["author"], author);

        let err = catalog.add_collection_field(&ctx, ids[1], &author).unwrap_err();
        assert!(matches!(err, HoldError::AlreadyExists(_)));

        let err = catalog.add_collection_field(&ctx, 999, &author).unwrap_err();
        assert!(matches!(err, HoldError::NotFound(_)));
    }

    #[test]
    fn test_discard_unready_never_reuses_ids() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ctx = Context::background();

        let mut batch = vec![person()];
        catalog.add_collections(&ctx, None, &mut batch).unwrap();
        let discarded = batch[0].id;
        assert_eq!(catalog.discard_unready(&ctx, &[discarded]).unwrap(), 1);
        assert!(catalog.all_collections(&ctx).unwrap().is_empty());

        let ids = seed(&catalog, vec![person()]);
        assert!(ids[0] > discarded);
    }

    #[test]
    fn test_discard_leaves_ready_collections() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ids = seed(&catalog, vec![person()]);
        assert_eq!(catalog.discard_unready(&Context::background(), &ids).unwrap(), 0);
    }

    #[test]
    fn test_registration_journal() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ctx = Context::background();

        let first = catalog.begin_registration(&ctx, "v1", "type A { x: Int }").unwrap();
        let second = catalog.begin_registration(&ctx, "v2", "type B { y: Int }").unwrap();
        catalog
            .finish_registration(&ctx, first, RegistrationStatus::Complete)
            .unwrap();

        let pending = catalog
            .registrations(&ctx, Some(RegistrationStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert_eq!(pending[0].source, "type B { y: Int }");
        assert!(pending[0].finished_at.is_none());

        let all = catalog.registrations(&ctx, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, RegistrationStatus::Complete);
        assert!(all[0].finished_at.is_some());
    }

    #[test]
    fn test_cancelled_context_skips_catalog() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let ctx = Context::background();
        ctx.cancel_handle().cancel();
        let err = catalog.list_collections(&ctx).unwrap_err();
        assert!(matches!(err, HoldError::Cancelled));
    }
}
