//! The engine: both stores plus the registrar, validator and resolver wired
//! together behind one handle.

use crate::catalog::{
    Collection, CollectionDao, CollectionField, CollectionSpec, Registration, RegistrationStatus,
    ScalarType, SqliteCatalog,
};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{HoldError, Result};
use crate::graphql::{self, IMPLICIT_ID_FIELD};
use crate::records::{RecordStore, ID_COLUMN};
use crate::registrar::{ReconcileReport, Registrar, RegistrationReport, TypeRef};
use crate::resolver::{Resolver, ResponseData};
use crate::validator::{ValidationSnapshot, Validator};
use rusqlite::types::Value;
use serde::Serialize;
use std::sync::Arc;

/// Envelope returned by [`Engine::execute`].
#[derive(Debug, Serialize)]
pub struct Response {
    pub data: ResponseData,
}

/// Main entry point. Opens (or creates) the catalog and record stores, runs
/// startup reconciliation and exposes registration and query operations.
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<SqliteCatalog>,
    records: Arc<RecordStore>,
    registrar: Registrar,
    validator: Validator,
    resolver: Resolver,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(SqliteCatalog::open(&config.catalog_path, &config.store)?);
        let records = Arc::new(RecordStore::open(&config.records_path, &config.store)?);

        let engine = Engine {
            registrar: Registrar::new(catalog.clone(), records.clone()),
            validator: Validator::new(catalog.clone()),
            resolver: Resolver::new(records.clone()),
            config,
            catalog,
            records,
        };

        if engine.config.reconcile_on_open {
            engine.reconcile()?;
        }
        log::info!(
            "engine opened (catalog: {}, records: {})",
            engine.config.catalog_path,
            engine.config.records_path
        );
        Ok(engine)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::in_memory())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh context carrying the configured statement timeout, if any.
    pub fn context(&self) -> Context {
        match self.config.statement_timeout() {
            Some(timeout) => Context::with_timeout(timeout),
            None => Context::background(),
        }
    }

    // ── Schema ───────────────────────────────────────────────────────

    /// Register the object types of a GraphQL type document.
    pub fn register_schema(&self, source: &str, version: &str) -> Result<RegistrationReport> {
        let document = graphql::parse_schema(source)?;
        self.registrar
            .register_schema(&self.context(), &document, version)
    }

    /// Append a field to an existing collection. `field_type` uses SDL type
    /// syntax (`Int`, `[Person]`, ...); `ref_namespace` is the namespace of a
    /// referenced type.
    pub fn append_field(
        &self,
        spec: &CollectionSpec,
        name: &str,
        field_type: &str,
        ref_namespace: &str,
    ) -> Result<CollectionField> {
        let type_ref = TypeRef::parse(field_type)?;
        self.registrar
            .append_field(&self.context(), spec, name, &type_ref, ref_namespace)
    }

    pub fn reconcile(&self) -> Result<ReconcileReport> {
        self.registrar.reconcile(&self.context())
    }

    pub fn collection(&self, spec: &CollectionSpec) -> Result<Collection> {
        self.catalog.find_collection_by_spec(&self.context(), spec)
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>> {
        self.catalog.list_collections(&self.context())
    }

    pub fn registrations(&self, status: Option<RegistrationStatus>) -> Result<Vec<Registration>> {
        self.catalog.registrations(&self.context(), status)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn validate(&self, query: &str) -> Result<ValidationSnapshot> {
        let document = graphql::parse_query(query)?;
        self.validator
            .validate_root_selections(&self.context(), &document)
    }

    /// Validate then resolve, both under `ctx`.
    pub fn resolve(&self, ctx: &Context, query: &str) -> Result<ResponseData> {
        let document = graphql::parse_query(query)?;
        let snapshot = self.validator.validate_root_selections(ctx, &document)?;
        self.resolver.resolve(ctx, &document, &snapshot)
    }

    /// Parse, validate and resolve a query document, wrapped as
    /// `{"data": {...}}`.
    pub fn execute(&self, query: &str) -> Result<Response> {
        self.execute_with(&self.context(), query)
    }

    pub fn execute_with(&self, ctx: &Context, query: &str) -> Result<Response> {
        Ok(Response {
            data: self.resolve(ctx, query)?,
        })
    }

    // ── Rows ─────────────────────────────────────────────────────────

    /// Insert one row. Keys must be catalog fields of the collection (or
    /// `id`); values are checked against the field types.
    pub fn insert_record(
        &self,
        spec: &CollectionSpec,
        record: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<i64> {
        let ctx = self.context();
        let collection = self.catalog.find_collection_by_spec(&ctx, spec)?;

        let mut values = Vec::with_capacity(record.len());
        for (key, value) in record {
            if key == IMPLICIT_ID_FIELD {
                values.push((ID_COLUMN.to_string(), to_integer(key, value)?));
                continue;
            }
            let field = collection
                .fields
                .get(key)
                .ok_or_else(|| HoldError::Argument(format!("unknown field {spec}.{key}")))?;
            values.push((key.clone(), json_to_sql(field, value)?));
        }
        self.records.insert_record(&ctx, &collection.table, &values)
    }

    /// Catalog and record store summary.
    pub fn status(&self) -> Result<serde_json::Value> {
        let ctx = self.context();
        let mut collections = Vec::new();
        for collection in self.catalog.list_collections(&ctx)? {
            collections.push(serde_json::json!({
                "name": collection.name,
                "namespace": collection.namespace,
                "table": collection.table,
                "fields": collection.fields.len(),
                "rows": self.records.count_rows(&ctx, &collection.table)?,
            }));
        }

        let mut registrations = serde_json::Map::new();
        for registration in self.catalog.registrations(&ctx, None)? {
            let entry = registrations
                .entry(registration.status.as_str())
                .or_insert(serde_json::Value::from(0));
            *entry = serde_json::Value::from(entry.as_u64().unwrap_or(0) + 1);
        }

        Ok(serde_json::json!({
            "catalog_path": self.config.catalog_path,
            "records_path": self.config.records_path,
            "collections": collections,
            "registrations": registrations,
        }))
    }
}

fn json_to_sql(field: &CollectionField, value: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    if value.is_null() {
        return Ok(Value::Null);
    }
    if field.is_reference() {
        return to_integer(&field.name, value);
    }
    let mismatch = || {
        HoldError::Argument(format!(
            "field {} expects {}, got {value}",
            field.name, field.field_type
        ))
    };
    match (field.scalar_type(), value) {
        (Some(ScalarType::Int | ScalarType::Id), _) => to_integer(&field.name, value),
        (Some(ScalarType::Float), Json::Number(n)) => n.as_f64().map(Value::Real).ok_or_else(mismatch),
        (Some(ScalarType::Boolean), Json::Bool(b)) => Ok(Value::Integer(i64::from(*b))),
        (Some(ScalarType::String), Json::String(s)) => Ok(Value::Text(s.clone())),
        _ => Err(mismatch()),
    }
}

fn to_integer(name: &str, value: &serde_json::Value) -> Result<Value> {
    value
        .as_i64()
        .map(Value::Integer)
        .ok_or_else(|| HoldError::Argument(format!("field {name} expects an integer, got {value}")))
}
