//! Query resolution: one SQL statement per root field, shaped server-side
//! into the exact JSON the selection asks for.

use crate::catalog::{Collection, ScalarType};
use crate::context::Context;
use crate::error::{HoldError, Result};
use crate::graphql::{self, QueryDocument, Selection, IMPLICIT_ID_FIELD};
use crate::records::{RecordStore, ID_COLUMN};
use crate::sql::{quote_identifier, quote_literal, SqlFragment};
use crate::validator::ValidationSnapshot;
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolved JSON per root field, keyed by alias or field name. Values are the
/// JSON text produced by the record store, passed through untouched.
pub type ResponseData = BTreeMap<String, Box<RawValue>>;

pub struct Resolver {
    records: Arc<RecordStore>,
}

impl Resolver {
    pub fn new(records: Arc<RecordStore>) -> Self {
        Resolver { records }
    }

    /// Resolve every root field of `document`. The first failure aborts the
    /// whole response.
    pub fn resolve(
        &self,
        ctx: &Context,
        document: &QueryDocument<'_>,
        snapshot: &ValidationSnapshot,
    ) -> Result<ResponseData> {
        let mut data = ResponseData::new();
        for root in graphql::root_fields(document)? {
            let id = graphql::record_id(root.field)?;
            let collection = snapshot
                .root_collection(&root.spec)
                .ok_or_else(|| HoldError::NotFound(format!("collection {}", root.spec)))?;

            let query = compile_record_query(collection, id, &root.selections, snapshot)?;
            let json = self
                .records
                .query_json(ctx, &query)?
                .ok_or_else(|| HoldError::NotFound(format!("{} with id {id}", root.spec)))?;
            data.insert(root.response_key().to_string(), RawValue::from_string(json)?);
        }
        Ok(data)
    }
}

/// Compile `SELECT json_object(...) FROM <table> WHERE id = ?` for one root
/// record. Nested reference fields become correlated subqueries, so the whole
/// tree is fetched by a single statement.
pub fn compile_record_query(
    collection: &Collection,
    id: i64,
    selections: &[Selection],
    snapshot: &ValidationSnapshot,
) -> Result<SqlFragment> {
    let alias = table_alias(0);
    let mut query = SqlFragment::new("SELECT ");
    query
        .push_sql(&json_object(collection, selections, snapshot, 0)?)
        .push_sql(&format!(
            " FROM {} AS {alias} WHERE {alias}.{} = ",
            quote_identifier(&collection.table),
            quote_identifier(ID_COLUMN)
        ))
        .push_param(id);
    Ok(query)
}

fn table_alias(depth: usize) -> String {
    quote_identifier(&format!("t{depth}"))
}

/// `json_object('key', expr, ...)` over the row aliased `t{depth}`.
fn json_object(
    collection: &Collection,
    selections: &[Selection],
    snapshot: &ValidationSnapshot,
    depth: usize,
) -> Result<String> {
    let alias = table_alias(depth);
    let mut args = Vec::with_capacity(selections.len() * 2);
    for selection in selections {
        args.push(quote_literal(selection.response_key()));
        args.push(value_expr(collection, selection, snapshot, depth, &alias)?);
    }
    Ok(format!("json_object({})", args.join(", ")))
}

fn value_expr(
    collection: &Collection,
    selection: &Selection,
    snapshot: &ValidationSnapshot,
    depth: usize,
    alias: &str,
) -> Result<String> {
    if selection.name == IMPLICIT_ID_FIELD {
        return Ok(format!("{alias}.{}", quote_identifier(ID_COLUMN)));
    }
    let field = collection.fields.get(&selection.name).ok_or_else(|| {
        HoldError::NotFound(format!(
            "field {}.{} in validation snapshot",
            collection.name, selection.name
        ))
    })?;
    let column = format!("{alias}.{}", quote_identifier(&field.name));

    if !field.is_reference() {
        return Ok(match field.scalar_type() {
            Some(ScalarType::Boolean) => format!(
                "json(CASE WHEN {column} IS NULL THEN 'null' WHEN {column} THEN 'true' ELSE 'false' END)"
            ),
            _ => column,
        });
    }

    let target = snapshot.collection(field.reference).ok_or_else(|| {
        HoldError::NotFound(format!("collection id {} in validation snapshot", field.reference))
    })?;
    let inner = table_alias(depth + 1);
    // Subquery results lose their JSON subtype; json() restores it so the
    // nested object is embedded rather than quoted.
    Ok(format!(
        "json((SELECT {} FROM {} AS {inner} WHERE {inner}.{} = {column}))",
        json_object(target, &selection.children, snapshot, depth + 1)?,
        quote_identifier(&target.table),
        quote_identifier(ID_COLUMN),
    ))
}
